//! The communicator prelude.
//!
//! The purpose of this module is to alleviate imports of common
//! functionalities.

pub use crate::channel::{ChannelState, Communicator, RdmaChannel};
#[cfg(rdma_core)]
pub use crate::cm::{CmChannel, CmProvider};
pub use crate::config::ChannelConfig;
pub use crate::endpoint::{Endpoint, EndpointAddr, EndpointDescriptor};
pub use crate::error::{Error, Result};
pub use crate::loopback::LoopbackFabric;
