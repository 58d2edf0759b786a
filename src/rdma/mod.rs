//! RDMA data types shared by every transport.

pub mod caps;
pub mod mr;
pub mod type_alias;
pub mod wc;
