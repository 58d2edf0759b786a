//! Bindings of libibverbs and librdmacm C interfaces.

#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(deref_nullptr)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(unused)]

mod inline;

mod private {
    include!(concat!(env!("OUT_DIR"), "/rdma_bindings.rs"));

    pub use super::inline::*;
}

pub(crate) use self::private::*;
