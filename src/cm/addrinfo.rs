use std::ffi::CString;
use std::io;
use std::mem;
use std::os::raw::c_int;
use std::ptr::{self, NonNull};

use crate::bindings::*;
use crate::endpoint::EndpointAddr;

/// Owned result list of `rdma_getaddrinfo`.
pub(crate) struct AddrInfo(NonNull<rdma_addrinfo>);

impl_raw_wrapper_traits!(rdma_addrinfo, AddrInfo);

impl AddrInfo {
    /// Look up the RDMA address of a numeric endpoint address, for RC
    /// connections in the TCP port space. Set `passive` for listening.
    pub fn get(addr: &EndpointAddr, passive: bool) -> io::Result<Self> {
        let node = CString::new(addr.ip().to_string())?;
        let service = CString::new(addr.port().to_string())?;

        // SAFETY: POD type.
        let mut hints = unsafe { mem::zeroed::<rdma_addrinfo>() };
        hints.ai_flags = if passive {
            (RAI_PASSIVE | RAI_NUMERICHOST) as c_int
        } else {
            RAI_NUMERICHOST as c_int
        };
        hints.ai_port_space = rdma_port_space::RDMA_PS_TCP as c_int;

        let mut res = ptr::null_mut();
        // SAFETY: FFI.
        let ret = unsafe { rdma_getaddrinfo(node.as_ptr(), service.as_ptr(), &hints, &mut res) };
        match ret {
            0 => {}
            -1 => return Err(io::Error::last_os_error()),
            code => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("rdma_getaddrinfo failed with code {}", code),
                ))
            }
        }
        NonNull::new(res)
            .map(Self)
            .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))
    }
}

impl Drop for AddrInfo {
    fn drop(&mut self) {
        // SAFETY: call only once, and no UAF since I will be dropped.
        unsafe { rdma_freeaddrinfo(self.as_raw()) };
    }
}
