//! Work completions.

use std::fmt;

use thiserror::Error;

use super::type_alias::WrId;

/// Opcode of a completion queue entry.
///
/// Only two-sided opcodes are distinguished; anything else is kept raw.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WcOpcode {
    /// Send request.
    Send,
    /// Receive request.
    Recv,
    /// Any other opcode, carrying the raw `ibv_wc_opcode` value.
    Other(u32),
}

impl WcOpcode {
    const IBV_WC_SEND: u32 = 0;
    const IBV_WC_RECV: u32 = 1 << 7;

    /// Interpret a raw `ibv_wc_opcode` value.
    pub fn from_raw(opcode: u32) -> Self {
        match opcode {
            Self::IBV_WC_SEND => WcOpcode::Send,
            Self::IBV_WC_RECV => WcOpcode::Recv,
            x => WcOpcode::Other(x),
        }
    }
}

/// Status of a completion queue entry.
///
/// Descriptions follow [RDMAmojo](https://www.rdmamojo.com/2013/02/15/ibv_poll_cq/).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WcStatus {
    /// The work request completed and its buffers may be reused.
    #[error("success")]
    Success,

    /// A message did not fit the posted receive buffer, or exceeded the
    /// port's maximum message size.
    #[error("local length error")]
    LocLenErr,

    /// Internal QP consistency error while processing the work request.
    #[error("local QP operation error")]
    LocQpOpErr,

    /// Local EE context operation error (RD only, unused).
    #[error("local EE context operation error")]
    LocEecOpErr,

    /// The scatter/gather list does not reference a valid memory region.
    #[error("local protection error")]
    LocProtErr,

    /// The work request was outstanding when the QP entered the error state,
    /// e.g., because the connection was torn down.
    #[error("WR flush error")]
    WrFlushErr,

    /// Memory window binding failure.
    #[error("memory window bind error")]
    MwBindErr,

    /// Unexpected transport opcode from the responder.
    #[error("bad response error")]
    BadRespErr,

    /// Protection error on a local buffer during a remote operation.
    #[error("local access error")]
    LocAccessErr,

    /// The responder detected an invalid message, e.g., a send larger than
    /// the posted receive buffer.
    #[error("remote invalid request error")]
    RemInvReqErr,

    /// Protection error on a remote buffer.
    #[error("remote access error")]
    RemAccessErr,

    /// The responder could not complete the operation.
    #[error("remote operation error")]
    RemOpErr,

    /// No ACK/NACK from the remote side within the retry budget. Usually the
    /// remote QP is gone.
    #[error("transport retry counter exceeded")]
    RetryExcErr,

    /// The remote side had no receive posted within the RNR retry budget.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr,

    /// Local RDD violation (RD only, unused).
    #[error("local RDD violation error")]
    LocRddViolErr,

    /// Remote invalid RD request (RD only, unused).
    #[error("remote invalid RD request")]
    RemInvRdReqErr,

    /// The responder aborted the operation.
    #[error("remote aborted error")]
    RemAbortErr,

    /// Invalid EE context number (RD only, unused).
    #[error("invalid EE context number")]
    InvEecnErr,

    /// Invalid EE context state (RD only, unused).
    #[error("invalid EE context state error")]
    InvEecStateErr,

    /// Fatal, possibly unrecoverable error.
    #[error("fatal error")]
    FatalErr,

    /// A response timed out.
    #[error("response timeout error")]
    RespTimeoutErr,

    /// Any error not covered above.
    #[error("general error")]
    GeneralErr,

    /// A status this crate does not know about.
    #[error("unknown status {0}")]
    Unknown(u32),
}

impl WcStatus {
    /// All known statuses, indexed by their `ibv_wc_status` value.
    const KNOWN: [WcStatus; 22] = [
        WcStatus::Success,
        WcStatus::LocLenErr,
        WcStatus::LocQpOpErr,
        WcStatus::LocEecOpErr,
        WcStatus::LocProtErr,
        WcStatus::WrFlushErr,
        WcStatus::MwBindErr,
        WcStatus::BadRespErr,
        WcStatus::LocAccessErr,
        WcStatus::RemInvReqErr,
        WcStatus::RemAccessErr,
        WcStatus::RemOpErr,
        WcStatus::RetryExcErr,
        WcStatus::RnrRetryExcErr,
        WcStatus::LocRddViolErr,
        WcStatus::RemInvRdReqErr,
        WcStatus::RemAbortErr,
        WcStatus::InvEecnErr,
        WcStatus::InvEecStateErr,
        WcStatus::FatalErr,
        WcStatus::RespTimeoutErr,
        WcStatus::GeneralErr,
    ];

    /// Interpret a raw `ibv_wc_status` value.
    pub fn from_raw(status: u32) -> Self {
        Self::KNOWN
            .get(status as usize)
            .copied()
            .unwrap_or(WcStatus::Unknown(status))
    }

    /// Get the raw `ibv_wc_status` value.
    pub fn as_raw(self) -> u32 {
        match self {
            WcStatus::Unknown(x) => x,
            known => Self::KNOWN
                .iter()
                .position(|s| *s == known)
                .map_or(u32::MAX, |i| i as u32),
        }
    }
}

/// Work completion entry polled from a completion queue.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Wc {
    pub(crate) wr_id: WrId,
    pub(crate) status: WcStatus,
    pub(crate) opcode: WcOpcode,
    pub(crate) byte_len: u32,
}

impl Wc {
    /// Create a work completion entry.
    pub fn new(wr_id: WrId, status: WcStatus, opcode: WcOpcode, byte_len: u32) -> Self {
        Self {
            wr_id,
            status,
            opcode,
            byte_len,
        }
    }

    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.wr_id
    }

    /// Get the completion status.
    #[inline]
    pub fn status(&self) -> WcStatus {
        self.status
    }

    /// Get the opcode of the work request.
    ///
    /// **NOTE:** the opcode is only meaningful for successful completions.
    #[inline]
    pub fn opcode(&self) -> WcOpcode {
        self.opcode
    }

    /// Get the number of bytes processed or transferred.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.byte_len as usize
    }

    /// Get the completion status as a `Result`.
    ///
    /// - If the status is success, return the number of bytes transferred.
    /// - Otherwise, return the status as an error.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.bytes()),
            status => Err(status),
        }
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id)
            .field("status", &self.status)
            .field("byte_len", &self.byte_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_raw() {
        assert_eq!(WcStatus::from_raw(0), WcStatus::Success);
        assert_eq!(WcStatus::from_raw(5), WcStatus::WrFlushErr);
        assert_eq!(WcStatus::from_raw(12), WcStatus::RetryExcErr);
        assert_eq!(WcStatus::from_raw(21), WcStatus::GeneralErr);
        assert_eq!(WcStatus::from_raw(99), WcStatus::Unknown(99));

        for raw in 0..=22 {
            assert_eq!(WcStatus::from_raw(raw).as_raw(), raw);
        }
    }

    #[test]
    fn test_ok() {
        let wc = Wc::new(7, WcStatus::Success, WcOpcode::Recv, 4);
        assert_eq!(wc.ok(), Ok(4));

        let wc = Wc::new(7, WcStatus::LocLenErr, WcOpcode::Other(0), 0);
        assert_eq!(wc.ok(), Err(WcStatus::LocLenErr));
    }

    #[cfg(rdma_core)]
    #[test]
    fn test_raw_values_match_verbs() {
        use crate::bindings::*;

        assert_eq!(
            WcStatus::from_raw(ibv_wc_status::IBV_WC_WR_FLUSH_ERR),
            WcStatus::WrFlushErr
        );
        assert_eq!(
            WcStatus::from_raw(ibv_wc_status::IBV_WC_GENERAL_ERR),
            WcStatus::GeneralErr
        );
        assert_eq!(WcOpcode::from_raw(ibv_wc_opcode::IBV_WC_SEND), WcOpcode::Send);
        assert_eq!(WcOpcode::from_raw(ibv_wc_opcode::IBV_WC_RECV), WcOpcode::Recv);
    }
}
