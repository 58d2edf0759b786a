//! Error types of the communicator.

use std::{fmt, io};

use thiserror::Error;

use crate::channel::ChannelState;
use crate::rdma::type_alias::WrId;
use crate::rdma::wc::WcStatus;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Recv => f.write_str("recv"),
        }
    }
}

/// Failure of a single read or write.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The buffer does not fit in one work request, whose length is 32-bit.
    #[error("{len}B buffer is too large for one {dir} work request")]
    TooLarge { dir: Direction, len: usize },

    /// Memory registration of the user buffer failed.
    #[error("failed to register {len}B buffer")]
    Register {
        len: usize,
        #[source]
        source: io::Error,
    },

    /// The work request was rejected by the queue pair.
    #[error("failed to post {0} work request")]
    Post(Direction, #[source] io::Error),

    /// Polling the completion queue failed. The work request may still be in
    /// flight, so its memory region is leaked.
    #[error("failed to poll {0} completion queue")]
    Poll(Direction, #[source] io::Error),

    /// The work request completed with an error status.
    #[error("{0} work request completed with error")]
    Completion(Direction, #[source] WcStatus),

    /// A completion arrived for a work request that was never posted.
    #[error("unexpected {dir} completion: expected wr_id {expected}, got {got}")]
    UnexpectedCompletion {
        dir: Direction,
        expected: WrId,
        got: WrId,
    },
}

impl TransferError {
    /// Whether the in-flight memory region could not be reclaimed, leaving
    /// the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransferError::Poll(..) | TransferError::UnexpectedCompletion { .. }
        )
    }

    /// Get the completion status if the work request completed with an error.
    pub fn status(&self) -> Option<WcStatus> {
        match self {
            TransferError::Completion(_, status) => Some(*status),
            _ => None,
        }
    }
}

/// Communicator error type.
#[derive(Debug, Error)]
pub enum Error {
    /// The host name could not be resolved to an address.
    #[error("cannot resolve host `{host}`")]
    Resolution {
        host: String,
        #[source]
        source: io::Error,
    },

    /// Failed to set up the listening endpoint.
    #[error("failed to bind and listen")]
    Bind(#[source] io::Error),

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection")]
    Accept(#[source] io::Error),

    /// Failed to connect to the remote endpoint.
    #[error("failed to connect")]
    Connect(#[source] io::Error),

    /// Failed to disconnect an established connection.
    #[error("failed to disconnect")]
    Disconnect(#[source] io::Error),

    /// A read or write failed.
    #[error("transfer failed")]
    Transfer(#[from] TransferError),

    /// The operation is not allowed in the current lifecycle state.
    #[error("cannot {op} a channel in state {state}")]
    InvalidState {
        op: &'static str,
        state: ChannelState,
    },

    /// The configuration could not be loaded.
    #[error("bad configuration: {0}")]
    Config(String),
}

/// Communicator result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
