//! Queue pair capabilities and their negotiation.

use crate::config::ChannelConfig;

/// Queue pair capability attributes.
///
/// This type corresponds to `struct ibv_qp_cap` in the `ibverbs` C driver.
///
/// The documentation is heavily borrowed from [RDMAmojo](https://www.rdmamojo.com/2012/12/21/ibv_create_qp/).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QpCaps {
    /// The maximum number of outstanding Work Requests that can be posted to
    /// the Send Queue in that Queue Pair.
    pub max_send_wr: u32,

    /// The maximum number of outstanding Work Requests that can be posted to
    /// the Receive Queue in that Queue Pair.
    pub max_recv_wr: u32,

    /// The maximum number of scatter/gather elements in any Work Request that
    /// can be posted to the Send Queue in that Queue Pair.
    pub max_send_sge: u32,

    /// The maximum number of scatter/gather elements in any Work Request that
    /// can be posted to the Receive Queue in that Queue Pair.
    pub max_recv_sge: u32,

    /// The maximum message size (in bytes) that can be posted inline to the
    /// Send Queue. If no inline message is requested, the value can be 0.
    pub max_inline_data: u32,
}

impl QpCaps {
    /// Build the capability request attached to connection setup.
    ///
    /// With the default configuration, this asks for one outstanding work
    /// request per direction, one SGE per work request, and 16B inline data.
    pub fn requested(config: &ChannelConfig) -> Self {
        QpCaps {
            max_send_wr: config.max_send_wr,
            max_recv_wr: config.max_recv_wr,
            max_send_sge: config.max_send_sge,
            max_recv_sge: config.max_recv_sge,
            max_inline_data: config.max_inline_data,
        }
    }
}

/// Capabilities of a connected queue pair, as reported by the device after
/// the connection handshake.
///
/// Devices may silently downgrade what was requested, so the inline decision
/// is always made against the queried values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NegotiatedCaps {
    caps: QpCaps,
    inline_threshold: u32,
    inline_eligible: bool,
}

impl NegotiatedCaps {
    /// Derive the effective capabilities from the queried ones.
    ///
    /// Inline sends are enabled iff the device reports at least
    /// `inline_threshold` bytes of inline data.
    pub fn negotiate(actual: QpCaps, inline_threshold: u32) -> Self {
        let inline_eligible = actual.max_inline_data >= inline_threshold;
        if !inline_eligible {
            log::warn!(
                "rrcomm: device doesn't support inline sends of {}B (max {}B), using sge sends",
                inline_threshold,
                actual.max_inline_data
            );
        }
        Self {
            caps: actual,
            inline_threshold,
            inline_eligible,
        }
    }

    /// Get the queried capabilities.
    #[inline]
    pub fn caps(&self) -> &QpCaps {
        &self.caps
    }

    /// Get the configured inline threshold.
    #[inline]
    pub fn inline_threshold(&self) -> u32 {
        self.inline_threshold
    }

    /// Whether the connection supports inline sends at all.
    #[inline]
    pub fn inline_eligible(&self) -> bool {
        self.inline_eligible
    }

    /// Whether a send of `size` bytes should be posted inline.
    #[inline]
    pub fn inline_for(&self, size: usize) -> bool {
        self.inline_eligible && size <= self.inline_threshold as usize
    }
}
