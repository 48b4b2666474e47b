//! Disconnection reasons and the verify-error-to-reject-code mapping table.
//!
//! The mapping table resolves an explicit open question left by the design:
//! the source material gestures at a `VerifyError -> reject code` table
//! without enumerating it. The table below is that enumeration; see
//! `DESIGN.md` for the reasoning behind each entry's ban-score delta.
use thiserror::Error;

use peerpool_wire::RejectCode;

/// Why a peer was disconnected. Mirrors the teacher's own
/// `DisconnectReason`, trimmed to the reasons this crate's state machine
/// can actually produce.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisconnectReason {
    /// The peer crossed the ban-score threshold.
    #[error("peer misbehaving: {0}")]
    PeerMisbehaving(&'static str),
    /// The peer's protocol version is too old.
    #[error("peer protocol version too old")]
    PeerProtocolVersion,
    /// The peer doesn't advertise the required service bits.
    #[error("peer doesn't support required services")]
    PeerServices,
    /// The peer's magic doesn't match our network.
    #[error("peer network magic mismatch")]
    PeerMagic,
    /// The peer connected to itself.
    #[error("self connection")]
    SelfConnection,
    /// The peer didn't complete the handshake in time.
    #[error("connection stall")]
    ConnectionStall,
    /// The peer stopped responding to a pending request.
    #[error("peer timed out: {0}")]
    PeerTimeout(&'static str),
    /// The peer sent a message its state didn't permit.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    /// Outbound or inbound buffer exceeded its cap.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    /// Host application asked for this peer to be dropped.
    #[error("disconnected by command")]
    Command,
    /// Catch-all for conditions not covered above.
    #[error("{0}")]
    Other(&'static str),
}

impl DisconnectReason {
    /// Whether this reason represents a transient condition (network
    /// hiccup, timeout) as opposed to a deliberate protocol rejection —
    /// useful for deciding whether the address manager should still be
    /// willing to retry the peer later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionStall | Self::PeerTimeout(_) | Self::ResourceExhausted(_)
        )
    }
}

/// The outcome the chain or mempool collaborator reports back after being
/// asked to validate a block or transaction. The pool never inspects the
/// inside of a verify failure; it only needs enough to pick a reject code
/// and a ban-score delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    /// The object itself couldn't be parsed into a consensus-valid shape.
    Malformed,
    /// The object failed a consensus rule (bad PoW, bad signature, ...).
    Invalid,
    /// The object uses rules this node no longer accepts.
    Obsolete,
    /// The object was already known.
    Duplicate,
    /// The object doesn't meet local relay policy.
    NonStandard,
    /// An output value was below the dust threshold.
    Dust,
    /// The offered fee rate was below the configured minimum.
    InsufficientFee,
    /// The object conflicts with a hard-coded checkpoint.
    Checkpoint,
}

impl VerifyError {
    /// The wire `reject` code this verify failure maps to.
    pub fn reject_code(&self) -> RejectCode {
        match self {
            Self::Malformed => RejectCode::Malformed,
            Self::Invalid => RejectCode::Invalid,
            Self::Obsolete => RejectCode::Obsolete,
            Self::Duplicate => RejectCode::Duplicate,
            Self::NonStandard => RejectCode::NonStandard,
            Self::Dust => RejectCode::Dust,
            Self::InsufficientFee => RejectCode::InsufficientFee,
            Self::Checkpoint => RejectCode::Checkpoint,
        }
    }

    /// The ban-score delta to apply to the sending peer after a `reject`
    /// for this failure is sent. Malformed/invalid data is treated more
    /// harshly than policy-only rejections (dust, fee, duplicate), which a
    /// well-behaved peer can trigger legitimately under normal relay churn.
    pub fn ban_score_delta(&self) -> u32 {
        match self {
            Self::Malformed => 100,
            Self::Invalid => 100,
            Self::Checkpoint => 100,
            Self::Obsolete => 20,
            Self::NonStandard => 10,
            Self::InsufficientFee => 0,
            Self::Dust => 0,
            Self::Duplicate => 0,
        }
    }

    /// A short human-readable reason, as carried in the `reject` message's
    /// reason field.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Invalid => "invalid",
            Self::Obsolete => "obsolete",
            Self::Duplicate => "duplicate",
            Self::NonStandard => "non-standard",
            Self::Dust => "dust",
            Self::InsufficientFee => "insufficient fee",
            Self::Checkpoint => "checkpoint mismatch",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_verify_error_has_a_distinct_reject_code_or_documented_overlap() {
        for err in [
            VerifyError::Malformed,
            VerifyError::Invalid,
            VerifyError::Obsolete,
            VerifyError::Duplicate,
            VerifyError::NonStandard,
            VerifyError::Dust,
            VerifyError::InsufficientFee,
            VerifyError::Checkpoint,
        ] {
            let _ = err.reject_code();
            let _ = err.reason();
        }
    }

    #[test]
    fn harsh_failures_score_at_the_ban_threshold() {
        assert_eq!(VerifyError::Malformed.ban_score_delta(), 100);
        assert_eq!(VerifyError::Checkpoint.ban_score_delta(), 100);
    }

    #[test]
    fn policy_only_rejections_do_not_score() {
        assert_eq!(VerifyError::Dust.ban_score_delta(), 0);
        assert_eq!(VerifyError::Duplicate.ban_score_delta(), 0);
    }
}
