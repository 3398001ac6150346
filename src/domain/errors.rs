use thiserror::Error;

use crate::domain::entities::position::Position;

/// Gating outcome that is not an error: the event simply did not warrant an
/// order. Counted, logged, and forgotten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Event below the qualification threshold.
    NotQualified,
    /// `open + pending` already at the position cap.
    CapacityReached,
    /// Another invocation holds the per-symbol lock.
    Pending,
    /// Instrument unknown or not currently tradable.
    Untradable,
    /// Spread too wide to counter-trade into.
    Illiquid,
    /// No balance reference available to size against.
    NoBalance,
    /// Sized quantity below the venue minimum.
    BelowMinQuantity,
    /// Position already pyramided through every split.
    MaxDcaLevel,
    /// Price has not improved enough past the previous trigger.
    NoImprovement,
    /// Passive entry did not fill within the settle window.
    PassiveUnfilled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NotQualified => write!(f, "not qualified"),
            SkipReason::CapacityReached => write!(f, "capacity"),
            SkipReason::Pending => write!(f, "pending"),
            SkipReason::Untradable => write!(f, "untradable"),
            SkipReason::Illiquid => write!(f, "illiquid"),
            SkipReason::NoBalance => write!(f, "no balance"),
            SkipReason::BelowMinQuantity => write!(f, "below min quantity"),
            SkipReason::MaxDcaLevel => write!(f, "max dca level"),
            SkipReason::NoImprovement => write!(f, "no improvement"),
            SkipReason::PassiveUnfilled => write!(f, "passive unfilled"),
        }
    }
}

/// Terminal outcome of one `on_liquidation` invocation. Every failure mode is
/// converted into one of these; nothing propagates out of the engine.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Skipped(SkipReason),
    Filled(Box<Position>),
    /// The venue rejected or the fill could not be confirmed; entry abandoned.
    Failed(String),
    /// Unexpected I/O or state error; entry abandoned.
    Error(String),
}

impl ExecutionOutcome {
    pub fn is_filled(&self) -> bool {
        matches!(self, ExecutionOutcome::Filled(_))
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            ExecutionOutcome::Skipped(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Failures from the venue gateway.
#[derive(Debug, Clone, Error)]
pub enum VenueError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited")]
    RateLimited,

    #[error("malformed venue response: {0}")]
    Malformed(String),
}

impl VenueError {
    /// Read-path failures worth a backoff retry. One-shot order submissions
    /// are never retried on these; the entry is abandoned instead.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VenueError::Network(_) | VenueError::Timeout(_) | VenueError::RateLimited
        )
    }
}
