//! Tiered settlement matching.
//!
//! The venue's closed-PnL records carry no key back to the originating entry,
//! so association is heuristic: an ordered list of pure predicates, evaluated
//! strictest first, first match wins. Each tier is independently testable.

use std::time::Duration;

use crate::config::EngineConfig;
use crate::domain::entities::position::Position;
use crate::domain::repositories::venue_client::ClosedPnlRecord;

/// Relative proximity check, tolerant of a zero reference.
pub(crate) fn within_pct(value: f64, reference: f64, pct: f64) -> bool {
    if reference == 0.0 {
        return value == 0.0;
    }
    ((value - reference) / reference).abs() <= pct
}

pub struct MatchTier {
    pub name: &'static str,
    pub matches: fn(&Position, &ClosedPnlRecord) -> bool,
}

fn tier_exact(position: &Position, record: &ClosedPnlRecord) -> bool {
    within_pct(record.avg_entry_price, position.entry_price, 0.005)
        && within_pct(record.qty, position.quantity, 0.01)
}

/// Looser bounds absorb DCA-blended entries and partial rounding drift.
fn tier_dca_adjusted(position: &Position, record: &ClosedPnlRecord) -> bool {
    within_pct(record.avg_entry_price, position.entry_price, 0.05)
        && within_pct(record.qty, position.quantity, 0.20)
}

fn tier_side(position: &Position, record: &ClosedPnlRecord) -> bool {
    record.side == position.side
}

fn tier_most_recent(_position: &Position, _record: &ClosedPnlRecord) -> bool {
    true
}

pub const TIERS: [MatchTier; 4] = [
    MatchTier { name: "exact", matches: tier_exact },
    MatchTier { name: "dca_adjusted", matches: tier_dca_adjusted },
    MatchTier { name: "side", matches: tier_side },
    MatchTier { name: "most_recent", matches: tier_most_recent },
];

/// Pick the settlement record for `position` from pre-filtered candidates.
///
/// Candidates must already exclude consumed ids and be sorted most recent
/// first, so the terminal tier degenerates to "most recent unconsumed".
pub fn find_match<'a>(
    position: &Position,
    candidates: &[&'a ClosedPnlRecord],
) -> Option<(&'static str, &'a ClosedPnlRecord)> {
    for tier in &TIERS {
        for record in candidates {
            if (tier.matches)(position, record) {
                return Some((tier.name, record));
            }
        }
    }
    None
}

/// Retry schedule for settlement matching: settlement lags position
/// disappearance, so attempts are spaced out, and the trailing attempts drop
/// the time-ordering filter instead of branching inline.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub relax_after: u32,
}

impl RetryPolicy {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        RetryPolicy {
            attempts: cfg.match_attempts,
            delay: Duration::from_secs(cfg.match_delay_secs),
            relax_after: cfg.match_relax_after,
        }
    }

    /// Whether this attempt ignores the open-time ordering constraint.
    pub fn is_relaxed(&self, attempt: u32) -> bool {
        attempt >= self.relax_after
    }
}
