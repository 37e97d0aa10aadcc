//! Trust state machine.
//!
//! | From | clean | suspicious | malicious |
//! |------|-------|------------|-----------|
//! | untrusted | validated | flagged | quarantined |
//! | flagged | validated | - | quarantined |
//! | validated | - | - | quarantined |
//! | quarantined | - | - | - |
//!
//! [`transition`] is the strict table. [`plan`] is what the validator applies: re-scans that
//! land on a `-` cell keep the current level, except that nothing ever leaves `quarantined`.

use crate::error::{Result, TrustError};
use crate::memory::TrustLevel;
use crate::security::scanner::Verdict;

/// Strict transition table; every cell outside it is an `InvariantViolation`.
pub fn transition(current: TrustLevel, verdict: Verdict) -> Result<TrustLevel> {
    use TrustLevel::*;
    match (current, verdict) {
        (Untrusted, Verdict::Clean) => Ok(Validated),
        (Untrusted, Verdict::Suspicious) => Ok(Flagged),
        (Untrusted, Verdict::Malicious) => Ok(Quarantined),
        (Flagged, Verdict::Clean) => Ok(Validated),
        (Flagged, Verdict::Malicious) => Ok(Quarantined),
        (Validated, Verdict::Malicious) => Ok(Quarantined),
        (from, verdict) => Err(TrustError::InvariantViolation { from, verdict }),
    }
}

/// What a validation pass does to an entry's trust level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustDecision {
    pub from: TrustLevel,
    pub to: TrustLevel,
    pub verdict: Verdict,
}

impl TrustDecision {
    #[inline]
    pub fn is_change(&self) -> bool {
        self.from != self.to
    }

    /// A validated entry condemned by a newer ruleset.
    #[inline]
    pub fn is_demotion(&self) -> bool {
        self.from == TrustLevel::Validated && self.to == TrustLevel::Quarantined
    }
}

/// Decision for a scan outcome. Off-table re-scan results retain the current level;
/// a quarantined entry is never re-planned.
pub fn plan(current: TrustLevel, verdict: Verdict) -> Result<TrustDecision> {
    let to = match (current, verdict) {
        (TrustLevel::Quarantined, _) => {
            return Err(TrustError::InvariantViolation {
                from: current,
                verdict,
            })
        }
        (TrustLevel::Flagged, Verdict::Suspicious)
        | (TrustLevel::Validated, Verdict::Clean)
        | (TrustLevel::Validated, Verdict::Suspicious) => current,
        _ => transition(current, verdict)?,
    };
    Ok(TrustDecision {
        from: current,
        to,
        verdict,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use TrustLevel::*;

    const LEVELS: [TrustLevel; 4] = [Untrusted, Validated, Flagged, Quarantined];
    const VERDICTS: [Verdict; 3] = [Verdict::Clean, Verdict::Suspicious, Verdict::Malicious];

    #[test]
    fn table_cells() {
        assert_eq!(transition(Untrusted, Verdict::Clean).unwrap(), Validated);
        assert_eq!(transition(Untrusted, Verdict::Suspicious).unwrap(), Flagged);
        assert_eq!(transition(Untrusted, Verdict::Malicious).unwrap(), Quarantined);
        assert_eq!(transition(Flagged, Verdict::Clean).unwrap(), Validated);
        assert_eq!(transition(Flagged, Verdict::Malicious).unwrap(), Quarantined);
        assert_eq!(transition(Validated, Verdict::Malicious).unwrap(), Quarantined);
    }

    #[test]
    fn off_table_cells_are_violations() {
        for (from, verdict) in [
            (Flagged, Verdict::Suspicious),
            (Validated, Verdict::Clean),
            (Validated, Verdict::Suspicious),
            (Quarantined, Verdict::Clean),
        ] {
            assert!(matches!(
                transition(from, verdict),
                Err(TrustError::InvariantViolation { .. })
            ));
        }
    }

    #[test]
    fn nothing_leaves_quarantine() {
        for verdict in VERDICTS {
            let err = plan(Quarantined, verdict).unwrap_err();
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn plan_never_promotes_past_the_table() {
        for from in LEVELS.into_iter().filter(|l| *l != Quarantined) {
            for verdict in VERDICTS {
                let d = plan(from, verdict).unwrap();
                if d.is_change() {
                    assert_eq!(transition(from, verdict).unwrap(), d.to);
                }
            }
        }
        assert!(plan(Validated, Verdict::Malicious).unwrap().is_demotion());
        assert!(!plan(Flagged, Verdict::Suspicious).unwrap().is_change());
    }
}
