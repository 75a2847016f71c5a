//! Pre-check gate: estimate how much of the persisted set a feed would orphan.

use std::collections::HashSet;

use refsync_adapters::{RowIter, RowMapper};
use refsync_core::Identity;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::RowError;

/// The persisted side of the comparison. Only membership and size are needed.
pub trait IdentitySet {
    fn len(&self) -> usize;

    fn contains_identity(&self, identity: &Identity) -> bool;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdentitySet for HashSet<Identity> {
    fn len(&self) -> usize {
        HashSet::len(self)
    }

    fn contains_identity(&self, identity: &Identity) -> bool {
        self.contains(identity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Proceed,
    Abort { observed_fraction: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateReport {
    pub decision: GateDecision,
    pub existing: u64,
    pub candidates_seen: u64,
    pub missing: u64,
    pub unreadable_rows: u64,
    pub observed_fraction: f64,
    pub threshold: f64,
}

impl GateReport {
    pub fn proceeds(&self) -> bool {
        matches!(self.decision, GateDecision::Proceed)
    }
}

/// Identity-only projection of a row stream. Attribute mapping is skipped.
pub fn identities<'a>(
    rows: RowIter<'a>,
    mapper: &'a dyn RowMapper,
) -> impl Iterator<Item = Result<Identity, RowError>> + 'a {
    rows.map(move |row| {
        let row = row?;
        Ok(mapper.identity(&row)?)
    })
}

/// Stream candidate identities once and decide whether the run may proceed.
///
/// Only identities that match the persisted set are retained, so memory stays
/// proportional to the persisted side. Abort requires the observed fraction to
/// be strictly above `threshold`.
pub fn precheck<I>(candidates: I, existing: &dyn IdentitySet, threshold: f64) -> GateReport
where
    I: IntoIterator<Item = Result<Identity, RowError>>,
{
    let mut matched: HashSet<Identity> = HashSet::new();
    let mut candidates_seen = 0u64;
    let mut unreadable_rows = 0u64;

    for candidate in candidates {
        match candidate {
            Ok(identity) => {
                candidates_seen += 1;
                if existing.contains_identity(&identity) {
                    matched.insert(identity);
                }
            }
            Err(err) => {
                unreadable_rows += 1;
                warn!(line = err.line(), error = %err, "precheck could not read row identity");
            }
        }
    }

    let existing_len = existing.len() as u64;
    let missing = existing_len.saturating_sub(matched.len() as u64);
    let observed_fraction = if existing_len == 0 {
        0.0
    } else {
        missing as f64 / existing_len as f64
    };
    let decision = if observed_fraction > threshold {
        GateDecision::Abort { observed_fraction }
    } else {
        GateDecision::Proceed
    };

    info!(
        existing = existing_len,
        candidates_seen,
        missing,
        observed_fraction,
        threshold,
        ?decision,
        "precheck finished"
    );

    GateReport {
        decision,
        existing: existing_len,
        candidates_seen,
        missing,
        unreadable_rows,
        observed_fraction,
        threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refsync_adapters::ParseError;

    fn ident(n: usize) -> Identity {
        Identity::new("iso-3166", format!("C{n:03}"), "")
    }

    fn persisted(count: usize) -> HashSet<Identity> {
        (0..count).map(ident).collect()
    }

    #[test]
    fn quarter_missing_aborts_at_twenty_percent() {
        let existing = persisted(100);
        let feed: Vec<_> = (25..100).map(|n| Ok(ident(n))).collect();

        let report = precheck(feed, &existing, 0.2);
        assert_eq!(report.missing, 25);
        assert_eq!(report.decision, GateDecision::Abort { observed_fraction: 0.25 });
        assert!(!report.proceeds());
    }

    #[test]
    fn quarter_missing_proceeds_at_thirty_percent() {
        let existing = persisted(100);
        let feed: Vec<_> = (25..100).map(|n| Ok(ident(n))).collect();

        let report = precheck(feed, &existing, 0.3);
        assert!(report.proceeds());
        assert!((report.observed_fraction - 0.25).abs() < 1e-9);
    }

    #[test]
    fn fraction_equal_to_threshold_proceeds() {
        let existing = persisted(10);
        let feed: Vec<_> = (2..10).map(|n| Ok(ident(n))).collect();
        assert!(precheck(feed, &existing, 0.2).proceeds());
    }

    #[test]
    fn empty_persisted_set_always_proceeds() {
        let existing = HashSet::new();
        let report = precheck(vec![Ok(ident(1))], &existing, 0.0);
        assert_eq!(report.observed_fraction, 0.0);
        assert!(report.proceeds());
    }

    #[test]
    fn duplicates_and_new_identities_do_not_mask_missing_ones() {
        let existing = persisted(4);
        let feed = vec![
            Ok(ident(0)),
            Ok(ident(0)),
            Ok(ident(0)),
            Ok(ident(500)),
            Err(RowError::Parse(ParseError::InvalidUtf8 { line: 5 })),
        ];
        let report = precheck(feed, &existing, 0.5);
        assert_eq!(report.missing, 3);
        assert_eq!(report.candidates_seen, 4);
        assert_eq!(report.unreadable_rows, 1);
        assert!(!report.proceeds());
    }
}
