//! Per-run identity index: what the store held at load time, and what this run did to it.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use refsync_core::{CandidateEntity, Identity, ObservedStatus, PersistedEntity};
use refsync_storage::{EntityStore, Mutation, StoreError};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub identity: Identity,
    pub last_known: Option<PersistedEntity>,
    pub status: ObservedStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    /// `changed` is false when the merge reproduced the persisted state exactly.
    Updated { changed: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub outcome: ApplyOutcome,
    pub mutation: Mutation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub new: u64,
    pub updated: u64,
    pub untouched: u64,
}

#[derive(Debug, Default)]
pub struct IdentityIndex {
    entries: HashMap<Identity, IndexEntry>,
}

impl IdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(store: &dyn EntityStore) -> Result<Self, StoreError> {
        let entities = store.load_all().await?;
        let index = Self::from_entities(entities);
        debug!(entities = index.len(), "identity index loaded");
        Ok(index)
    }

    /// Every persisted entity starts out `Untouched`.
    pub fn from_entities(entities: impl IntoIterator<Item = PersistedEntity>) -> Self {
        let entries = entities
            .into_iter()
            .map(|entity| {
                let identity = entity.identity.clone();
                (
                    identity.clone(),
                    IndexEntry {
                        identity,
                        last_known: Some(entity),
                        status: ObservedStatus::Untouched,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn get(&self, identity: &Identity) -> Option<&IndexEntry> {
        self.entries.get(identity)
    }

    /// Resolve a candidate against the index and produce the mutation that persists it.
    ///
    /// A second sighting of an identity inserted earlier in the same run becomes an
    /// update, and the entry keeps its `New` status.
    pub fn apply(&mut self, candidate: CandidateEntity, now: DateTime<Utc>) -> Applied {
        match self.entries.get_mut(&candidate.identity) {
            Some(entry) => {
                let (merged, changed) = match &entry.last_known {
                    Some(existing) => {
                        let merged = existing.merged_with(candidate, now);
                        let changed = existing.stale || existing.attributes != merged.attributes;
                        (merged, changed)
                    }
                    None => (PersistedEntity::from_candidate(candidate, now), true),
                };
                if entry.status == ObservedStatus::Untouched {
                    entry.status = ObservedStatus::Updated;
                }
                entry.last_known = Some(merged.clone());
                Applied {
                    outcome: ApplyOutcome::Updated { changed },
                    mutation: Mutation::Update(merged),
                }
            }
            None => {
                let entity = PersistedEntity::from_candidate(candidate, now);
                let identity = entity.identity.clone();
                self.entries.insert(
                    identity.clone(),
                    IndexEntry {
                        identity,
                        last_known: Some(entity.clone()),
                        status: ObservedStatus::New,
                    },
                );
                Applied {
                    outcome: ApplyOutcome::Inserted,
                    mutation: Mutation::Insert(entity),
                }
            }
        }
    }

    /// Persisted identities that are not already marked stale.
    pub fn live_identities(&self) -> HashSet<Identity> {
        self.entries
            .values()
            .filter(|entry| entry.last_known.as_ref().is_some_and(|e| !e.stale))
            .map(|entry| entry.identity.clone())
            .collect()
    }

    /// Record an identity whose row was committed by an earlier attempt of this run.
    pub fn mark_replayed(&mut self, identity: &Identity) {
        if let Some(entry) = self.entries.get_mut(identity) {
            if entry.status == ObservedStatus::Untouched {
                entry.status = ObservedStatus::Updated;
            }
        }
    }

    /// Identities the feed never mentioned, in identity order.
    pub fn untouched(&self) -> Vec<Identity> {
        let mut out: Vec<Identity> = self
            .entries
            .values()
            .filter(|entry| entry.status == ObservedStatus::Untouched)
            .map(|entry| entry.identity.clone())
            .collect();
        out.sort();
        out
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.entries.values() {
            match entry.status {
                ObservedStatus::New => counts.new += 1,
                ObservedStatus::Updated => counts.updated += 1,
                ObservedStatus::Untouched => counts.untouched += 1,
            }
        }
        counts
    }

    /// Drain the index into identity order, leaving it empty.
    pub fn take_entries(&mut self) -> Vec<IndexEntry> {
        let mut entries: Vec<IndexEntry> = self.entries.drain().map(|(_, entry)| entry).collect();
        entries.sort_by(|a, b| a.identity.cmp(&b.identity));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refsync_core::Attributes;

    fn candidate(code: &str, name: &str) -> CandidateEntity {
        CandidateEntity {
            identity: Identity::new("iso-4217", code, ""),
            attributes: Attributes::from([("name".to_string(), name.to_string())]),
            source_line: 1,
        }
    }

    fn persisted(code: &str, name: &str) -> PersistedEntity {
        PersistedEntity::from_candidate(candidate(code, name), Utc::now())
    }

    #[test]
    fn unknown_identity_is_inserted_as_new() {
        let mut index = IdentityIndex::new();
        let applied = index.apply(candidate("USD", "Dollar"), Utc::now());
        assert_eq!(applied.outcome, ApplyOutcome::Inserted);
        assert!(matches!(applied.mutation, Mutation::Insert(_)));
        assert_eq!(
            index.get(&Identity::new("iso-4217", "USD", "")).map(|e| e.status),
            Some(ObservedStatus::New)
        );
    }

    #[test]
    fn known_identity_is_updated_and_change_is_detected() {
        let mut index = IdentityIndex::from_entities([persisted("USD", "Dollar")]);

        let same = index.apply(candidate("USD", "Dollar"), Utc::now());
        assert_eq!(same.outcome, ApplyOutcome::Updated { changed: false });

        let renamed = index.apply(candidate("USD", "US Dollar"), Utc::now());
        assert_eq!(renamed.outcome, ApplyOutcome::Updated { changed: true });
        assert_eq!(index.counts().updated, 1);
    }

    #[test]
    fn stale_entity_seen_again_counts_as_changed() {
        let mut stale = persisted("DEM", "Mark");
        stale.stale = true;
        let mut index = IdentityIndex::from_entities([stale]);

        let applied = index.apply(candidate("DEM", "Mark"), Utc::now());
        assert_eq!(applied.outcome, ApplyOutcome::Updated { changed: true });
        match applied.mutation {
            Mutation::Update(entity) => assert!(!entity.stale),
            other => panic!("unexpected mutation {other:?}"),
        }
    }

    #[test]
    fn repeat_sighting_of_new_identity_keeps_new_status() {
        let mut index = IdentityIndex::new();
        index.apply(candidate("EUR", "Euro"), Utc::now());
        let second = index.apply(candidate("EUR", "Euro (EMU)"), Utc::now());

        assert_eq!(second.outcome, ApplyOutcome::Updated { changed: true });
        assert!(matches!(second.mutation, Mutation::Update(_)));
        assert_eq!(index.counts().new, 1);
        assert_eq!(index.counts().updated, 0);
    }

    #[test]
    fn untouched_and_take_entries_are_sorted() {
        let mut index = IdentityIndex::from_entities([
            persisted("ZWL", "Zim dollar"),
            persisted("AFA", "Afghani"),
            persisted("USD", "Dollar"),
        ]);
        index.apply(candidate("USD", "Dollar"), Utc::now());
        index.mark_replayed(&Identity::new("iso-4217", "ZWL", ""));

        assert_eq!(index.untouched(), vec![Identity::new("iso-4217", "AFA", "")]);

        let entries = index.take_entries();
        let codes: Vec<&str> = entries.iter().map(|e| e.identity.code.as_str()).collect();
        assert_eq!(codes, ["AFA", "USD", "ZWL"]);
        assert!(index.is_empty());
    }
}
