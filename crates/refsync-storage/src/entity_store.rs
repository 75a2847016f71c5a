//! Persistence-engine contract and the in-memory engine.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refsync_core::{Identity, PersistedEntity};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    Insert(PersistedEntity),
    Update(PersistedEntity),
    MarkStale {
        identity: Identity,
        at: DateTime<Utc>,
    },
    Delete(Identity),
}

impl Mutation {
    pub fn identity(&self) -> &Identity {
        match self {
            Self::Insert(entity) | Self::Update(entity) => &entity.identity,
            Self::MarkStale { identity, .. } | Self::Delete(identity) => identity,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("insert conflicts with existing entity {identity}")]
    Conflict { identity: Identity },
    #[error("update targets missing entity {identity}")]
    Missing { identity: Identity },
    #[error("store temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt row for {identity}: {reason}")]
    CorruptRow { identity: Identity, reason: String },
    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Backend(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            Self::Conflict { .. } | Self::Missing { .. } | Self::CorruptRow { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitReceipt {
    pub inserted: u64,
    pub updated: u64,
    pub marked_stale: u64,
    pub deleted: u64,
}

impl CommitReceipt {
    fn record(&mut self, mutation: &Mutation, affected: bool) {
        if !affected {
            return;
        }
        match mutation {
            Mutation::Insert(_) => self.inserted += 1,
            Mutation::Update(_) => self.updated += 1,
            Mutation::MarkStale { .. } => self.marked_stale += 1,
            Mutation::Delete(_) => self.deleted += 1,
        }
    }
}

/// A persistence engine. `commit` applies every mutation or none of them.
///
/// The reconciler assumes it is the only writer for the duration of a run.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<PersistedEntity>, StoreError>;

    async fn get(&self, identity: &Identity) -> Result<Option<PersistedEntity>, StoreError>;

    async fn commit(&self, mutations: &[Mutation]) -> Result<CommitReceipt, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    rows: Mutex<BTreeMap<Identity, PersistedEntity>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: impl IntoIterator<Item = PersistedEntity>) -> Self {
        let rows = entities
            .into_iter()
            .map(|entity| (entity.identity.clone(), entity))
            .collect();
        Self {
            rows: Mutex::new(rows),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<Identity, PersistedEntity>>, StoreError> {
        self.rows
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    pub fn snapshot(&self) -> Vec<PersistedEntity> {
        self.lock()
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|rows| rows.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn load_all(&self) -> Result<Vec<PersistedEntity>, StoreError> {
        Ok(self.lock()?.values().cloned().collect())
    }

    async fn get(&self, identity: &Identity) -> Result<Option<PersistedEntity>, StoreError> {
        Ok(self.lock()?.get(identity).cloned())
    }

    async fn commit(&self, mutations: &[Mutation]) -> Result<CommitReceipt, StoreError> {
        let mut rows = self.lock()?;
        // Stage against a copy so a failing mutation leaves the visible state untouched.
        let mut staged = rows.clone();
        let mut receipt = CommitReceipt::default();

        for mutation in mutations {
            let affected = match mutation {
                Mutation::Insert(entity) => {
                    if staged.contains_key(&entity.identity) {
                        return Err(StoreError::Conflict {
                            identity: entity.identity.clone(),
                        });
                    }
                    staged.insert(entity.identity.clone(), entity.clone());
                    true
                }
                Mutation::Update(entity) => {
                    let Some(existing) = staged.get_mut(&entity.identity) else {
                        return Err(StoreError::Missing {
                            identity: entity.identity.clone(),
                        });
                    };
                    *existing = entity.clone();
                    true
                }
                Mutation::MarkStale { identity, at } => match staged.get_mut(identity) {
                    Some(existing) if !existing.stale => {
                        existing.stale = true;
                        existing.updated_at = *at;
                        true
                    }
                    _ => false,
                },
                Mutation::Delete(identity) => staged.remove(identity).is_some(),
            };
            receipt.record(mutation, affected);
        }

        *rows = staged;
        Ok(receipt)
    }
}
