//! Postgres persistence engine. One transaction per `commit` call.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refsync_core::{Attributes, Identity, PersistedEntity};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::debug;

use crate::entity_store::{CommitReceipt, EntityStore, Mutation, StoreError};

const SELECT_COLUMNS: &str =
    "SELECT domain, code, qualifier, attributes, stale, first_seen_at, updated_at FROM reference_entities";

#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running reference_entities migrations")
    }
}

fn entity_from_row(row: &PgRow) -> Result<PersistedEntity, StoreError> {
    let identity = Identity::new(
        row.try_get::<String, _>("domain")?,
        row.try_get::<String, _>("code")?,
        row.try_get::<String, _>("qualifier")?,
    );
    let attributes = row
        .try_get::<Json<Attributes>, _>("attributes")
        .map_err(|err| StoreError::CorruptRow {
            identity: identity.clone(),
            reason: err.to_string(),
        })?
        .0;
    Ok(PersistedEntity {
        identity,
        attributes,
        stale: row.try_get("stale")?,
        first_seen_at: row.try_get::<DateTime<Utc>, _>("first_seen_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn load_all(&self) -> Result<Vec<PersistedEntity>, StoreError> {
        let rows = sqlx::query(SELECT_COLUMNS).fetch_all(&self.pool).await?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn get(&self, identity: &Identity) -> Result<Option<PersistedEntity>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE domain = $1 AND code = $2 AND qualifier = $3");
        let row = sqlx::query(&sql)
            .bind(&identity.domain)
            .bind(&identity.code)
            .bind(&identity.qualifier)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entity_from_row).transpose()
    }

    async fn commit(&self, mutations: &[Mutation]) -> Result<CommitReceipt, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut receipt = CommitReceipt::default();

        for mutation in mutations {
            match mutation {
                Mutation::Insert(entity) => {
                    let result = sqlx::query(
                        "INSERT INTO reference_entities \
                         (domain, code, qualifier, attributes, stale, first_seen_at, updated_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7) \
                         ON CONFLICT (domain, code, qualifier) DO NOTHING",
                    )
                    .bind(&entity.identity.domain)
                    .bind(&entity.identity.code)
                    .bind(&entity.identity.qualifier)
                    .bind(Json(&entity.attributes))
                    .bind(entity.stale)
                    .bind(entity.first_seen_at)
                    .bind(entity.updated_at)
                    .execute(&mut *tx)
                    .await?;
                    if result.rows_affected() == 0 {
                        return Err(StoreError::Conflict {
                            identity: entity.identity.clone(),
                        });
                    }
                    receipt.inserted += 1;
                }
                Mutation::Update(entity) => {
                    let result = sqlx::query(
                        "UPDATE reference_entities \
                         SET attributes = $4, stale = $5, updated_at = $6 \
                         WHERE domain = $1 AND code = $2 AND qualifier = $3",
                    )
                    .bind(&entity.identity.domain)
                    .bind(&entity.identity.code)
                    .bind(&entity.identity.qualifier)
                    .bind(Json(&entity.attributes))
                    .bind(entity.stale)
                    .bind(entity.updated_at)
                    .execute(&mut *tx)
                    .await?;
                    if result.rows_affected() == 0 {
                        return Err(StoreError::Missing {
                            identity: entity.identity.clone(),
                        });
                    }
                    receipt.updated += 1;
                }
                Mutation::MarkStale { identity, at } => {
                    let result = sqlx::query(
                        "UPDATE reference_entities SET stale = TRUE, updated_at = $4 \
                         WHERE domain = $1 AND code = $2 AND qualifier = $3 AND NOT stale",
                    )
                    .bind(&identity.domain)
                    .bind(&identity.code)
                    .bind(&identity.qualifier)
                    .bind(at)
                    .execute(&mut *tx)
                    .await?;
                    receipt.marked_stale += result.rows_affected();
                }
                Mutation::Delete(identity) => {
                    let result = sqlx::query(
                        "DELETE FROM reference_entities \
                         WHERE domain = $1 AND code = $2 AND qualifier = $3",
                    )
                    .bind(&identity.domain)
                    .bind(&identity.code)
                    .bind(&identity.qualifier)
                    .execute(&mut *tx)
                    .await?;
                    receipt.deleted += result.rows_affected();
                }
            }
        }

        // Dropping `tx` on any early return above rolls the whole unit back.
        tx.commit().await?;
        debug!(?receipt, mutations = mutations.len(), "postgres unit of work committed");
        Ok(receipt)
    }
}
