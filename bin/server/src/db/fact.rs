//! PostgreSQL fact store.

use async_trait::async_trait;
use chrono::Utc;
use rootcause::Report;
use speda_conversation::{Fact, FactStore, StoreError};
use speda_core::UserId;
use sqlx::{FromRow, PgPool};

fn storage_failed(err: sqlx::Error) -> Report<StoreError> {
    StoreError::StorageFailed {
        reason: err.to_string(),
    }
    .into()
}

#[derive(FromRow)]
struct FactRow {
    category: String,
    key: String,
    value: String,
    importance: i16,
}

impl From<FactRow> for Fact {
    fn from(row: FactRow) -> Self {
        let importance = u8::try_from(row.importance.clamp(1, 10)).unwrap_or(1);
        Fact::new(row.category, row.key, row.value, importance)
    }
}

/// Fact store backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgFactStore {
    pool: PgPool,
}

impl PgFactStore {
    /// Creates a new store.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FactStore for PgFactStore {
    async fn upsert(&self, owner: UserId, fact: Fact) -> speda_core::Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO user_facts (owner_id, category, key, value, importance, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (owner_id, category, key)
            DO UPDATE SET value = EXCLUDED.value,
                          importance = EXCLUDED.importance,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(owner.to_string())
        .bind(&fact.category)
        .bind(&fact.key)
        .bind(&fact.value)
        .bind(i16::from(fact.importance))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_failed)?;

        Ok(())
    }

    async fn important(
        &self,
        owner: UserId,
        min_importance: u8,
    ) -> speda_core::Result<Vec<Fact>, StoreError> {
        let rows: Vec<FactRow> = sqlx::query_as(
            r#"
            SELECT category, key, value, importance
            FROM user_facts
            WHERE owner_id = $1 AND importance >= $2
            ORDER BY importance DESC, created_at ASC
            "#,
        )
        .bind(owner.to_string())
        .bind(i16::from(min_importance))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_failed)?;

        Ok(rows.into_iter().map(Fact::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_importance_is_kept_in_range() {
        let fact = Fact::from(FactRow {
            category: "Work".to_string(),
            key: "employer".to_string(),
            value: "Acme".to_string(),
            importance: 42,
        });
        assert_eq!(fact, Fact::new("work", "employer", "Acme", 10));

        let low = Fact::from(FactRow {
            category: "work".to_string(),
            key: "k".to_string(),
            value: "v".to_string(),
            importance: -3,
        });
        assert_eq!(low.importance, 1);
    }
}
