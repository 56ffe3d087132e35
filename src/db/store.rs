use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

use crate::audit::{AuditOutcome, AuditRecord, AuditSink};
use crate::error::DispatchError;

// Helper struct to map DB row to AuditRecord
#[derive(FromRow)]
struct AuditRow {
    id: String,
    recorded_at: String,
    user_id: String,
    user_name: String,
    team_id: String,
    channel_id: String,
    command_text: String,
    detail: String,
}

impl TryFrom<AuditRow> for AuditRecord {
    type Error = DispatchError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let recorded_at = DateTime::parse_from_rfc3339(&row.recorded_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                DispatchError::DatabaseError(format!("Bad recorded_at on {}: {}", row.id, e))
            })?;
        let outcome: AuditOutcome = serde_json::from_str(&row.detail).map_err(|e| {
            DispatchError::DatabaseError(format!("Bad outcome detail on {}: {}", row.id, e))
        })?;

        Ok(AuditRecord {
            id: row.id,
            recorded_at,
            user_id: row.user_id,
            user_name: row.user_name,
            team_id: row.team_id,
            channel_id: row.channel_id,
            command_text: row.command_text,
            outcome,
        })
    }
}

fn into_records(rows: Vec<AuditRow>) -> Result<Vec<AuditRecord>, DispatchError> {
    rows.into_iter().map(AuditRecord::try_from).collect()
}

/// Number of records per outcome
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub success: i64,
    pub denied: i64,
    pub error: i64,
}

/// Append-only audit log in SQLite
#[derive(Clone)]
pub struct SqlAuditStore {
    pool: SqlitePool,
}

impl SqlAuditStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a record. Records are never updated.
    pub async fn append(&self, record: &AuditRecord) -> Result<(), DispatchError> {
        let detail = serde_json::to_string(&record.outcome).map_err(|e| {
            DispatchError::DatabaseError(format!("Failed to serialize outcome: {}", e))
        })?;

        sqlx::query(
            r#"
            INSERT INTO audit_records (
                id, recorded_at, outcome,
                user_id, user_name, team_id, channel_id,
                command_text, detail
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.recorded_at.to_rfc3339())
        .bind(record.outcome.kind())
        .bind(&record.user_id)
        .bind(&record.user_name)
        .bind(&record.team_id)
        .bind(&record.channel_id)
        .bind(&record.command_text)
        .bind(detail)
        .execute(&self.pool)
        .await
        .map_err(|e| DispatchError::DatabaseError(format!("Failed to append audit record: {}", e)))?;

        Ok(())
    }

    /// Get a record by ID
    pub async fn get_record(&self, id: &str) -> Result<Option<AuditRecord>, DispatchError> {
        let row = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, recorded_at, user_id, user_name, team_id, channel_id, command_text, detail
            FROM audit_records
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DispatchError::DatabaseError(format!("Failed to fetch audit record: {}", e)))?;

        row.map(AuditRecord::try_from).transpose()
    }

    /// Get the most recent records, newest first
    pub async fn get_recent_records(&self, limit: i64) -> Result<Vec<AuditRecord>, DispatchError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, recorded_at, user_id, user_name, team_id, channel_id, command_text, detail
            FROM audit_records
            ORDER BY recorded_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            DispatchError::DatabaseError(format!("Failed to fetch recent audit records: {}", e))
        })?;

        into_records(rows)
    }

    /// Get records with a given outcome (success, denied, error)
    pub async fn get_records_by_outcome(
        &self,
        outcome: &str,
        limit: i64,
    ) -> Result<Vec<AuditRecord>, DispatchError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, recorded_at, user_id, user_name, team_id, channel_id, command_text, detail
            FROM audit_records
            WHERE outcome = ?
            ORDER BY recorded_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(outcome)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            DispatchError::DatabaseError(format!("Failed to fetch audit records by outcome: {}", e))
        })?;

        into_records(rows)
    }

    /// Get records for one chat user
    pub async fn get_records_by_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<AuditRecord>, DispatchError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, recorded_at, user_id, user_name, team_id, channel_id, command_text, detail
            FROM audit_records
            WHERE user_id = ?
            ORDER BY recorded_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            DispatchError::DatabaseError(format!("Failed to fetch audit records by user: {}", e))
        })?;

        into_records(rows)
    }

    /// Get records for one chat user with a given outcome
    pub async fn get_records_by_user_and_outcome(
        &self,
        user_id: &str,
        outcome: &str,
        limit: i64,
    ) -> Result<Vec<AuditRecord>, DispatchError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, recorded_at, user_id, user_name, team_id, channel_id, command_text, detail
            FROM audit_records
            WHERE user_id = ? AND outcome = ?
            ORDER BY recorded_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(outcome)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            DispatchError::DatabaseError(format!(
                "Failed to fetch audit records by user and outcome: {}",
                e
            ))
        })?;

        into_records(rows)
    }

    /// Count records per outcome
    pub async fn get_outcome_counts(&self) -> Result<OutcomeCounts, DispatchError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT outcome, COUNT(*) FROM audit_records GROUP BY outcome")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    DispatchError::DatabaseError(format!("Failed to count audit records: {}", e))
                })?;

        let mut counts = OutcomeCounts::default();
        for (outcome, count) in rows {
            match outcome.as_str() {
                "success" => counts.success = count,
                "denied" => counts.denied = count,
                "error" => counts.error = count,
                _ => {}
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl AuditSink for SqlAuditStore {
    async fn record(&self, record: &AuditRecord) -> Result<(), DispatchError> {
        self.append(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ErrorStage;
    use crate::auth::AuthError;
    use crate::command::{CommandError, SlashCommand};
    use crate::db::init_memory_db;

    fn command(user_id: &str) -> SlashCommand {
        SlashCommand {
            user_id: user_id.to_string(),
            user_name: "ana".to_string(),
            team_id: "T1".to_string(),
            channel_id: "C1".to_string(),
            command: "/deploy".to_string(),
            text: "api prod".to_string(),
            ..Default::default()
        }
    }

    async fn store() -> SqlAuditStore {
        SqlAuditStore::new(init_memory_db().await.unwrap())
    }

    #[tokio::test]
    async fn append_and_fetch() {
        let store = store().await;
        let record = AuditRecord::command_error(&command("U1"), &CommandError::WrongArity(1));
        store.append(&record).await.unwrap();

        let fetched = store.get_record(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, record.id);
        assert_eq!(fetched.user_id, "U1");
        assert_eq!(
            fetched.outcome,
            AuditOutcome::Error {
                stage: ErrorStage::Command,
                reason: CommandError::WrongArity(1).to_string(),
            }
        );
        assert!(store.get_record("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let store = store().await;
        let record = AuditRecord::command_error(&command("U1"), &CommandError::WrongArity(1));
        store.append(&record).await.unwrap();
        assert!(store.append(&record).await.is_err());
    }

    #[tokio::test]
    async fn filters_and_counts() {
        let store = store().await;
        let denied = AuditRecord::denied(
            &command("U2"),
            &AuthError::UserNotAllowed {
                user_id: "U2".to_string(),
            },
        );
        let errored = AuditRecord::command_error(&command("U1"), &CommandError::WrongArity(0));
        store.record(&denied).await.unwrap();
        store.record(&errored).await.unwrap();

        let recent = store.get_recent_records(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(store.get_recent_records(1).await.unwrap().len(), 1);

        let by_outcome = store.get_records_by_outcome("denied", 10).await.unwrap();
        assert_eq!(by_outcome.len(), 1);
        assert_eq!(by_outcome[0].id, denied.id);

        let by_user = store.get_records_by_user("U1", 10).await.unwrap();
        assert_eq!(by_user.len(), 1);
        assert_eq!(by_user[0].id, errored.id);

        let both = store
            .get_records_by_user_and_outcome("U1", "error", 10)
            .await
            .unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].id, errored.id);
        assert!(
            store
                .get_records_by_user_and_outcome("U1", "denied", 10)
                .await
                .unwrap()
                .is_empty()
        );

        assert_eq!(
            store.get_outcome_counts().await.unwrap(),
            OutcomeCounts {
                success: 0,
                denied: 1,
                error: 1,
            }
        );
    }
}
