//! Data Access Layer
//!
//! Postgres-backed session storage. Lesson state and history are kept as
//! JSONB next to the session row so one read restores the whole session.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recap_core::{
    service::SessionStore,
    session::{Session, SessionStatus},
};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// A session row as stored in `recap_sessions`.
#[derive(FromRow, Debug)]
struct SessionRow {
    id: Uuid,
    user_id: String,
    app_name: String,
    status: String,
    state_json: serde_json::Value,
    instruction: String,
    history_json: serde_json::Value,
    created_at: DateTime<Utc>,
}

fn status_to_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Expired => "expired",
    }
}

fn status_from_str(raw: &str) -> Result<SessionStatus> {
    match raw {
        "active" => Ok(SessionStatus::Active),
        "expired" => Ok(SessionStatus::Expired),
        other => anyhow::bail!("unknown session status '{other}'"),
    }
}

impl TryFrom<SessionRow> for Session {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(Session {
            id: row.id,
            user_id: row.user_id,
            app_name: row.app_name,
            status: status_from_str(&row.status)?,
            state: serde_json::from_value(row.state_json)
                .with_context(|| format!("corrupt state for session {}", row.id))?,
            instruction: row.instruction,
            history: serde_json::from_value(row.history_json)
                .with_context(|| format!("corrupt history for session {}", row.id))?,
            created_at: row.created_at,
        })
    }
}

/// A wrapper around the `PgPool` implementing [`SessionStore`].
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO recap_sessions
                (id, user_id, app_name, status, state_json, instruction, history_json, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(session.id)
        .bind(&session.user_id)
        .bind(&session.app_name)
        .bind(status_to_str(session.status))
        .bind(serde_json::to_value(&session.state)?)
        .bind(&session.instruction)
        .bind(serde_json::to_value(&session.history)?)
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, user_id, app_name, status, state_json, instruction, history_json, created_at
            FROM recap_sessions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Session::try_from).transpose()
    }

    async fn save(&self, session: &Session) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE recap_sessions
            SET status = $2, state_json = $3, history_json = $4, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(session.id)
        .bind(status_to_str(session.status))
        .bind(serde_json::to_value(&session.state)?)
        .bind(serde_json::to_value(&session.history)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("session {} does not exist", session.id);
        }
        Ok(())
    }
}
