use chrono::{DateTime, Utc};
use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;
use thiserror::Error;
use tokio_postgres::NoTls;

/// Typed errors for the Persistence Gateway (C1), distinguishing transient
/// unavailability from constraint violations so callers (notably the
/// creation flow) can react differently to each.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("persistence layer unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violated: {0}")]
    ConstraintViolated(String),
    #[error("not found")]
    NotFound,
}

impl From<deadpool_postgres::PoolError> for DbError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        DbError::Unavailable(e.to_string())
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(e: tokio_postgres::Error) -> Self {
        if let Some(db_err) = e.as_db_error() {
            // SQLSTATE 23505 = unique_violation
            if db_err.code().code() == "23505" {
                return DbError::ConstraintViolated(db_err.message().to_string());
            }
        }
        DbError::Unavailable(e.to_string())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub token: String,
    pub handler_name: String,
    pub created_by_user_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BotFlow {
    pub flow_id: String,
    pub user_id: i64,
    pub creator_id: i64,
    pub status: String,
    pub current_stage: i32,
    pub bot_token_id: Option<String>,
    pub final_status: Option<String>,
    pub stage_times: HashMap<String, DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persistence Gateway (C1). Owns the connection pool and exposes typed
/// operations over the four logical collections plus the handler-runtime
/// key/value store, matching the teacher's "struct wrapping a Pool" idiom.
pub struct PersistenceGateway {
    pool: Pool,
}

impl PersistenceGateway {
    pub fn create_pool(database_url: &str) -> Result<Pool, Box<dyn std::error::Error + Send + Sync>> {
        let mut cfg = PoolConfig::new();
        cfg.url = Some(database_url.to_string());
        let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;
        Ok(pool)
    }

    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    // ---- Registry ----

    pub async fn registry_lookup(&self, token: &str) -> Result<Option<RegistryEntry>, DbError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT token, handler_name, created_by_user_id, created_at FROM bot_registry WHERE token = $1",
                &[&token],
            )
            .await?;
        Ok(row.map(|r| RegistryEntry {
            token: r.get(0),
            handler_name: r.get(1),
            created_by_user_id: r.get(2),
            created_at: r.get(3),
        }))
    }

    pub async fn registry_exists(&self, token: &str) -> Result<bool, DbError> {
        Ok(self.registry_lookup(token).await?.is_some())
    }

    /// Upsert on `token`: registering an already-registered token replaces
    /// its `handler_name`/`created_by_user_id` rather than erroring, so a
    /// later registration always wins (spec.md's register/lookup round-trip
    /// property).
    pub async fn registry_register(
        &self,
        token: &str,
        handler_name: &str,
        created_by_user_id: i64,
    ) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO bot_registry (token, handler_name, created_by_user_id) VALUES ($1, $2, $3)
                 ON CONFLICT (token) DO UPDATE SET handler_name = EXCLUDED.handler_name,
                     created_by_user_id = EXCLUDED.created_by_user_id, created_at = NOW()",
                &[&token, &handler_name, &created_by_user_id],
            )
            .await?;
        Ok(())
    }

    /// Count of successful registrations by `user_id` since `since` — backs
    /// the §4.7.2 rolling 24h rate limit.
    pub async fn registry_count_created_by(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
    ) -> Result<i64, DbError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM bot_registry WHERE created_by_user_id = $1 AND created_at >= $2",
                &[&user_id, &since],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Deletes the registry row by `handler_name` rather than `token` — used
    /// by quarantine (§4.3), which only ever knows the handler name it just
    /// failed to load, not the token that maps to it.
    pub async fn registry_delete_by_handler_name(&self, handler_name: &str) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        client
            .execute("DELETE FROM bot_registry WHERE handler_name = $1", &[&handler_name])
            .await?;
        Ok(())
    }

    // ---- Flows ----

    pub async fn flow_insert(&self, flow: &BotFlow) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        let stage_times = serde_json::to_value(&flow.stage_times).unwrap_or(Json::Object(Default::default()));
        client
            .execute(
                "INSERT INTO bot_flows (flow_id, user_id, creator_id, status, current_stage, bot_token_id, final_status, stage_times)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &flow.flow_id,
                    &flow.user_id,
                    &flow.creator_id,
                    &flow.status,
                    &flow.current_stage,
                    &flow.bot_token_id,
                    &flow.final_status,
                    &stage_times,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn flow_by_id(&self, flow_id: &str) -> Result<Option<BotFlow>, DbError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT flow_id, user_id, creator_id, status, current_stage, bot_token_id, final_status, stage_times, created_at, updated_at, completed_at
                 FROM bot_flows WHERE flow_id = $1",
                &[&flow_id],
            )
            .await?;
        Ok(row.map(row_to_flow))
    }

    pub async fn flow_by_bot_token_id(&self, bot_token_id: &str) -> Result<Option<BotFlow>, DbError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT flow_id, user_id, creator_id, status, current_stage, bot_token_id, final_status, stage_times, created_at, updated_at, completed_at
                 FROM bot_flows WHERE bot_token_id = $1",
                &[&bot_token_id],
            )
            .await?;
        Ok(row.map(row_to_flow))
    }

    /// Most recent open (final_status null) flow for `user_id` — used to
    /// reconstruct ConversationState after a restart.
    pub async fn flow_most_recent_open(&self, user_id: i64) -> Result<Option<BotFlow>, DbError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT flow_id, user_id, creator_id, status, current_stage, bot_token_id, final_status, stage_times, created_at, updated_at, completed_at
                 FROM bot_flows WHERE user_id = $1 AND final_status IS NULL
                 ORDER BY updated_at DESC LIMIT 1",
                &[&user_id],
            )
            .await?;
        Ok(row.map(row_to_flow))
    }

    /// Applies the Stage Guardrail (§4.7): `current_stage` only moves
    /// forward, except when setting a terminal `final_status`.
    pub async fn flow_advance(
        &self,
        flow_id: &str,
        status: &str,
        new_stage: Option<i32>,
        bot_token_id: Option<&str>,
        final_status: Option<&str>,
    ) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        let completed = final_status.is_some();
        let rows = client
            .execute(
                "UPDATE bot_flows SET
                    status = $2,
                    current_stage = CASE WHEN $3::int IS NULL THEN current_stage
                                         WHEN $5::text IS NOT NULL THEN GREATEST(current_stage, $3)
                                         WHEN $3 > current_stage THEN $3
                                         ELSE current_stage END,
                    bot_token_id = COALESCE($4, bot_token_id),
                    final_status = COALESCE($5, final_status),
                    updated_at = NOW(),
                    completed_at = CASE WHEN $6 THEN NOW() ELSE completed_at END
                 WHERE flow_id = $1",
                &[&flow_id, &status, &new_stage, &bot_token_id, &final_status, &completed],
            )
            .await?;
        if rows == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // ---- Events ----

    /// Idempotent insert: if `event_id` is set and already present, does nothing.
    pub async fn event_log(
        &self,
        event_id: Option<&str>,
        user_id: i64,
        event_type: &str,
        flow_id: Option<&str>,
        bot_token_id: Option<&str>,
        metadata: &Json,
    ) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO funnel_events (event_id, user_id, event_type, flow_id, bot_token_id, metadata)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (event_id) DO NOTHING",
                &[&event_id, &user_id, &event_type, &flow_id, &bot_token_id, metadata],
            )
            .await?;
        Ok(())
    }

    /// Deletes events older than 90 days — substitutes for the document
    /// store's native TTL index (§4.1).
    pub async fn events_reap_expired(&self) -> Result<u64, DbError> {
        let client = self.pool.get().await?;
        let affected = client
            .execute(
                "DELETE FROM funnel_events WHERE timestamp < NOW() - INTERVAL '90 days'",
                &[],
            )
            .await?;
        Ok(affected)
    }

    // ---- Actions ----

    pub async fn action_log(
        &self,
        user_id: i64,
        action_type: &str,
        bot_id: Option<&str>,
        details: &Json,
    ) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO user_actions (user_id, action_type, bot_id, details) VALUES ($1, $2, $3, $4)",
                &[&user_id, &action_type, &bot_id, details],
            )
            .await?;
        Ok(())
    }

    // ---- bot_states (handler-runtime save_state/load_state) ----

    pub async fn state_save(&self, bot_id: &str, user_id: &str, key: &str, value: &Json) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO bot_states (bot_id, user_id, key, value) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (bot_id, user_id, key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
                &[&bot_id, &user_id, &key, value],
            )
            .await?;
        Ok(())
    }

    pub async fn state_load(&self, bot_id: &str, user_id: &str, key: &str) -> Result<Option<Json>, DbError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT value FROM bot_states WHERE bot_id = $1 AND user_id = $2 AND key = $3",
                &[&bot_id, &user_id, &key],
            )
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

fn row_to_flow(r: tokio_postgres::Row) -> BotFlow {
    let stage_times_json: Json = r.get(7);
    BotFlow {
        flow_id: r.get(0),
        user_id: r.get(1),
        creator_id: r.get(2),
        status: r.get(3),
        current_stage: r.get(4),
        bot_token_id: r.get(5),
        final_status: r.get(6),
        stage_times: serde_json::from_value(stage_times_json).unwrap_or_default(),
        created_at: r.get(8),
        updated_at: r.get(9),
        completed_at: r.get(10),
    }
}
