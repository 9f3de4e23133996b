use crate::artifact_store::{ArtifactStoreClient, ArtifactStoreError};
use crate::config::Config;
use crate::db::{BotFlow, DbError, PersistenceGateway};
use crate::llm::{CodeSynthesiser, SynthesisError};
use crate::localization::messages::Lang;
use crate::registry::HandlerRegistry;
use crate::telegram::{Reply, TelegramApiClient};
use chrono::{Duration as ChronoDuration, Utc};
use log::{error, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const CONVERSATION_TIMEOUT: Duration = Duration::from_secs(600);
const CREATION_IN_PROGRESS_TTL: Duration = Duration::from_secs(180);
const MAX_BOTS_PER_USER_PER_DAY: i64 = 2;
const MIN_TOKEN_LEN: usize = 20;
const CREATE_BOT_CALLBACK: &str = "create_bot";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowState {
    None,
    WaitingToken,
    WaitingDescription,
    Creating,
}

#[derive(Clone, Debug)]
struct ConversationState {
    state: FlowState,
    flow_id: String,
    /// The raw bot token, held only in memory between token acceptance and
    /// bot creation; only its derived `bot_token_id` is ever persisted.
    token: Option<String>,
    last_touch: Instant,
}

/// Creation Flow State Machine (C7). Orchestrates C2-C5 and C1 event logging
/// behind one collaborator so the dispatcher never reaches into flow
/// internals (§9: breaking the dispatcher/creation-handler cycle).
pub struct CreationFlow {
    db: Arc<PersistenceGateway>,
    artifact_store: Arc<ArtifactStoreClient>,
    synthesiser: Arc<CodeSynthesiser>,
    registry: Arc<HandlerRegistry>,
    telegram: Arc<TelegramApiClient>,
    config: Arc<Config>,
    conversations: Mutex<HashMap<i64, ConversationState>>,
    in_progress: Mutex<HashMap<String, Instant>>,
}

impl CreationFlow {
    pub fn new(
        db: Arc<PersistenceGateway>,
        artifact_store: Arc<ArtifactStoreClient>,
        synthesiser: Arc<CodeSynthesiser>,
        registry: Arc<HandlerRegistry>,
        telegram: Arc<TelegramApiClient>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            artifact_store,
            synthesiser,
            registry,
            telegram,
            config,
            conversations: Mutex::new(HashMap::new()),
            in_progress: Mutex::new(HashMap::new()),
        }
    }

    /// Reconstructs in-memory conversation state from the most recent open
    /// flow for `user_id`, per §3's restart-recovery invariant.
    async fn state_for(&self, user_id: i64) -> FlowState {
        let mut conversations = self.conversations.lock().await;
        if let Some(existing) = conversations.get(&user_id) {
            if existing.last_touch.elapsed() < CONVERSATION_TIMEOUT {
                return existing.state;
            }
            conversations.remove(&user_id);
        }
        drop(conversations);

        match self.db.flow_most_recent_open(user_id).await {
            Ok(Some(flow)) => {
                let state = status_to_state(&flow.status);
                self.conversations.lock().await.insert(
                    user_id,
                    ConversationState {
                        state,
                        flow_id: flow.flow_id,
                        token: None,
                        last_touch: Instant::now(),
                    },
                );
                state
            }
            _ => FlowState::None,
        }
    }

    fn is_admin(&self, user_id: i64) -> bool {
        user_id == self.config.admin_chat_id
    }

    /// Entry point mirroring a loaded handler's `handle_message(text, user_id, context)`
    /// signature; invoked by the dispatcher on the primary token before any
    /// loaded rhai plugin is tried.
    pub async fn handle_message(&self, text: &str, user_id: i64, lang: Lang) -> Option<Reply> {
        let trimmed = text.trim();
        match trimmed {
            "/start" => Some(Reply::Structured {
                text: lang.flow_start().to_string(),
                parse_mode: None,
                reply_markup: Some(json!({
                    "inline_keyboard": [[{"text": lang.flow_start_button(), "callback_data": CREATE_BOT_CALLBACK}]]
                })),
            }),
            "/cancel" => Some(self.handle_cancel(user_id, lang).await),
            "/create_bot" => Some(self.handle_create_bot(user_id, lang).await),
            "/stats" if self.is_admin(user_id) => Some(Reply::Text(self.render_stats().await)),
            _ => {
                let state = self.state_for(user_id).await;
                match state {
                    FlowState::WaitingToken => Some(self.handle_token_input(user_id, trimmed, lang).await),
                    FlowState::WaitingDescription => Some(self.handle_description_input(user_id, trimmed, lang).await),
                    _ => None,
                }
            }
        }
    }

    /// Entry point for the primary token's `CallbackQuery` updates. The only
    /// button the creation flow ever renders is the `/start` "Create" button,
    /// which must run the exact same rate-limit/flow-insert/`flow_started`
    /// sequence as `/create_bot` (§4.7.3).
    pub async fn handle_callback(&self, data: &str, user_id: i64, lang: Lang) -> Option<Reply> {
        match data {
            CREATE_BOT_CALLBACK => Some(self.handle_create_bot(user_id, lang).await),
            _ => None,
        }
    }

    async fn handle_cancel(&self, user_id: i64, lang: Lang) -> Reply {
        let mut conversations = self.conversations.lock().await;
        let Some(convo) = conversations.remove(&user_id) else {
            return Reply::Text(lang.flow_no_active_flow().to_string());
        };
        drop(conversations);
        let _ = self
            .db
            .flow_advance(&convo.flow_id, "cancelled", None, None, Some("cancelled"))
            .await;
        self.log_event(Some(format!("flow_cancelled_{}", convo.flow_id)), user_id, "flow_cancelled", Some(&convo.flow_id), None, json!({}))
            .await;
        Reply::Text(lang.flow_cancelled().to_string())
    }

    async fn handle_create_bot(&self, user_id: i64, lang: Lang) -> Reply {
        if !self.is_admin(user_id) {
            let since = Utc::now() - ChronoDuration::hours(24);
            let count = self.registry.count_created_by(user_id, since).await;
            if count >= MAX_BOTS_PER_USER_PER_DAY {
                return Reply::Text(lang.flow_rate_limited().to_string());
            }
        }

        let flow_id = new_flow_id(user_id);
        let flow = BotFlow {
            flow_id: flow_id.clone(),
            user_id,
            creator_id: user_id,
            status: "waiting_token".to_string(),
            current_stage: 1,
            bot_token_id: None,
            final_status: None,
            stage_times: HashMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        };
        if let Err(e) = self.db.flow_insert(&flow).await {
            error!("failed to insert flow {}: {}", flow_id, e);
            return Reply::Text(lang.error_generic_creation_failed().to_string());
        }
        self.log_event(Some(format!("flow_started_{}", flow_id)), user_id, "flow_started", Some(&flow_id), None, json!({}))
            .await;
        let _ = self.db.flow_advance(&flow_id, "waiting_token", Some(2), None, None).await;

        self.conversations.lock().await.insert(
            user_id,
            ConversationState {
                state: FlowState::WaitingToken,
                flow_id,
                token: None,
                last_touch: Instant::now(),
            },
        );
        Reply::Text(lang.flow_waiting_token().to_string())
    }

    /// §4.7.1 token validation and duplicate-collision pre-check.
    async fn handle_token_input(&self, user_id: i64, token: &str, lang: Lang) -> Reply {
        let Some(convo) = self.conversations.lock().await.get(&user_id).cloned() else {
            return Reply::Text(lang.flow_no_active_flow().to_string());
        };

        if !is_valid_token(token) {
            return Reply::Text(lang.flow_invalid_token().to_string());
        }
        let bot_token_id = bot_token_id_of(token);

        if let Ok(Some(existing)) = self.db.flow_by_bot_token_id(&bot_token_id).await {
            if existing.flow_id != convo.flow_id {
                let _ = self
                    .db
                    .flow_advance(&convo.flow_id, "failed", None, None, Some("failed"))
                    .await;
                self.conversations.lock().await.remove(&user_id);
                return Reply::Text(lang.flow_token_already_used().to_string());
            }
        }

        match self
            .db
            .flow_advance(&convo.flow_id, "waiting_description", Some(3), Some(&bot_token_id), None)
            .await
        {
            Ok(()) => {}
            Err(DbError::ConstraintViolated(_)) => {
                let _ = self
                    .db
                    .flow_advance(&convo.flow_id, "failed", None, None, Some("failed"))
                    .await;
                self.conversations.lock().await.remove(&user_id);
                return Reply::Text(lang.flow_token_already_used().to_string());
            }
            Err(e) => {
                error!("failed to advance flow {} to waiting_description: {}", convo.flow_id, e);
                return Reply::Text(lang.error_generic_creation_failed().to_string());
            }
        }

        self.log_event(Some(format!("token_accepted_{}", convo.flow_id)), user_id, "token_accepted", Some(&convo.flow_id), Some(&bot_token_id), json!({}))
            .await;

        self.conversations.lock().await.entry(user_id).and_modify(|c| {
            c.state = FlowState::WaitingDescription;
            c.token = Some(token.to_string());
            c.last_touch = Instant::now();
        });

        Reply::Text(lang.flow_waiting_description().to_string())
    }

    async fn handle_description_input(&self, user_id: i64, instruction: &str, lang: Lang) -> Reply {
        let Some(convo) = self.conversations.lock().await.get(&user_id).cloned() else {
            return Reply::Text(lang.flow_no_active_flow().to_string());
        };
        let Ok(Some(flow)) = self.db.flow_by_id(&convo.flow_id).await else {
            return Reply::Text(lang.error_generic_creation_failed().to_string());
        };
        let Some(bot_token_id) = flow.bot_token_id.clone() else {
            return Reply::Text(lang.error_generic_creation_failed().to_string());
        };

        self.log_event(Some(format!("description_submitted_{}", convo.flow_id)), user_id, "description_submitted", Some(&convo.flow_id), Some(&bot_token_id), json!({}))
            .await;
        let _ = self
            .db
            .flow_advance(&convo.flow_id, "creating", Some(4), None, None)
            .await;
        self.conversations.lock().await.entry(user_id).and_modify(|c| {
            c.state = FlowState::Creating;
            c.last_touch = Instant::now();
        });

        let Some(token) = convo.token.clone() else {
            return Reply::Text(lang.error_generic_creation_failed().to_string());
        };
        let outcome = self
            .create_with_token(user_id, &convo.flow_id, &token, &bot_token_id, instruction)
            .await;

        self.conversations.lock().await.remove(&user_id);
        outcome_to_reply(outcome, lang)
    }

    /// §4.7.3: the 9-step creation procedure.
    pub async fn create_with_token(
        &self,
        user_id: i64,
        flow_id: &str,
        token: &str,
        bot_token_id: &str,
        instruction: &str,
    ) -> CreationOutcome {
        {
            let mut in_progress = self.in_progress.lock().await;
            if let Some(started) = in_progress.get(token) {
                if started.elapsed() < CREATION_IN_PROGRESS_TTL {
                    return CreationOutcome::AlreadyInProgress;
                }
            }
            in_progress.insert(token.to_string(), Instant::now());
        }
        let outcome = self.create_with_token_inner(user_id, flow_id, token, bot_token_id, instruction).await;
        self.in_progress.lock().await.remove(token);
        outcome
    }

    async fn create_with_token_inner(
        &self,
        user_id: i64,
        flow_id: &str,
        token: &str,
        bot_token_id: &str,
        instruction: &str,
    ) -> CreationOutcome {
        let handler_name = format!("bot_{}", sanitize_handler_suffix(bot_token_id));
        let remote_path = ArtifactStoreClient::handler_path(&handler_name);

        let artifact_exists = self.artifact_store.exists(&remote_path).await.unwrap_or(false);
        if self.registry.exists(token).await || artifact_exists {
            self.fail(flow_id, "artifact_or_registry_exists").await;
            return CreationOutcome::Failed("a bot for this token already exists".to_string());
        }

        match self.synthesiser.synthesise(&handler_name, instruction).await {
            Ok(source) => {
                if let Err(e) = self.artifact_store.create(&remote_path, &source).await {
                    self.fail(flow_id, &format!("artifact_store: {}", e)).await;
                    return CreationOutcome::Failed(artifact_store_message(&e));
                }

                if let Err(e) = self.registry.register(token, &handler_name, user_id).await {
                    self.fail(flow_id, &format!("registry: {}", e)).await;
                    return CreationOutcome::Failed("registration failed".to_string());
                }

                let webhook_url = format!("{}/{}", self.config.webhook_base_url.trim_end_matches('/'), token);
                match self.telegram.set_webhook(token, &webhook_url).await {
                    Ok(()) => {
                        let _ = self.db.flow_advance(flow_id, "created", Some(4), None, None).await;
                        self.log_event(Some(format!("bot_created_{}", flow_id)), user_id, "bot_created", Some(flow_id), Some(bot_token_id), json!({}))
                            .await;
                        CreationOutcome::Created
                    }
                    Err(_) => {
                        let _ = self
                            .db
                            .flow_advance(flow_id, "created_webhook_pending", Some(4), None, Some("created_webhook_pending"))
                            .await;
                        info!("bot_created_webhook_pending for flow {}", flow_id);
                        CreationOutcome::CreatedWebhookPending
                    }
                }
            }
            Err(e) => {
                self.fail(flow_id, &e.to_string()).await;
                CreationOutcome::Failed(synthesis_error_message(&e))
            }
        }
    }

    async fn fail(&self, flow_id: &str, reason: &str) {
        let _ = self.db.flow_advance(flow_id, "failed", None, None, Some("failed")).await;
        self.log_event(None, 0, "creation_failed", Some(flow_id), None, json!({"error": reason}))
            .await;
    }

    /// §4.7.4 activation probe: invoked by the dispatcher for every text
    /// update on a secondary token, before the handler itself is invoked.
    pub async fn activation_probe(&self, bot_token_id: &str, sender_id: i64) {
        let Ok(Some(flow)) = self.db.flow_by_bot_token_id(bot_token_id).await else {
            return;
        };
        if flow.creator_id != sender_id {
            return;
        }
        if flow.status == "activated" {
            return;
        }
        if self
            .db
            .flow_advance(&flow.flow_id, "activated", Some(5), None, Some("activated"))
            .await
            .is_ok()
        {
            self.log_event(
                Some(format!("activation_{}", flow.flow_id)),
                sender_id,
                "bot_activated_by_creator",
                Some(&flow.flow_id),
                Some(bot_token_id),
                json!({}),
            )
            .await;
        }
    }

    async fn log_event(
        &self,
        event_id: Option<String>,
        user_id: i64,
        event_type: &str,
        flow_id: Option<&str>,
        bot_token_id: Option<&str>,
        metadata: serde_json::Value,
    ) {
        if let Err(e) = self
            .db
            .event_log(event_id.as_deref(), user_id, event_type, flow_id, bot_token_id, &metadata)
            .await
        {
            warn!("failed to log funnel event {}: {}", event_type, e);
        }
    }

    async fn render_stats(&self) -> String {
        let Ok(client) = self.db.pool().get().await else {
            return "Admin stats: database unavailable.".to_string();
        };
        let row = client
            .query_one(
                "SELECT
                    (SELECT COUNT(*) FROM bot_registry) AS total_bots,
                    (SELECT COUNT(*) FROM bot_flows WHERE created_at >= now() - interval '1 day') AS started_today,
                    (SELECT COUNT(*) FROM bot_flows WHERE status = 'activated' AND updated_at >= now() - interval '1 day') AS activated_today,
                    (SELECT COUNT(*) FROM bot_flows WHERE final_status = 'failed' AND updated_at >= now() - interval '1 day') AS failed_today",
                &[],
            )
            .await;
        match row {
            Ok(row) => {
                let total_bots: i64 = row.get(0);
                let started_today: i64 = row.get(1);
                let activated_today: i64 = row.get(2);
                let failed_today: i64 = row.get(3);
                format!(
                    "Admin stats:\n{} bots registered overall.\n{} flows started in the last 24h, {} activated, {} failed.",
                    total_bots, started_today, activated_today, failed_today
                )
            }
            Err(e) => {
                warn!("failed to render admin stats: {}", e);
                "Admin stats: query failed.".to_string()
            }
        }
    }
}

pub enum CreationOutcome {
    Created,
    CreatedWebhookPending,
    AlreadyInProgress,
    Failed(String),
}

fn outcome_to_reply(outcome: CreationOutcome, lang: Lang) -> Reply {
    match outcome {
        CreationOutcome::Created => Reply::Text(lang.flow_created().to_string()),
        CreationOutcome::CreatedWebhookPending => Reply::Text(lang.flow_created_webhook_pending().to_string()),
        CreationOutcome::AlreadyInProgress => Reply::Text(lang.flow_already_in_progress().to_string()),
        CreationOutcome::Failed(_) => Reply::Text(lang.error_generic_creation_failed().to_string()),
    }
}

fn synthesis_error_message(e: &SynthesisError) -> String {
    match e {
        SynthesisError::Quota => "system busy".to_string(),
        SynthesisError::Auth => "auth error".to_string(),
        SynthesisError::ProviderUnavailable => "service unavailable".to_string(),
        SynthesisError::EmptyResponse => "model returned no code".to_string(),
        SynthesisError::PolicyRejected(r) => format!("plugin rejected: {}", r),
    }
}

fn artifact_store_message(e: &ArtifactStoreError) -> String {
    e.to_string()
}

/// §4.7.1: accepted iff it contains ':' and length >= 20.
pub fn is_valid_token(token: &str) -> bool {
    token.contains(':') && token.len() >= MIN_TOKEN_LEN
}

/// §4.7.1: portion before first ':', or first 10 characters if no colon.
pub fn bot_token_id_of(token: &str) -> String {
    match token.split_once(':') {
        Some((prefix, _)) => prefix.to_string(),
        None => token.chars().take(10).collect(),
    }
}

fn sanitize_handler_suffix(bot_token_id: &str) -> String {
    bot_token_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn new_flow_id(user_id: i64) -> String {
    format!("flow_{}_{}", user_id, fastrand::u64(..))
}

fn status_to_state(status: &str) -> FlowState {
    match status {
        "waiting_token" => FlowState::WaitingToken,
        "waiting_description" => FlowState::WaitingDescription,
        "creating" => FlowState::Creating,
        _ => FlowState::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_validation_boundary() {
        assert!(!is_valid_token(&"a".repeat(19)));
        assert!(!is_valid_token(&"a".repeat(20)));
        assert!(is_valid_token(&format!("{}:{}", "1".repeat(9), "a".repeat(10))));
    }

    #[test]
    fn bot_token_id_extraction() {
        assert_eq!(bot_token_id_of("123456789:ABCdef"), "123456789");
        assert_eq!(bot_token_id_of("nocolonhereatall"), "nocolonher");
    }

    #[test]
    fn handler_suffix_is_sanitized() {
        assert_eq!(sanitize_handler_suffix("123:abc"), "123_abc");
    }
}
