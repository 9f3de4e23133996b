use crate::analytics::FunnelAnalytics;
use crate::config::Config;
use crate::db::PersistenceGateway;
use crate::flow::{bot_token_id_of, CreationFlow};
use crate::handler_runtime::HandlerContext;
use crate::localization::messages::Lang;
use crate::registry::HandlerRegistry;
use crate::telegram::{Reply, TelegramApiClient};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use log::{error, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use teloxide::types::{MaybeInaccessibleMessage, Update, UpdateKind};

/// Webhook Dispatcher (C6): the single axum entry point every bot's webhook
/// points at. Resolves `bot_token` to either the built-in creation flow
/// (primary token) or a loaded handler (secondary token), and always
/// acknowledges Telegram with `{"ok": true}` regardless of inner outcome.
#[derive(Clone)]
pub struct DispatcherState {
    pub config: Arc<Config>,
    pub db: Arc<PersistenceGateway>,
    pub registry: Arc<HandlerRegistry>,
    pub telegram: Arc<TelegramApiClient>,
    pub creation_flow: Arc<CreationFlow>,
    pub analytics: Arc<FunnelAnalytics>,
}

pub fn router(state: DispatcherState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/funnel", get(funnel_summary))
        .route("/api/funnel/users", get(funnel_users))
        .route("/api/funnel/errors", get(funnel_errors))
        .route("/:bot_token", post(webhook))
        .with_state(state)
}

async fn root() -> &'static str {
    "bot-factory is running"
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy", "bot": "bot-factory"}))
}

fn parse_days(params: &HashMap<String, String>) -> i64 {
    params.get("days").and_then(|v| v.parse().ok()).filter(|d| *d > 0).unwrap_or(30)
}

fn admin_authorized(state: &DispatcherState, headers: &HeaderMap, params: &HashMap<String, String>) -> bool {
    let provided = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .or_else(|| params.get("token").map(|s| s.as_str()));
    state.config.admin_token_matches(provided)
}

async fn funnel_summary(
    State(state): State<DispatcherState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !admin_authorized(&state, &headers, &params) {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"})));
    }
    let days = parse_days(&params);
    let window = params.get("window").map(|s| s.as_str()).unwrap_or("start");
    (StatusCode::OK, Json(state.analytics.funnel_summary(days, window).await))
}

async fn funnel_users(
    State(state): State<DispatcherState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !admin_authorized(&state, &headers, &params) {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"})));
    }
    let days = parse_days(&params);
    let stage = params.get("stage").and_then(|v| v.parse().ok());
    let limit = params.get("limit").and_then(|v| v.parse().ok()).filter(|l| *l > 0).unwrap_or(50);
    (StatusCode::OK, Json(state.analytics.funnel_users(days, stage, limit).await))
}

async fn funnel_errors(
    State(state): State<DispatcherState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !admin_authorized(&state, &headers, &params) {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"})));
    }
    let days = parse_days(&params);
    (StatusCode::OK, Json(state.analytics.funnel_errors(days).await))
}

/// Every webhook call is acknowledged with `{"ok": true}`; failures inside
/// handler dispatch are logged and surfaced to the chat as a fixed apology,
/// never as a non-200 response (§4.6 fault isolation).
async fn webhook(
    State(state): State<DispatcherState>,
    Path(bot_token): Path<String>,
    body: axum::body::Bytes,
) -> Json<Value> {
    let update: Update = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(e) => {
            warn!("failed to decode update for token prefix {}: {}", bot_token_id_of(&bot_token), e);
            return Json(json!({"ok": true}));
        }
    };

    if let Err(e) = handle_update(&state, &bot_token, update).await {
        error!("dispatch error for token prefix {}: {}", bot_token_id_of(&bot_token), e);
    }

    Json(json!({"ok": true}))
}

async fn handle_update(state: &DispatcherState, bot_token: &str, update: Update) -> Result<(), String> {
    let is_primary = bot_token == state.config.telegram_token;

    match update.kind {
        UpdateKind::Message(message) => {
            let Some(text) = message.text().map(|t| t.to_string()) else {
                return Ok(());
            };
            let Some(user) = message.from() else {
                return Ok(());
            };
            let user_id = user.id.0 as i64;
            let chat_id = message.chat.id.0;
            let lang = Lang::from_code(user.language_code.as_deref());

            state
                .db
                .action_log(user_id, "message_received", Some(&bot_token_id_of(bot_token)), &json!({"is_primary": is_primary}))
                .await
                .ok();

            if !is_primary {
                state.creation_flow.activation_probe(&bot_token_id_of(bot_token), user_id).await;
            }

            let reply = if is_primary {
                state.creation_flow.handle_message(&text, user_id, lang).await
            } else {
                dispatch_to_handler(state, bot_token, &text, user_id, &message, lang).await
            };

            if let Some(reply) = reply {
                if !reply.is_empty() {
                    state
                        .telegram
                        .send_message(bot_token, chat_id, &reply)
                        .await
                        .map_err(|e| e.to_string())?;
                }
            }
            Ok(())
        }
        UpdateKind::CallbackQuery(callback) => {
            let user_id = callback.from.id.0 as i64;
            let data = callback.data.clone().unwrap_or_default();

            if is_primary {
                let lang = Lang::from_code(callback.from.language_code.as_deref());
                let reply = state.creation_flow.handle_callback(&data, user_id, lang).await;
                state.telegram.answer_callback(bot_token, &callback.id, None).await.ok();
                if let Some(reply) = reply {
                    if !reply.is_empty() {
                        if let Some(chat_id) = callback.message.as_ref().map(message_chat_id) {
                            state
                                .telegram
                                .send_message(bot_token, chat_id, &reply)
                                .await
                                .map_err(|e| e.to_string())?;
                        }
                    }
                }
                return Ok(());
            }

            let Some(handler_name) = state.registry.lookup(bot_token).await else {
                return Ok(());
            };
            match state.registry.load(&handler_name).await {
                Ok(handler) => match handler.handle_callback(&data, user_id) {
                    Ok(_) => {
                        state.telegram.answer_callback(bot_token, &callback.id, None).await.ok();
                    }
                    Err(e) => {
                        warn!("handler {} raised on callback: {}", handler_name, e);
                        let lang = Lang::from_code(callback.from.language_code.as_deref());
                        state.telegram.answer_callback(bot_token, &callback.id, Some(lang.handler_fault_apology())).await.ok();
                    }
                },
                Err(e) => {
                    warn!("failed to load handler {} for callback: {}", handler_name, e);
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn dispatch_to_handler(
    state: &DispatcherState,
    bot_token: &str,
    text: &str,
    user_id: i64,
    message: &teloxide::types::Message,
    lang: Lang,
) -> Option<Reply> {
    let handler_name = state.registry.lookup(bot_token).await?;
    let handler = match state.registry.load(&handler_name).await {
        Ok(h) => h,
        Err(e) => {
            warn!("handler {} failed to load: {}", handler_name, e);
            return Some(Reply::Text(lang.handler_fault_apology().to_string()));
        }
    };

    let chat = &message.chat;
    let sender_is_admin = state
        .telegram
        .is_admin(bot_token, chat.id.0, user_id)
        .await
        .unwrap_or(false);

    let context = HandlerContext::new(
        bot_token.to_string(),
        chat.id.0,
        chat_kind(chat),
        chat.title().map(|t| t.to_string()),
        message.id.0 as i64,
        user_id,
        message.from().and_then(|u| u.username.clone()),
        message.from().map(|u| u.first_name.clone()),
        message.from().and_then(|u| u.last_name.clone()),
        chat.is_group() || chat.is_supergroup(),
        chat.is_private(),
        sender_is_admin,
        state.telegram.clone(),
    );

    match handler.handle_message(text, user_id, context) {
        Ok(Some(value)) => Some(Reply::Text(dynamic_to_text(value))),
        Ok(None) => None,
        Err(e) => {
            warn!("handler {} raised on message: {}", handler_name, e);
            Some(Reply::Text(lang.handler_fault_apology().to_string()))
        }
    }
}

fn dynamic_to_text(value: rhai::Dynamic) -> String {
    value.clone().into_string().unwrap_or_else(|_| value.to_string())
}

fn message_chat_id(message: &MaybeInaccessibleMessage) -> i64 {
    match message {
        MaybeInaccessibleMessage::Regular(msg) => msg.chat.id.0,
        MaybeInaccessibleMessage::Inaccessible(msg) => msg.chat.id.0,
    }
}

fn chat_kind(chat: &teloxide::types::Chat) -> String {
    if chat.is_private() {
        "private".to_string()
    } else if chat.is_group() {
        "group".to_string()
    } else if chat.is_supergroup() {
        "supergroup".to_string()
    } else if chat.is_channel() {
        "channel".to_string()
    } else {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_acks_are_always_ok_shape() {
        let ack = json!({"ok": true});
        assert_eq!(ack["ok"], true);
    }
}
