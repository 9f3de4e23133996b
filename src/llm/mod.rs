use log::{error, info, warn};
use reqwest::{Client, StatusCode};
use rhai::Engine;
use serde_json::json;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

/// Native function names the handler runtime registers into every script's
/// engine scope (§4.9). A generated script that redefines one of these
/// shadows the runtime's own implementation for every call site — the one
/// host-capability-shaped attack the guardrail has to catch, since the
/// scripting dialect otherwise exposes no filesystem, process, or network
/// access at all (§6: plugin security contract).
const RESERVED_NATIVE_FNS: &[&str] = &[
    "reply",
    "delete_message",
    "ban_user",
    "kick_user",
    "mute_user",
    "unmute_user",
    "is_admin",
    "save_state",
    "load_state",
];

/// Static-analysis guardrail (§6, §4.4 step 5): rejects scripts that fail to
/// parse or that redefine a reserved native function name. Run before a
/// synthesised script is persisted anywhere.
fn check_policy(source: &str) -> Result<(), String> {
    let engine = Engine::new();
    let ast = engine.compile(source).map_err(|e| format!("syntax error: {}", e))?;
    for func in ast.iter_functions() {
        if RESERVED_NATIVE_FNS.contains(&func.name) {
            return Err(format!("script redefines reserved function `{}`", func.name));
        }
    }
    Ok(())
}

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_MODEL: &str = "claude-sonnet-4-5-20250929";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const MAX_RETRIES: u32 = 3;
pub const BASE_DELAY_MS: u64 = 1000;
pub const SYNTHESIS_TIMEOUT_SECS: u64 = 60;
pub const SYNTHESIS_MAX_TOKENS: u32 = 8000;

/// One outcome of a synthesis attempt, already mapped to a user-facing
/// message and an admin-notification decision per the provider error table.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("system busy")]
    Quota,
    #[error("auth error")]
    Auth,
    #[error("service unavailable")]
    ProviderUnavailable,
    #[error("model returned no code")]
    EmptyResponse,
    #[error("plugin rejected: {0}")]
    PolicyRejected(String),
}

impl SynthesisError {
    /// Whether this outcome should trigger an admin notification, and with what kind.
    pub fn admin_kind(&self) -> Option<&'static str> {
        match self {
            SynthesisError::Quota => Some("quota"),
            SynthesisError::Auth => Some("api_error"),
            SynthesisError::ProviderUnavailable => Some("api_error"),
            SynthesisError::EmptyResponse | SynthesisError::PolicyRejected(_) => None,
        }
    }
}

struct RateLimiter {
    last_call: Arc<Mutex<Option<Instant>>>,
    min_interval: Duration,
}

impl RateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            last_call: Arc::new(Mutex::new(None)),
            min_interval,
        }
    }

    async fn wait(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(last_instant) = *last {
            let elapsed = last_instant.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

static SYNTHESIS_RATE_LIMITER: OnceLock<RateLimiter> = OnceLock::new();

fn rate_limiter() -> &'static RateLimiter {
    SYNTHESIS_RATE_LIMITER.get_or_init(|| RateLimiter::new(Duration::from_millis(250)))
}

pub fn calculate_delay(attempt: u32) -> Duration {
    let base_delay = BASE_DELAY_MS * (1 << attempt);
    let jitter = fastrand::u64(0..=base_delay / 4);
    Duration::from_millis(base_delay + jitter)
}

pub struct CodeSynthesiser {
    client: Client,
    api_key: String,
}

impl CodeSynthesiser {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
        }
    }

    /// Generate handler source for `handler_name` implementing `instruction`.
    /// Strips code fences; does not prepend any preamble (save_state/load_state
    /// and the moderation context are native functions of the handler runtime).
    pub async fn synthesise(
        &self,
        handler_name: &str,
        instruction: &str,
    ) -> Result<String, SynthesisError> {
        let system_prompt = build_system_prompt(handler_name);
        rate_limiter().wait().await;

        for attempt in 0..=MAX_RETRIES {
            match self.call_once(&system_prompt, instruction).await {
                Ok(content) if content.trim().is_empty() => {
                    warn!("synthesis returned empty content for {}", handler_name);
                    return Err(SynthesisError::EmptyResponse);
                }
                Ok(content) => {
                    let source = strip_code_fences(&content);
                    if let Err(reason) = check_policy(&source) {
                        warn!("guardrail rejected synthesised script for {}: {}", handler_name, reason);
                        return Err(SynthesisError::PolicyRejected(reason));
                    }
                    info!(
                        "synthesised {} bytes of handler source for {}",
                        source.len(),
                        handler_name
                    );
                    return Ok(source);
                }
                Err(err @ SynthesisError::Auth) | Err(err @ SynthesisError::Quota) => {
                    return Err(err);
                }
                Err(err) => {
                    if attempt == MAX_RETRIES {
                        error!(
                            "synthesis failed for {} after {} attempts: {}",
                            handler_name,
                            MAX_RETRIES + 1,
                            err
                        );
                        return Err(err);
                    }
                    let delay = calculate_delay(attempt);
                    warn!(
                        "synthesis attempt {}/{} failed for {}: {}. retrying in {}ms",
                        attempt + 1,
                        MAX_RETRIES + 1,
                        handler_name,
                        err,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                }
            }
        }
        unreachable!()
    }

    async fn call_once(
        &self,
        system_prompt: &str,
        instruction: &str,
    ) -> Result<String, SynthesisError> {
        let payload = json!({
            "model": ANTHROPIC_MODEL,
            "max_tokens": SYNTHESIS_MAX_TOKENS,
            "system": system_prompt,
            "messages": [{"role": "user", "content": instruction}],
        });

        let response = timeout(
            Duration::from_secs(SYNTHESIS_TIMEOUT_SECS),
            self.client
                .post(ANTHROPIC_API_URL)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&payload)
                .send(),
        )
        .await
        .map_err(|_| SynthesisError::ProviderUnavailable)?
        .map_err(|_| SynthesisError::ProviderUnavailable)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SynthesisError::Quota);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(SynthesisError::Auth);
        }
        if status == StatusCode::BAD_REQUEST {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let message = body["error"]["message"].as_str().unwrap_or("").to_lowercase();
            if message.contains("credit") || message.contains("billing") {
                return Err(SynthesisError::Quota);
            }
            return Err(SynthesisError::ProviderUnavailable);
        }
        if status.is_server_error() {
            return Err(SynthesisError::ProviderUnavailable);
        }
        if !status.is_success() {
            return Err(SynthesisError::ProviderUnavailable);
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|_| SynthesisError::ProviderUnavailable)?;

        let text = body["content"]
            .as_array()
            .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
            .and_then(|b| b["text"].as_str())
            .unwrap_or("")
            .to_string();
        Ok(text)
    }
}

fn strip_code_fences(content: &str) -> String {
    let trimmed = content.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.trim_start_matches(|c: char| c.is_alphabetic());
        let rest = rest.strip_prefix('\n').unwrap_or(rest);
        if let Some(body) = rest.strip_suffix("```") {
            return body.trim().to_string();
        }
        return rest.trim().to_string();
    }
    trimmed.to_string()
}

fn build_system_prompt(handler_name: &str) -> String {
    format!(
        "You write a single Rhai script implementing a Telegram bot handler named `{handler_name}`.\n\
         Define any subset of these functions: `get_widget()`, `handle_message(text, user_id, context)`, `handle_callback(data, user_id)`.\n\
         `handle_message`/`handle_callback` return `()` for no reply, a string for a plain-text reply, or a map `#{{text: .., parse_mode: .., reply_markup: ..}}`.\n\
         On `/start` always reply in Hebrew, listing the bot's available commands.\n\
         For unrecognised input, reply with a short friendly fallback message.\n\
         You may call `save_state(user_id, key, value)` and `load_state(user_id, key, default)` to persist per-user data; no other storage is available.\n\
         The `context` argument (when accepted) exposes `reply(text)`, `delete_message()`, `ban_user(user_id)`, `kick_user(user_id)`, `mute_user(user_id)`, `unmute_user(user_id)`, `is_admin(user_id)`, and read-only fields `chat_id`, `user_id`, `is_group`, `is_private`, `sender_is_admin`.\n\
         Do not reference scheduling, timers, or background tasks; every reply must be produced synchronously within the call.\n\
         Emit only the script source, no prose, no markdown fences."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fenced_code_block() {
        let input = "```rhai\nfn get_widget() {}\n```";
        assert_eq!(strip_code_fences(input), "fn get_widget() {}");
    }

    #[test]
    fn leaves_unfenced_code_untouched() {
        let input = "fn get_widget() {}";
        assert_eq!(strip_code_fences(input), "fn get_widget() {}");
    }

    #[test]
    fn admin_kind_matches_error_table() {
        assert_eq!(SynthesisError::Quota.admin_kind(), Some("quota"));
        assert_eq!(SynthesisError::Auth.admin_kind(), Some("api_error"));
        assert_eq!(SynthesisError::EmptyResponse.admin_kind(), None);
    }

    #[test]
    fn policy_accepts_ordinary_handler() {
        let source = "fn handle_message(text, user_id, context) { context.reply(text); }";
        assert!(check_policy(source).is_ok());
    }

    #[test]
    fn policy_rejects_redefined_native_fn() {
        let source = "fn save_state(a, b, c) { () }\nfn handle_message(text, user_id, context) { () }";
        assert!(check_policy(source).is_err());
    }

    #[test]
    fn policy_rejects_syntax_errors() {
        assert!(check_policy("fn handle_message(text { }").is_err());
    }
}
