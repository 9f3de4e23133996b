use log::info;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Per-token outbound rate limiter for the Telegram API client (C5).
/// Telegram's own per-bot limits are generous; this protects against a single
/// runaway handler starving the process's outbound connection pool.
pub struct TelegramRateLimiter {
    last_call: Mutex<HashMap<String, Instant>>,
    min_interval: Duration,
}

impl TelegramRateLimiter {
    pub fn new() -> Self {
        Self {
            last_call: Mutex::new(HashMap::new()),
            min_interval: Duration::from_millis(30),
        }
    }

    pub async fn wait_for_token(&self, token: &str) {
        let mut map = self.last_call.lock().await;
        if let Some(last) = map.get(token) {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                info!("rate limiting outbound call for token prefix, waiting {}ms", wait_time.as_millis());
                sleep(wait_time).await;
            }
        }
        map.insert(token.to_string(), Instant::now());
    }
}

impl Default for TelegramRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Arc-wrapped handle shared by every request task.
pub type SharedTelegramRateLimiter = Arc<TelegramRateLimiter>;
