use std::env;

/// Typed, immutable process configuration. Loaded once at startup and handed
/// to every component by explicit construction; nothing reads `std::env`
/// again after `Config::from_env` returns.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub debug: bool,
    pub telegram_token: String,
    pub webhook_base_url: String,
    pub anthropic_api_key: String,
    pub github_token: String,
    pub github_user: String,
    pub github_repo: String,
    pub github_branch: String,
    pub database_url: String,
    pub admin_chat_id: i64,
    pub dashboard_admin_token: Option<String>,
    pub dev_mode: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for environment variable {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match env::var("PORT") {
            Ok(v) => v
                .parse()
                .map_err(|_| ConfigError::Invalid { name: "PORT", value: v })?,
            Err(_) => 5000,
        };

        let debug = env::var("DEBUG")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        let admin_chat_id = required("ADMIN_CHAT_ID")?
            .parse()
            .map_err(|_| ConfigError::Invalid {
                name: "ADMIN_CHAT_ID",
                value: env::var("ADMIN_CHAT_ID").unwrap_or_default(),
            })?;

        Ok(Self {
            port,
            debug,
            telegram_token: required("TELEGRAM_TOKEN")?,
            webhook_base_url: required("RENDER_EXTERNAL_URL")?,
            anthropic_api_key: required("ANTHROPIC_API_KEY")?,
            github_token: required("GITHUB_TOKEN")?,
            github_user: required("GITHUB_USER")?,
            github_repo: required("GITHUB_REPO")?,
            github_branch: env::var("GITHUB_BRANCH").unwrap_or_else(|_| "main".to_string()),
            database_url: required("DATABASE_URL")?,
            admin_chat_id,
            dashboard_admin_token: env::var("DASHBOARD_ADMIN_TOKEN").ok(),
            dev_mode: env::var("DEV_MODE")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
        })
    }

    /// Webhook admin auth per §4.8 / §9: deny by default when unconfigured,
    /// unless DEV_MODE explicitly restores the open fallback.
    pub fn admin_token_matches(&self, provided: Option<&str>) -> bool {
        match (&self.dashboard_admin_token, provided) {
            (Some(expected), Some(got)) => expected == got,
            (Some(_), None) => false,
            (None, _) => self.dev_mode,
        }
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}
