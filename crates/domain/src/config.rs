use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Gateway configuration, loaded from a TOML file selected with
/// `--config <path>`. Every field has a default so a missing file still
/// yields a runnable (if useless) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // ── Chat platform ────────────────────────────────────────────
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default)]
    pub verification_token: String,
    #[serde(default)]
    pub encrypt_key: String,
    /// Base URL of the chat platform's open API.
    #[serde(default = "d_platform_base_url")]
    pub platform_base_url: String,

    // ── HTTP listener ────────────────────────────────────────────
    #[serde(default = "d_http_port")]
    pub http_port: String,
    #[serde(default)]
    pub use_https: bool,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    #[serde(default)]
    pub enable_log: bool,

    // ── Upstream AI ──────────────────────────────────────────────
    #[serde(default = "d_ai_provider_type")]
    pub ai_provider_type: String,
    #[serde(default)]
    pub ai_api_url: String,
    #[serde(default)]
    pub ai_api_key: String,
    #[serde(default)]
    pub ai_model: String,
    /// Upstream request timeout, seconds.
    #[serde(default = "d_ai_timeout")]
    pub ai_timeout: u64,
    #[serde(default = "d_ai_max_retries")]
    pub ai_max_retries: u32,
    /// Whether `agent_thought` stream events are shown to the user.
    #[serde(default = "d_true")]
    pub emit_thoughts: bool,

    // ── Access control ───────────────────────────────────────────
    #[serde(default)]
    pub access_control_enable: bool,
    #[serde(default)]
    pub access_control_max_count_per_user_per_day: u32,
}

impl Default for Config {
    fn default() -> Self {
        // Round-trips through serde so the d_* helpers stay the single
        // source of default values.
        toml::from_str("").expect("empty config deserializes")
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_timeout)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_platform_base_url() -> String {
    "https://open.feishu.cn/open-apis".into()
}
fn d_http_port() -> String {
    "9000".into()
}
fn d_ai_provider_type() -> String {
    "dify".into()
}
fn d_ai_timeout() -> u64 {
    60
}
fn d_ai_max_retries() -> u32 {
    3
}
fn d_true() -> bool {
    true
}
