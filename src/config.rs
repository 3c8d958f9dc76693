//! Configuration for Chatcoach
//!
//! Resolution order (later wins):
//!   1. built-in defaults
//!   2. `config.toml` (`~/.config/chatcoach/config.toml` or an explicit path)
//!   3. `CHATCOACH_API_URL` / `CHATCOACH_MODEL` environment variables
//!   4. CLI flags (applied by the binary through the `with_*` builders)

use crate::{CoachError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default analysis backend
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Default model label reported to the context estimator
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// How draft prompts are scored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptScoring {
    /// Remote prompt-quality service
    #[default]
    Remote,
    /// Local regex heuristics (no network)
    Local,
}

/// Configuration for Chatcoach
#[derive(Debug, Clone)]
pub struct CoachConfig {
    /// Base URL of the analysis backend
    pub api_url: String,

    /// Upper bound for every remote call
    pub request_timeout: Duration,

    /// Fallback poll interval of the change detector
    pub poll_interval: Duration,

    /// Quiet period before a remote prompt analysis
    pub quiet_period: Duration,

    /// Quiet period before a local heuristic analysis
    pub local_quiet_period: Duration,

    /// Prompts shorter than this (in chars) get a canned "too short" result
    pub min_prompt_chars: usize,

    /// Interval between context budget estimations
    pub budget_interval: Duration,

    /// Delay before asking for a follow-up question
    pub follow_up_delay: Duration,

    /// Minimum flow score that triggers a follow-up
    pub follow_up_min_score: f64,

    /// Preceding turns sent with a turn-flow analysis
    pub flow_history_window: usize,

    /// Turns sent with a follow-up request
    pub follow_up_history_window: usize,

    /// Capacity of the issue ring buffer
    pub issue_log_capacity: usize,

    /// Default token budget for context bridges
    pub bridge_token_budget: u32,

    /// Knowledge graph fetch window
    pub knowledge_time_range_days: u32,

    /// Knowledge graph node cap
    pub knowledge_max_nodes: u32,

    /// Model label reported to the context estimator
    pub model: String,

    /// Optional goal forwarded to follow-up generation
    pub user_goal: Option<String>,

    /// Prompt scoring mode
    pub prompt_scoring: PromptScoring,

    /// File holding the stable user id
    pub identity_file: PathBuf,

    /// Capacity of the presentation event channel
    pub event_capacity: usize,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_secs(2),
            quiet_period: Duration::from_millis(1500),
            local_quiet_period: Duration::from_millis(500),
            min_prompt_chars: 10,
            budget_interval: Duration::from_secs(30),
            follow_up_delay: Duration::from_secs(2),
            follow_up_min_score: 7.0,
            flow_history_window: 10,
            follow_up_history_window: 8,
            issue_log_capacity: 10,
            bridge_token_budget: 2000,
            knowledge_time_range_days: 30,
            knowledge_max_nodes: 50,
            model: DEFAULT_MODEL.to_string(),
            user_goal: None,
            prompt_scoring: PromptScoring::Remote,
            identity_file: default_config_dir().join("identity"),
            event_capacity: 256,
        }
    }
}

/// Partial config.toml; every field is optional and overrides the default.
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    api_url: Option<String>,
    request_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    quiet_period_ms: Option<u64>,
    local_quiet_period_ms: Option<u64>,
    min_prompt_chars: Option<usize>,
    budget_interval_secs: Option<u64>,
    follow_up_delay_ms: Option<u64>,
    follow_up_min_score: Option<f64>,
    flow_history_window: Option<usize>,
    follow_up_history_window: Option<usize>,
    issue_log_capacity: Option<usize>,
    bridge_token_budget: Option<u32>,
    knowledge_time_range_days: Option<u32>,
    knowledge_max_nodes: Option<u32>,
    model: Option<String>,
    user_goal: Option<String>,
    prompt_scoring: Option<PromptScoring>,
    identity_file: Option<PathBuf>,
}

/// `~/.config/chatcoach` (platform equivalent), falling back to `./.chatcoach`
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("chatcoach"))
        .unwrap_or_else(|| PathBuf::from(".chatcoach"))
}

/// Timer periods must be positive; a zero period would stop the loop that uses it.
fn non_zero(key: &str, period: Duration) -> std::result::Result<Duration, String> {
    if period.is_zero() {
        return Err(format!("{} must be greater than zero", key));
    }
    Ok(period)
}

impl CoachConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load defaults, then the config file (if any), then the environment.
    ///
    /// A missing file is not an error; malformed TOML is.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_config_dir().join("config.toml"));

        let mut config = Self::default();

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let parsed = toml::from_str::<ConfigToml>(&content)
                    .map_err(|e| CoachError::Config(format!("{}: {}", path.display(), e)))?;
                config
                    .apply_file(parsed)
                    .map_err(|e| CoachError::Config(format!("{}: {}", path.display(), e)))?;
                info!("Loaded config from {}", path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config file at {}, using defaults", path.display());
            }
            Err(e) => {
                warn!("Could not read config {}: {}. Using defaults.", path.display(), e);
            }
        }

        config.apply_env();
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigToml) -> std::result::Result<(), String> {
        if let Some(v) = file.api_url {
            self.api_url = v;
        }
        if let Some(v) = file.request_timeout_ms {
            self.request_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.poll_interval_ms {
            self.poll_interval = non_zero("poll_interval_ms", Duration::from_millis(v))?;
        }
        if let Some(v) = file.quiet_period_ms {
            self.quiet_period = Duration::from_millis(v);
        }
        if let Some(v) = file.local_quiet_period_ms {
            self.local_quiet_period = Duration::from_millis(v);
        }
        if let Some(v) = file.min_prompt_chars {
            self.min_prompt_chars = v;
        }
        if let Some(v) = file.budget_interval_secs {
            self.budget_interval = non_zero("budget_interval_secs", Duration::from_secs(v))?;
        }
        if let Some(v) = file.follow_up_delay_ms {
            self.follow_up_delay = Duration::from_millis(v);
        }
        if let Some(v) = file.follow_up_min_score {
            self.follow_up_min_score = v;
        }
        if let Some(v) = file.flow_history_window {
            self.flow_history_window = v;
        }
        if let Some(v) = file.follow_up_history_window {
            self.follow_up_history_window = v;
        }
        if let Some(v) = file.issue_log_capacity {
            self.issue_log_capacity = v.max(1);
        }
        if let Some(v) = file.bridge_token_budget {
            self.bridge_token_budget = v;
        }
        if let Some(v) = file.knowledge_time_range_days {
            self.knowledge_time_range_days = v;
        }
        if let Some(v) = file.knowledge_max_nodes {
            self.knowledge_max_nodes = v;
        }
        if let Some(v) = file.model {
            self.model = v;
        }
        if file.user_goal.is_some() {
            self.user_goal = file.user_goal;
        }
        if let Some(v) = file.prompt_scoring {
            self.prompt_scoring = v;
        }
        if let Some(v) = file.identity_file {
            self.identity_file = v;
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("CHATCOACH_API_URL") {
            if !url.trim().is_empty() {
                self.api_url = url.trim().to_string();
            }
        }
        if let Ok(model) = std::env::var("CHATCOACH_MODEL") {
            if !model.trim().is_empty() {
                self.model = model.trim().to_string();
            }
        }
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_user_goal(mut self, goal: Option<String>) -> Self {
        self.user_goal = goal;
        self
    }

    pub fn with_prompt_scoring(mut self, scoring: PromptScoring) -> Self {
        self.prompt_scoring = scoring;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_identity_file(mut self, path: PathBuf) -> Self {
        self.identity_file = path;
        self
    }

    /// Quiet period matching the configured scoring mode
    pub fn effective_quiet_period(&self) -> Duration {
        match self.prompt_scoring {
            PromptScoring::Remote => self.quiet_period,
            PromptScoring::Local => self.local_quiet_period,
        }
    }
}
