use crate::error::{Result, RuleflowError};
use crate::guard::{GuardConfig, MAX_DURATION_SECS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "ruleflow.yaml";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7420
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// Where field updates and comments are written. The access token is read
/// from the environment variable named by `token_env`, never from the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub organization_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_api_version() -> String {
    "7.1-preview.3".to_string()
}

fn default_token_env() -> String {
    "RULEFLOW_TRACKER_TOKEN".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            organization_url: String::new(),
            api_version: default_api_version(),
            token_env: default_token_env(),
            timeout_secs: default_timeout(),
        }
    }
}

impl TrackerConfig {
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "default_rules_dir")]
    pub dir: PathBuf,
}

fn default_rules_dir() -> PathBuf {
    PathBuf::from("rules")
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            dir: default_rules_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Per-day JSONL session logs are written here when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonl_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_interval")]
    pub min_interval_secs: u64,
    #[serde(default = "default_event_entries")]
    pub max_entries: usize,
}

fn default_event_interval() -> u64 {
    5
}

fn default_event_entries() -> usize {
    1000
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: default_event_interval(),
            max_entries: default_event_entries(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

impl Config {
    pub fn path(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE)
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::path(root);
        if !path.exists() {
            return Err(RuleflowError::Config(format!(
                "{} not found",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        if Self::path(root).exists() {
            Self::load(root)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&Self::path(root), data.as_bytes())
    }

    pub fn rules_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.rules.dir)
    }

    pub fn sessions_dir(&self, root: &Path) -> Option<PathBuf> {
        self.sessions.jsonl_dir.as_ref().map(|d| root.join(d))
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut warn = |level: WarnLevel, message: String| {
            warnings.push(ConfigWarning { level, message });
        };

        let g = &self.guard;
        if g.max_per_hour == 0 {
            warn(
                WarnLevel::Error,
                "guard.max_per_hour is 0: every rule would be blocked".into(),
            );
        }
        if g.max_entries == 0 {
            warn(
                WarnLevel::Error,
                "guard.max_entries is 0: guard state could never be kept".into(),
            );
        }
        if g.sweep_interval_secs == 0 {
            warn(
                WarnLevel::Warning,
                "guard.sweep_interval_secs is 0: sweeps will run on every check".into(),
            );
        }
        for (name, value) in [
            ("guard.min_interval_secs", g.min_interval_secs),
            ("guard.duplicate_window_secs", g.duplicate_window_secs),
            ("guard.sweep_interval_secs", g.sweep_interval_secs),
            ("guard.retention_secs", g.retention_secs),
            ("events.min_interval_secs", self.events.min_interval_secs),
        ] {
            if value > MAX_DURATION_SECS {
                warn(
                    WarnLevel::Error,
                    format!("{name} ({value}) exceeds {MAX_DURATION_SECS} seconds and is clamped"),
                );
            }
        }
        if g.retention_secs < g.duplicate_window_secs {
            warn(
                WarnLevel::Warning,
                format!(
                    "guard.retention_secs ({}) is shorter than duplicate_window_secs ({}): duplicates may slip through",
                    g.retention_secs, g.duplicate_window_secs
                ),
            );
        }
        if g.retention_secs < g.min_interval_secs {
            warn(
                WarnLevel::Warning,
                format!(
                    "guard.retention_secs ({}) is shorter than min_interval_secs ({})",
                    g.retention_secs, g.min_interval_secs
                ),
            );
        }

        if self.tracker.organization_url.trim().is_empty() {
            warn(
                WarnLevel::Warning,
                "tracker.organization_url is not set: writes will fail".into(),
            );
        } else if !self.tracker.organization_url.starts_with("http://")
            && !self.tracker.organization_url.starts_with("https://")
        {
            warn(
                WarnLevel::Error,
                format!(
                    "tracker.organization_url '{}' is not an http(s) URL",
                    self.tracker.organization_url
                ),
            );
        }
        if self.tracker.token_env.trim().is_empty() {
            warn(
                WarnLevel::Warning,
                "tracker.token_env is empty: requests will be unauthenticated".into(),
            );
        }

        if self.server.port == 0 {
            warn(WarnLevel::Warning, "server.port is 0: an ephemeral port will be used".into());
        }
        if self.events.max_entries == 0 {
            warn(WarnLevel::Warning, "events.max_entries is 0: treated as 1".into());
        }

        warnings
    }
}
