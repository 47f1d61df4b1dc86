//! Configuration for the intake core

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{PathMode, ProcessingCategory};

/// Environment variable naming a TOML config file
pub const CONFIG_ENV_VAR: &str = "VAULT_INTAKE_CONFIG";

/// Main intake configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IntakeConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Format detection limits
    pub detection: DetectionConfig,
    /// Priority scoring weights and thresholds
    pub scoring: ScoringConfig,
    /// Queue fairness and lease settings
    pub queue: QueueConfig,
    /// Worker pools per category
    pub dispatcher: DispatcherConfig,
    /// Fast/deep path settings
    pub coordinator: CoordinatorConfig,
    /// Per-backend circuit breaker settings
    pub breaker: BreakerConfig,
    /// Retry and backoff
    pub retry: RetryConfig,
    /// SQLite persistence
    pub storage: StorageConfig,
    /// Extraction backends
    pub backends: Vec<BackendConfig>,
    /// Downstream publishing
    pub publish: PublishConfig,
}

impl IntakeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: IntakeConfig = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, then `VAULT_INTAKE_CONFIG`, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.is_empty() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.queue.min_dispatch_share) {
            return Err(Error::Config(format!(
                "queue.min_dispatch_share must be within 0.0..=1.0, got {}",
                self.queue.min_dispatch_share
            )));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config("breaker.failure_threshold must be at least 1".to_string()));
        }
        if self.scoring.priority_threshold < self.scoring.normal_threshold {
            return Err(Error::Config(
                "scoring.priority_threshold must not be below scoring.normal_threshold".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::Config("retry.multiplier must be at least 1.0".to_string()));
        }
        for backend in &self.backends {
            if backend.id.is_empty() || backend.url.is_empty() {
                return Err(Error::Config("every backend needs an id and a url".to_string()));
            }
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 8090 }
fn default_max_body_size() -> usize { 1024 * 1024 } // 1MB

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_size: default_max_body_size(),
        }
    }
}

/// Format detection limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Bytes read from the start of each file (default: 8KB)
    #[serde(default = "default_header_window")]
    pub header_window: usize,
    /// Container directory entries inspected before giving up (default: 512)
    #[serde(default = "default_max_container_entries")]
    pub max_container_entries: usize,
}

fn default_header_window() -> usize { 8192 }
fn default_max_container_entries() -> usize { 512 }

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            header_window: default_header_window(),
            max_container_entries: default_max_container_entries(),
        }
    }
}

/// Priority scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_baseline")]
    pub baseline: i32,
    /// Bonus for files modified within the last hour
    #[serde(default = "default_recency_hour")]
    pub recency_hour_bonus: i32,
    /// Bonus for files modified within the last day
    #[serde(default = "default_recency_day")]
    pub recency_day_bonus: i32,
    /// Bonus for files modified within the last week
    #[serde(default = "default_recency_week")]
    pub recency_week_bonus: i32,
    /// Category weights
    #[serde(default)]
    pub weights: CategoryWeights,
    /// High-value filename keywords, matched case-insensitively
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
    #[serde(default = "default_keyword_bonus")]
    pub keyword_bonus: i32,
    /// Files above this size are penalised (default: 100MB)
    #[serde(default = "default_large_file_bytes")]
    pub large_file_bytes: u64,
    #[serde(default = "default_large_file_penalty")]
    pub large_file_penalty: i32,
    /// Scores at or above this are exempt from the size penalty
    #[serde(default = "default_important_threshold")]
    pub important_threshold: i32,
    /// Files above this size lose a further penalty, important or not (default: 500MB)
    #[serde(default = "default_very_large_file_bytes")]
    pub very_large_file_bytes: u64,
    #[serde(default = "default_very_large_penalty")]
    pub very_large_penalty: i32,
    /// Files above this size skip the fast path (default: 50MB)
    #[serde(default = "default_deep_size_threshold")]
    pub deep_size_threshold: u64,
    /// Subtypes that skip the fast path above `deep_type_size_threshold`
    #[serde(default = "default_deep_subtypes")]
    pub deep_subtypes: Vec<String>,
    /// Size above which `deep_subtypes` skip the fast path (default: 10MB)
    #[serde(default = "default_deep_type_size_threshold")]
    pub deep_type_size_threshold: u64,
    /// Minimum score for the priority tier
    #[serde(default = "default_priority_threshold")]
    pub priority_threshold: u8,
    /// Minimum score for the normal tier
    #[serde(default = "default_normal_threshold")]
    pub normal_threshold: u8,
}

fn default_baseline() -> i32 { 50 }
fn default_recency_hour() -> i32 { 30 }
fn default_recency_day() -> i32 { 20 }
fn default_recency_week() -> i32 { 10 }
fn default_keyword_bonus() -> i32 { 15 }
fn default_large_file_bytes() -> u64 { 100 * 1024 * 1024 } // 100MB
fn default_large_file_penalty() -> i32 { 10 }
fn default_important_threshold() -> i32 { 70 }
fn default_very_large_file_bytes() -> u64 { 500 * 1024 * 1024 } // 500MB
fn default_very_large_penalty() -> i32 { 20 }
fn default_deep_size_threshold() -> u64 { 50 * 1024 * 1024 } // 50MB
fn default_deep_type_size_threshold() -> u64 { 10 * 1024 * 1024 } // 10MB

fn default_deep_subtypes() -> Vec<String> {
    ["pdf", "mp3", "wav", "m4a", "mp4", "mkv", "avi"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_priority_threshold() -> u8 { 75 }
fn default_normal_threshold() -> u8 { 40 }

fn default_keywords() -> Vec<String> {
    [
        "vertrag", "contract", "rechnung", "invoice", "beleg", "passwort", "password",
        "geheim", "secret", "confidential", "steuer", "tax", "bank", "konto", "account",
        "wichtig", "urgent", "dringend", "asap", "bewerbung", "application", "zeugnis",
        "certificate",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            baseline: default_baseline(),
            recency_hour_bonus: default_recency_hour(),
            recency_day_bonus: default_recency_day(),
            recency_week_bonus: default_recency_week(),
            weights: CategoryWeights::default(),
            keywords: default_keywords(),
            keyword_bonus: default_keyword_bonus(),
            large_file_bytes: default_large_file_bytes(),
            large_file_penalty: default_large_file_penalty(),
            important_threshold: default_important_threshold(),
            very_large_file_bytes: default_very_large_file_bytes(),
            very_large_penalty: default_very_large_penalty(),
            deep_size_threshold: default_deep_size_threshold(),
            deep_subtypes: default_deep_subtypes(),
            deep_type_size_threshold: default_deep_type_size_threshold(),
            priority_threshold: default_priority_threshold(),
            normal_threshold: default_normal_threshold(),
        }
    }
}

/// Score weight per kind of content
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryWeights {
    pub communication: i32,
    pub documents: i32,
    pub spreadsheets: i32,
    pub audio: i32,
    pub video: i32,
    pub images: i32,
    pub archive: i32,
    pub other: i32,
}

impl Default for CategoryWeights {
    fn default() -> Self {
        Self {
            communication: 25,
            documents: 15,
            spreadsheets: 12,
            audio: 10,
            video: 8,
            images: 5,
            archive: 3,
            other: 0,
        }
    }
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Fraction of dispatches reserved for a waiting lower tier (0 = strict priority)
    #[serde(default = "default_min_dispatch_share")]
    pub min_dispatch_share: f64,
    /// Leases not acknowledged within this many seconds are redelivered
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
    /// How often expired leases are reaped
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

fn default_min_dispatch_share() -> f64 { 0.1 }
fn default_visibility_timeout() -> u64 { 600 }
fn default_reaper_interval() -> u64 { 15 }

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// One dispatch in this many goes to a starved lower tier
    pub fn fairness_window(&self) -> Option<u32> {
        if self.min_dispatch_share <= 0.0 {
            return None;
        }
        Some((1.0 / self.min_dispatch_share.min(1.0)).round().max(1.0) as u32)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_dispatch_share: default_min_dispatch_share(),
            visibility_timeout_secs: default_visibility_timeout(),
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Slots for categories not listed in `slots` (default: CPU count, max 8)
    pub default_slots: Option<usize>,
    /// Per-category slot overrides
    #[serde(default)]
    pub slots: HashMap<ProcessingCategory, usize>,
    /// Share of a category's slots deep work may occupy (default: half)
    #[serde(default)]
    pub deep_slots: HashMap<ProcessingCategory, usize>,
    /// Idle poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval() -> u64 { 250 }

impl DispatcherConfig {
    pub fn slots_for(&self, category: ProcessingCategory) -> usize {
        self.slots
            .get(&category)
            .copied()
            .or(self.default_slots)
            .unwrap_or_else(|| num_cpus::get().min(8))
            .max(1)
    }

    /// Deep work never takes every slot of a category, so fresh intake keeps moving
    pub fn deep_slots_for(&self, category: ProcessingCategory) -> usize {
        let slots = self.slots_for(category);
        let deep = self
            .deep_slots
            .get(&category)
            .copied()
            .unwrap_or(slots / 2);
        if slots == 1 {
            return 1;
        }
        deep.clamp(1, slots - 1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_slots: None,
            slots: HashMap::new(),
            deep_slots: HashMap::new(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// Dual-path coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Timeout for fast backend calls (default: 30s)
    #[serde(default = "default_fast_timeout")]
    pub fast_timeout_secs: u64,
    /// Timeout for deep backend calls (default: 300s = 5 minutes)
    #[serde(default = "default_deep_timeout")]
    pub deep_timeout_secs: u64,
    /// Categories that skip the deep path
    #[serde(default = "default_fast_only")]
    pub fast_only: Vec<ProcessingCategory>,
}

fn default_fast_timeout() -> u64 { 30 }
fn default_deep_timeout() -> u64 { 300 }
fn default_fast_only() -> Vec<ProcessingCategory> { vec![ProcessingCategory::Other] }

impl CoordinatorConfig {
    pub fn timeout_for(&self, mode: PathMode) -> Duration {
        match mode {
            PathMode::Fast => Duration::from_secs(self.fast_timeout_secs),
            PathMode::Deep => Duration::from_secs(self.deep_timeout_secs),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            fast_timeout_secs: default_fast_timeout(),
            deep_timeout_secs: default_deep_timeout(),
            fast_only: default_fast_only(),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive transient failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Failures older than this no longer count (seconds)
    #[serde(default = "default_failure_window")]
    pub window_secs: u64,
    /// Time an open circuit waits before admitting a probe (seconds)
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 { 5 }
fn default_failure_window() -> u64 { 60 }
fn default_cooldown() -> u64 { 30 }

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_failure_window(),
            cooldown_secs: default_cooldown(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Transient failures tolerated before dead-lettering
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 { 3 }
fn default_base_delay() -> u64 { 2_000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_max_delay() -> u64 { 300_000 } // 5 minutes

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay(),
        }
    }
}

/// SQLite persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Persist jobs and dead letters (default: true)
    #[serde(default = "default_storage_enabled")]
    pub enabled: bool,
    /// Database path (default: <data dir>/vault-intake/intake.db)
    pub database_path: Option<PathBuf>,
}

fn default_storage_enabled() -> bool { true }

impl StorageConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("vault-intake")
                .join("intake.db")
        })
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: default_storage_enabled(),
            database_path: None,
        }
    }
}

/// One HTTP extraction backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    /// Endpoint receiving extraction requests
    pub url: String,
    /// Categories this backend serves
    pub categories: Vec<ProcessingCategory>,
    /// Paths this backend serves (default: both)
    #[serde(default = "default_backend_paths")]
    pub paths: Vec<PathMode>,
}

fn default_backend_paths() -> Vec<PathMode> { vec![PathMode::Fast, PathMode::Deep] }

/// Downstream publishing configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PublishConfig {
    /// Endpoint receiving result events; results are only logged when unset
    pub url: Option<String>,
}
