use chrono::Duration;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration as StdDuration;
use tracing::warn;

use crate::error::{IngestError, Result};

/// Default time-to-live stamped on provenance nodes.
pub const DEFAULT_TTL_HOURS: i64 = 48;

/// Per-group TTL. Groups without an override use `default_hours`.
#[derive(Debug, Clone, PartialEq)]
pub struct TtlPolicy {
    pub default_hours: i64,
    pub overrides: HashMap<String, i64>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            default_hours: DEFAULT_TTL_HOURS,
            overrides: HashMap::new(),
        }
    }
}

impl TtlPolicy {
    pub fn with_default_hours(hours: i64) -> Self {
        Self {
            default_hours: hours,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, group_id: impl Into<String>, hours: i64) -> Self {
        self.overrides.insert(group_id.into(), hours);
        self
    }

    pub fn ttl_for(&self, group_id: &str) -> Duration {
        let hours = self
            .overrides
            .get(group_id)
            .copied()
            .unwrap_or(self.default_hours);
        Duration::hours(hours.max(0))
    }

    /// Parses `group=hours,group=hours`. Malformed entries are reported.
    pub fn parse_overrides(raw: &str) -> Result<HashMap<String, i64>> {
        let mut overrides = HashMap::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (group, hours) = entry.split_once('=').ok_or_else(|| {
                IngestError::Config(format!("TTL override '{}' is not group=hours", entry))
            })?;
            let hours: i64 = hours.trim().parse().map_err(|_| {
                IngestError::Config(format!("TTL override '{}' has non-numeric hours", entry))
            })?;
            overrides.insert(group.trim().to_string(), hours);
        }
        Ok(overrides)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatorConfig {
    pub max_attempts: u32,
    pub poll_delay: StdDuration,
    pub clock_skew: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            poll_delay: StdDuration::from_secs(2),
            clock_skew: Duration::seconds(30),
        }
    }
}

impl CorrelatorConfig {
    /// Upper bound on time spent sleeping in one correlation.
    pub fn max_wait(&self) -> StdDuration {
        self.poll_delay * self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityConfig {
    pub window: usize,
    pub max_links: usize,
    pub threshold: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            window: 50,
            max_links: 3,
            threshold: 0.7,
        }
    }
}

/// Connection details for the extraction service.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub extraction: ExtractionConfig,
    pub ttl: TtlPolicy,
    pub correlator: CorrelatorConfig,
    pub similarity: SimilarityConfig,
}

impl EngineConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self> {
        let db_path = match std::env::var("DB_PATH") {
            Ok(path) => PathBuf::from(path),
            Err(_) => default_db_path()?,
        };

        let extraction = ExtractionConfig {
            base_url: std::env::var("EXTRACTION_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            api_key: std::env::var("EXTRACTION_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            timeout_secs: env_parse("EXTRACTION_TIMEOUT_SECS", 30),
        };

        let mut ttl = TtlPolicy::with_default_hours(env_parse("GRAPH_TTL_HOURS", DEFAULT_TTL_HOURS));
        if let Ok(raw) = std::env::var("GRAPH_TTL_OVERRIDES") {
            ttl.overrides = TtlPolicy::parse_overrides(&raw)?;
        }

        let correlator = CorrelatorConfig {
            max_attempts: env_parse("CORRELATION_ATTEMPTS", 3),
            poll_delay: StdDuration::from_millis(env_parse("CORRELATION_DELAY_MS", 2000)),
            clock_skew: Duration::seconds(env_parse("CORRELATION_SKEW_SECS", 30)),
        };

        let similarity = SimilarityConfig {
            window: env_parse("SIMILARITY_WINDOW", 50),
            max_links: env_parse("SIMILARITY_MAX_LINKS", 3),
            threshold: env_parse("SIMILARITY_THRESHOLD", 0.7),
        };

        Ok(Self {
            db_path,
            extraction,
            ttl,
            correlator,
            similarity,
        })
    }
}

pub fn default_db_path() -> Result<PathBuf> {
    let home = std::env::var("HOME")
        .map_err(|_| IngestError::Config("HOME environment variable not set".to_string()))?;
    Ok(PathBuf::from(home).join(".memory-graph").join("graph.db"))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring unparseable {}={}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}
