use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Link and cell protocol constants
pub mod protocol {
    /// Link protocol version spoken on connections
    pub const LINK_VERSION: u16 = 4;

    /// Size of the circuit id field
    pub const CIRC_ID_LEN: usize = 4;

    /// Payload size of a fixed-length cell
    pub const CELL_PAYLOAD_LEN: usize = 509;

    /// Total size of a fixed-length cell on the wire
    pub const CELL_LEN: usize = CIRC_ID_LEN + 1 + CELL_PAYLOAD_LEN;

    /// Relay header: command, recognized, stream id, digest, length
    pub const RELAY_HEADER_LEN: usize = 11;

    /// Maximum data carried by one relay cell
    pub const RELAY_DATA_LEN: usize = CELL_PAYLOAD_LEN - RELAY_HEADER_LEN;

    /// Hash length used by the key-derivation function and running digests
    pub const HASH_LEN: usize = 20;

    /// Symmetric key length (AES-128)
    pub const KEY_LEN: usize = 16;

    /// Bytes produced by the key-derivation function
    pub const KDF_OUTPUT_LEN: usize = 100;

    /// Number of RELAY_EARLY cells a circuit may send
    pub const RELAY_EARLY_BUDGET: u8 = 8;

    /// Default connect timeout for physical links
    pub const CONNECTION_TIMEOUT_SECS: u64 = 30;
}

/// Flow-control windows
pub mod flow {
    /// Circuit-level window start
    pub const CIRCUIT_WINDOW_START: u32 = 1000;

    /// Circuit-level SENDME increment
    pub const CIRCUIT_WINDOW_INCREMENT: u32 = 100;

    /// Stream-level window start
    pub const STREAM_WINDOW_START: u32 = 500;

    /// Stream-level SENDME increment
    pub const STREAM_WINDOW_INCREMENT: u32 = 50;
}

/// Route selection constants
pub mod routing {
    /// Default circuit length (number of hops)
    pub const DEFAULT_CIRCUIT_LENGTH: usize = 3;

    /// Minimum circuit length
    pub const MIN_CIRCUIT_LENGTH: usize = 1;

    /// Maximum circuit length
    pub const MAX_CIRCUIT_LENGTH: usize = 8;

    /// Upper bound on backtracking steps during a single route search
    pub const MAX_ROUTE_SEARCH_STEPS: usize = 64;

    /// Maximum number of concurrent circuits a relay may appear in
    pub const MAX_CIRCUITS_PER_NODE: usize = 10;

    /// Weight of the circuit setup time in the ranking average
    pub const SETUP_TIME_WEIGHT: f64 = 3.0;
}

/// Entry guard policy defaults
pub mod guards {
    /// Number of top usable guards the pick is drawn from
    pub const NUM_GUARDS: usize = 3;

    /// A new guard is added while at most this many are usable
    pub const MIN_USABLE_GUARDS: usize = 2;

    /// Disqualified guards are dropped after this many days
    pub const DISCARD_AFTER_DAYS: u64 = 30;

    /// Failure-count tiers and the backoff applied up to each tier (hours)
    pub const BACKOFF_TIERS: [(u32, u64); 3] = [(18, 1), (24, 4), (33, 18)];

    /// Backoff applied beyond the last tier (hours)
    pub const MAX_BACKOFF_HOURS: u64 = 36;

    /// Upper bound on persisted guard entries
    pub const MAX_ENTRIES: usize = 10;

    /// A picked candidate nobody reported on is forgotten after this long
    pub const PENDING_TIMEOUT_SECS: u64 = 300;
}

/// One escalation step of the guard retry backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffTier {
    /// Applies while the unsuccessful-connect counter is at most this value
    pub max_failures: u32,
    pub backoff_hours: u64,
}

/// Guard selection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub num_guards: usize,
    pub min_usable: usize,
    pub max_entries: usize,
    pub discard_after_days: u64,
    pub backoff_tiers: Vec<BackoffTier>,
    pub max_backoff_hours: u64,
    pub pending_timeout_secs: u64,
    /// Where persisted guards live; `None` keeps them in memory
    pub guard_file: Option<PathBuf>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            num_guards: guards::NUM_GUARDS,
            min_usable: guards::MIN_USABLE_GUARDS,
            max_entries: guards::MAX_ENTRIES,
            discard_after_days: guards::DISCARD_AFTER_DAYS,
            backoff_tiers: guards::BACKOFF_TIERS
                .iter()
                .map(|(max_failures, backoff_hours)| BackoffTier {
                    max_failures: *max_failures,
                    backoff_hours: *backoff_hours,
                })
                .collect(),
            max_backoff_hours: guards::MAX_BACKOFF_HOURS,
            pending_timeout_secs: guards::PENDING_TIMEOUT_SECS,
            guard_file: None,
        }
    }
}

impl GuardConfig {
    /// Backoff window for a guard with the given failure count
    pub fn backoff_for(&self, unsuccessful_connect: u32) -> Duration {
        let hours = self
            .backoff_tiers
            .iter()
            .find(|tier| unsuccessful_connect <= tier.max_failures)
            .map(|tier| tier.backoff_hours)
            .unwrap_or(self.max_backoff_hours);
        Duration::from_secs(hours * 3600)
    }

    pub fn discard_after(&self) -> Duration {
        Duration::from_secs(self.discard_after_days * 24 * 3600)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs)
    }
}

/// Client engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub min_route_length: usize,
    pub max_route_length: usize,

    /// Use CREATE_FAST for the first hop
    pub fast_first_hop: bool,

    /// Per-cell receive timeout while building
    pub queue_timeout_ms: u64,

    /// Wall-clock budget for building one circuit
    pub max_setup_duration_ms: u64,

    /// Rebuilt routes allowed before a build fails
    pub max_route_retries: usize,

    /// Parallel build attempts per request
    pub parallel_builds: usize,

    pub streams_per_circuit: usize,
    pub auto_close_on_last_stream: bool,

    /// 0.0 = uniform relay selection, 1.0 = fully bandwidth-weighted
    pub ranking_influence: f64,

    pub max_circuits_per_node: usize,

    /// Stream failures per carried stream before a circuit stops taking streams
    pub stream_failure_ratio: f64,

    pub min_idle_circuits: usize,
    pub background_build_interval_ms: u64,
    pub max_background_builds: usize,

    pub guards: GuardConfig,

    pub verbose: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            min_route_length: routing::DEFAULT_CIRCUIT_LENGTH,
            max_route_length: routing::DEFAULT_CIRCUIT_LENGTH,
            fast_first_hop: true,
            queue_timeout_ms: 10_000,
            max_setup_duration_ms: 60_000,
            max_route_retries: 3,
            parallel_builds: 2,
            streams_per_circuit: 50,
            auto_close_on_last_stream: false,
            ranking_influence: 0.8,
            max_circuits_per_node: routing::MAX_CIRCUITS_PER_NODE,
            stream_failure_ratio: 0.5,
            min_idle_circuits: 2,
            background_build_interval_ms: 5_000,
            max_background_builds: 2,
            guards: GuardConfig::default(),
            verbose: false,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route_length(mut self, min: usize, max: usize) -> Self {
        self.min_route_length = min;
        self.max_route_length = max;
        self
    }

    pub fn with_fast_first_hop(mut self, fast: bool) -> Self {
        self.fast_first_hop = fast;
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_setup_duration(mut self, duration: Duration) -> Self {
        self.max_setup_duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_max_route_retries(mut self, retries: usize) -> Self {
        self.max_route_retries = retries;
        self
    }

    pub fn with_parallel_builds(mut self, count: usize) -> Self {
        self.parallel_builds = count;
        self
    }

    pub fn with_ranking_influence(mut self, influence: f64) -> Self {
        self.ranking_influence = influence;
        self
    }

    pub fn with_guard_file(mut self, path: PathBuf) -> Self {
        self.guards.guard_file = Some(path);
        self
    }

    pub fn with_auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close_on_last_stream = auto_close;
        self
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn max_setup_duration(&self) -> Duration {
        Duration::from_millis(self.max_setup_duration_ms)
    }

    pub fn background_build_interval(&self) -> Duration {
        Duration::from_millis(self.background_build_interval_ms)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_route_length < routing::MIN_CIRCUIT_LENGTH
            || self.max_route_length > routing::MAX_CIRCUIT_LENGTH
            || self.min_route_length > self.max_route_length
        {
            return Err(ConfigError::Invalid(format!(
                "route length range {}..={} outside {}..={}",
                self.min_route_length,
                self.max_route_length,
                routing::MIN_CIRCUIT_LENGTH,
                routing::MAX_CIRCUIT_LENGTH
            )));
        }
        if !(0.0..=1.0).contains(&self.ranking_influence) {
            return Err(ConfigError::Invalid(format!(
                "ranking_influence {} outside 0.0..=1.0",
                self.ranking_influence
            )));
        }
        if self.parallel_builds == 0 {
            return Err(ConfigError::Invalid("parallel_builds must be at least 1".into()));
        }
        if self.guards.num_guards == 0 {
            return Err(ConfigError::Invalid("guards.num_guards must be at least 1".into()));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::OnionError {
    fn from(err: ConfigError) -> Self {
        crate::OnionError::Config(err.to_string())
    }
}
