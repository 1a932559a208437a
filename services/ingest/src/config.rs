//! Stream configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/roost/stream.toml`.
//!
//! The file has three layers:
//! - `[stream]` — listener and acceptance tunables.
//! - `[defaults]` — the receiver settings every child starts from.
//! - `[scopes."<uuid>"]` — one section per API key or machine identity:
//!   its type, enable flag, client-IP allow list, and any `[defaults]`
//!   override. A child's effective settings resolve defaults, then its API
//!   key's section, then its machine section.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

/// How long an attached receiver may stay silent before a new connection
/// for the same host may preempt it.
pub const STALE_RECEIVER_SECS: i64 = 30;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub schema_version: u32,
    pub stream: StreamSettings,
    pub defaults: ReceiverConfig,
    scopes: HashMap<Uuid, ScopeConfig>,
}

/// Listener and acceptance tunables.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub enabled: bool,
    pub bind_address: String,
    /// This node's own machine identity; generated at startup when absent.
    pub node_id: Option<Uuid>,
    /// Minimum seconds between accepted streams; 0 disables the limiter.
    pub min_interval_secs: i64,
    pub receive_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub error_send_timeout_secs: u64,
    pub ingest_threads: usize,
}

/// Per-receiver settings, fully resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub update_every: i64,
    pub history: i64,
    pub memory_mode: MemoryMode,
    pub health: HealthMode,
    pub forward: ForwardSettings,
    pub replication: ReplicationSettings,
    pub ephemeral: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSettings {
    pub enabled: bool,
    pub parents: Vec<String>,
    pub api_key: String,
    pub charts_filter: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSettings {
    pub enabled: bool,
    pub period_secs: i64,
    pub step_secs: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    Dbengine,
    Ram,
    Alloc,
    None,
}

/// Three-valued health switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthMode {
    Off,
    On,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Api,
    Machine,
}

#[derive(Debug, Clone)]
struct ScopeConfig {
    kind: ScopeKind,
    /// Absent means the per-kind default: API keys off, machines on.
    enabled: Option<bool>,
    allow_from: Vec<String>,
    overrides: ScopeOverrides,
}

#[derive(Debug, Clone, Default)]
struct ScopeOverrides {
    update_every: Option<i64>,
    history: Option<i64>,
    memory_mode: Option<MemoryMode>,
    health: Option<HealthMode>,
    ephemeral: Option<bool>,
    forward: Option<ForwardSettings>,
    replication: Option<ReplicationSettings>,
}

impl Config {
    /// The configured type of a UUID, if it has a section at all.
    pub fn kind_of(&self, id: &Uuid) -> Option<ScopeKind> {
        self.scopes.get(id).map(|s| s.kind)
    }

    /// Enable flag for a UUID. `kind` supplies the default when the section
    /// does not say: API keys default off, machine identities default on.
    pub fn scope_enabled(&self, id: &Uuid, kind: ScopeKind) -> bool {
        self.scopes
            .get(id)
            .and_then(|s| s.enabled)
            .unwrap_or(kind == ScopeKind::Machine)
    }

    /// Whether `ip` passes the allow list for a UUID. No section means no
    /// restriction.
    pub fn ip_allowed(&self, id: &Uuid, ip: &str) -> bool {
        match self.scopes.get(id) {
            Some(scope) => ip_matches(&scope.allow_from, ip),
            None => true,
        }
    }

    /// Effective receiver settings for a child: defaults, then the API key
    /// section, then the machine section.
    pub fn resolve_receiver(&self, api_key: &Uuid, machine: &Uuid) -> ReceiverConfig {
        let mut cfg = self.defaults.clone();
        for id in [api_key, machine] {
            if let Some(scope) = self.scopes.get(id) {
                apply_overrides(&mut cfg, &scope.overrides);
            }
        }
        cfg
    }
}

fn apply_overrides(cfg: &mut ReceiverConfig, ov: &ScopeOverrides) {
    if let Some(v) = ov.update_every {
        cfg.update_every = v;
    }
    if let Some(v) = ov.history {
        cfg.history = v;
    }
    if let Some(v) = ov.memory_mode {
        cfg.memory_mode = v;
    }
    if let Some(v) = ov.health {
        cfg.health = v;
    }
    if let Some(v) = ov.ephemeral {
        cfg.ephemeral = v;
    }
    if let Some(v) = &ov.forward {
        cfg.forward = v.clone();
    }
    if let Some(v) = &ov.replication {
        cfg.replication = v.clone();
    }
}

// ---------------------------------------------------------------------------
// Client-IP allow lists
// ---------------------------------------------------------------------------

/// First matching pattern decides; a `!` prefix negates. `*` matches any
/// run of characters. An exhausted list denies.
pub fn ip_matches(patterns: &[String], ip: &str) -> bool {
    for p in patterns {
        let (negated, pattern) = match p.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, p.as_str()),
        };
        if wildcard_match(pattern, ip) {
            return !negated;
        }
    }
    false
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    stream: Option<RawStream>,
    defaults: Option<RawDefaults>,
    scopes: Option<HashMap<String, RawScope>>,
}

#[derive(Debug, Deserialize)]
struct RawStream {
    enabled: Option<bool>,
    bind_address: Option<String>,
    node_id: Option<String>,
    min_interval_secs: Option<i64>,
    receive_timeout_secs: Option<u64>,
    send_timeout_secs: Option<u64>,
    error_send_timeout_secs: Option<u64>,
    ingest_threads: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawDefaults {
    update_every: Option<i64>,
    history: Option<i64>,
    memory_mode: Option<MemoryMode>,
    health: Option<HealthMode>,
    ephemeral: Option<bool>,
    forward: Option<RawForward>,
    replication: Option<RawReplication>,
}

#[derive(Debug, Deserialize)]
struct RawForward {
    enabled: Option<bool>,
    parents: Option<Vec<String>>,
    api_key: Option<String>,
    charts_filter: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReplication {
    enabled: Option<bool>,
    period_secs: Option<i64>,
    step_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawScope {
    #[serde(rename = "type")]
    kind: Option<String>,
    enabled: Option<bool>,
    allow_from: Option<Vec<String>>,
    update_every: Option<i64>,
    history: Option<i64>,
    memory_mode: Option<MemoryMode>,
    health: Option<HealthMode>,
    ephemeral: Option<bool>,
    forward: Option<RawForward>,
    replication: Option<RawReplication>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    load_config_from_str(&toml_str)
}

/// Load config from the default path `/etc/roost/stream.toml`.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from_path(Path::new("/etc/roost/stream.toml"))
}

/// Load config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str)?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let stream = match raw.stream {
        Some(s) => StreamSettings {
            enabled: s.enabled.unwrap_or(true),
            bind_address: s.bind_address.unwrap_or_else(default_bind),
            node_id: match s.node_id {
                Some(id) => Some(Uuid::parse_str(&id).map_err(|_| {
                    ConfigError::InvalidValue(format!("stream.node_id is not a UUID: {id}"))
                })?),
                None => None,
            },
            min_interval_secs: s.min_interval_secs.unwrap_or(0),
            receive_timeout_secs: s.receive_timeout_secs.unwrap_or(600),
            send_timeout_secs: s.send_timeout_secs.unwrap_or(60),
            error_send_timeout_secs: s.error_send_timeout_secs.unwrap_or(5),
            ingest_threads: s.ingest_threads.unwrap_or(4),
        },
        None => StreamSettings {
            enabled: true,
            bind_address: default_bind(),
            node_id: None,
            min_interval_secs: 0,
            receive_timeout_secs: 600,
            send_timeout_secs: 60,
            error_send_timeout_secs: 5,
            ingest_threads: 4,
        },
    };

    let defaults = resolve_defaults(raw.defaults);

    let mut scopes = HashMap::new();
    for (key, raw_scope) in raw.scopes.unwrap_or_default() {
        let id = Uuid::parse_str(&key).map_err(|_| {
            ConfigError::InvalidValue(format!("scope section key is not a UUID: {key}"))
        })?;
        let kind = match raw_scope.kind.as_deref() {
            Some("api") => ScopeKind::Api,
            Some("machine") => ScopeKind::Machine,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "scopes.{key}.type must be \"api\" or \"machine\", got {other}"
                )))
            }
            None => return Err(ConfigError::MissingField(format!("scopes.{key}.type"))),
        };
        scopes.insert(
            id,
            ScopeConfig {
                kind,
                enabled: raw_scope.enabled,
                allow_from: raw_scope.allow_from.unwrap_or_else(|| vec!["*".to_owned()]),
                overrides: ScopeOverrides {
                    update_every: raw_scope.update_every,
                    history: raw_scope.history,
                    memory_mode: raw_scope.memory_mode,
                    health: raw_scope.health,
                    ephemeral: raw_scope.ephemeral,
                    forward: raw_scope.forward.map(resolve_forward),
                    replication: raw_scope.replication.map(resolve_replication),
                },
            },
        );
    }

    Ok(Config {
        schema_version,
        stream,
        defaults,
        scopes,
    })
}

fn default_bind() -> String {
    "0.0.0.0:8940".to_owned()
}

fn resolve_defaults(raw: Option<RawDefaults>) -> ReceiverConfig {
    let raw = raw.unwrap_or(RawDefaults {
        update_every: None,
        history: None,
        memory_mode: None,
        health: None,
        ephemeral: None,
        forward: None,
        replication: None,
    });
    ReceiverConfig {
        update_every: raw.update_every.unwrap_or(1),
        history: raw.history.unwrap_or(3600),
        memory_mode: raw.memory_mode.unwrap_or(MemoryMode::Dbengine),
        health: raw.health.unwrap_or(HealthMode::Auto),
        forward: raw.forward.map(resolve_forward).unwrap_or(ForwardSettings {
            enabled: false,
            parents: Vec::new(),
            api_key: String::new(),
            charts_filter: "*".to_owned(),
        }),
        replication: raw
            .replication
            .map(resolve_replication)
            .unwrap_or(ReplicationSettings {
                enabled: true,
                period_secs: 86400,
                step_secs: 600,
            }),
        ephemeral: raw.ephemeral.unwrap_or(false),
    }
}

fn resolve_forward(raw: RawForward) -> ForwardSettings {
    ForwardSettings {
        enabled: raw.enabled.unwrap_or(false),
        parents: raw.parents.unwrap_or_default(),
        api_key: raw.api_key.unwrap_or_default(),
        charts_filter: raw.charts_filter.unwrap_or_else(|| "*".to_owned()),
    }
}

fn resolve_replication(raw: RawReplication) -> ReplicationSettings {
    ReplicationSettings {
        enabled: raw.enabled.unwrap_or(true),
        period_secs: raw.period_secs.unwrap_or(86400),
        step_secs: raw.step_secs.unwrap_or(600),
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}
