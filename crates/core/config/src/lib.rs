//! CellCC configuration.
//!
//! Configuration is a closed, typed record: every directive is enumerated
//! below with its type and default, the per-cell and per-queue families are
//! maps keyed by cell/queue name, and unknown directives are fatal at load
//! time. Directive paths are `/`-separated (`dump/scratch-dir`,
//! `restore/queues/slow/max-parallel`).

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
};

mod config_file;

pub use config_file::{load, ConfigOverride, Json5};

/// Default config file path used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cellcc/cellcc.conf";

/// Queue name used when a sync request does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Where configuration comes from: the file path plus any `-x` overrides.
///
/// Daemons hold on to this so a `SIGHUP` can re-run the exact same load; a
/// reload that fails leaves the previously validated [`Config`] in place.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    path: PathBuf,
    path_is_default: bool,
    overrides: Vec<ConfigOverride>,
}

impl ConfigSource {
    /// Build a source from an optional `--config` path and `-x` overrides.
    ///
    /// Without an explicit path the built-in default is used, and its
    /// absence is tolerated (the overrides may carry everything needed).
    pub fn new(path: Option<PathBuf>, overrides: Vec<ConfigOverride>) -> Self {
        match path {
            Some(path) => Self {
                path,
                path_is_default: false,
                overrides,
            },
            None => Self {
                path: PathBuf::from(DEFAULT_CONFIG_PATH),
                path_is_default: true,
                overrides,
            },
        }
    }

    /// Load and validate the configuration.
    pub fn load(&self) -> Result<Config, ConfigError> {
        config_file::load(&self.path, self.path_is_default, &self.overrides)
    }
}

/// Resolved CellCC configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    /// Per-source-cell routing: which destination cells a volume in the
    /// keyed cell is synchronized to.
    #[serde(default)]
    pub cells: HashMap<String, CellConfig>,
    #[serde(default)]
    pub dump: DumpConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub vos: VosConfig,
    #[serde(default)]
    pub remctl: RemctlConfig,
    #[serde(default)]
    pub pick: PickConfig,
    #[serde(default)]
    pub check: CheckConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

/// Job database connection settings.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DbConfig {
    /// Connection URL for the shared job database (required).
    pub url: Option<String>,
    /// Connection pool size per process.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

/// Per-source-cell settings.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CellConfig {
    /// Destination cells volumes in this cell are synced to by default.
    #[serde(default)]
    pub dst_cells: Vec<String>,
}

/// Dump-side settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DumpConfig {
    /// Scratch directory dump blobs are written into.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Bytes that must remain free on the scratch filesystem beyond the
    /// estimated dump size.
    #[serde(default = "default_scratch_min_free")]
    pub scratch_min_free: u64,
    /// Checksum algorithm recorded with every dump blob.
    #[serde(default)]
    pub checksum: ChecksumAlgo,
    /// Maximum concurrent dump jobs per dump-server process.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Seconds between dump-server scans for new work.
    #[serde(default = "default_daemon_interval")]
    pub interval: u64,
    #[serde(default)]
    pub incremental: IncrementalConfig,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            scratch_min_free: default_scratch_min_free(),
            checksum: ChecksumAlgo::default(),
            max_parallel: default_max_parallel(),
            interval: default_daemon_interval(),
            incremental: IncrementalConfig::default(),
        }
    }
}

/// Incremental dump behavior.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct IncrementalConfig {
    /// Attempt incremental dumps based on the destination's last update.
    #[serde(default)]
    pub enabled: bool,
    /// Short-circuit jobs whose destination is already current.
    #[serde(default)]
    pub skip_unchanged: bool,
    /// Fall back to a full dump when the destination cannot be examined.
    #[serde(default = "default_true")]
    pub fulldump_on_error: bool,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            skip_unchanged: false,
            fulldump_on_error: true,
        }
    }
}

/// Restore-side settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RestoreConfig {
    /// Scratch directory fetched dump blobs are written into.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Bytes that must remain free on the scratch filesystem beyond the
    /// incoming blob size.
    #[serde(default = "default_scratch_min_free")]
    pub scratch_min_free: u64,
    /// Seconds between restore-server scans for new work.
    #[serde(default = "default_daemon_interval")]
    pub interval: u64,
    /// Per-queue settings, keyed by queue name. A `default` queue always
    /// exists at runtime even when absent here.
    #[serde(default)]
    pub queues: HashMap<String, QueueConfig>,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            scratch_min_free: default_scratch_min_free(),
            interval: default_daemon_interval(),
            queues: HashMap::new(),
        }
    }
}

/// Per-queue settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct QueueConfig {
    /// Maximum concurrent jobs for this queue.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub release: ReleaseConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            release: ReleaseConfig::default(),
        }
    }
}

/// Per-queue release settings.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ReleaseConfig {
    /// Extra flags passed to the release command. An empty value passes the
    /// flag bare; a non-empty value follows the flag as its argument.
    #[serde(default)]
    pub flags: BTreeMap<String, String>,
}

/// Settings for the filesystem administrative CLI.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VosConfig {
    /// The `vos`-like binary to run.
    #[serde(default = "default_vos_command")]
    pub command: String,
    /// Authenticate with the server key on the local host.
    #[serde(default)]
    pub localauth: bool,
    /// Authenticate with credentials from this keytab instead.
    #[serde(default)]
    pub keytab: Option<String>,
    /// Principal to authenticate as when using a keytab.
    #[serde(default)]
    pub principal: Option<String>,
}

impl Default for VosConfig {
    fn default() -> Self {
        Self {
            command: default_vos_command(),
            localauth: false,
            keytab: None,
            principal: None,
        }
    }
}

/// Settings for the remote-command transport.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RemctlConfig {
    /// The remote-command client binary.
    #[serde(default = "default_remctl_command")]
    pub command: String,
    /// Port the remote-command server listens on.
    #[serde(default = "default_remctl_port")]
    pub port: u16,
    /// Principal allowed to invoke the server-side subcommands.
    #[serde(default)]
    pub principal: Option<String>,
}

impl Default for RemctlConfig {
    fn default() -> Self {
        Self {
            command: default_remctl_command(),
            port: default_remctl_port(),
            principal: None,
        }
    }
}

/// Hook commands run by the sync pipeline.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PickConfig {
    /// Shell command deciding whether a volume is synced (`include`) or
    /// skipped (`exclude`).
    #[serde(default)]
    pub filter_command: Option<String>,
    /// Shell command choosing the sites for a newly created volume.
    #[serde(default)]
    pub sites_command: Option<String>,
}

/// Check-server policy settings.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CheckConfig {
    /// Seconds between check-server sweeps.
    #[serde(default = "default_check_interval")]
    pub interval: u64,
    /// Failed attempts after which a job is no longer retried.
    #[serde(default = "default_error_limit")]
    pub error_limit: i32,
    /// Minimum seconds between error-limit alerts for the same job.
    #[serde(default = "default_errlimit_interval")]
    pub errlimit_interval: i64,
    /// Seconds without a mutation before a job is reported stale.
    #[serde(default = "default_stale_seconds")]
    pub stale_seconds: i64,
    /// Seconds since creation before a job is reported old.
    #[serde(default = "default_old_seconds")]
    pub old_seconds: i64,
    /// Copy finished jobs to the history relation before deleting them.
    #[serde(default = "default_true")]
    pub archive_jobs: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            interval: default_check_interval(),
            error_limit: default_error_limit(),
            errlimit_interval: default_errlimit_interval(),
            stale_seconds: default_stale_seconds(),
            old_seconds: default_old_seconds(),
            archive_jobs: true,
        }
    }
}

/// Alert dispatch settings. The three channels are independent.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AlertsConfig {
    /// Shell command fed the text-formatted alerts on stdin.
    #[serde(default)]
    pub text_command: Option<String>,
    /// Shell command fed the JSON-encoded alerts on stdin.
    #[serde(default)]
    pub json_command: Option<String>,
    /// Emit alerts to the log at warning level.
    #[serde(default = "default_true")]
    pub log: bool,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            text_command: None,
            json_command: None,
            log: true,
        }
    }
}

/// Checksum algorithm for dump blobs.
///
/// The algorithm name is the prefix of the recorded `ALGO:hex` string, so
/// the transfer side can verify with whatever algorithm the dump side used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgo {
    Md5,
    #[default]
    Sha256,
    Sha512,
}

impl ChecksumAlgo {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl std::str::FromStr for ChecksumAlgo {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(ConfigError::UnknownChecksum {
                algo: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for ChecksumAlgo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Config {
    /// Validate cross-directive constraints.
    ///
    /// Called by [`load`]; also the whole of `cellcc config --check`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.db.url.as_deref().is_some_and(|url| !url.is_empty()) {
            return Err(ConfigError::MissingDirective {
                key: "db/url".to_string(),
            });
        }

        // vos must authenticate exactly one way. Neither (or both) set is a
        // configuration the admin tool cannot act on.
        match (self.vos.localauth, self.vos.keytab.as_deref()) {
            (true, None) | (false, Some(_)) => {}
            (false, None) => {
                return Err(ConfigError::VosAuth {
                    reason: "neither vos/localauth nor vos/keytab is set".to_string(),
                })
            }
            (true, Some(_)) => {
                return Err(ConfigError::VosAuth {
                    reason: "vos/localauth and vos/keytab are mutually exclusive".to_string(),
                })
            }
        }

        for (qname, queue) in &self.restore.queues {
            if queue.max_parallel == 0 {
                return Err(ConfigError::InvalidDirective {
                    key: format!("restore/queues/{qname}/max-parallel"),
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        if self.dump.max_parallel == 0 {
            return Err(ConfigError::InvalidDirective {
                key: "dump/max-parallel".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// The database URL. Only valid after [`Config::validate`].
    pub fn db_url(&self) -> &str {
        self.db.url.as_deref().unwrap_or_default()
    }

    /// Destination cells configured for a source cell.
    pub fn dst_cells(&self, src_cell: &str) -> Option<&[String]> {
        self.cells
            .get(src_cell)
            .map(|cell| cell.dst_cells.as_slice())
    }

    /// Per-queue settings, falling back to defaults for unknown queues.
    pub fn queue(&self, qname: &str) -> QueueConfig {
        self.restore.queues.get(qname).cloned().unwrap_or_default()
    }

    /// Queue names the restore-server serves: everything configured plus
    /// the synthetic `default` queue.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.restore.queues.keys().cloned().collect();
        if !names.iter().any(|name| name == DEFAULT_QUEUE) {
            names.push(DEFAULT_QUEUE.to_string());
        }
        names.sort();
        names
    }

    /// Look up a single directive by `/`-separated path.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let doc = serde_json::to_value(self).ok()?;
        let mut current = &doc;
        for segment in key.split('/') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// The fully resolved configuration as pretty-printed JSON.
    pub fn dump_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested config file does not exist.
    #[error("Config file not found: {path:?}")]
    MissingFile { path: PathBuf },

    /// The config file exists but could not be read.
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file (or an override) failed to parse or carried unknown
    /// directives.
    #[error("Failed to load config from {path:?}: {source}")]
    Figment {
        path: PathBuf,
        #[source]
        source: Box<figment::Error>,
    },

    /// A required directive is absent.
    #[error("Missing required config directive: {key}")]
    MissingDirective { key: String },

    /// A directive carries a value the system cannot act on.
    #[error("Invalid config directive {key}: {reason}")]
    InvalidDirective { key: String, reason: String },

    /// The vos authentication directives are inconsistent.
    #[error("Invalid vos auth configuration: {reason}")]
    VosAuth { reason: String },

    /// A `-x KEY=VAL` argument could not be parsed.
    #[error("Invalid -x override {arg:?}: {reason}")]
    InvalidOverride { arg: String, reason: String },

    /// An unrecognized checksum algorithm name.
    #[error("Unknown checksum algorithm: {algo}")]
    UnknownChecksum { algo: String },
}

fn default_pool_size() -> u32 {
    10
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/var/tmp/cellcc")
}

fn default_scratch_min_free() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_max_parallel() -> usize {
    10
}

fn default_daemon_interval() -> u64 {
    30
}

fn default_vos_command() -> String {
    "vos".to_string()
}

fn default_remctl_command() -> String {
    "remctl".to_string()
}

fn default_remctl_port() -> u16 {
    4373
}

fn default_check_interval() -> u64 {
    60
}

fn default_error_limit() -> i32 {
    5
}

fn default_errlimit_interval() -> i64 {
    3600
}

fn default_stale_seconds() -> i64 {
    3600
}

fn default_old_seconds() -> i64 {
    172_800
}

fn default_true() -> bool {
    true
}
