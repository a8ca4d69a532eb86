use crate::error::{FeedSyncError, Result};
use serde::Deserialize;
use std::num::IntErrorKind;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// RunOptions
// ---------------------------------------------------------------------------

pub const DEFAULT_TIMEOUT_MINUTES: u64 = 30;
pub const MIN_TIMEOUT_MINUTES: i64 = 5;
pub const MAX_TIMEOUT_MINUTES: i64 = 900;

pub const DEFAULT_INTERVAL_SECS: f64 = 5.0;
pub const MIN_INTERVAL_SECS: f64 = 1.0;
pub const MAX_INTERVAL_SECS: f64 = 60.0;

/// Per-invocation settings taken from the command line.
///
/// Built once and passed into every component; nothing reads these from
/// ambient state.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Deadline applied to each waiting stage.
    pub timeout: Duration,
    /// Pause between poll ticks.
    pub interval: Duration,
    /// Reduced dataset: leave the large NVD/CPE tables out of the snapshot.
    pub slim: bool,
}

impl RunOptions {
    /// Parse and clamp raw argument strings. Unparseable values fall back to
    /// the defaults instead of failing.
    pub fn from_args(timeout_minutes: &str, interval_secs: &str, slim: bool) -> Self {
        Self {
            timeout: Duration::from_secs(clamp_timeout_minutes(timeout_minutes) * 60),
            interval: Duration::from_secs_f64(clamp_interval_secs(interval_secs)),
            slim,
        }
    }

    pub fn timeout_minutes(&self) -> u64 {
        self.timeout.as_secs() / 60
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_MINUTES * 60),
            interval: Duration::from_secs_f64(DEFAULT_INTERVAL_SECS),
            slim: false,
        }
    }
}

/// Integers beyond `i64` still clamp to the nearest bound.
pub fn clamp_timeout_minutes(raw: &str) -> u64 {
    let minutes = match raw.trim().parse::<i64>() {
        Ok(minutes) => minutes,
        Err(e) => match e.kind() {
            IntErrorKind::PosOverflow => MAX_TIMEOUT_MINUTES,
            IntErrorKind::NegOverflow => MIN_TIMEOUT_MINUTES,
            _ => return DEFAULT_TIMEOUT_MINUTES,
        },
    };
    minutes.clamp(MIN_TIMEOUT_MINUTES, MAX_TIMEOUT_MINUTES) as u64
}

pub fn clamp_interval_secs(raw: &str) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(secs) if !secs.is_nan() => secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS),
        _ => DEFAULT_INTERVAL_SECS,
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_engine_url")]
    pub url: String,
    #[serde(default = "default_engine_user")]
    pub user: String,
    #[serde(default = "default_engine_password")]
    pub password: String,
    /// Per-request timeout for status queries, independent of the stage
    /// deadline.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub verify_tls: bool,
}

fn default_engine_url() -> String {
    "http://localhost:8228/v1".to_string()
}

fn default_engine_user() -> String {
    "admin".to_string()
}

fn default_engine_password() -> String {
    "foobar".to_string()
}

fn default_request_timeout() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: default_engine_url(),
            user: default_engine_user(),
            password: default_engine_password(),
            request_timeout_secs: default_request_timeout(),
            verify_tls: false,
        }
    }
}

// ---------------------------------------------------------------------------
// ServicesConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServicesConfig {
    /// Command prefix for docker-compose invocations.
    #[serde(default = "default_compose")]
    pub compose: Vec<String>,
    #[serde(default = "default_docker")]
    pub docker: Vec<String>,
    #[serde(default = "default_db_service")]
    pub db: String,
    #[serde(default = "default_engine_service")]
    pub engine: String,
    /// Container name used by `docker cp`.
    #[serde(default = "default_db_service")]
    pub db_container: String,
}

fn default_compose() -> Vec<String> {
    vec!["docker-compose".to_string()]
}

fn default_docker() -> Vec<String> {
    vec!["docker".to_string()]
}

fn default_db_service() -> String {
    "nextlinux-db".to_string()
}

fn default_engine_service() -> String {
    "nextlinux-engine".to_string()
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            compose: default_compose(),
            docker: default_docker(),
            db: default_db_service(),
            engine: default_engine_service(),
            db_container: default_db_service(),
        }
    }
}

// ---------------------------------------------------------------------------
// ReadinessConfig
// ---------------------------------------------------------------------------

/// The engine CLI's `system wait` check. An empty `command` skips it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadinessConfig {
    #[serde(default = "default_readiness_command")]
    pub command: Vec<String>,
    /// Feed passed to `--feedsready` while waiting for sync completion.
    #[serde(default = "default_readiness_feed")]
    pub feed: String,
}

fn default_readiness_command() -> Vec<String> {
    vec!["nextlinux-cli".to_string()]
}

fn default_readiness_feed() -> String {
    "vulnerabilities".to_string()
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            command: default_readiness_command(),
            feed: default_readiness_feed(),
        }
    }
}

// ---------------------------------------------------------------------------
// TriggerConfig
// ---------------------------------------------------------------------------

/// Replaces the default `curl -X POST …?sync=true` trigger when set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerConfig {
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// SnapshotConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotConfig {
    #[serde(default = "default_image")]
    pub image: String,
    /// Dump location inside the database container.
    #[serde(default = "default_dump_path")]
    pub dump_path: String,
    #[serde(default = "default_db_user")]
    pub db_user: String,
    /// Tables whose data is never exported.
    #[serde(default = "default_exclude_tables")]
    pub exclude_tables: Vec<String>,
    /// Additionally excluded in slim mode.
    #[serde(default = "default_slim_exclude_tables")]
    pub slim_exclude_tables: Vec<String>,
}

fn default_image() -> String {
    "nextlinux/engine-db-preload:dev".to_string()
}

fn default_dump_path() -> String {
    "/docker-entrypoint-initdb.d/nextlinux-bootstrap.sql.gz".to_string()
}

fn default_db_user() -> String {
    "postgres".to_string()
}

fn default_exclude_tables() -> Vec<String> {
    [
        "nextlinux",
        "users",
        "services",
        "leases",
        "tasks",
        "events",
        "queues",
        "queuemeta",
        "queues",
        "accounts",
        "account_users",
        "user_access_credentials",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_slim_exclude_tables() -> Vec<String> {
    vec![
        "feed_data_nvdv2_vulnerabilities".to_string(),
        "feed_data_cpev2_vulnerabilities".to_string(),
    ]
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            dump_path: default_dump_path(),
            db_user: default_db_user(),
            exclude_tables: default_exclude_tables(),
            slim_exclude_tables: default_slim_exclude_tables(),
        }
    }
}

impl SnapshotConfig {
    /// `--exclude-table-data=<t>` for every excluded table, in order.
    pub fn exclude_options(&self, slim: bool) -> Vec<String> {
        let extra: &[String] = if slim { &self.slim_exclude_tables } else { &[] };
        self.exclude_tables
            .iter()
            .chain(extra)
            .map(|t| format!("--exclude-table-data={t}"))
            .collect()
    }

    /// File name `docker cp` leaves in the working directory.
    pub fn artifact_name(&self) -> &str {
        self.dump_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.dump_path)
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FeedSyncError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.url.trim().is_empty() {
            return Err(FeedSyncError::Config("engine.url is empty".into()));
        }
        if self.engine.request_timeout_secs == 0 {
            return Err(FeedSyncError::Config(
                "engine.request_timeout_secs must be positive".into(),
            ));
        }
        let templates = [
            ("services.compose", Some(&self.services.compose)),
            ("services.docker", Some(&self.services.docker)),
            ("trigger.command", self.trigger.command.as_ref()),
        ];
        for (name, template) in templates {
            if template.is_some_and(|argv| argv.is_empty()) {
                return Err(FeedSyncError::Config(format!("{name} is empty")));
            }
        }
        for (name, value) in [
            ("services.db", &self.services.db),
            ("services.engine", &self.services.engine),
            ("services.db_container", &self.services.db_container),
            ("snapshot.dump_path", &self.snapshot.dump_path),
        ] {
            if value.trim().is_empty() {
                return Err(FeedSyncError::Config(format!("{name} is empty")));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_clamped() {
        assert_eq!(clamp_timeout_minutes("1"), 5);
        assert_eq!(clamp_timeout_minutes("-3"), 5);
        assert_eq!(clamp_timeout_minutes("120"), 120);
        assert_eq!(clamp_timeout_minutes("10000"), 900);
        assert_eq!(clamp_timeout_minutes("abc"), DEFAULT_TIMEOUT_MINUTES);
        assert_eq!(clamp_timeout_minutes("1.5"), DEFAULT_TIMEOUT_MINUTES);
    }

    #[test]
    fn timeout_beyond_i64_clamps_to_bounds() {
        assert_eq!(clamp_timeout_minutes("99999999999999999999"), 900);
        assert_eq!(clamp_timeout_minutes("-99999999999999999999"), 5);
        assert_eq!(clamp_timeout_minutes(""), DEFAULT_TIMEOUT_MINUTES);
    }

    #[test]
    fn interval_is_clamped() {
        assert_eq!(clamp_interval_secs("0.1"), 1.0);
        assert_eq!(clamp_interval_secs("2.5"), 2.5);
        assert_eq!(clamp_interval_secs("600"), 60.0);
        assert_eq!(clamp_interval_secs("inf"), 60.0);
        assert_eq!(clamp_interval_secs("NaN"), DEFAULT_INTERVAL_SECS);
        assert_eq!(clamp_interval_secs("soon"), DEFAULT_INTERVAL_SECS);
    }

    #[test]
    fn run_options_from_args() {
        let opts = RunOptions::from_args("10", "0.5", true);
        assert_eq!(opts.timeout, Duration::from_secs(600));
        assert_eq!(opts.interval, Duration::from_secs(1));
        assert_eq!(opts.timeout_minutes(), 10);
        assert!(opts.slim);
    }

    #[test]
    fn defaults_match_stock_deployment() {
        let cfg = Config::default();
        assert_eq!(cfg.engine.url, "http://localhost:8228/v1");
        assert_eq!(cfg.services.compose, vec!["docker-compose"]);
        assert_eq!(cfg.services.db, "nextlinux-db");
        assert_eq!(cfg.readiness.feed, "vulnerabilities");
        assert!(cfg.trigger.command.is_none());
        assert_eq!(cfg.snapshot.exclude_tables.len(), 12);
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = "engine:\n  url: http://engine:8228/v1\nreadiness:\n  command: []\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.engine.url, "http://engine:8228/v1");
        assert_eq!(cfg.engine.user, "admin");
        assert!(cfg.readiness.command.is_empty());
        assert_eq!(cfg.snapshot.db_user, "postgres");
    }

    #[test]
    fn rejects_unknown_fields() {
        let yaml = "engine:\n  ulr: http://typo\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn validate_rejects_empty_templates() {
        let mut cfg = Config::default();
        cfg.services.compose.clear();
        assert!(matches!(cfg.validate(), Err(FeedSyncError::Config(_))));

        let mut cfg = Config::default();
        cfg.trigger.command = Some(vec![]);
        assert!(cfg.validate().unwrap_err().to_string().contains("trigger.command"));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("feedsync.yaml");
        std::fs::write(&path, "services:\n  compose: [docker, compose]\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.services.compose, vec!["docker", "compose"]);
    }

    #[test]
    fn load_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Config::load(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn exclude_options_slim_adds_tables() {
        let snap = SnapshotConfig::default();
        let full = snap.exclude_options(false);
        let slim = snap.exclude_options(true);
        assert_eq!(full[0], "--exclude-table-data=nextlinux");
        assert_eq!(slim.len(), full.len() + 2);
        assert_eq!(
            slim.last().unwrap(),
            "--exclude-table-data=feed_data_cpev2_vulnerabilities"
        );
    }

    #[test]
    fn artifact_name_is_basename() {
        assert_eq!(
            SnapshotConfig::default().artifact_name(),
            "nextlinux-bootstrap.sql.gz"
        );
    }
}
