//! Frozen-per-session configuration. A `Config` is loaded once at
//! startup from a TOML file (and/or CLI overrides) and handed to each
//! router session as an `Arc<Config>` snapshot; sessions never see a
//! config value change mid-flight, matching §3 "Config snapshot".
use serde::Deserialize;
use std::str::FromStr;

use crate::errors::RouterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaveSelectionCriteria {
    LeastGlobalConnections,
    LeastRouterConnections,
    LeastBehindMaster,
    LeastCurrentOperations,
}

impl Default for SlaveSelectionCriteria {
    fn default() -> Self {
        SlaveSelectionCriteria::LeastCurrentOperations
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseSqlVariablesIn {
    Master,
    All,
}

impl Default for UseSqlVariablesIn {
    fn default() -> Self {
        UseSqlVariablesIn::Master
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterFailureMode {
    FailInstantly,
    FailOnWrite,
    ErrorOnWrite,
}

impl Default for MasterFailureMode {
    fn default() -> Self {
        MasterFailureMode::FailInstantly
    }
}

/// Either an absolute connection count or a percentage of the cluster
/// size, as accepted by `max_slave_connections`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveConnectionCap {
    Count(usize),
    Percent(u8),
}

impl Default for SlaveConnectionCap {
    fn default() -> Self {
        SlaveConnectionCap::Count(1)
    }
}

impl FromStr for SlaveConnectionCap {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let pct: u8 = pct
                .parse()
                .map_err(|_| RouterError::Config(format!("invalid percent cap: {s}")))?;
            Ok(SlaveConnectionCap::Percent(pct.min(100)))
        } else {
            let n: usize = s
                .parse()
                .map_err(|_| RouterError::Config(format!("invalid connection cap: {s}")))?;
            Ok(SlaveConnectionCap::Count(n))
        }
    }
}

impl<'de> Deserialize<'de> for SlaveConnectionCap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Int(usize),
            Str(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Int(n) => Ok(SlaveConnectionCap::Count(n)),
            Repr::Str(s) => SlaveConnectionCap::from_str(&s).map_err(serde::de::Error::custom),
        }
    }
}

impl SlaveConnectionCap {
    /// Resolve against the current live slave count to get a concrete cap.
    pub fn resolve(&self, cluster_size: usize) -> usize {
        match self {
            SlaveConnectionCap::Count(n) => *n,
            SlaveConnectionCap::Percent(pct) => {
                (cluster_size * (*pct as usize) / 100).max(1)
            }
        }
    }
}

/// Mirrors spec §6 "Configuration parameters". Loaded from TOML, with
/// every field defaulted so a minimal file (or no file at all, when
/// backends are supplied purely via `--backend`) is still usable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub slave_selection_criteria: SlaveSelectionCriteria,
    pub max_slave_connections: SlaveConnectionCap,
    /// Seconds; `-1` disables lag-based exclusion.
    pub max_slave_replication_lag: i64,
    pub use_sql_variables_in: UseSqlVariablesIn,
    pub max_sescmd_history: usize,
    pub disable_sescmd_history: bool,
    pub master_accept_reads: bool,
    pub strict_multi_stmt: bool,
    pub master_failure_mode: MasterFailureMode,
    pub retry_failed_reads: bool,
    pub connection_keepalive: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            slave_selection_criteria: SlaveSelectionCriteria::default(),
            max_slave_connections: SlaveConnectionCap::default(),
            max_slave_replication_lag: -1,
            use_sql_variables_in: UseSqlVariablesIn::default(),
            max_sescmd_history: 200,
            disable_sescmd_history: false,
            master_accept_reads: false,
            strict_multi_stmt: false,
            master_failure_mode: MasterFailureMode::default(),
            retry_failed_reads: true,
            connection_keepalive: 300,
        }
    }
}

impl Config {
    /// Load from a TOML file on disk; callers treat a missing file as
    /// "use defaults", so only malformed content is an error here.
    pub fn load(path: &std::path::Path) -> Result<Self, RouterError> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| RouterError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.max_slave_connections, SlaveConnectionCap::Count(1));
        assert_eq!(cfg.max_slave_replication_lag, -1);
        assert_eq!(cfg.use_sql_variables_in, UseSqlVariablesIn::Master);
    }

    #[test]
    fn parses_percent_cap() {
        assert_eq!(
            SlaveConnectionCap::from_str("50%").unwrap(),
            SlaveConnectionCap::Percent(50)
        );
        assert_eq!(SlaveConnectionCap::Percent(50).resolve(10), 5);
    }

    #[test]
    fn loads_from_toml() {
        let toml_str = r#"
            slave_selection_criteria = "least_behind_master"
            max_slave_connections = "200%"
            master_failure_mode = "fail_on_write"
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(
            cfg.slave_selection_criteria,
            SlaveSelectionCriteria::LeastBehindMaster
        );
        assert_eq!(cfg.master_failure_mode, MasterFailureMode::FailOnWrite);
    }
}
