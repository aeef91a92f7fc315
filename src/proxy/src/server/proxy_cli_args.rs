use clap::Parser;

/// One `--backend role=addr` entry from the command line, e.g.
/// `--backend master=10.0.0.1:3306` or `--backend slave=10.0.0.2:3306`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendArg {
    pub role: BackendRole,
    pub addr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendRole {
    Master,
    Slave,
}

impl std::str::FromStr for BackendArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (role_str, addr) = s
            .split_once('=')
            .ok_or_else(|| format!("expected `role=addr`, got `{s}`"))?;
        let role = match role_str.to_ascii_lowercase().as_str() {
            "master" => BackendRole::Master,
            "slave" => BackendRole::Slave,
            other => return Err(format!("unknown backend role `{other}`, expected master|slave")),
        };
        if addr.is_empty() {
            return Err("backend address must not be empty".to_string());
        }
        Ok(BackendArg {
            role,
            addr: addr.to_string(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[clap(
    name = "rwsplit-proxy",
    version = "0.1.0",
    about = "Read/write-splitting MySQL/MariaDB proxy with a declarative result-set masking filter."
)]
pub struct ProxyServerArgs {
    #[clap(long, value_name = "WORKERS", default_value_t = 4)]
    pub works: usize,
    #[clap(long, value_name = "PORT", default_value_t = 3310)]
    pub port: u16,
    #[clap(long, value_name = "HTTP_PORT", default_value_t = 9000)]
    pub http_port: u16,
    #[clap(long, value_name = "TLS", default_value_t = false)]
    pub tls: bool,
    #[clap(long, value_name = "ENABLE METRICS COLLECTOR", default_value_t = false)]
    pub enable_metrics: bool,
    #[clap(long, value_name = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Path to the router's TOML configuration (§6 slave selection,
    /// failover policy, sescmd history limits).
    #[clap(long, value_name = "CONFIG_PATH")]
    pub config: Option<String>,

    /// Path to the masking rules JSON document. Omit to run with
    /// result-set rewriting disabled.
    #[clap(long, value_name = "MASKING_RULES_PATH")]
    pub masking_rules: Option<String>,

    /// Repeatable `--backend master=<addr>` / `--backend slave=<addr>`
    /// entries making up the static backend topology.
    #[clap(long = "backend", value_name = "ROLE=ADDR")]
    pub backends: Vec<BackendArg>,
}

impl ProxyServerArgs {
    pub fn master_addr(&self) -> Option<&str> {
        self.backends
            .iter()
            .find(|b| b.role == BackendRole::Master)
            .map(|b| b.addr.as_str())
    }

    pub fn slave_addrs(&self) -> Vec<&str> {
        self.backends
            .iter()
            .filter(|b| b.role == BackendRole::Slave)
            .map(|b| b.addr.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parses_master_and_slave_entries() {
        let m = BackendArg::from_str("master=10.0.0.1:3306").unwrap();
        assert_eq!(m.role, BackendRole::Master);
        let s = BackendArg::from_str("slave=10.0.0.2:3306").unwrap();
        assert_eq!(s.role, BackendRole::Slave);
    }

    #[test]
    fn rejects_unknown_role() {
        assert!(BackendArg::from_str("replica=10.0.0.2:3306").is_err());
    }

    #[test]
    fn rejects_missing_equals() {
        assert!(BackendArg::from_str("10.0.0.2:3306").is_err());
    }
}
