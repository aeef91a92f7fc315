use crate::backend::pool::pooled_conn_mgr::PooledConnMgr;
use crate::backend::pool::BackendPoolConfig;
use crate::backend::BackendInstance;

use deadpool::managed::{Object, Pool};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

#[derive(Debug, Clone)]
pub struct BackendManagerOptions {
    pub tls: bool,
    pub pool_config: BackendPoolConfig,
}

impl Default for BackendManagerOptions {
    fn default() -> Self {
        Self {
            tls: false,
            pool_config: BackendPoolConfig::default(),
        }
    }
}

/// Which role's pool a caller wants a connection from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPreference {
    Master,
    AnySlave,
}

struct RolePool {
    instance: BackendInstance,
    pool: Pool<PooledConnMgr>,
}

/// Owns one `deadpool` connection pool per configured backend address
/// and hands out a pool for a requested role. The master pool is
/// optional (a read-only deployment may run with slaves only); the
/// slave list is round-robined.
pub struct BackendMgr {
    master: Option<RolePool>,
    slaves: Vec<RolePool>,
    next_slave: AtomicUsize,
}

impl BackendMgr {
    fn build_pool(
        addr: &str,
        mgr_options: &BackendManagerOptions,
    ) -> Result<RolePool, std::io::Error> {
        let instance = BackendInstance::new(addr.to_string());
        let conn_mgr = PooledConnMgr::new(instance.clone());
        let max_size = mgr_options.pool_config.max_size as usize;
        let pool = Pool::builder(conn_mgr).max_size(max_size).build().map_err(|e| {
            std::io::Error::new(ErrorKind::ConnectionRefused, e.to_string())
        })?;
        info!("RwSplit backend_mgr conn pool initialized addr={addr:?}");
        Ok(RolePool { instance, pool })
    }

    pub fn new(
        master_addr: Option<&str>,
        slave_addrs: &[&str],
        mgr_options: &BackendManagerOptions,
    ) -> Result<Self, std::io::Error> {
        let master = master_addr
            .map(|addr| Self::build_pool(addr, mgr_options))
            .transpose()?;
        let slaves = slave_addrs
            .iter()
            .map(|addr| Self::build_pool(addr, mgr_options))
            .collect::<Result<Vec<_>, _>>()?;
        if master.is_none() && slaves.is_empty() {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "no backend addresses configured",
            ));
        }
        Ok(Self {
            master,
            slaves,
            next_slave: AtomicUsize::new(0),
        })
    }

    /// No-op placeholder kept for the connect-time call site; pools
    /// are already built eagerly in `new`.
    pub async fn prepare_backend_conn_pool(&self) -> Result<(), std::io::Error> {
        Ok(())
    }

    pub fn connect_to_backend(
        &self,
        preference: BackendPreference,
    ) -> Result<Pool<PooledConnMgr, Object<PooledConnMgr>>, std::io::Error> {
        match preference {
            BackendPreference::Master => self
                .master
                .as_ref()
                .map(|rp| rp.pool.clone())
                .ok_or_else(|| {
                    std::io::Error::new(ErrorKind::NotConnected, "no master backend configured")
                }),
            BackendPreference::AnySlave => {
                if self.slaves.is_empty() {
                    return self.connect_to_backend(BackendPreference::Master);
                }
                let idx = self.next_slave.fetch_add(1, Ordering::Relaxed) % self.slaves.len();
                Ok(self.slaves[idx].pool.clone())
            }
        }
    }

    pub fn master_addr(&self) -> Option<&str> {
        self.master.as_ref().map(|rp| rp.instance.addr.as_str())
    }

    pub fn slave_addrs(&self) -> Vec<&str> {
        self.slaves.iter().map(|rp| rp.instance.addr.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_topology() {
        let opts = BackendManagerOptions::default();
        assert!(BackendMgr::new(None, &[], &opts).is_err());
    }
}
