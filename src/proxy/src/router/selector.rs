//! Chooses which backend(s) a classified statement goes to. Grounded in
//! `BackendLoadBalancer`/`BackendRouter` (`backend/router/mod.rs`), which
//! pick one instance out of a candidate set; this generalizes that idea
//! with the ordering/cap/lag rules a read/write split needs instead of
//! a bare random or P2C pick.
use crate::backend::handle::{BackendHandle, BackendRole};
use crate::config::{Config, SlaveSelectionCriteria};
use crate::errors::RouterError;
use crate::router::classifier::RouteTarget;

/// Orders candidate slaves by the configured criterion. Lower is better.
fn criterion_key(h: &BackendHandle, criterion: SlaveSelectionCriteria) -> u64 {
    match criterion {
        SlaveSelectionCriteria::LeastGlobalConnections => h.health.global_connections as u64,
        SlaveSelectionCriteria::LeastRouterConnections => h.health.router_connections as u64,
        SlaveSelectionCriteria::LeastBehindMaster => h.health.replication_lag_secs.max(0) as u64,
        SlaveSelectionCriteria::LeastCurrentOperations => h.health.current_operations as u64,
    }
}

pub enum SelectionOutcome<'a> {
    Single(&'a mut BackendHandle),
    Broadcast(Vec<&'a mut BackendHandle>),
}

/// Picks candidate slaves eligible under the cap and lag threshold,
/// sorted by criterion with ties broken by backend id for determinism.
fn eligible_slaves<'a>(
    backends: &'a mut [BackendHandle],
    cfg: &Config,
) -> Vec<&'a mut BackendHandle> {
    let cluster_size = backends.len();
    let mut slaves: Vec<&mut BackendHandle> = backends
        .iter_mut()
        .filter(|b| b.role == BackendRole::Slave && b.is_usable() && b.health.alive)
        .filter(|b| {
            cfg.max_slave_replication_lag < 0
                || b.health.replication_lag_secs <= cfg.max_slave_replication_lag
        })
        .collect();
    slaves.sort_by(|a, b| {
        criterion_key(a, cfg.slave_selection_criteria)
            .cmp(&criterion_key(b, cfg.slave_selection_criteria))
            .then_with(|| a.id.cmp(&b.id))
    });
    let cap = cfg.max_slave_connections.resolve(cluster_size);
    slaves.truncate(cap.max(1));
    slaves
}

/// Selects a single backend for a non-session-modifying statement
/// restricted to `target_mask`. `target_mask == ALL` is handled by the
/// caller via broadcast and never reaches this function.
pub fn select_one<'a>(
    backends: &'a mut [BackendHandle],
    target_mask: RouteTarget,
    cfg: &Config,
) -> Result<&'a mut BackendHandle, RouterError> {
    if target_mask.contains(RouteTarget::MASTER) && !target_mask.contains(RouteTarget::SLAVE) {
        return backends
            .iter_mut()
            .find(|b| matches!(b.role, BackendRole::Master | BackendRole::Joined) && b.is_usable())
            .ok_or(RouterError::NoBackend);
    }

    let candidates = eligible_slaves(backends, cfg);
    if let Some(best) = candidates.into_iter().next() {
        return Ok(best);
    }

    if cfg.master_accept_reads {
        return backends
            .iter_mut()
            .find(|b| matches!(b.role, BackendRole::Master | BackendRole::Joined) && b.is_usable())
            .ok_or(RouterError::NoBackend);
    }

    Err(RouterError::NoBackend)
}

/// Backends that should receive a broadcast copy of a session-modifying
/// command: every live, unclosed, `DONE` handle.
pub fn broadcast_targets(backends: &mut [BackendHandle]) -> Vec<&mut BackendHandle> {
    backends
        .iter_mut()
        .filter(|b| {
            b.is_usable()
                && b.reply_state() == crate::backend::handle::ReplyState::Done
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::handle::BackendHandle;

    fn make(id: &str, role: BackendRole, lag: i64) -> BackendHandle {
        let mut h = BackendHandle::new(id, "127.0.0.1:0", role);
        h.health.replication_lag_secs = lag;
        h.health.alive = true;
        h
    }

    #[test]
    fn picks_lowest_lag_slave() {
        let mut backends = vec![
            make("s1", BackendRole::Slave, 5),
            make("s2", BackendRole::Slave, 1),
            make("m1", BackendRole::Master, 0),
        ];
        let cfg = Config {
            slave_selection_criteria: SlaveSelectionCriteria::LeastBehindMaster,
            max_slave_connections: crate::config::SlaveConnectionCap::Count(5),
            ..Config::default()
        };
        let picked = select_one(&mut backends, RouteTarget::SLAVE, &cfg).unwrap();
        assert_eq!(picked.id, "s2");
    }

    #[test]
    fn falls_back_to_master_when_no_slave_qualifies() {
        let mut backends = vec![make("m1", BackendRole::Master, 0)];
        let mut cfg = Config::default();
        cfg.master_accept_reads = true;
        let picked = select_one(&mut backends, RouteTarget::SLAVE, &cfg).unwrap();
        assert_eq!(picked.id, "m1");
    }

    #[test]
    fn no_backend_when_nothing_qualifies() {
        let mut backends: Vec<BackendHandle> = vec![];
        let cfg = Config::default();
        let result = select_one(&mut backends, RouteTarget::SLAVE, &cfg);
        assert!(matches!(result, Err(RouterError::NoBackend)));
    }

    #[test]
    fn respects_max_slave_connections_cap() {
        let mut backends = vec![
            make("s1", BackendRole::Slave, 0),
            make("s2", BackendRole::Slave, 0),
            make("s3", BackendRole::Slave, 0),
        ];
        let mut cfg = Config::default();
        cfg.max_slave_connections = crate::config::SlaveConnectionCap::Count(1);
        let eligible = eligible_slaves(&mut backends, &cfg);
        assert_eq!(eligible.len(), 1);
    }
}
