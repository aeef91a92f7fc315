pub mod backend_mgr;
pub mod handle;
pub mod pool;

/// A single physical backend address plus the role it plays in the
/// replication topology. `BackendMgr` keeps one connection pool per
/// entry.
#[derive(Clone, Default, Debug, Eq, PartialEq, Hash)]
pub struct BackendInstance {
    pub addr: String,
}

impl BackendInstance {
    pub fn new(addr: String) -> Self {
        Self { addr }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum DbConnPhase {
    None,
    Connection,
    Command,
}

#[derive(Default, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DbUserConnLifeCycle {
    db_user: Option<String>,
    conn_phase: Option<DbConnPhase>,
}

impl DbUserConnLifeCycle {
    pub fn is_none(&self) -> bool {
        self.db_user.is_none() && self.conn_phase.is_none()
    }

    pub fn new_conn_life_cycle(db_user: String, conn_phase: DbConnPhase) -> Self {
        Self {
            db_user: Some(db_user),
            conn_phase: Some(conn_phase),
        }
    }

    pub fn conn_phase(&self) -> Option<DbConnPhase> {
        self.conn_phase.clone()
    }

    pub fn db_user(&self) -> Option<String> {
        self.db_user.clone()
    }
}
