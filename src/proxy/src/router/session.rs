//! The per-client state machine: owns one or more `BackendHandle`s and
//! decides, for every packet, where it goes and how the replies get
//! merged back into the single stream the client sees. This is the
//! generalization of `QueryForwarder`'s single-backend forwarding loop
//! (`server/forwarder/query_forward.rs`) to N backends with a
//! session-command log standing in for the part of session state a
//! lone connection gets for free.
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::handle::{BackendHandle, BackendRole};
use crate::config::{Config, MasterFailureMode};
use crate::errors::RouterError;
use crate::protocol::mysql::packet::Packet;
use crate::router::classifier::{
    classify_packet, ClassifierContext, LoadDataState, RouteTarget, TempTableAction,
};
use crate::router::selector::{broadcast_targets, select_one};
use crate::router::sescmd::SessionCommandLog;

/// What the session wants the surrounding server to do next. The server
/// loop (`server/mod.rs`) is the one holding actual sockets; this keeps
/// `RouterSession` testable without any I/O.
#[derive(Debug, Clone)]
pub enum RouterAction {
    Send { backend_id: String, payload: Vec<u8> },
    ReplyToClient { payload: Vec<u8> },
    CloseSession,
}

struct InFlight {
    /// Backend whose reply is forwarded to the client.
    reference: String,
    /// Every backend a copy of the query was sent to (len 1 for a
    /// normal routed query, >1 for a broadcast).
    recipients: HashSet<String>,
    sescmd_position: Option<u64>,
    /// The query payload sent to `reference`, kept so a failed read can
    /// be silently retried on another slave.
    payload: Vec<u8>,
    /// Final packet header byte per backend, populated only for
    /// broadcasts, used to detect divergent replies once all complete.
    finals: std::collections::HashMap<String, u8>,
}

pub struct RouterSession {
    pub config: Arc<Config>,
    backends: Vec<BackendHandle>,
    current_master: Option<String>,
    /// Sticky-master lock: set while a transaction or strict multi-stmt
    /// run is open, cleared at transaction end / session reset.
    sticky_master: bool,
    load_data_state: LoadDataState,
    temp_tables: HashSet<String>,
    sescmd_log: SessionCommandLog,
    expected_responses: u32,
    pending_queue: VecDeque<Vec<u8>>,
    in_flight: Option<InFlight>,
    closed: bool,
    client_deprecate_eof: bool,
    in_transaction: bool,
}

impl RouterSession {
    pub fn open(backends: Vec<BackendHandle>, config: Arc<Config>) -> Self {
        let current_master = backends
            .iter()
            .find(|b| matches!(b.role, BackendRole::Master | BackendRole::Joined))
            .map(|b| b.id.clone());
        let sescmd_log = SessionCommandLog::new(config.max_sescmd_history, config.disable_sescmd_history);
        RouterSession {
            config,
            backends,
            current_master,
            sticky_master: false,
            load_data_state: LoadDataState::Inactive,
            temp_tables: HashSet::new(),
            sescmd_log,
            expected_responses: 0,
            pending_queue: VecDeque::new(),
            in_flight: None,
            closed: false,
            client_deprecate_eof: false,
            in_transaction: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn expected_responses(&self) -> u32 {
        self.expected_responses
    }

    /// Entries currently held in the session-command replay log, for
    /// the caller to surface as a gauge (§A.5).
    pub fn sescmd_log_len(&self) -> usize {
        self.sescmd_log.iter().count()
    }

    pub fn backend_role(&self, id: &str) -> Option<BackendRole> {
        self.backends.iter().find(|b| b.id == id).map(|b| b.role)
    }

    /// Whether `id` has finished delivering its current reply. The I/O
    /// driver uses this to know when to stop draining one backend and
    /// move on to the next queued action.
    pub fn backend_reply_done(&self, id: &str) -> bool {
        self.backend_reply_state(id)
            .map(|s| s == crate::backend::handle::ReplyState::Done)
            .unwrap_or(true)
    }

    /// `id`'s current position in the reply-state machine, so the I/O
    /// driver knows whether the next packet off the wire is a
    /// column-count header, a column definition, a result row, or a
    /// plain OK/ERR — the same distinction `QueryForwarder` makes
    /// inline, exposed here for `RouterSession`'s N-backend case.
    pub fn backend_reply_state(&self, id: &str) -> Option<crate::backend::handle::ReplyState> {
        self.backends.iter().find(|b| b.id == id).map(|b| b.reply_state())
    }

    fn backend_mut(&mut self, id: &str) -> Option<&mut BackendHandle> {
        self.backends.iter_mut().find(|b| b.id == id)
    }

    /// Routes one client packet. §4.3 "Routing a query".
    pub fn route_query(&mut self, payload: Vec<u8>) -> Vec<RouterAction> {
        if self.closed {
            return vec![];
        }
        if self.expected_responses > 0 {
            self.pending_queue.push_back(payload);
            return vec![];
        }
        self.dispatch(payload)
    }

    fn dispatch(&mut self, payload: Vec<u8>) -> Vec<RouterAction> {
        let ctx = ClassifierContext {
            temp_tables: &self.temp_tables,
            load_data_state: self.load_data_state,
            strict_multi_stmt: self.config.strict_multi_stmt,
            use_sql_variables_in: self.config.use_sql_variables_in,
            sticky_master: self.sticky_master,
        };
        let classification = classify_packet(&payload, &ctx);

        if let Some(err) = classification.rejected {
            warn!(%err, "classifier rejected statement");
            return vec![RouterAction::ReplyToClient {
                payload: synth_err_packet(&err.to_string()),
            }];
        }

        if let Some((action, name)) = classification.temp_table_action {
            match action {
                TempTableAction::Create => {
                    self.temp_tables.insert(name);
                }
                TempTableAction::Drop => {
                    self.temp_tables.remove(&name);
                }
            }
        }

        match self.load_data_state {
            LoadDataState::Start => self.load_data_state = LoadDataState::Active,
            LoadDataState::Active if classification.ends_load_data => {
                self.load_data_state = LoadDataState::End;
            }
            _ => {}
        }
        if classification.starts_load_data {
            self.load_data_state = LoadDataState::Start;
        }

        if classification.is_multi_stmt && self.config.strict_multi_stmt {
            self.sticky_master = true;
        }
        track_transaction_state(&mut self.in_transaction, &mut self.sticky_master, &payload);

        if classification.is_session_modifying || classification.needs_broadcast {
            return self.dispatch_broadcast(payload);
        }

        self.dispatch_single(payload, classification.target_mask)
    }

    fn dispatch_broadcast(&mut self, payload: Vec<u8>) -> Vec<RouterAction> {
        let position = match self.sescmd_log.append(payload.clone()) {
            Ok(p) => Some(p),
            Err(RouterError::HistoryOverflow { .. }) => None,
            Err(_) => None,
        };
        common::metrics::gauge(
            common::metrics::metric_def::ROUTER_SESCMD_LOG_SIZE,
            self.sescmd_log_len() as f64,
            Some(common::metrics::common_labels()),
        );

        let current_master = self.current_master.clone();
        let recipients: Vec<String> = broadcast_targets(&mut self.backends)
            .into_iter()
            .map(|b| b.id.clone())
            .collect();

        if recipients.is_empty() {
            return vec![RouterAction::ReplyToClient {
                payload: synth_err_packet("no eligible backend for this statement"),
            }];
        }

        let reference = current_master
            .filter(|id| recipients.contains(id))
            .unwrap_or_else(|| recipients[0].clone());

        let deprecate = self.client_deprecate_eof;
        let mut actions = Vec::with_capacity(recipients.len());
        for id in &recipients {
            if let Some(b) = self.backend_mut(id) {
                b.begin_query(deprecate);
            }
            actions.push(RouterAction::Send {
                backend_id: id.clone(),
                payload: payload.clone(),
            });
        }

        self.expected_responses = recipients.len() as u32;
        self.in_flight = Some(InFlight {
            reference,
            recipients: recipients.into_iter().collect(),
            sescmd_position: position,
            payload,
            finals: std::collections::HashMap::new(),
        });
        actions
    }

    fn dispatch_single(&mut self, payload: Vec<u8>, target_mask: RouteTarget) -> Vec<RouterAction> {
        let deprecate = self.client_deprecate_eof;
        let picked_id = match select_one(&mut self.backends, target_mask, &self.config) {
            Ok(b) => {
                b.begin_query(deprecate);
                b.id.clone()
            }
            Err(_) => {
                return self.apply_no_backend_failure();
            }
        };

        self.expected_responses = 1;
        self.in_flight = Some(InFlight {
            reference: picked_id.clone(),
            recipients: std::iter::once(picked_id.clone()).collect(),
            sescmd_position: None,
            payload: payload.clone(),
            finals: std::collections::HashMap::new(),
        });
        vec![RouterAction::Send {
            backend_id: picked_id,
            payload,
        }]
    }

    fn apply_no_backend_failure(&mut self) -> Vec<RouterAction> {
        if self.in_transaction {
            let err = RouterError::TransactionLoss;
            warn!(%err, "closing session");
            self.closed = err.is_session_fatal();
            return vec![RouterAction::CloseSession];
        }
        match self.config.master_failure_mode {
            MasterFailureMode::FailInstantly | MasterFailureMode::FailOnWrite => {
                self.closed = true;
                vec![RouterAction::CloseSession]
            }
            MasterFailureMode::ErrorOnWrite => vec![RouterAction::ReplyToClient {
                payload: synth_err_packet("no eligible backend for this statement"),
            }],
        }
    }

    /// A packet arrived from `backend_id`. §4.3 "Reply handling".
    pub fn client_reply(&mut self, backend_id: &str, packet: Packet) -> Vec<RouterAction> {
        if self.closed {
            return vec![];
        }
        let Some(backend) = self.backend_mut(backend_id) else {
            warn!(backend_id, "reply from unknown backend dropped");
            return vec![];
        };
        let reply_complete = backend.advance(&packet);
        debug_assert!(backend.invariant_holds());

        let Some(in_flight) = self.in_flight.as_ref() else {
            return vec![];
        };
        if !in_flight.recipients.contains(backend_id) {
            warn!(backend_id, "reply from a backend outside the current exchange dropped");
            return vec![];
        }
        let is_reference = in_flight.reference == backend_id;
        let position = in_flight.sescmd_position;
        let is_broadcast = in_flight.recipients.len() > 1;

        let mut actions = Vec::new();
        if is_reference {
            actions.push(RouterAction::ReplyToClient {
                payload: packet.as_ref().to_vec(),
            });
        } else {
            debug!(backend_id, "non-reference broadcast reply consumed silently");
        }

        if reply_complete {
            self.expected_responses = self.expected_responses.saturating_sub(1);
            if let Some(pos) = position {
                if is_reference {
                    self.sescmd_log.mark_reference_reply(pos);
                }
            }
            if is_broadcast {
                if let Some(in_flight) = self.in_flight.as_mut() {
                    in_flight.finals.insert(backend_id.to_string(), packet.as_ref()[0]);
                }
            }

            if self.expected_responses == 0 {
                self.check_broadcast_consistency();
                self.finish_current_exchange();
                if let Some(next) = self.pending_queue.pop_front() {
                    actions.extend(self.dispatch(next));
                }
            }
        }
        actions
    }

    /// §4.3.4 "Reply consistency": a broadcast recipient whose final
    /// packet header disagrees with the reference's is logged and
    /// excluded from further routing, but the client never sees it.
    fn check_broadcast_consistency(&mut self) {
        let Some(in_flight) = self.in_flight.as_ref() else {
            return;
        };
        let Some(&reference_header) = in_flight.finals.get(&in_flight.reference) else {
            return;
        };
        let divergent: Vec<String> = in_flight
            .finals
            .iter()
            .filter(|(id, header)| **id != in_flight.reference && **header != reference_header)
            .map(|(id, _)| id.clone())
            .collect();
        for id in divergent {
            let err = RouterError::ConsistencyDiverge {
                backend: id.clone(),
            };
            warn!(%err, "marking backend FATAL_FAILURE");
            if let Some(b) = self.backend_mut(&id) {
                b.mark_fatal();
            }
        }
    }

    fn finish_current_exchange(&mut self) {
        if let Some(min_acked) = self.min_acked_sescmd_position() {
            self.sescmd_log.trim_up_to(min_acked);
            common::metrics::gauge(
                common::metrics::metric_def::ROUTER_SESCMD_LOG_SIZE,
                self.sescmd_log_len() as f64,
                Some(common::metrics::common_labels()),
            );
        }
        self.in_flight = None;
    }

    fn min_acked_sescmd_position(&self) -> Option<u64> {
        self.sescmd_log
            .iter()
            .filter(|e| e.reply_received)
            .map(|e| e.position)
            .min()
    }

    /// Replay the session-command log, in position order, onto a newly
    /// attached backend before any real query reaches it.
    pub fn replay_sescmd_log(&self, backend_id: &str) -> Vec<RouterAction> {
        self.sescmd_log
            .replay_from(0)
            .into_iter()
            .map(|entry| RouterAction::Send {
                backend_id: backend_id.to_string(),
                payload: entry.raw.clone(),
            })
            .collect()
    }

    /// §4.3.5 failover/error handling for an asynchronous backend error.
    pub fn handle_error(&mut self, backend_id: &str) -> Vec<RouterAction> {
        let is_master = self.current_master.as_deref() == Some(backend_id);
        if let Some(b) = self.backend_mut(backend_id) {
            b.mark_fatal();
        }

        if !is_master {
            if self.config.retry_failed_reads && !self.in_transaction {
                if let Some(retried) = self.retry_on_another_slave(backend_id) {
                    return vec![retried];
                }
            }
            return vec![RouterAction::ReplyToClient {
                payload: synth_err_packet("backend connection failed"),
            }];
        }

        if self.in_transaction {
            let err = RouterError::TransactionLoss;
            warn!(%err, "closing session");
            self.closed = err.is_session_fatal();
            return vec![RouterAction::CloseSession];
        }

        match self.config.master_failure_mode {
            MasterFailureMode::FailInstantly => {
                self.closed = true;
                vec![RouterAction::CloseSession]
            }
            MasterFailureMode::FailOnWrite => {
                self.current_master = None;
                vec![]
            }
            MasterFailureMode::ErrorOnWrite => {
                self.current_master = None;
                vec![]
            }
        }
    }

    fn retry_on_another_slave(&mut self, failed_id: &str) -> Option<RouterAction> {
        let payload = self
            .in_flight
            .as_ref()
            .filter(|f| f.reference == failed_id)
            .map(|f| f.payload.clone())?;
        let picked = select_one(&mut self.backends, RouteTarget::SLAVE, &self.config).ok()?;
        let id = picked.id.clone();
        picked.begin_query(self.client_deprecate_eof);
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.reference = id.clone();
        }
        Some(RouterAction::Send {
            backend_id: id,
            payload,
        })
    }

    /// Whether a write against the current master would have to be
    /// refused under `ErrorOnWrite` because the master is gone.
    pub fn master_unavailable(&self) -> bool {
        self.current_master.is_none()
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

fn track_transaction_state(in_transaction: &mut bool, sticky_master: &mut bool, payload: &[u8]) {
    let stmt = crate::router::classifier::first_statement_text(payload);
    if crate::router::classifier::is_begin_transaction(&stmt) {
        *in_transaction = true;
        *sticky_master = true;
    } else if crate::router::classifier::is_end_transaction(&stmt) {
        *in_transaction = false;
        *sticky_master = false;
    }
}

fn synth_err_packet(msg: &str) -> Vec<u8> {
    let mut packet = vec![0xffu8];
    packet.extend(1105u16.to_le_bytes());
    packet.push(b'#');
    packet.extend(b"HY000");
    packet.extend(msg.as_bytes());
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn session(master: bool, slaves: usize) -> RouterSession {
        let mut backends = Vec::new();
        if master {
            backends.push(BackendHandle::new("master", "127.0.0.1:1", BackendRole::Master));
        }
        for i in 0..slaves {
            let mut h = BackendHandle::new(format!("slave{i}"), "127.0.0.1:2", BackendRole::Slave);
            h.health.alive = true;
            backends.push(h);
        }
        RouterSession::open(backends, Arc::new(Config::default()))
    }

    fn query(sql: &str) -> Vec<u8> {
        let mut p = vec![crate::protocol::mysql::constants::CommandCode::ComQuery as u8];
        p.extend(sql.as_bytes());
        p
    }

    #[test]
    fn read_only_select_routes_to_a_slave() {
        let mut s = session(true, 1);
        let actions = s.route_query(query("SELECT 1"));
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            RouterAction::Send { backend_id, .. } => assert_eq!(backend_id, "slave0"),
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(s.expected_responses(), 1);
    }

    #[test]
    fn write_without_master_closes_instantly_by_default() {
        let mut s = session(false, 1);
        let actions = s.route_query(query("INSERT INTO t VALUES (1)"));
        assert!(matches!(actions[0], RouterAction::CloseSession));
        assert!(s.is_closed());
    }

    #[test]
    fn queued_query_waits_for_in_flight_reply() {
        let mut s = session(true, 0);
        let first = s.route_query(query("INSERT INTO t VALUES (1)"));
        assert_eq!(first.len(), 1);
        let second = s.route_query(query("SELECT 1"));
        assert!(second.is_empty());
        assert_eq!(s.expected_responses(), 1);
    }

    #[test]
    fn bug694_rejects_user_variable_select_without_touching_backends() {
        let mut s = session(true, 1);
        s.config = Arc::new(Config {
            use_sql_variables_in: crate::config::UseSqlVariablesIn::All,
            ..Config::default()
        });
        let actions = s.route_query(query("SELECT @a:=@a+1 as a, test.b FROM test"));
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            RouterAction::ReplyToClient { payload } => {
                assert_eq!(payload[0], 0xff);
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(s.expected_responses(), 0);
    }

    #[test]
    fn session_modifying_command_is_logged_and_broadcast() {
        let mut s = session(true, 1);
        let actions = s.route_query(query("SET @x:=5"));
        assert_eq!(actions.len(), 2);
        assert_eq!(s.sescmd_log.len(), 1);
    }

    /// §8 Scenario C: under FAIL_ON_WRITE, a write attempted once the
    /// master is already gone closes the session on that write.
    #[test]
    fn write_without_master_closes_under_fail_on_write() {
        let mut s = session(false, 1);
        s.config = Arc::new(Config {
            master_failure_mode: MasterFailureMode::FailOnWrite,
            ..Config::default()
        });
        let actions = s.route_query(query("INSERT INTO t VALUES (1)"));
        assert!(matches!(actions[0], RouterAction::CloseSession));
        assert!(s.is_closed());
    }

    /// Under ERROR_ON_WRITE the session survives a lost master and keeps
    /// answering every write attempt with a synthetic error, indefinitely.
    #[test]
    fn write_without_master_keeps_erroring_under_error_on_write() {
        let mut s = session(false, 1);
        s.config = Arc::new(Config {
            master_failure_mode: MasterFailureMode::ErrorOnWrite,
            ..Config::default()
        });
        for _ in 0..3 {
            let actions = s.route_query(query("INSERT INTO t VALUES (1)"));
            match &actions[0] {
                RouterAction::ReplyToClient { .. } => {}
                other => panic!("unexpected action {other:?}"),
            }
            assert!(!s.is_closed());
        }
    }

    /// §8 Scenario B: a session-modifying command logged earlier is
    /// replayed onto a freshly attached slave before any real query.
    #[test]
    fn sescmd_log_replays_onto_newly_attached_slave() {
        let mut s = session(true, 1);
        s.route_query(query("SET @x:=5"));

        let mut fresh = BackendHandle::new("slave1", "127.0.0.1:3", BackendRole::Slave);
        fresh.health.alive = true;
        s.backends.push(fresh);

        let replay = s.replay_sescmd_log("slave1");
        assert_eq!(replay.len(), 1);
        match &replay[0] {
            RouterAction::Send { backend_id, payload } => {
                assert_eq!(backend_id, "slave1");
                assert_eq!(payload, &query("SET @x:=5"));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }
}
