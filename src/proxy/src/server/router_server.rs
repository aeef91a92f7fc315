//! Accept loop that drives one [`RouterSession`] per client connection
//! against a live master/slave backend topology, generalizing
//! [`crate::server::haentgl_server::HaentglServer::connect`]'s single
//! fixed backend to the N backends a `RouterSession` can route across.
//!
//! Each backend connection is authenticated the same way
//! `HaentglServer` authenticates its one backend
//! (`Authenticator::reply_handshake_response`, reusing the client's own
//! handshake response against every backend's salt), then handed to
//! the router as a [`BackendHandle`]. From there every client packet
//! is routed through [`RouterSession::route_query`] and every backend
//! packet through [`RouterSession::client_reply`]; this module only
//! owns the sockets and turns `RouterAction`s into actual reads and
//! writes.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use common::metrics::common_labels;
use common::metrics::metric_def::{
    ROUTER_ACTIVE_SESSIONS, ROUTER_BACKEND_FAILURES, ROUTER_MASTER_QUERIES, ROUTER_SLAVE_QUERIES,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::backend::handle::{BackendHandle, BackendRole, ReplyState};
use crate::config::Config;
use crate::errors::RouterError;
use crate::masking::rewrite_row;
use crate::masking::rules::RuleSet;
use crate::protocol::mysql::basic::{column_definition, Column, HandshakeResponse};
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::Packet;
use crate::router::session::{RouterAction, RouterSession};
use crate::server::auth::{gen_user_salt, Authenticator};

/// One live backend socket plus the column cache needed to apply a
/// masking rule to the rows the router forwards from it.
struct BackendLink {
    reader: PacketReader<OwnedReadHalf>,
    writer: PacketWriter<OwnedWriteHalf>,
    columns: Vec<Column>,
}

pub struct RouterDrivenServer<A> {
    authenticator: A,
    config: Arc<Config>,
    master_addr: Option<String>,
    slave_addrs: Vec<String>,
    masking: std::sync::RwLock<Arc<RuleSet>>,
}

impl<A: Authenticator + Send + Sync + 'static> RouterDrivenServer<A> {
    pub fn new(
        config: Arc<Config>,
        master_addr: Option<String>,
        slave_addrs: Vec<String>,
        authenticator: A,
    ) -> Self {
        Self {
            authenticator,
            config,
            master_addr,
            slave_addrs,
            masking: std::sync::RwLock::new(Arc::new(RuleSet::default())),
        }
    }

    pub fn with_masking_rules(self, rules: RuleSet) -> Self {
        *self.masking.write().unwrap() = Arc::new(rules);
        self
    }

    pub fn reload_masking_rules(&self, rules: RuleSet) {
        *self.masking.write().unwrap() = Arc::new(rules);
    }

    fn current_masking_rules(&self) -> Arc<RuleSet> {
        Arc::clone(&self.masking.read().unwrap())
    }

    /// Accepts connections on `listener` until it errors; every client
    /// gets its own task and its own `RouterSession`.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = this.handle_connection(stream).await {
                    warn!(%err, %peer, "router-driven connection ended with an error");
                }
            });
        }
    }

    async fn connect_backend(
        addr: &str,
    ) -> Result<(PacketReader<OwnedReadHalf>, PacketWriter<OwnedWriteHalf>), std::io::Error> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok((PacketReader::new(reader), PacketWriter::new(writer)))
    }

    async fn attach_backend(
        &self,
        id: &str,
        addr: &str,
        role: BackendRole,
        client_seq: u8,
        handshake_pkt: &Packet,
        handshake_response: &HandshakeResponse,
        client_reader: &mut PacketReader<OwnedReadHalf>,
        client_writer: &mut PacketWriter<OwnedWriteHalf>,
    ) -> Result<(BackendHandle, BackendLink), std::io::Error> {
        let (mut reader, mut writer) = Self::connect_backend(addr).await?;
        self.authenticator
            .reply_handshake_response(
                &mut writer,
                &mut reader,
                client_writer,
                client_reader,
                client_seq,
                (handshake_pkt.as_ref(), handshake_response),
            )
            .await?;
        Ok((
            BackendHandle::new(id.to_string(), addr.to_string(), role),
            BackendLink {
                reader,
                writer,
                columns: Vec::new(),
            },
        ))
    }

    async fn handle_connection(&self, client_stream: TcpStream) -> std::io::Result<()> {
        let (client_read_half, client_write_half) = client_stream.into_split();
        let mut client_reader = PacketReader::new(client_read_half);
        let mut client_writer = PacketWriter::new(client_write_half);

        let conn_id = std::thread::current().id().as_u64().get();
        let salt = gen_user_salt();
        #[cfg(feature = "tls")]
        let (client_seq, handshake_response, handshake_pkt) = self
            .authenticator
            .initial_handshake(conn_id, salt, &mut client_reader, &mut client_writer, &None)
            .await?;
        #[cfg(not(feature = "tls"))]
        let (client_seq, handshake_response, handshake_pkt) = self
            .authenticator
            .initial_handshake(conn_id, salt, &mut client_reader, &mut client_writer)
            .await?;

        let mut backends = Vec::new();
        let mut links: HashMap<String, BackendLink> = HashMap::new();
        if let Some(addr) = self.master_addr.clone() {
            let (handle, link) = self
                .attach_backend(
                    "master",
                    &addr,
                    BackendRole::Master,
                    client_seq,
                    &handshake_pkt,
                    &handshake_response,
                    &mut client_reader,
                    &mut client_writer,
                )
                .await?;
            backends.push(handle);
            links.insert("master".to_string(), link);
        }
        for (i, addr) in self.slave_addrs.clone().into_iter().enumerate() {
            let id = format!("slave{i}");
            let (handle, link) = self
                .attach_backend(
                    &id,
                    &addr,
                    BackendRole::Slave,
                    client_seq,
                    &handshake_pkt,
                    &handshake_response,
                    &mut client_reader,
                    &mut client_writer,
                )
                .await?;
            backends.push(handle);
            links.insert(id, link);
        }
        if backends.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no backend addresses configured",
            ));
        }

        let mut session = RouterSession::open(backends, Arc::clone(&self.config));
        common::metrics::gauge_inc(ROUTER_ACTIVE_SESSIONS, 1_f64, Some(common_labels()));
        let account = (handshake_response.db_user_string(), "%".to_string());
        info!(user = %account.0, "router session attached");
        let result = self
            .drive_session(&mut session, &mut links, &mut client_reader, &mut client_writer, &account)
            .await;
        common::metrics::gauge_dec(ROUTER_ACTIVE_SESSIONS, 1_f64, Some(common_labels()));
        result
    }

    async fn drive_session(
        &self,
        session: &mut RouterSession,
        links: &mut HashMap<String, BackendLink>,
        client_reader: &mut PacketReader<OwnedReadHalf>,
        client_writer: &mut PacketWriter<OwnedWriteHalf>,
        account: &(String, String),
    ) -> std::io::Result<()> {
        let masking = self.current_masking_rules();
        let mut client_seq: u8 = 0;

        loop {
            let Some((seq, packet)) = client_reader.next_async().await? else {
                return Ok(());
            };
            client_seq = seq;
            let initial = session.route_query(packet.as_ref().to_vec());
            let mut pending: VecDeque<RouterAction> = initial.into();

            while let Some(action) = pending.pop_front() {
                match action {
                    RouterAction::Send { backend_id, payload } => {
                        if let Some(role) = session.backend_role(&backend_id) {
                            let metric = match role {
                                BackendRole::Master | BackendRole::Joined => ROUTER_MASTER_QUERIES,
                                BackendRole::Slave => ROUTER_SLAVE_QUERIES,
                            };
                            common::metrics::counter_inc(metric, 1, Some(common_labels()));
                        }
                        let Some(link) = links.get_mut(&backend_id) else {
                            warn!(backend_id, "router selected an unknown backend, dropping send");
                            continue;
                        };
                        if let Err(io_err) = send_to_backend(link, &payload).await {
                            self.record_backend_failure(&backend_id, &io_err);
                            pending.extend(session.handle_error(&backend_id));
                            continue;
                        }
                        match self
                            .drain_backend(
                                session,
                                link,
                                client_writer,
                                &mut client_seq,
                                &backend_id,
                                &masking,
                                account,
                            )
                            .await
                        {
                            Ok(follow_up) => pending.extend(follow_up),
                            Err(io_err) => {
                                self.record_backend_failure(&backend_id, &io_err);
                                pending.extend(session.handle_error(&backend_id));
                            }
                        }
                    }
                    RouterAction::ReplyToClient { payload } => {
                        client_seq = client_seq.wrapping_add(1);
                        write_to_client(client_writer, client_seq, &payload).await?;
                    }
                    RouterAction::CloseSession => return Ok(()),
                }
            }

            if session.is_closed() {
                return Ok(());
            }
        }
    }

    fn record_backend_failure(&self, backend_id: &str, io_err: &std::io::Error) {
        let err = RouterError::BackendFailure {
            backend: backend_id.to_string(),
            source: std::io::Error::new(io_err.kind(), io_err.to_string()),
        };
        warn!(%err, "backend I/O failed");
        common::metrics::counter_inc(ROUTER_BACKEND_FAILURES, 1, Some(common_labels()));
    }

    /// Reads packets from `backend_id` until its current reply is fully
    /// delivered, forwarding the reference backend's packets to the
    /// client (with masking applied to result rows) and feeding every
    /// packet through `session.client_reply`. Any `Send`/`CloseSession`
    /// actions `client_reply` produces along the way (sescmd replay,
    /// the next queued statement once this exchange completes) are
    /// returned for the caller to process.
    async fn drain_backend(
        &self,
        session: &mut RouterSession,
        link: &mut BackendLink,
        client_writer: &mut PacketWriter<OwnedWriteHalf>,
        client_seq: &mut u8,
        backend_id: &str,
        masking: &RuleSet,
        account: &(String, String),
    ) -> std::io::Result<Vec<RouterAction>> {
        let (user, host) = account;
        let mut follow_up = Vec::new();
        loop {
            let Some((_, mut packet)) = link.reader.next_async().await? else {
                return Ok(vec![RouterAction::CloseSession]);
            };

            let state_before = session.backend_reply_state(backend_id);
            match state_before {
                Some(ReplyState::Start) => link.columns.clear(),
                Some(ReplyState::RsetColdef)
                    if !packet.is_eof_packet() && !packet.is_result_set_eof_packet() =>
                {
                    if let Ok((_, column)) = column_definition(packet.as_ref()) {
                        link.columns.push(column);
                    }
                }
                Some(ReplyState::RsetRows)
                    if !packet.is_eof_packet()
                        && !packet.is_result_set_eof_packet()
                        && !packet.is_err_packet()
                        && !link.columns.is_empty() =>
                {
                    rewrite_row(packet.as_mut(), &link.columns, masking, user, host);
                }
                _ => {}
            }

            for action in session.client_reply(backend_id, packet) {
                match action {
                    RouterAction::ReplyToClient { payload } => {
                        *client_seq = client_seq.wrapping_add(1);
                        write_to_client(client_writer, *client_seq, &payload).await?;
                    }
                    other => follow_up.push(other),
                }
            }

            if session.backend_reply_done(backend_id) {
                break;
            }
        }
        Ok(follow_up)
    }
}

async fn send_to_backend(link: &mut BackendLink, payload: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    link.writer.set_seq(0);
    link.writer.write_all(payload)?;
    link.writer.end_packet().await?;
    link.writer.flush_all().await
}

async fn write_to_client(
    client_writer: &mut PacketWriter<OwnedWriteHalf>,
    seq: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    use std::io::Write;
    client_writer.set_seq(seq);
    client_writer.write_all(payload)?;
    client_writer.end_packet().await?;
    client_writer.flush_all().await
}
