//! One physical connection to one backend server, and the reply-state
//! machine that tracks how far a response has progressed. Grounded in
//! `QueryForwarder::forward_query`/`forward_result`/`forward_until_result_end`,
//! which walk this same START → RSET_COLDEF → RSET_ROWS → DONE shape one
//! packet at a time but without giving it a name; here it is made
//! explicit so the router session can drive N of these independently.
use byteorder::ByteOrder;
use mysql_common::constants::StatusFlags;

use crate::protocol::mysql::packet::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendRole {
    Master,
    Slave,
    /// Galera-style multi-master node; treated as a master for routing.
    Joined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    Start,
    Done,
    RsetColdef,
    RsetRows,
}

/// Tracks a single backend's health as observed by the selector:
/// live connection counters the route selector sorts candidates by.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendHealth {
    pub global_connections: u32,
    pub router_connections: u32,
    pub replication_lag_secs: i64,
    pub current_operations: u32,
    pub alive: bool,
}

pub struct BackendHandle {
    pub id: String,
    pub addr: String,
    pub role: BackendRole,
    pub health: BackendHealth,
    pub in_use: bool,
    pub closed: bool,
    pub fatal_failure: bool,
    reply_state: ReplyState,
    outstanding_results: u32,
    client_deprecate_eof: bool,
}

impl BackendHandle {
    pub fn new(id: impl Into<String>, addr: impl Into<String>, role: BackendRole) -> Self {
        BackendHandle {
            id: id.into(),
            addr: addr.into(),
            role,
            health: BackendHealth {
                alive: true,
                ..BackendHealth::default()
            },
            in_use: false,
            closed: false,
            fatal_failure: false,
            reply_state: ReplyState::Done,
            outstanding_results: 0,
            client_deprecate_eof: false,
        }
    }

    pub fn reply_state(&self) -> ReplyState {
        self.reply_state
    }

    pub fn outstanding_results(&self) -> u32 {
        self.outstanding_results
    }

    /// §3 invariant: `reply_state == DONE iff outstanding_results == 0`.
    pub fn invariant_holds(&self) -> bool {
        (self.reply_state == ReplyState::Done) == (self.outstanding_results == 0)
    }

    pub fn is_usable(&self) -> bool {
        !self.closed && !self.fatal_failure
    }

    pub fn mark_fatal(&mut self) {
        self.fatal_failure = true;
        self.in_use = false;
    }

    /// A new query is being dispatched to this handle: arm the state
    /// machine to expect one fresh reply cycle.
    pub fn begin_query(&mut self, client_deprecate_eof: bool) {
        self.reply_state = ReplyState::Start;
        self.outstanding_results += 1;
        self.client_deprecate_eof = client_deprecate_eof;
        self.in_use = true;
    }

    /// Feed one packet from this backend into the reply-state machine.
    /// Returns `true` when this packet completed the *entire* reply
    /// (outstanding_results reached 0 — i.e. no more result sets follow,
    /// per `SERVER_MORE_RESULTS_EXISTS`).
    pub fn advance(&mut self, packet: &Packet) -> bool {
        match self.reply_state {
            ReplyState::Start => {
                if packet.is_ok_packet() {
                    self.finish_one_result(status_flags_of_ok(packet))
                } else if packet.is_err_packet() {
                    self.finish_one_result(StatusFlags::empty())
                } else if packet.is_local_in_file_packet() {
                    self.finish_one_result(StatusFlags::empty())
                } else {
                    // Column-count header: a result set is beginning.
                    self.reply_state = ReplyState::RsetColdef;
                    false
                }
            }
            ReplyState::RsetColdef => {
                if packet.is_eof_packet() || packet.is_result_set_eof_packet() {
                    self.reply_state = ReplyState::RsetRows;
                }
                false
            }
            ReplyState::RsetRows => {
                if packet.is_err_packet() {
                    self.finish_one_result(StatusFlags::empty())
                } else if packet.is_eof_packet() {
                    let status = crate::protocol::mysql::basic::eof_server_status(packet.as_ref())
                        .map(|(_, s)| s)
                        .unwrap_or(StatusFlags::empty());
                    self.finish_one_result(status)
                } else if self.client_deprecate_eof && packet.is_result_set_eof_packet() {
                    self.finish_one_result(status_flags_of_ok(packet))
                } else {
                    false
                }
            }
            ReplyState::Done => false,
        }
    }

    fn finish_one_result(&mut self, status: StatusFlags) -> bool {
        if status.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS) {
            self.reply_state = ReplyState::Start;
            false
        } else {
            self.reply_state = ReplyState::Done;
            self.outstanding_results = self.outstanding_results.saturating_sub(1);
            self.in_use = false;
            self.outstanding_results == 0
        }
    }
}

fn status_flags_of_ok(packet: &Packet) -> StatusFlags {
    let bytes = packet.as_ref();
    if bytes.len() < 5 {
        return StatusFlags::empty();
    }
    StatusFlags::from_bits_truncate(byteorder::LittleEndian::read_u16(&bytes[3..5]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_packet(more_results: bool) -> Packet {
        let status: u16 = if more_results {
            StatusFlags::SERVER_MORE_RESULTS_EXISTS.bits()
        } else {
            0
        };
        let mut bytes = vec![0x00u8, 0x00, 0x00];
        bytes.extend(status.to_le_bytes());
        Packet::from_vec(bytes)
    }

    fn err_packet() -> Packet {
        Packet::from_vec(vec![0xffu8, 0x15, 0x04])
    }

    #[test]
    fn simple_ok_completes_immediately() {
        let mut h = BackendHandle::new("b1", "127.0.0.1:3306", BackendRole::Master);
        h.begin_query(false);
        assert!(h.advance(&ok_packet(false)));
        assert_eq!(h.reply_state(), ReplyState::Done);
        assert_eq!(h.outstanding_results(), 0);
        assert!(h.invariant_holds());
    }

    #[test]
    fn multi_result_loops_before_completing() {
        let mut h = BackendHandle::new("b1", "127.0.0.1:3306", BackendRole::Master);
        h.begin_query(false);
        assert!(!h.advance(&ok_packet(true)));
        assert_eq!(h.reply_state(), ReplyState::Start);
        assert!(h.advance(&ok_packet(false)));
        assert_eq!(h.reply_state(), ReplyState::Done);
    }

    #[test]
    fn err_packet_completes_the_reply() {
        let mut h = BackendHandle::new("b1", "127.0.0.1:3306", BackendRole::Master);
        h.begin_query(false);
        assert!(h.advance(&err_packet()));
        assert_eq!(h.reply_state(), ReplyState::Done);
        assert!(h.invariant_holds());
    }
}
