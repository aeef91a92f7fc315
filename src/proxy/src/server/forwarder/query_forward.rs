use crate::masking::rules::RuleSet;
use crate::masking::rewrite_row;
use crate::parse_err_packet;
use crate::protocol::mysql::basic::{
    column_definition, eof_server_status, ok_packet, read_length_encoded_number, Column,
    HandshakeResponse,
};
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::Packet;
use crate::server::forwarder::ComForwarder;

use async_trait::async_trait;
use byteorder::ByteOrder;
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

pub struct QueryForwarder {
    pub com_code: CommandCode,
    /// Active masking rules for the connected account, if any were
    /// loaded. `None` disables result-set rewriting entirely.
    pub masking: Option<Arc<RuleSet>>,
    /// `user@host` of the connected account, used to evaluate a
    /// matched rule's `applies_to`/`exempted` lists.
    pub account: (String, String),
}

impl QueryForwarder {
    async fn forward_query<W>(
        &self,
        handshake: &HandshakeResponse,
        backend_reader: &mut PacketReader<OwnedReadHalf>,
        client_writer: &mut PacketWriter<W>,
    ) -> Result<(), std::io::Error>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let capabilities = handshake.client_flag;
        loop {
            let response_packet = self
                .forward_one_packet(client_writer, backend_reader, false)
                .await?;
            // debug!(
            //     "ProxySrv forward_query start header = {:?}",
            //     response_packet[0]
            // );
            let status_flag = if response_packet.is_ok_packet() {
                client_writer.flush_all().await?;
                let (_, ok_pkt) = ok_packet(&response_packet, capabilities).unwrap();
                ok_pkt.status_flags
            } else if response_packet.is_err_packet() {
                parse_err_packet!(capabilities, response_packet, "forward_query ERR");
                client_writer.flush_all().await?;
                return Ok(());
            } else if response_packet.is_local_in_file_packet() {
                //TODO: supported it
                unimplemented!("not supported LocalInFileHeader");
            } else {
                let col_count = read_length_encoded_number(&response_packet)
                    .map(|(_, n)| n as usize)
                    .unwrap_or(0);
                self.forward_result(handshake, backend_reader, client_writer, col_count)
                    .await?
            };
            if !status_flag.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS) {
                break;
            }
        }
        Ok(())
    }

    async fn forward_result<W>(
        &self,
        handshake: &HandshakeResponse,
        backend_reader: &mut PacketReader<OwnedReadHalf>,
        client_writer: &mut PacketWriter<W>,
        col_count: usize,
    ) -> Result<StatusFlags, std::io::Error>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let client_capability = handshake.client_flag;
        let client_deprecate_eof =
            client_capability.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF);

        let mut columns: Vec<Column> = Vec::with_capacity(col_count);
        for _ in 0..col_count {
            let coldef_packet = self
                .forward_one_packet(client_writer, backend_reader, false)
                .await?;
            if let Ok((_, column)) = column_definition(&coldef_packet) {
                columns.push(column);
            }
        }

        if !client_deprecate_eof {
            let resp_packet = loop {
                let response_packet = self
                    .forward_one_packet(client_writer, backend_reader, false)
                    .await?;
                if response_packet.is_eof_packet() {
                    break response_packet;
                }
            };
            let status_code = byteorder::LittleEndian::read_u16(&resp_packet[3..]);
            if let Some(status_flags) = StatusFlags::from_bits(status_code) {
                if status_flags.contains(StatusFlags::SERVER_STATUS_CURSOR_EXISTS) {
                    // debug!("ProxySrv forward_result SERVER_STATUS_CURSOR_EXISTS ");
                    client_writer.flush_all().await?;
                    return Ok(status_flags);
                }
            }
        }
        self.forward_until_result_end(handshake, backend_reader, client_writer, &columns)
            .await
    }

    async fn forward_until_result_end<W>(
        &self,
        handshake: &HandshakeResponse,
        backend_reader: &mut PacketReader<OwnedReadHalf>,
        client_writer: &mut PacketWriter<W>,
        columns: &[Column],
    ) -> Result<StatusFlags, std::io::Error>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let client_capability = handshake.client_flag;
        let client_deprecate_eof =
            client_capability.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF);
        loop {
            let (seq, mut response_packet) = self.read_one_packet(backend_reader).await?;

            if response_packet.is_err_packet() {
                self.write_one_packet(client_writer, seq, &response_packet)
                    .await?;
                parse_err_packet!(
                    client_capability,
                    response_packet,
                    "ComQuery forward_until_result_end ERR"
                );
                client_writer.flush_all().await?;
                break;
            }
            let is_terminator = if !client_deprecate_eof {
                response_packet.is_eof_packet()
            } else {
                response_packet.is_result_set_eof_packet()
            };
            if !is_terminator {
                if let (Some(rules), false) = (&self.masking, columns.is_empty()) {
                    let (user, host) = (&self.account.0, &self.account.1);
                    rewrite_row(response_packet.as_mut(), columns, rules, user, host);
                }
            }
            self.write_one_packet(client_writer, seq, &response_packet)
                .await?;

            if !client_deprecate_eof {
                if response_packet.is_eof_packet() {
                    client_writer.flush_all().await?;
                    let (_, status_flag) = eof_server_status(&response_packet).unwrap();
                    return Ok(status_flag);
                }
            } else if response_packet.is_result_set_eof_packet() {
                let (_, ok_pkt) = ok_packet(&response_packet, client_capability).unwrap();
                client_writer.flush_all().await?;
                return Ok(ok_pkt.status_flags);
            }
        }
        Ok(StatusFlags::default())
    }

    /// Reads one raw packet from `backend_reader` without forwarding
    /// it, so its body can be rewritten before being sent on. Returns
    /// the backend's sequence number alongside it so the client write
    /// can preserve it.
    async fn read_one_packet(
        &self,
        backend_reader: &mut PacketReader<OwnedReadHalf>,
    ) -> Result<(u8, Packet), std::io::Error> {
        let (seq, packet) = crate::async_packet_read!(backend_reader);
        Ok((seq, packet))
    }

    async fn write_one_packet<W>(
        &self,
        client_writer: &mut PacketWriter<W>,
        seq: u8,
        packet: &Packet,
    ) -> Result<(), std::io::Error>
    where
        W: AsyncWrite + Send + Unpin,
    {
        client_writer.set_seq(seq);
        client_writer.write_all(packet)?;
        client_writer.end_packet().await
    }
}

#[async_trait]
impl<R, W> ComForwarder<R, W> for QueryForwarder
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    async fn forward(
        &self,
        _: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        _: &mut PacketWriter<OwnedWriteHalf>,
        backend_reader: &mut PacketReader<OwnedReadHalf>,
        handshake: &HandshakeResponse,
    ) -> Result<Option<Packet>, std::io::Error> {
        let query_rs = match self.com_code {
            CommandCode::ComQuery | CommandCode::ComStmtExecute | CommandCode::ComProcessInfo => {
                self.forward_query(handshake, backend_reader, client_writer)
                    .await
            }
            CommandCode::ComFieldList | CommandCode::ComStmtFetch => self
                .forward_until_result_end(handshake, backend_reader, client_writer, &[])
                .await
                .map(|_| ()),
            _ => {
                unreachable!("not supported com_code = {:?}", self.com_code);
            }
        };
        match query_rs {
            Ok(()) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
