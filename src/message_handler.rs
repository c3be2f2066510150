//! Inbound datagram demultiplexing: parses the packet header, feeds the
//! congestion and timing state, then walks the message frames and drives the
//! logical connection (and, for PRX messages, the NAT punchthrough) through
//! its transitions.
//!
//! Everything here runs synchronously under the connection lock; packets and
//! events to emit are collected and handled by the caller afterwards.

use crate::connection::ConnectionInner;
use crate::logical_connection::{ConnectionEvent, LogicalConnection};
use crate::message::{endpoint_bytes, write_control_packet};
use crate::message_header::{MessageFlags, MessageHeader};
use crate::nat_punchthrough::{NatPunchthrough, P2pEndpoints};
use crate::packet_header::PacketHeader;
use crate::rto_timer::RtoTimer;
use crate::send_queue::PendingRttResponse;
use crate::types::{ConnectionType, P2pState};
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

impl ConnectionInner {
    /// Processes one UDP payload addressed to this connection.
    /// `unexpected_remote_host` is set when the datagram's sender is not the
    /// connection's current remote address; only a subset of PRX messages is
    /// acceptable from such senders.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn process_datagram(
        &mut self,
        now: Instant,
        from: SocketAddr,
        unexpected_remote_host: bool,
        local_address: SocketAddr,
        buf: &[u8],
        out: &mut Vec<Vec<u8>>,
        addressed_out: &mut Vec<(SocketAddr, Vec<u8>)>,
        events: &mut Vec<ConnectionEvent>,
        needs_tick: &mut bool,
    ) {
        let (packet_header, packet_header_length) = match PacketHeader::parse(buf) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("received packet with unparsable header from {}: {:#} - dropping", from, e);
                return;
            }
        };

        if !unexpected_remote_host {
            self.got_packet(now, &packet_header, buf.len(), events, out, needs_tick);
        }

        if packet_header_length == buf.len() {
            // a heartbeat; the header processing above was all there is to do
            trace!("got heartbeat from {}", from);
        }
        else {
            let body = &buf[packet_header_length..];
            let mut offset = 0;
            while offset < body.len() {
                let (header, data_offset) = match MessageHeader::parse_next_message(body, &mut offset) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!("dropping rest of packet from {}: {:#}", from, e);
                        break;
                    }
                };
                let data = Bytes::copy_from_slice(&body[data_offset..data_offset + header.length]);

                let keep_going = self.process_message(
                    now,
                    from,
                    unexpected_remote_host,
                    local_address,
                    &header,
                    data,
                    out,
                    addressed_out,
                    events,
                    needs_tick,
                );
                if !keep_going {
                    break;
                }
            }
        }
    }

    /// Packet-level bookkeeping for every packet from the expected remote:
    /// RTT and timeout state, loss detection, congestion estimation.
    fn got_packet(
        &mut self,
        now: Instant,
        header: &PacketHeader,
        packet_length: usize,
        events: &mut Vec<ConnectionEvent>,
        out: &mut Vec<Vec<u8>>,
        needs_tick: &mut bool,
    ) {
        self.conn_time.got_packet(now, header);
        if let Some(sequence_number) = header.sequence_number {
            self.loss_list.got_packet(now, sequence_number);
        }
        let rtt = self.conn_time.rtt().unwrap_or(crate::types::INIT_RTO);
        self.congestion.got_packet(now, rtt, header, packet_length);

        if let Some(request_id) = header.rtt_request {
            self.pending_rtt_response = Some(PendingRttResponse {
                id: request_id,
                received_at: now,
            });
            // make sure a response goes out even on an otherwise idle link
            self.send_queue.enqueue_heartbeat();
            *needs_tick = true;
        }

        if self.rto_timer.got_packet() {
            events.push(ConnectionEvent::ConnectionRegained);
        }

        let mut logical = self.logical.take();
        if let Some(logical) = logical.as_mut() {
            let mut ctx = self.conn_context(now, out, events, needs_tick);
            logical.got_packet(header, &mut ctx);
        }
        self.logical = logical;
    }

    /// Dispatches one message frame by its (PRX, SYN, RST, ACK) flags.
    /// Returns false when the rest of the packet should be dropped.
    #[allow(clippy::too_many_arguments)]
    fn process_message(
        &mut self,
        now: Instant,
        from: SocketAddr,
        unexpected_remote_host: bool,
        local_address: SocketAddr,
        header: &MessageHeader,
        data: Bytes,
        out: &mut Vec<Vec<u8>>,
        addressed_out: &mut Vec<(SocketAddr, Vec<u8>)>,
        events: &mut Vec<ConnectionEvent>,
        needs_tick: &mut bool,
    ) -> bool {
        let prx = header.flags.contains(MessageFlags::PRX);
        let syn = header.flags.contains(MessageFlags::SYN);
        let rst = header.flags.contains(MessageFlags::RST);
        let ack = header.flags.contains(MessageFlags::ACK);

        if !prx && unexpected_remote_host {
            self.got_non_prx_message_from_unexpected_remote_host(now, from, addressed_out);
            return false;
        }

        if prx {
            match (syn, rst, ack) {
                (false, false, false) => self.got_prx(now, addressed_out, local_address),
                (true, true, true) => self.got_prx_rst_syn_ack(now, &data, addressed_out, events),
                (false, true, true) => self.got_prx_rst_ack(),
                (true, false, false) => self.got_prx_syn(now, from, &data, addressed_out),
                (true, false, true) => self.got_prx_syn_ack(now, from, &data, addressed_out, events),
                _ => {
                    debug!("got PRX message with invalid flag combination - dropping");
                    return false;
                }
            }
            return true;
        }

        if syn && !rst {
            // connect request (cookie-bearing P2P SYNs only concern the
            // mediator, which this core does not implement)
            if 0 != header.length {
                debug!("got SYN message with non-empty payload - dropping");
                return false;
            }
            if ack {
                debug!("got SYN message with ACK flag - dropping");
                return false;
            }
            let Some(their_isn) = header.sequence_number else {
                debug!("got SYN message without sequence number - dropping");
                return false;
            };

            return self.got_syn(now, their_isn, out, events, needs_tick);
        }

        if syn && rst && ack {
            // close confirmed, or the third leg of the open handshake
            let mut logical = self.logical.take();
            if let Some(logical) = logical.as_mut() {
                let mut ctx = self.conn_context(now, out, events, needs_tick);
                logical.got_syn_rst_ack(&mut ctx);
            }
            self.logical = logical;
            return true;
        }

        if syn && rst {
            // connect reply
            let Some(their_isn) = header.sequence_number else {
                debug!("got SYN-RST message without sequence number - dropping");
                return false;
            };

            let mut logical = self.logical.take();
            let handled = match logical.as_mut() {
                Some(logical) if logical.is_opening() => {
                    let mut ctx = self.conn_context(now, out, events, needs_tick);
                    logical.got_syn_rst(their_isn, &mut ctx)
                }
                _ => false,
            };
            self.logical = logical;

            if !handled {
                debug!("got unexpected SYN-RST message - dropping");
            }
            return handled;
        }

        if rst {
            // close request: confirm it regardless of connection state
            if ack {
                debug!("got RST message with ACK flag - dropping");
                return false;
            }

            self.send_syn_rst_ack(now, out);

            let mut logical = self.logical.take();
            if let Some(logical) = logical.as_mut() {
                let mut ctx = self.conn_context(now, out, events, needs_tick);
                logical.got_rst(&mut ctx);
            }
            self.logical = logical;
            return true;
        }

        // a data message
        let mut logical = self.logical.take();
        if let Some(logical) = logical.as_mut() {
            let mut ctx = self.conn_context(now, out, events, needs_tick);
            logical.got_message(header, data, &mut ctx);
        }
        else {
            debug!("got data message but the handshake has not happened - dropping");
        }
        self.logical = logical;
        true
    }

    /// An inbound SYN on an existing connection object: either the first SYN
    /// (creating the logical connection), a duplicate whose SYN-RST reply
    /// got lost, or a stale SYN from a peer that forgot this connection.
    fn got_syn(
        &mut self,
        now: Instant,
        their_isn: u16,
        out: &mut Vec<Vec<u8>>,
        events: &mut Vec<ConnectionEvent>,
        needs_tick: &mut bool,
    ) -> bool {
        if self.logical.is_none() {
            let isn = self.initial_sequence_number;
            let logical = {
                let mut ctx = self.conn_context(now, out, events, needs_tick);
                LogicalConnection::new_server(isn, their_isn, &mut ctx)
            };
            self.logical = Some(logical);
            return true;
        }

        let mut logical = self.logical.take();
        let existing = logical.as_mut().expect("checked for none above");

        let result = if existing.is_open() && existing.other_host_initial_sequence_number() != their_isn {
            // The other host has forgotten this connection and is opening a
            // new one. Force close; its next SYN retry will find no
            // connection and get a fresh one.
            debug!("got SYN with a new initial sequence number on an open connection - closing");
            self.pending_force_close = Some(crate::types::DisconnectReason::ThisHostClosed);
            false
        }
        else if existing.connection_type() == ConnectionType::Server {
            // our SYN-RST presumably got lost; repeat it
            let mut ctx = self.conn_context(now, out, events, needs_tick);
            existing.resend_init_message(&mut ctx);
            true
        }
        else {
            debug!("got SYN on a connection this host initiated - dropping");
            false
        };

        self.logical = logical;
        result
    }

    fn send_syn_rst_ack(&mut self, now: Instant, out: &mut Vec<Vec<u8>>) {
        let timestamp = self.conn_time.timestamp(now);
        if let Some(packet) = write_control_packet(
            timestamp,
            MessageFlags::SYN | MessageFlags::RST | MessageFlags::ACK,
            0,
            &[],
            self.config.mtu,
        ) {
            out.push(packet);
        }
    }

    /// The mediator acknowledged our cookie and is waiting for the peer.
    /// Reply with our inner endpoint so it can build the endpoint pairs.
    fn got_prx(&mut self, now: Instant, addressed_out: &mut Vec<(SocketAddr, Vec<u8>)>, local_address: SocketAddr) {
        if self.p2p.is_none() {
            debug!("got PRX on a non-P2P connection - ignoring");
            return;
        }

        let payload = endpoint_bytes(local_address);
        let timestamp = self.conn_time.timestamp(now);
        if let Some(packet) = write_control_packet(
            timestamp,
            MessageFlags::PRX | MessageFlags::ACK,
            0,
            &payload,
            self.config.mtu,
        ) {
            trace!("answering PRX with our inner endpoint {}", local_address);
            addressed_out.push((self.remote_address, packet));
        }
    }

    /// The mediator's punchthrough offer: both sides' endpoint pairs. Kicks
    /// off the PRX-SYN race toward the peer's candidates.
    fn got_prx_rst_syn_ack(
        &mut self,
        now: Instant,
        payload: &[u8],
        addressed_out: &mut Vec<(SocketAddr, Vec<u8>)>,
        events: &mut Vec<ConnectionEvent>,
    ) {
        let Some(p2p) = self.p2p.clone() else {
            debug!("got punchthrough offer on a non-P2P connection - ignoring");
            return;
        };
        if self.punchthrough.is_some() {
            trace!("punchthrough already in progress - ignoring repeated offer");
            return;
        }

        let endpoints = match P2pEndpoints::parse(payload, self.remote_address.is_ipv4(), &p2p) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                debug!("invalid punchthrough offer: {:#} - ignoring", e);
                return;
            }
        };

        let timer = RtoTimer::new(
            None,
            self.config.connection_timeout,
            self.config.connection_timeout,
            self.punch_rto_delegate.clone(),
        );

        self.p2p_endpoints = Some(endpoints.clone());
        self.punchthrough = Some(NatPunchthrough::new(
            now,
            endpoints,
            &p2p,
            self.mediator_address,
            self.config.mtu,
            timer,
            addressed_out,
        ));
        self.p2p_state = P2pState::Establishing;
        events.push(ConnectionEvent::P2p(P2pState::Establishing));
    }

    fn got_prx_rst_ack(&mut self) {
        if let Some(punch) = self.punchthrough.as_mut() {
            if punch.got_prx_rst_ack() {
                debug!("mediator relay torn down");
                self.punchthrough = None;
            }
        }
    }

    /// The peer probes one of our endpoints directly; answer toward wherever
    /// the probe came from.
    fn got_prx_syn(
        &mut self,
        now: Instant,
        from: SocketAddr,
        payload: &[u8],
        addressed_out: &mut Vec<(SocketAddr, Vec<u8>)>,
    ) {
        let (Some(p2p), Some(endpoints)) = (self.p2p.as_ref(), self.p2p_endpoints.as_ref()) else {
            debug!("got PRX-SYN without punchthrough state - ignoring");
            return;
        };
        if !endpoints.validate_prx_syn(p2p, payload) {
            debug!("got PRX-SYN that failed authentication - dropping");
            return;
        }

        let response = endpoints.prx_syn_ack_payload(p2p);
        let timestamp = self.conn_time.timestamp(now);
        if let Some(packet) = write_control_packet(
            timestamp,
            MessageFlags::PRX | MessageFlags::SYN | MessageFlags::ACK,
            0,
            &response,
            self.config.mtu,
        ) {
            trace!("answering PRX-SYN from {}", from);
            addressed_out.push((from, packet));
        }
    }

    /// The peer answered one of our PRX-SYN probes; maybe switch paths.
    fn got_prx_syn_ack(
        &mut self,
        now: Instant,
        from: SocketAddr,
        payload: &[u8],
        addressed_out: &mut Vec<(SocketAddr, Vec<u8>)>,
        events: &mut Vec<ConnectionEvent>,
    ) {
        let Some(p2p) = self.p2p.clone() else {
            return;
        };

        if let Some(punch) = self.punchthrough.as_mut() {
            let outcome = punch.got_prx_syn_ack(now, from, &p2p, payload, addressed_out);

            if let Some(new_remote) = outcome.new_remote_address {
                debug!("switching remote address to direct path {}", new_remote);
                self.remote_address = new_remote;
            }
            if outcome.first_establishment {
                // adopt the RTT measured on the direct path
                punch.swap_conn_time(&mut self.conn_time);
                if !self.sender_buffer.is_empty() {
                    let rto = self.conn_time.rto();
                    self.rto_timer.force_reset_rto_timer(rto);
                }
                self.p2p_state = P2pState::Established;
                events.push(ConnectionEvent::P2p(P2pState::Established));
            }
            return;
        }

        // Teardown already finished: a late PRX-SYN-ACK from the inner
        // endpoint still overrides an established outer path.
        if let Some(endpoints) = self.p2p_endpoints.as_ref() {
            if from == endpoints.peer_inner
                && self.remote_address != endpoints.peer_inner
                && endpoints.validate_prx_syn_ack(&p2p, payload)
            {
                debug!("late PRX-SYN-ACK from inner endpoint {}, switching over", from);
                self.remote_address = from;
            }
        }
    }

    /// Regular traffic from an address we are not connected to. If the peer
    /// reaches us through its outer endpoint while we believe in the inner
    /// path, coax it onto the inner path with an unsolicited PRX-SYN-ACK.
    fn got_non_prx_message_from_unexpected_remote_host(
        &mut self,
        now: Instant,
        from: SocketAddr,
        addressed_out: &mut Vec<(SocketAddr, Vec<u8>)>,
    ) {
        let (Some(p2p), Some(endpoints)) = (self.p2p.as_ref(), self.p2p_endpoints.as_ref()) else {
            debug!("got non-PRX message from unexpected host {} - dropping", from);
            return;
        };

        if from == endpoints.peer_outer && self.remote_address == endpoints.peer_inner {
            let response = endpoints.prx_syn_ack_payload(p2p);
            let timestamp = self.conn_time.timestamp(now);
            if let Some(packet) = write_control_packet(
                timestamp,
                MessageFlags::PRX | MessageFlags::SYN | MessageFlags::ACK,
                0,
                &response,
                self.config.mtu,
            ) {
                debug!("peer used the outer path; nudging it toward the inner endpoint");
                addressed_out.push((endpoints.peer_inner, packet));
            }
        }
    }
}
