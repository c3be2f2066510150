use crate::config::SockConfig;
use crate::congestion_control::CongestionControl;
use crate::conn_time::ConnTime;
use crate::error::RudpError;
use crate::logical_connection::{ConnContext, ConnectionEvent, LogicalConnection};
use crate::loss_list::LossList;
use crate::message::Message;
use crate::nat_punchthrough::{NatPunchthrough, P2pData, P2pEndpoints};
use crate::packet_header::PacketHeader;
use crate::receiver_buffer::ReceiverBuffer;
use crate::rto_timer::{RtoTimer, RtoTimerDelegate};
use crate::send_queue::{PacketContext, PendingRttResponse, SendQueue};
use crate::sender_buffer::SenderBuffer;
use crate::socket::DatagramSocket;
use crate::types::*;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use rand::rngs::StdRng;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

/// Receives the lifecycle and data events of one connection. Calls are made
/// after the triggering datagram or timer has been fully processed, so
/// implementations are free to call back into the connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionDelegate: Send + Sync + 'static {
    /// The open handshake finished; on error the connection is closed.
    async fn connection_opened(&self, error: Option<DisconnectReason>);

    async fn on_message(&self, channel: ChannelQualifier, data: Bytes);

    async fn on_disconnect(&self, reason: DisconnectReason);

    /// The connection has been silent suspiciously long.
    async fn connection_lost(&self);

    /// Traffic resumed after a connection-lost warning.
    async fn connection_regained(&self);

    /// Messages on an unreliable sequenced channel were skipped.
    async fn on_packet_loss(&self, channel: ChannelQualifier, count: u64);

    async fn p2p_state_changed(&self, state: P2pState);
}

/// Lets a connection remove itself from its socket's connection table.
pub(crate) trait ConnectionRegistry: Send + Sync {
    fn deregister_connection(&self, remote_address: SocketAddr);
}

pub(crate) struct ConnectionInner {
    pub config: Arc<SockConfig>,
    pub remote_address: SocketAddr,
    /// The relay the connection was set up through; differs from
    /// `remote_address` once NAT punchthrough migrated to a direct path.
    pub mediator_address: SocketAddr,
    pub initial_sequence_number: u16,

    pub logical: Option<LogicalConnection>,
    pub sender_buffer: SenderBuffer,
    pub receiver_buffer: ReceiverBuffer,
    pub send_queue: SendQueue,
    pub conn_time: ConnTime,
    pub congestion: CongestionControl,
    pub loss_list: LossList,
    pub pending_rtt_response: Option<PendingRttResponse>,

    pub rto_timer: RtoTimer,
    pub punch_rto_delegate: Arc<dyn RtoTimerDelegate>,
    pub tick_handle: Option<JoinHandle<()>>,
    pub heartbeat_handle: Option<JoinHandle<()>>,
    pub nak_handle: Option<JoinHandle<()>>,

    pub sent_data_since_last_heartbeat: bool,
    /// Set during inbound processing, applied once the datagram's message
    /// loop has completed (never mid-processing).
    pub pending_force_close: Option<DisconnectReason>,

    pub p2p: Option<P2pData>,
    pub punchthrough: Option<NatPunchthrough>,
    pub p2p_endpoints: Option<P2pEndpoints>,
    pub p2p_state: P2pState,

    pub teardown: bool,
}

impl ConnectionInner {
    /// Splits the inner state into the context the logical connection works
    /// against. `logical` is deliberately not part of it.
    pub fn conn_context<'a>(
        &'a mut self,
        now: Instant,
        out: &'a mut Vec<Vec<u8>>,
        events: &'a mut Vec<ConnectionEvent>,
        needs_tick: &'a mut bool,
    ) -> ConnContext<'a> {
        ConnContext {
            now,
            sender_buffer: &mut self.sender_buffer,
            receiver_buffer: &mut self.receiver_buffer,
            send_queue: &mut self.send_queue,
            packet: PacketContext {
                conn_time: &mut self.conn_time,
                congestion: &mut self.congestion,
                loss_list: &mut self.loss_list,
                pending_rtt_response: &mut self.pending_rtt_response,
            },
            out,
            events,
            needs_tick,
        }
    }

    pub fn begin_teardown(&mut self) {
        self.teardown = true;
        self.rto_timer.deschedule();
        for handle in [
            self.tick_handle.take(),
            self.heartbeat_handle.take(),
            self.nak_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        self.punchthrough = None;
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.begin_teardown();
    }
}

/// The composition root of one connection: owns the logical connection, the
/// buffers, the send queue, the congestion state and all timers, and is the
/// unit addressed by a peer.
///
/// All state lives behind one lock; every UDP receive, timer callback and
/// API call for the connection is serialized through it, and delegate events
/// are dispatched only after the lock has been released again.
pub struct Connection {
    config: Arc<SockConfig>,
    conn_type: ConnectionType,
    socket: Arc<dyn DatagramSocket>,
    delegate: Arc<dyn ConnectionDelegate>,
    registry: Option<Weak<dyn ConnectionRegistry>>,
    pub(crate) inner: RwLock<ConnectionInner>,
    weak_self: Weak<Connection>,
}

struct ConnRtoDelegate {
    conn: Weak<Connection>,
}

#[async_trait]
impl RtoTimerDelegate for ConnRtoDelegate {
    async fn rto_timeout(&self, now: Instant, scheduled_rto: Duration) -> Option<Duration> {
        match self.conn.upgrade() {
            Some(conn) => conn.handle_rto_timeout(now, scheduled_rto).await,
            None => None,
        }
    }

    async fn connection_lost(&self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.delegate.connection_lost().await;
        }
    }

    async fn connection_timeout(&self) {
        // The force close tears the timer (and with it this very task) down;
        // run it on a task of its own so the teardown cannot cancel the
        // disconnect notification mid-delivery.
        if let Some(conn) = self.conn.upgrade() {
            tokio::spawn(async move {
                conn.force_close(DisconnectReason::ConnectionTimedOut).await;
            });
        }
    }
}

struct PunchRtoDelegate {
    conn: Weak<Connection>,
}

#[async_trait]
impl RtoTimerDelegate for PunchRtoDelegate {
    async fn rto_timeout(&self, now: Instant, _scheduled_rto: Duration) -> Option<Duration> {
        match self.conn.upgrade() {
            Some(conn) => conn.handle_punch_rto_timeout(now).await,
            None => None,
        }
    }

    async fn connection_lost(&self) {
        // warnings are disabled for the punchthrough timer
    }

    async fn connection_timeout(&self) {
        // as above: the handler deschedules this task's timer
        if let Some(conn) = self.conn.upgrade() {
            tokio::spawn(async move {
                conn.handle_punch_connection_timeout().await;
            });
        }
    }
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<SockConfig>,
        conn_type: ConnectionType,
        remote_address: SocketAddr,
        socket: Arc<dyn DatagramSocket>,
        delegate: Arc<dyn ConnectionDelegate>,
        registry: Option<Weak<dyn ConnectionRegistry>>,
        p2p: Option<P2pData>,
        initial_sequence_number: u16,
        rng: StdRng,
    ) -> Arc<Connection> {
        let now = Instant::now();

        Arc::new_cyclic(|weak: &Weak<Connection>| {
            let rto_timer = RtoTimer::new(
                Some(config.time_before_connection_warning()),
                config.connection_timeout,
                config.initial_connection_timeout,
                Arc::new(ConnRtoDelegate { conn: weak.clone() }),
            );
            let punch_rto_delegate: Arc<dyn RtoTimerDelegate> =
                Arc::new(PunchRtoDelegate { conn: weak.clone() });

            let inner = ConnectionInner {
                config: config.clone(),
                remote_address,
                mediator_address: remote_address,
                initial_sequence_number,
                logical: None,
                sender_buffer: SenderBuffer::new(config.sender_buffer_size),
                receiver_buffer: ReceiverBuffer::new(config.receiver_buffer_size),
                send_queue: SendQueue::new(config.mtu),
                conn_time: ConnTime::new(now),
                congestion: CongestionControl::new(now, rng),
                loss_list: LossList::new(),
                pending_rtt_response: None,
                rto_timer,
                punch_rto_delegate,
                tick_handle: None,
                heartbeat_handle: None,
                nak_handle: None,
                sent_data_since_last_heartbeat: false,
                pending_force_close: None,
                p2p,
                punchthrough: None,
                p2p_endpoints: None,
                p2p_state: P2pState::NotEstablishing,
                teardown: false,
            };

            Connection {
                config,
                conn_type,
                socket,
                delegate,
                registry,
                inner: RwLock::new(inner),
                weak_self: weak.clone(),
            }
        })
    }

    /// Initiates the handshake of a client or P2P connection: creates the
    /// logical connection, which sends the SYN. Also starts the periodic
    /// heartbeat and NAK probing loops.
    pub(crate) async fn open(self: &Arc<Self>) {
        let mut out = Vec::new();
        let mut events = Vec::new();
        let mut needs_tick = false;
        let remote;
        {
            let mut inner = self.inner.write().await;
            let now = Instant::now();
            let p2p_cookie = inner.p2p.as_ref().map(|p2p| p2p.cookie.clone());
            let isn = inner.initial_sequence_number;

            let logical = LogicalConnection::new_client(
                self.conn_type,
                isn,
                p2p_cookie,
                &mut inner.conn_context(now, &mut out, &mut events, &mut needs_tick),
            );
            inner.logical = Some(logical);

            let rto = inner.conn_time.rto();
            inner.rto_timer.update_rto_timeout(rto);
            remote = inner.remote_address;
            self.start_periodic_loops(&mut inner);
        }
        self.finish_turn(remote, out, Vec::new(), events, false).await;
    }

    /// Starts the background loops of an accepted server connection; its
    /// logical connection is created by the first SYN datagram.
    pub(crate) async fn start_server(self: &Arc<Self>) {
        let mut inner = self.inner.write().await;
        self.start_periodic_loops(&mut inner);
    }

    fn start_periodic_loops(self: &Arc<Self>, inner: &mut ConnectionInner) {
        if inner.teardown {
            return;
        }

        let heartbeat_interval = self.config.heartbeat_interval();
        let weak = self.weak_self.clone();
        inner.heartbeat_handle = Some(tokio::spawn(async move {
            loop {
                sleep(heartbeat_interval).await;
                let Some(conn) = weak.upgrade() else {
                    break;
                };
                conn.handle_heartbeat_interval().await;
            }
        }));

        let weak = self.weak_self.clone();
        inner.nak_handle = Some(tokio::spawn(async move {
            loop {
                let Some(conn) = weak.upgrade() else {
                    break;
                };
                let interval = conn.inner.read().await.conn_time.nak_interval();
                drop(conn);
                sleep(interval).await;

                let Some(conn) = weak.upgrade() else {
                    break;
                };
                conn.handle_nak_interval().await;
            }
        }));
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.conn_type
    }

    pub fn local_address(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub async fn remote_address(&self) -> SocketAddr {
        self.inner.read().await.remote_address
    }

    pub async fn is_open(&self) -> bool {
        self.inner
            .read()
            .await
            .logical
            .as_ref()
            .is_some_and(|logical| logical.is_open())
    }

    pub async fn p2p_state(&self) -> P2pState {
        self.inner.read().await.p2p_state
    }

    /// The biggest payload `send` accepts: one MTU-sized packet minus the
    /// packet and message headers.
    pub fn max_message_size(&self) -> usize {
        self.config.mtu - PacketHeader::MIN_LENGTH - Message::MAX_HEADER_SIZE
    }

    /// Sends a message. Fails synchronously on a closed connection, an empty
    /// or oversized message, or (for reliable channels) a full sender
    /// buffer; unreliable sends are best-effort beyond that.
    pub async fn send(
        self: &Arc<Self>,
        data: Bytes,
        channel: ChannelQualifier,
        priority: Priority,
    ) -> Result<(), RudpError> {
        let max_message_size = self.max_message_size();
        let mut out = Vec::new();
        let mut events = Vec::new();
        let mut needs_tick = false;
        let result;
        let remote;
        let deregister;
        {
            let mut inner = self.inner.write().await;
            if inner.teardown {
                return Err(RudpError::Closed);
            }

            let now = Instant::now();
            let mut logical = inner.logical.take();
            result = match logical.as_mut() {
                Some(logical) => logical.send(
                    data,
                    channel,
                    priority,
                    max_message_size,
                    &mut inner.conn_context(now, &mut out, &mut events, &mut needs_tick),
                ),
                None => Err(RudpError::Closed),
            };
            inner.logical = logical;

            remote = inner.remote_address;
            deregister = self.epilogue(&mut inner, &mut events, needs_tick);
        }
        self.finish_turn(remote, out, Vec::new(), events, deregister).await;
        result
    }

    /// Initiates the orderly close handshake.
    pub async fn close(self: &Arc<Self>) -> Result<(), RudpError> {
        let mut out = Vec::new();
        let mut events = Vec::new();
        let mut needs_tick = false;
        let result;
        let remote;
        let deregister;
        {
            let mut inner = self.inner.write().await;
            if inner.teardown {
                return Err(RudpError::Closed);
            }

            let now = Instant::now();
            let mut logical = inner.logical.take();
            result = match logical.as_mut() {
                Some(logical) => {
                    logical.close(&mut inner.conn_context(now, &mut out, &mut events, &mut needs_tick))
                }
                None => Err(RudpError::Closed),
            };
            inner.logical = logical;

            remote = inner.remote_address;
            deregister = self.epilogue(&mut inner, &mut events, needs_tick);
        }
        self.finish_turn(remote, out, Vec::new(), events, deregister).await;
        result
    }

    /// Immediately closes the connection without notifying the other host.
    pub async fn force_close(self: &Arc<Self>, reason: DisconnectReason) {
        let mut events = Vec::new();
        let remote;
        {
            let mut inner = self.inner.write().await;
            if inner.teardown {
                return;
            }

            match inner.logical.as_mut() {
                Some(logical) => logical.was_closed(reason, &mut events),
                None => events.push(ConnectionEvent::Disconnected(reason)),
            }
            remote = inner.remote_address;
            inner.begin_teardown();
        }
        self.deregister(remote);
        self.dispatch_events(events).await;
    }

    /// Feeds one received datagram through the protocol. Processing is fully
    /// synchronous under the connection lock; packets and delegate events
    /// produced by it are emitted afterwards.
    pub(crate) async fn handle_datagram(self: &Arc<Self>, now: Instant, from: SocketAddr, buf: &[u8]) {
        let mut out = Vec::new();
        let mut addressed_out = Vec::new();
        let mut events = Vec::new();
        let mut needs_tick = false;
        let remote;
        let deregister;
        {
            let mut inner = self.inner.write().await;
            if inner.teardown {
                return;
            }

            let unexpected_remote_host = from != inner.remote_address;
            inner.process_datagram(
                now,
                from,
                unexpected_remote_host,
                self.local_address(),
                buf,
                &mut out,
                &mut addressed_out,
                &mut events,
                &mut needs_tick,
            );

            remote = inner.remote_address;
            deregister = self.epilogue(&mut inner, &mut events, needs_tick);
        }
        self.finish_turn(remote, out, addressed_out, events, deregister).await;
    }

    /// Shared end-of-turn bookkeeping, run while still holding the lock:
    /// applies a deferred force close, reacts to state transitions, keeps
    /// the timers in step. Returns whether the connection should leave its
    /// socket's table.
    fn epilogue(
        self: &Arc<Self>,
        inner: &mut ConnectionInner,
        events: &mut Vec<ConnectionEvent>,
        needs_tick: bool,
    ) -> bool {
        // a force close requested mid-datagram is applied only here, after
        // the triggering call has fully unwound
        if let Some(reason) = inner.pending_force_close.take() {
            if let Some(logical) = inner.logical.as_mut() {
                logical.was_closed(reason, events);
            }
        }

        if inner
            .logical
            .as_ref()
            .is_some_and(|logical| logical.is_open())
        {
            inner.rto_timer.connection_opened();
        }

        if needs_tick {
            self.ensure_tick(inner);
        }

        if !inner.sender_buffer.is_empty() {
            let rto = inner.conn_time.rto();
            inner.rto_timer.update_rto_timeout(rto);
        }

        let disconnected = events
            .iter()
            .any(|event| matches!(event, ConnectionEvent::Disconnected(_)));
        if disconnected {
            inner.begin_teardown();
        }
        disconnected
    }

    fn ensure_tick(self: &Arc<Self>, inner: &mut ConnectionInner) {
        if inner.teardown
            || inner
                .tick_handle
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }

        let tick_interval = self.config.tick_interval();
        let weak = self.weak_self.clone();
        inner.tick_handle = Some(tokio::spawn(async move {
            sleep(tick_interval).await;
            if let Some(conn) = weak.upgrade() {
                conn.handle_tick().await;
            }
        }));
    }

    async fn handle_tick(self: &Arc<Self>) {
        let mut out = Vec::new();
        let remote;
        {
            let mut inner = self.inner.write().await;
            if inner.teardown {
                return;
            }
            let now = Instant::now();

            if 0 == inner.congestion.tick_allowance() && inner.send_queue.queued_bytes() > 0 {
                // congestion window is exhausted; try again next tick
                trace!("tick allowance exhausted, deferring flush");
                // this very task holds the tick slot; clear it so the retry
                // can actually be scheduled
                inner.tick_handle = None;
                self.ensure_tick(&mut inner);
                return;
            }

            let ConnectionInner {
                send_queue,
                conn_time,
                congestion,
                loss_list,
                pending_rtt_response,
                ..
            } = &mut *inner;
            let sent = send_queue.flush(
                now,
                &mut PacketContext {
                    conn_time,
                    congestion,
                    loss_list,
                    pending_rtt_response,
                },
                &mut out,
            );

            if sent {
                inner.sent_data_since_last_heartbeat = true;
            }
            remote = inner.remote_address;
        }

        for packet in out {
            self.socket.send_datagram(remote, &packet).await;
        }
    }

    async fn handle_heartbeat_interval(self: &Arc<Self>) {
        let mut inner = self.inner.write().await;
        if inner.teardown {
            return;
        }

        // don't send heartbeats until the handshake went through
        let is_open = inner
            .logical
            .as_ref()
            .is_some_and(|logical| logical.is_open());

        if is_open && !inner.sent_data_since_last_heartbeat {
            inner.send_queue.enqueue_heartbeat();
            self.ensure_tick(&mut inner);
        }
        inner.sent_data_since_last_heartbeat = false;
    }

    async fn handle_nak_interval(self: &Arc<Self>) {
        let mut out = Vec::new();
        let remote;
        {
            let mut inner = self.inner.write().await;
            if inner.teardown {
                return;
            }
            let now = Instant::now();

            let rtt = inner.conn_time.rtt().unwrap_or(INIT_RTO);
            if let Some(nak) = inner.loss_list.calculate_nak(now, rtt) {
                let header = PacketHeader {
                    timestamp: inner.conn_time.timestamp(now),
                    nak: Some(nak),
                    ..PacketHeader::default()
                };
                let mut buf = vec![0u8; self.config.mtu];
                if let Ok(len) = header.write(&mut buf) {
                    buf.truncate(len);
                    out.push(buf);
                }
            }
            remote = inner.remote_address;
        }

        for packet in out {
            self.socket.send_datagram(remote, &packet).await;
        }
    }

    /// The retransmission timeout fired: resend the oldest unacknowledged
    /// message of every stalled channel, escalate the RTO, and keep the
    /// timer running while anything is left.
    async fn handle_rto_timeout(self: &Arc<Self>, now: Instant, scheduled_rto: Duration) -> Option<Duration> {
        let mut out = Vec::new();
        let mut events = Vec::new();
        let mut needs_tick = false;
        let next_rto;
        let remote;
        {
            let mut inner = self.inner.write().await;
            if inner.teardown {
                return None;
            }

            let mut due = Vec::new();
            inner
                .sender_buffer
                .each_current_message(now, scheduled_rto, |message| due.push(message.clone()));

            if !due.is_empty() {
                debug!("RTO: retransmitting {} message(s)", due.len());
                let mut ctx = inner.conn_context(now, &mut out, &mut events, &mut needs_tick);
                for message in due {
                    // already registered; just queue it for sending again
                    ctx.send_queue.enqueue_message(now, message, &mut ctx.packet, ctx.out);
                }
                *ctx.needs_tick = true;
            }

            inner.conn_time.on_rto_timeout();
            inner.congestion.on_rto();

            next_rto = (!inner.sender_buffer.is_empty()).then(|| inner.conn_time.rto());
            remote = inner.remote_address;
            if needs_tick {
                self.ensure_tick(&mut inner);
            }
        }

        for packet in out {
            self.socket.send_datagram(remote, &packet).await;
        }
        self.dispatch_events(events).await;

        next_rto
    }

    async fn handle_punch_rto_timeout(self: &Arc<Self>, now: Instant) -> Option<Duration> {
        let mut addressed_out = Vec::new();
        let next_rto;
        {
            let mut inner = self.inner.write().await;
            if inner.teardown {
                return None;
            }
            let Some(p2p) = inner.p2p.clone() else {
                return None;
            };

            next_rto = inner
                .punchthrough
                .as_mut()
                .map(|punch| punch.on_rto_timeout(now, &p2p, &mut addressed_out));
        }

        for (to, packet) in addressed_out {
            self.socket.send_datagram(to, &packet).await;
        }
        next_rto
    }

    async fn handle_punch_connection_timeout(self: &Arc<Self>) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.write().await;
            if let Some(mut punch) = inner.punchthrough.take() {
                if punch.on_connection_timeout() {
                    debug!("NAT punchthrough timed out without a direct path");
                    inner.p2p_state = P2pState::Failed;
                    events.push(ConnectionEvent::P2p(P2pState::Failed));
                }
            }
        }
        self.dispatch_events(events).await;
    }

    fn deregister(&self, remote_address: SocketAddr) {
        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            registry.deregister_connection(remote_address);
        }
    }

    async fn finish_turn(
        self: &Arc<Self>,
        remote: SocketAddr,
        out: Vec<Vec<u8>>,
        addressed_out: Vec<(SocketAddr, Vec<u8>)>,
        events: Vec<ConnectionEvent>,
        deregister: bool,
    ) {
        for packet in out {
            self.socket.send_datagram(remote, &packet).await;
        }
        for (to, packet) in addressed_out {
            self.socket.send_datagram(to, &packet).await;
        }
        if deregister {
            // the remote the connection is keyed under never changes for
            // server connections, so this removes the right entry
            self.deregister(remote);
        }
        self.dispatch_events(events).await;
    }

    async fn dispatch_events(&self, events: Vec<ConnectionEvent>) {
        for event in events {
            match event {
                ConnectionEvent::Opened { error } => self.delegate.connection_opened(error).await,
                ConnectionEvent::Message { channel, data } => self.delegate.on_message(channel, data).await,
                ConnectionEvent::Disconnected(reason) => self.delegate.on_disconnect(reason).await,
                ConnectionEvent::ConnectionRegained => self.delegate.connection_regained().await,
                ConnectionEvent::PacketLoss { channel, count } => {
                    self.delegate.on_packet_loss(channel, count).await
                }
                ConnectionEvent::P2p(state) => self.delegate.p2p_state_changed(state).await,
            }
        }
    }
}
