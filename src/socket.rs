use crate::config::SockConfig;
use crate::connection::{Connection, ConnectionDelegate, ConnectionRegistry};
use crate::message::write_control_packet;
use crate::message_header::{MessageFlags, MessageHeader};
use crate::nat_punchthrough::P2pData;
use crate::packet_header::PacketHeader;
use crate::types::ConnectionType;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// The datagram send primitive the protocol runs on, abstracted to keep the
/// I/O mockable in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) {
        trace!("UDP socket: sending {} bytes to {}", buf.len(), to);

        if let Err(e) = self.send_to(buf, to).await {
            error!("error sending UDP packet to {}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// Socket-level callbacks: connection admission on the accepting side.
#[async_trait]
pub trait SocketDelegate: Send + Sync + 'static {
    /// An inbound SYN is about to create a server connection; supply the
    /// delegate it should report its events to.
    async fn make_connection_delegate(&self, remote_address: SocketAddr) -> Arc<dyn ConnectionDelegate>;

    /// The server connection has been created and registered.
    async fn connection_accepted(&self, connection: Arc<Connection>);
}

/// What to do with a datagram from an address we have no connection for.
#[derive(Debug, PartialEq, Eq)]
enum AdmissionAction {
    /// A well-formed connect request: create a server connection.
    AcceptSyn,
    /// A message that assumes an open connection. Answer with SYN-RST-ACK so
    /// the other host learns the connection is gone and can re-connect
    /// without waiting for its full timeout (a restarted server is the
    /// common way to get here).
    ReplySynRstAck,
    Ignore,
}

fn classify_datagram_without_connection(buf: &[u8]) -> AdmissionAction {
    let Ok((_, packet_header_length)) = PacketHeader::parse(buf) else {
        return AdmissionAction::Ignore;
    };
    if packet_header_length == buf.len() {
        // a stray heartbeat
        return AdmissionAction::Ignore;
    }

    let mut offset = 0;
    let Ok((header, _)) = MessageHeader::parse_next_message(&buf[packet_header_length..], &mut offset)
    else {
        return AdmissionAction::Ignore;
    };

    let syn = header.flags.contains(MessageFlags::SYN);
    let rst = header.flags.contains(MessageFlags::RST);
    let ack = header.flags.contains(MessageFlags::ACK);

    if header.flags.contains(MessageFlags::PRX) {
        AdmissionAction::Ignore
    }
    else if syn && !rst && !ack && 0 == header.length {
        AdmissionAction::AcceptSyn
    }
    else if syn && rst && ack {
        // a duplicate close confirm; part of normal operation
        AdmissionAction::Ignore
    }
    else {
        AdmissionAction::ReplySynRstAck
    }
}

/// A protocol endpoint: one listening UDP socket, the table of connections
/// accepted on it, and the `connect` entry points (which use a dedicated
/// socket per outbound connection).
pub struct RudpSocket {
    config: Arc<SockConfig>,
    socket: Arc<UdpSocket>,
    delegate: Arc<dyn SocketDelegate>,
    /// Server connections by remote address. Mutated only by the accept path
    /// of the receive loop and by connection deregistration.
    connections: Mutex<FxHashMap<SocketAddr, Arc<Connection>>>,
    rng: Mutex<StdRng>,
    recv_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RudpSocket {
    /// Binds the socket and starts its receive loop.
    pub async fn bind(
        bind_address: SocketAddr,
        config: SockConfig,
        delegate: Arc<dyn SocketDelegate>,
    ) -> anyhow::Result<Arc<RudpSocket>> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(bind_address).await?);
        info!("bound receive socket to {}", DatagramSocket::local_addr(socket.as_ref()));

        let rudp_socket = Arc::new(RudpSocket {
            config: Arc::new(config),
            socket,
            delegate,
            connections: Mutex::new(FxHashMap::default()),
            rng: Mutex::new(StdRng::from_os_rng()),
            recv_handle: Mutex::new(None),
        });

        let for_loop = rudp_socket.clone();
        let handle = tokio::spawn(async move { for_loop.recv_loop().await });
        *rudp_socket.recv_handle.lock().unwrap() = Some(handle);

        Ok(rudp_socket)
    }

    pub fn local_addr(&self) -> SocketAddr {
        DatagramSocket::local_addr(self.socket.as_ref())
    }

    pub fn config(&self) -> &Arc<SockConfig> {
        &self.config
    }

    /// Opens a client connection to `remote_address` on a dedicated socket.
    /// The delegate's `connection_opened` reports the handshake result.
    pub async fn connect(
        self: &Arc<Self>,
        remote_address: SocketAddr,
        delegate: Arc<dyn ConnectionDelegate>,
    ) -> anyhow::Result<Arc<Connection>> {
        self.connect_with(remote_address, delegate, ConnectionType::Client, None).await
    }

    /// Opens a P2P connection through a mediator: the SYN carries the cookie,
    /// and once the mediator offers both endpoint pairs, NAT punchthrough
    /// migrates the connection to a direct path.
    pub async fn connect_p2p(
        self: &Arc<Self>,
        mediator_address: SocketAddr,
        cookie: Bytes,
        shared_secret: Bytes,
        delegate: Arc<dyn ConnectionDelegate>,
    ) -> anyhow::Result<Arc<Connection>> {
        let p2p = P2pData { cookie, shared_secret };
        self.connect_with(mediator_address, delegate, ConnectionType::P2P, Some(p2p)).await
    }

    async fn connect_with(
        self: &Arc<Self>,
        remote_address: SocketAddr,
        delegate: Arc<dyn ConnectionDelegate>,
        conn_type: ConnectionType,
        p2p: Option<P2pData>,
    ) -> anyhow::Result<Arc<Connection>> {
        let bind_address: SocketAddr = if remote_address.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        }
        else {
            "[::]:0".parse().unwrap()
        };
        let socket = Arc::new(UdpSocket::bind(bind_address).await?);

        let (initial_sequence_number, rng) = {
            let mut socket_rng = self.rng.lock().unwrap();
            (socket_rng.random::<u16>(), StdRng::from_rng(&mut *socket_rng))
        };

        let connection = Connection::new(
            self.config.clone(),
            conn_type,
            remote_address,
            socket.clone(),
            delegate,
            None,
            p2p,
            initial_sequence_number,
            rng,
        );

        Self::spawn_client_recv_loop(socket, &connection);
        connection.open().await;

        Ok(connection)
    }

    fn spawn_client_recv_loop(socket: Arc<UdpSocket>, connection: &Arc<Connection>) {
        let weak = Arc::downgrade(connection);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let (num_read, from) = match socket.recv_from(&mut buf).await {
                    Ok(read) => read,
                    Err(e) => {
                        error!("socket error: {}", e);
                        continue;
                    }
                };

                let Some(connection) = weak.upgrade() else {
                    break;
                };
                connection.handle_datagram(Instant::now(), from, &buf[..num_read]).await;
            }
        });
    }

    async fn recv_loop(self: Arc<Self>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; 65536];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(read) => read,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            let now = Instant::now();
            let datagram = &buf[..num_read];

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id, %from);

            let connection = self.connections.lock().unwrap().get(&from).cloned();
            match connection {
                Some(connection) => connection.handle_datagram(now, from, datagram).instrument(span).await,
                None => {
                    self.handle_datagram_without_connection(now, from, datagram)
                        .instrument(span)
                        .await
                }
            }
        }
    }

    async fn handle_datagram_without_connection(self: &Arc<Self>, now: Instant, from: SocketAddr, datagram: &[u8]) {
        match classify_datagram_without_connection(datagram) {
            AdmissionAction::Ignore => {
                trace!("ignoring stray datagram from {}", from);
            }
            AdmissionAction::ReplySynRstAck => {
                debug!("got message from {} without a connection - answering SYN-RST-ACK", from);
                if let Some(packet) = write_control_packet(
                    0,
                    MessageFlags::SYN | MessageFlags::RST | MessageFlags::ACK,
                    0,
                    &[],
                    self.config.mtu,
                ) {
                    self.socket.send_datagram(from, &packet).await;
                }
            }
            AdmissionAction::AcceptSyn => {
                if !self.config.accept_connections {
                    warn!("got SYN from {} but this socket doesn't accept incoming connections", from);
                    return;
                }

                debug!("accepting connection from {}", from);
                let connection = self.make_server_connection(from).await;
                connection.handle_datagram(now, from, datagram).await;
            }
        }
    }

    async fn make_server_connection(self: &Arc<Self>, remote_address: SocketAddr) -> Arc<Connection> {
        let (initial_sequence_number, rng) = {
            let mut socket_rng = self.rng.lock().unwrap();
            (socket_rng.random::<u16>(), StdRng::from_rng(&mut *socket_rng))
        };

        let delegate = self.delegate.make_connection_delegate(remote_address).await;
        let registry_arc: Arc<dyn ConnectionRegistry> = self.clone();
        let registry: Weak<dyn ConnectionRegistry> = Arc::downgrade(&registry_arc);

        let connection = Connection::new(
            self.config.clone(),
            ConnectionType::Server,
            remote_address,
            self.socket.clone(),
            delegate,
            Some(registry),
            None,
            initial_sequence_number,
            rng,
        );

        self.connections
            .lock()
            .unwrap()
            .insert(remote_address, connection.clone());
        connection.start_server().await;
        self.delegate.connection_accepted(connection.clone()).await;

        connection
    }

    #[cfg(test)]
    pub(crate) fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

impl ConnectionRegistry for RudpSocket {
    fn deregister_connection(&self, remote_address: SocketAddr) {
        if self.connections.lock().unwrap().remove(&remote_address).is_some() {
            debug!("deregistered connection to {}", remote_address);
        }
    }
}

impl Drop for RudpSocket {
    fn drop(&mut self) {
        if let Some(handle) = self.recv_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn packet_with_flags(flags: MessageFlags, length: usize) -> Vec<u8> {
        let mut buf = [0u8; 600];
        let header_length = PacketHeader::write_empty(&mut buf, 0).unwrap();
        let written = crate::message_header::write_message(
            &mut buf,
            header_length,
            None,
            0,
            7,
            &vec![0u8; length],
            flags,
        );
        buf[..header_length + written].to_vec()
    }

    #[rstest]
    #[case::syn(MessageFlags::SYN, 0, AdmissionAction::AcceptSyn)]
    #[case::syn_with_payload(MessageFlags::SYN, 4, AdmissionAction::ReplySynRstAck)]
    #[case::data(MessageFlags::empty(), 4, AdmissionAction::ReplySynRstAck)]
    #[case::rst(MessageFlags::RST, 0, AdmissionAction::ReplySynRstAck)]
    #[case::syn_rst(MessageFlags::SYN.union(MessageFlags::RST), 0, AdmissionAction::ReplySynRstAck)]
    #[case::syn_rst_ack(
        MessageFlags::SYN.union(MessageFlags::RST).union(MessageFlags::ACK),
        0,
        AdmissionAction::Ignore
    )]
    #[case::prx(MessageFlags::PRX, 0, AdmissionAction::Ignore)]
    fn test_classify_datagram_without_connection(
        #[case] flags: MessageFlags,
        #[case] length: usize,
        #[case] expected: AdmissionAction,
    ) {
        let packet = packet_with_flags(flags, length);
        assert_eq!(classify_datagram_without_connection(&packet), expected);
    }

    #[test]
    fn test_classify_heartbeat_is_ignored() {
        let mut buf = [0u8; 8];
        let len = PacketHeader::write_empty(&mut buf, 0).unwrap();
        assert_eq!(classify_datagram_without_connection(&buf[..len]), AdmissionAction::Ignore);
    }

    #[test]
    fn test_classify_garbage_is_ignored() {
        assert_eq!(classify_datagram_without_connection(&[0xff, 1, 2]), AdmissionAction::Ignore);
    }
}
