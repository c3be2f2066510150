//! End-to-end tests over real UDP sockets on the loopback interface.

use async_trait::async_trait;
use bytes::Bytes;
use rudp::{
    ChannelQualifier, ChannelType, Connection, ConnectionDelegate, DisconnectReason, P2pState,
    Priority, RudpSocket, SockConfig, SocketDelegate,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;

#[derive(Debug, PartialEq)]
enum Event {
    Opened(Option<DisconnectReason>),
    Message(Vec<u8>),
    Disconnected(DisconnectReason),
    Accepted,
}

struct ChannelDelegate {
    events: UnboundedSender<Event>,
}

#[async_trait]
impl ConnectionDelegate for ChannelDelegate {
    async fn connection_opened(&self, error: Option<DisconnectReason>) {
        self.events.send(Event::Opened(error)).ok();
    }
    async fn on_message(&self, _channel: ChannelQualifier, data: Bytes) {
        self.events.send(Event::Message(data.to_vec())).ok();
    }
    async fn on_disconnect(&self, reason: DisconnectReason) {
        self.events.send(Event::Disconnected(reason)).ok();
    }
    async fn connection_lost(&self) {}
    async fn connection_regained(&self) {}
    async fn on_packet_loss(&self, _channel: ChannelQualifier, _count: u64) {}
    async fn p2p_state_changed(&self, _state: P2pState) {}
}

struct AcceptingDelegate {
    events: UnboundedSender<Event>,
    connections: UnboundedSender<Arc<Connection>>,
}

#[async_trait]
impl SocketDelegate for AcceptingDelegate {
    async fn make_connection_delegate(&self, _remote_address: SocketAddr) -> Arc<dyn ConnectionDelegate> {
        Arc::new(ChannelDelegate {
            events: self.events.clone(),
        })
    }

    async fn connection_accepted(&self, connection: Arc<Connection>) {
        self.events.send(Event::Accepted).ok();
        self.connections.send(connection).ok();
    }
}

struct RejectingDelegate;

#[async_trait]
impl SocketDelegate for RejectingDelegate {
    async fn make_connection_delegate(&self, _remote_address: SocketAddr) -> Arc<dyn ConnectionDelegate> {
        unreachable!("this socket does not accept connections");
    }

    async fn connection_accepted(&self, _connection: Arc<Connection>) {
        unreachable!("this socket does not accept connections");
    }
}

async fn expect_event(events: &mut UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn reliable_ordered() -> ChannelQualifier {
    ChannelQualifier::new(ChannelType::ReliableOrdered, 0)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_send_and_close_over_loopback() {
    let (server_events_tx, mut server_events) = unbounded_channel();
    let (server_conns_tx, mut server_conns) = unbounded_channel();
    let server = RudpSocket::bind(
        localhost(0),
        SockConfig {
            accept_connections: true,
            ..SockConfig::default()
        },
        Arc::new(AcceptingDelegate {
            events: server_events_tx,
            connections: server_conns_tx,
        }),
    )
    .await
    .unwrap();

    let client_socket = RudpSocket::bind(localhost(0), SockConfig::default(), Arc::new(RejectingDelegate))
        .await
        .unwrap();

    let (client_events_tx, mut client_events) = unbounded_channel();
    let client = client_socket
        .connect(
            server.local_addr(),
            Arc::new(ChannelDelegate {
                events: client_events_tx,
            }),
        )
        .await
        .unwrap();

    assert_eq!(expect_event(&mut client_events).await, Event::Opened(None));
    assert_eq!(expect_event(&mut server_events).await, Event::Accepted);

    // client -> server
    client
        .send(Bytes::from_static(b"hello"), reliable_ordered(), Priority::High)
        .await
        .unwrap();
    assert_eq!(expect_event(&mut server_events).await, Event::Message(b"hello".to_vec()));

    // server -> client
    let server_conn = server_conns.recv().await.unwrap();
    server_conn
        .send(Bytes::from_static(b"world"), reliable_ordered(), Priority::High)
        .await
        .unwrap();
    assert_eq!(expect_event(&mut client_events).await, Event::Message(b"world".to_vec()));

    // orderly close, confirmed by both sides
    client.close().await.unwrap();
    assert_eq!(
        expect_event(&mut client_events).await,
        Event::Disconnected(DisconnectReason::ThisHostClosed)
    );
    assert_eq!(
        expect_event(&mut server_events).await,
        Event::Disconnected(DisconnectReason::OtherHostClosed)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_several_messages_arrive_in_order() {
    let (server_events_tx, mut server_events) = unbounded_channel();
    let (server_conns_tx, _server_conns) = unbounded_channel();
    let server = RudpSocket::bind(
        localhost(0),
        SockConfig {
            accept_connections: true,
            ..SockConfig::default()
        },
        Arc::new(AcceptingDelegate {
            events: server_events_tx,
            connections: server_conns_tx,
        }),
    )
    .await
    .unwrap();

    let client_socket = RudpSocket::bind(localhost(0), SockConfig::default(), Arc::new(RejectingDelegate))
        .await
        .unwrap();
    let (client_events_tx, mut client_events) = unbounded_channel();
    let client = client_socket
        .connect(server.local_addr(), Arc::new(ChannelDelegate { events: client_events_tx }))
        .await
        .unwrap();

    assert_eq!(expect_event(&mut client_events).await, Event::Opened(None));
    assert_eq!(expect_event(&mut server_events).await, Event::Accepted);

    for i in 0..20u8 {
        client
            .send(Bytes::from(vec![i; 8]), reliable_ordered(), Priority::High)
            .await
            .unwrap();
    }

    for i in 0..20u8 {
        assert_eq!(expect_event(&mut server_events).await, Event::Message(vec![i; 8]));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_against_dead_host_times_out() {
    let client_socket = RudpSocket::bind(
        localhost(0),
        SockConfig {
            initial_connection_timeout: Duration::from_millis(300),
            ..SockConfig::default()
        },
        Arc::new(RejectingDelegate),
    )
    .await
    .unwrap();

    // a plain UDP socket that swallows everything and never answers
    let dead = tokio::net::UdpSocket::bind(localhost(0)).await.unwrap();
    let dead_addr = dead.local_addr().unwrap();

    let (events_tx, mut events) = unbounded_channel();
    let _client = client_socket
        .connect(dead_addr, Arc::new(ChannelDelegate { events: events_tx }))
        .await
        .unwrap();

    assert_eq!(
        expect_event(&mut events).await,
        Event::Opened(Some(DisconnectReason::OtherHostDidNotRespond))
    );
    assert_eq!(
        expect_event(&mut events).await,
        Event::Disconnected(DisconnectReason::ConnectionTimedOut)
    );
}
