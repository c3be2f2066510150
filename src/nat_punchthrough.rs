use crate::conn_time::ConnTime;
use crate::message::write_control_packet;
use crate::message_header::MessageFlags;
use crate::rto_timer::RtoTimer;
use anyhow::bail;
use bytes::{Buf, Bytes};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

type HmacSha256 = Hmac<Sha256>;

pub const HMAC_LENGTH: usize = 32;

/// Distinguishes a PRX-SYN-ACK from a reflected PRX-SYN.
const SYN_ACK_SALT: &[u8] = b"prx-syn-ack";

/// The credentials a P2P connection got from whoever brokered it: the cookie
/// it presents to the mediator, and the secret shared with the peer that
/// authenticates the punchthrough handshake.
#[derive(Clone)]
pub struct P2pData {
    pub cookie: Bytes,
    pub shared_secret: Bytes,
}

/// An endpoint pair: how a host sees itself (inner) and how the mediator
/// sees it (outer). On the wire: inner ip, inner port, outer ip, outer port,
/// all in network byte order.
fn parse_endpoint_pair(pair: &[u8], is_v4: bool) -> (SocketAddr, SocketAddr) {
    let mut cur = pair;
    let mut next_addr = || -> SocketAddr {
        let ip: IpAddr = if is_v4 {
            let mut octets = [0u8; 4];
            cur.copy_to_slice(&mut octets);
            Ipv4Addr::from(octets).into()
        }
        else {
            let mut octets = [0u8; 16];
            cur.copy_to_slice(&mut octets);
            Ipv6Addr::from(octets).into()
        };
        SocketAddr::new(ip, cur.get_u16())
    };
    (next_addr(), next_addr())
}

fn endpoint_pair_length(is_v4: bool) -> usize {
    2 * (if is_v4 { 4 } else { 16 } + 2)
}

/// Both sides' candidate endpoints, as delivered by the mediator's
/// punchthrough offer.
#[derive(Clone)]
pub struct P2pEndpoints {
    pub my_pair: Bytes,
    pub peer_pair: Bytes,
    pub peer_inner: SocketAddr,
    pub peer_outer: SocketAddr,
}

impl P2pEndpoints {
    /// Parses and authenticates a PRX-RST-SYN-ACK payload:
    /// `my_pair ‖ hmac(secret, my_pair) ‖ peer_pair ‖ hmac(secret, peer_pair)`.
    /// The address family follows the mediator connection's.
    pub fn parse(payload: &[u8], is_v4: bool, p2p: &P2pData) -> anyhow::Result<P2pEndpoints> {
        let pair_length = endpoint_pair_length(is_v4);
        if payload.len() != 2 * (pair_length + HMAC_LENGTH) {
            bail!("punchthrough offer has {} bytes, expected {}", payload.len(), 2 * (pair_length + HMAC_LENGTH));
        }

        let (my_half, peer_half) = payload.split_at(pair_length + HMAC_LENGTH);
        let my_pair = &my_half[..pair_length];
        let peer_pair = &peer_half[..pair_length];

        if !verify_hmac(&p2p.shared_secret, &[my_pair], &my_half[pair_length..])
            || !verify_hmac(&p2p.shared_secret, &[peer_pair], &peer_half[pair_length..])
        {
            bail!("punchthrough offer failed authentication");
        }

        let (peer_inner, peer_outer) = parse_endpoint_pair(peer_pair, is_v4);

        Ok(P2pEndpoints {
            my_pair: Bytes::copy_from_slice(my_pair),
            peer_pair: Bytes::copy_from_slice(peer_pair),
            peer_inner,
            peer_outer,
        })
    }

    /// The payload of an outbound PRX-SYN: proof that we hold the shared
    /// secret and are the owner of our endpoint pair.
    pub fn prx_syn_payload(&self, p2p: &P2pData) -> Bytes {
        Bytes::copy_from_slice(&compute_hmac(&p2p.shared_secret, &[&self.my_pair]))
    }

    pub fn prx_syn_ack_payload(&self, p2p: &P2pData) -> Bytes {
        Bytes::copy_from_slice(&compute_hmac(&p2p.shared_secret, &[&self.my_pair, SYN_ACK_SALT]))
    }

    /// Validates an inbound PRX-SYN against the peer's endpoint pair.
    pub fn validate_prx_syn(&self, p2p: &P2pData, payload: &[u8]) -> bool {
        verify_hmac(&p2p.shared_secret, &[&self.peer_pair], payload)
    }

    pub fn validate_prx_syn_ack(&self, p2p: &P2pData, payload: &[u8]) -> bool {
        verify_hmac(&p2p.shared_secret, &[&self.peer_pair, SYN_ACK_SALT], payload)
    }
}

pub(crate) fn compute_hmac(secret: &[u8], parts: &[&[u8]]) -> [u8; HMAC_LENGTH] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

fn verify_hmac(secret: &[u8], parts: &[&[u8]], expected: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(expected).is_ok()
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum PunchState {
    /// Racing PRX-SYN toward the peer's candidate endpoints.
    Syn,
    /// Direct path won; telling the mediator to drop the relay.
    Teardown,
}

/// What the parent connection should do after a PRX-SYN-ACK.
pub struct PrxSynAckOutcome {
    /// Switch the connection's remote address to this endpoint.
    pub new_remote_address: Option<SocketAddr>,
    /// This was the first accepted PRX-SYN-ACK: adopt the punchthrough RTT
    /// state and report the P2P link as established.
    pub first_establishment: bool,
}

/// The direct-path negotiation of a P2P connection: sends (and resends)
/// PRX-SYN to both peer candidates, validates the PRX-SYN-ACK race, and
/// finally tears the mediator relay down.
///
/// Alive only while negotiation or teardown is in progress; the parent
/// connection drops it afterwards.
pub struct NatPunchthrough {
    state: PunchState,
    pub endpoints: P2pEndpoints,
    mediator_address: SocketAddr,
    mtu: usize,
    time: ConnTime,
    rto_timer: RtoTimer,
    established_to: Option<SocketAddr>,
}

impl NatPunchthrough {
    /// Starts the negotiation: sends the first PRX-SYN pair and arms the
    /// retransmission timer. `rto_timer` must route its callbacks back into
    /// this object via the parent connection.
    pub fn new(
        now: Instant,
        endpoints: P2pEndpoints,
        p2p: &P2pData,
        mediator_address: SocketAddr,
        mtu: usize,
        rto_timer: RtoTimer,
        out: &mut Vec<(SocketAddr, Vec<u8>)>,
    ) -> NatPunchthrough {
        let mut punch = NatPunchthrough {
            state: PunchState::Syn,
            endpoints,
            mediator_address,
            mtu,
            time: ConnTime::new(now),
            rto_timer,
            established_to: None,
        };

        punch.send_prx_syns(now, p2p, out);
        let rto = punch.time.rto();
        punch.rto_timer.update_rto_timeout(rto);
        punch
    }

    fn send_prx_syns(&mut self, now: Instant, p2p: &P2pData, out: &mut Vec<(SocketAddr, Vec<u8>)>) {
        let payload = self.endpoints.prx_syn_payload(p2p);
        let Some(packet) = write_control_packet(
            self.time.timestamp(now),
            MessageFlags::PRX | MessageFlags::SYN,
            0,
            &payload,
            self.mtu,
        )
        else {
            return;
        };

        trace!("sending PRX-SYN to {} and {}", self.endpoints.peer_inner, self.endpoints.peer_outer);
        out.push((self.endpoints.peer_inner, packet.clone()));
        if self.endpoints.peer_outer != self.endpoints.peer_inner {
            out.push((self.endpoints.peer_outer, packet));
        }
    }

    fn send_prx_rst(&mut self, now: Instant, out: &mut Vec<(SocketAddr, Vec<u8>)>) {
        if let Some(packet) = write_control_packet(
            self.time.timestamp(now),
            MessageFlags::PRX | MessageFlags::RST,
            0,
            &[],
            self.mtu,
        ) {
            trace!("sending PRX-RST to mediator {}", self.mediator_address);
            out.push((self.mediator_address, packet));
        }
    }

    /// Retransmission driver, called from the timer delegate. Returns the
    /// next RTO.
    pub fn on_rto_timeout(&mut self, now: Instant, p2p: &P2pData, out: &mut Vec<(SocketAddr, Vec<u8>)>) -> Duration {
        match self.state {
            PunchState::Syn => self.send_prx_syns(now, p2p, out),
            PunchState::Teardown => self.send_prx_rst(now, out),
        }
        self.time.on_rto_timeout();
        self.time.rto()
    }

    /// An authenticated PRX-SYN-ACK arrived from `from`. Decides the
    /// endpoint race: the first valid responder wins, but the inner endpoint
    /// overrides a previously accepted outer one at any time.
    pub fn got_prx_syn_ack(
        &mut self,
        now: Instant,
        from: SocketAddr,
        p2p: &P2pData,
        payload: &[u8],
        out: &mut Vec<(SocketAddr, Vec<u8>)>,
    ) -> PrxSynAckOutcome {
        let mut outcome = PrxSynAckOutcome {
            new_remote_address: None,
            first_establishment: false,
        };

        if from != self.endpoints.peer_inner && from != self.endpoints.peer_outer {
            debug!("got PRX-SYN-ACK from {}, which is no candidate endpoint - dropping", from);
            return outcome;
        }
        if !self.endpoints.validate_prx_syn_ack(p2p, payload) {
            debug!("got PRX-SYN-ACK that failed authentication - dropping");
            return outcome;
        }

        let is_inner = from == self.endpoints.peer_inner;
        match self.established_to {
            None => {
                outcome.new_remote_address = Some(from);
                outcome.first_establishment = true;
                self.established_to = Some(from);
            }
            Some(current) if is_inner && current != self.endpoints.peer_inner => {
                // the inner endpoint always wins, even late
                debug!("inner endpoint {} overrides established outer path", from);
                outcome.new_remote_address = Some(from);
                self.established_to = Some(from);
            }
            Some(_) => {}
        }

        if outcome.first_establishment {
            // direct path is up; get the relay torn down
            self.state = PunchState::Teardown;
            self.send_prx_rst(now, out);
            let rto = self.time.rto();
            self.rto_timer.force_reset_rto_timer(rto);
        }

        outcome
    }

    /// The mediator confirmed the relay teardown; the punchthrough object
    /// has served its purpose. Returns true when it should be dropped.
    pub fn got_prx_rst_ack(&mut self) -> bool {
        if self.state == PunchState::Teardown {
            self.rto_timer.deschedule();
            true
        }
        else {
            false
        }
    }

    /// The punchthrough connection timeout fired. Returns true if this means
    /// the negotiation failed (as opposed to a best-effort teardown simply
    /// giving up).
    pub fn on_connection_timeout(&mut self) -> bool {
        self.rto_timer.deschedule();
        self.state == PunchState::Syn && self.established_to.is_none()
    }

    /// Hands the direct-path RTT measurements to the parent connection.
    pub fn swap_conn_time(&mut self, conn_time: &mut ConnTime) {
        self.time.swap(conn_time);
    }

    pub fn established_to(&self) -> Option<SocketAddr> {
        self.established_to
    }
}
