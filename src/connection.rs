//! 연결 상태 기계
//!
//! - `Transport`: 네트워크, 포트 테이블, 설정을 묶은 공유 컨텍스트. listen / dial
//! - `Connection`: 한 실행 컨텍스트가 독점하는 연결. accept / send / recv / close
//!
//! 연결 간에 공유되는 상태는 포트 테이블뿐이다. 수신 태스크와는 디코딩된
//! 패킷 채널로만 통신하고, 시퀀스/버퍼 상태는 포그라운드만 만진다.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::address::parse_address;
use crate::backoff::Backoff;
use crate::packet::{flags, Packet, PacketFilter};
use crate::ports::{MemoryPortTable, PortTable};
use crate::receiver::ReceiverTask;
use crate::socket::{Network, RawNetwork, RawSocket};
use crate::state::ConnectionState;
use crate::stats::ConnectionStats;
use crate::{Config, Error, Result};

/// 리스너가 기억하는 응답한 SYN 수
const ANSWERED_SYN_MEMORY: usize = 64;

struct Shared<N> {
    network: N,
    ports: Arc<dyn PortTable>,
    config: Config,
}

/// 전송 컨텍스트 (clone은 같은 컨텍스트를 공유)
pub struct Transport<N: Network> {
    shared: Arc<Shared<N>>,
}

impl<N: Network> Clone for Transport<N> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Transport<RawNetwork> {
    /// 커널 raw 소켓 + 프로세스 내 포트 테이블
    pub fn raw(local_ip: Ipv4Addr, config: Config) -> Result<Self> {
        let ports = Arc::new(MemoryPortTable::new(config.ephemeral_ports.clone()));
        Self::new(RawNetwork::new(local_ip), ports, config)
    }
}

impl<N: Network> Transport<N> {
    pub fn new(network: N, ports: Arc<dyn PortTable>, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                network,
                ports,
                config,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn network(&self) -> &N {
        &self.shared.network
    }

    pub fn ports(&self) -> &dyn PortTable {
        self.shared.ports.as_ref()
    }

    /// 소켓 열기. 실패하면 방금 잡은 포트를 돌려놓음
    fn open_socket(&self, port: u16) -> Result<Arc<N::Socket>> {
        match self.shared.network.open() {
            Ok(socket) => Ok(Arc::new(socket)),
            Err(e) => {
                if let Err(release) = self.shared.ports.release(port) {
                    warn!("포트 {} 해제 실패: {}", port, release);
                }
                Err(e.into())
            }
        }
    }

    /// 포트를 예약하고 LISTENING 연결 반환. 포트 0이면 임시 포트 할당
    pub async fn listen(&self, address: &str) -> Result<Connection<N>> {
        let requested = parse_address(address)?;
        let ip = if requested.ip().is_unspecified() {
            self.shared.network.local_ip()
        } else {
            *requested.ip()
        };

        let port = match requested.port() {
            0 => self.shared.ports.allocate()?,
            port => {
                self.shared.ports.reserve(port)?;
                port
            }
        };
        let socket = self.open_socket(port)?;
        let local = SocketAddrV4::new(ip, port);

        info!("LISTEN {}", local);
        Ok(Connection::new(
            self.clone(),
            socket,
            local,
            None,
            ConnectionState::Listening,
            0,
            0,
        ))
    }

    /// 능동 연결. 백오프가 소진될 때까지 응답이 없으면 `DialFailed`
    pub async fn dial(&self, address: &str) -> Result<Connection<N>> {
        let remote = parse_address(address)?;
        let port = self.shared.ports.allocate()?;
        let socket = self.open_socket(port)?;
        let local = SocketAddrV4::new(self.shared.network.local_ip(), port);

        let isn: u32 = rand::random();
        let mut conn = Connection::new(
            self.clone(),
            socket,
            local,
            Some(remote),
            ConnectionState::SynSent,
            isn,
            0,
        );
        info!("DIAL {} -> {}", local, remote);

        let syn = conn.segment(remote, isn, 0, flags::SYN, Bytes::new());
        let expected_ack = isn.wrapping_add(1);
        let reply = conn
            .handshake(&syn, PacketFilter::port(port), |packet| {
                packet.has(flags::SYN | flags::ACK) && packet.ack == expected_ack
            })
            .await?;

        let Some(reply) = reply else {
            warn!("연결 수립 실패: {} 응답 없음", remote);
            conn.state = ConnectionState::Closed;
            conn.release_port()?;
            return Err(Error::DialFailed { addr: remote });
        };

        // 주소 변환을 거쳤을 수 있으므로 실제 응답 출처로 재바인딩
        let peer = reply.source;
        conn.peer = Some(peer);
        conn.seq = expected_ack;
        conn.ack = reply.seq.wrapping_add(1);
        conn.state = ConnectionState::Established;

        let ack = conn.segment(peer, conn.seq, conn.ack, flags::ACK, Bytes::new());
        conn.transmit(&ack).await?;
        conn.stats.acks_sent += 1;

        info!("ESTABLISHED {} <-> {}", local, peer);
        Ok(conn)
    }
}

/// 단일 연결
pub struct Connection<N: Network> {
    transport: Transport<N>,
    socket: Arc<N::Socket>,
    pub(crate) state: ConnectionState,
    pub(crate) fragment_size: usize,

    /// 송신 시퀀스 (다음에 보낼 스트림 위치)
    pub(crate) seq: u32,

    /// 수신 확인 (다음에 기대하는 스트림 위치)
    pub(crate) ack: u32,

    local: SocketAddrV4,
    pub(crate) peer: Option<SocketAddrV4>,

    /// 마지막 연산이 남긴 백오프 상태
    pub(crate) backoff: Backoff,

    /// 순서대로 도착했지만 아직 읽지 않은 바이트
    pub(crate) recv_buffer: BytesMut,

    pub(crate) stats: ConnectionStats,

    /// 리스너 전용: 최근 응답한 (peer, SYN seq)
    answered: VecDeque<(SocketAddrV4, u32)>,

    port_held: bool,
}

impl<N: Network> Connection<N> {
    fn new(
        transport: Transport<N>,
        socket: Arc<N::Socket>,
        local: SocketAddrV4,
        peer: Option<SocketAddrV4>,
        state: ConnectionState,
        seq: u32,
        ack: u32,
    ) -> Self {
        let fragment_size = transport.config().fragment_size;
        let backoff = Backoff::from_config(transport.config());
        Self {
            fragment_size,
            backoff,
            transport,
            socket,
            state,
            seq,
            ack,
            local,
            peer,
            recv_buffer: BytesMut::new(),
            stats: ConnectionStats::new(),
            answered: VecDeque::new(),
            port_held: true,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.peer
    }

    /// 송신 시퀀스
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// 수신 확인 위치
    pub fn ack(&self) -> u32 {
        self.ack
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// 현재 재전송 타임아웃
    pub fn time_limit(&self) -> Duration {
        self.backoff.time_limit()
    }

    /// 읽지 않은 버퍼 바이트 수
    pub fn buffered(&self) -> usize {
        self.recv_buffer.len()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub(crate) fn config(&self) -> &Config {
        self.transport.config()
    }

    /// ESTABLISHED가 아니면 `NotConnected`, 맞으면 상대 주소
    pub(crate) fn require_established(&self) -> Result<SocketAddrV4> {
        match (self.state, self.peer) {
            (ConnectionState::Established, Some(peer)) => Ok(peer),
            _ => Err(Error::NotConnected),
        }
    }

    /// 이 연결에서 나가는 패킷
    pub(crate) fn segment(
        &self,
        peer: SocketAddrV4,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: Bytes,
    ) -> Packet {
        Packet::new(self.local, peer, seq, ack, flags, payload)
    }

    pub(crate) async fn transmit(&self, packet: &Packet) -> Result<()> {
        self.socket
            .send_to(&packet.encode(), *packet.destination.ip())
            .await?;
        Ok(())
    }

    /// 수립된 세션의 패킷만 받는 수신 태스크
    pub(crate) fn session_receiver(&self, peer: SocketAddrV4) -> ReceiverTask {
        self.spawn_receiver(PacketFilter::session(self.local.port(), peer))
    }

    fn spawn_receiver(&self, filter: PacketFilter) -> ReceiverTask {
        ReceiverTask::spawn(self.socket.clone(), filter, self.config().read_timeout())
    }

    /// 핸드쉐이크 ACK가 유실되어 상대가 SYN-ACK를 재전송한 경우 ACK 재전송
    pub(crate) async fn answer_stray_syn(&mut self, packet: &Packet) -> Result<()> {
        let Some(peer) = self.peer else {
            return Ok(());
        };
        if !packet.has(flags::SYN | flags::ACK) {
            return Ok(());
        }

        debug!("SYN-ACK 재수신: 핸드쉐이크 ACK 재전송 -> {}", peer);
        let ack = self.segment(peer, self.seq, packet.seq.wrapping_add(1), flags::ACK, Bytes::new());
        self.transmit(&ack).await?;
        self.stats.acks_sent += 1;
        Ok(())
    }

    /// 요청 패킷을 보내고 검증된 응답을 기다림. 백오프 소진 시 `None`
    async fn handshake(
        &mut self,
        request: &Packet,
        filter: PacketFilter,
        validate: impl Fn(&Packet) -> bool,
    ) -> Result<Option<Packet>> {
        let poll = self.config().poll_interval();
        let mut backoff = Backoff::from_config(self.config());
        let mut task = self.spawn_receiver(filter);

        self.transmit(request).await?;
        let mut timer = Instant::now();

        let reply = loop {
            if let Some(packet) = task.next_within(poll).await {
                if validate(&packet) {
                    break Some(packet);
                }
                debug!(
                    "핸드쉐이크 중 무시: {} flags={:#04x} ack={}",
                    packet.source, packet.flags, packet.ack
                );
            }

            if timer.elapsed() > backoff.time_limit() {
                self.stats.timeouts += 1;
                let Some(next) = backoff.escalate() else {
                    break None;
                };
                backoff = next;
                warn!(
                    "핸드쉐이크 재전송 -> {} (시도 {}, 제한 {:?})",
                    request.destination,
                    backoff.attempts(),
                    backoff.time_limit()
                );
                self.transmit(request).await?;
                timer = Instant::now();
            }
        };

        task.stop().await;
        self.backoff = match reply {
            Some(_) => backoff.reset(),
            None => backoff,
        };
        Ok(reply)
    }

    /// 다음 연결 수락. SYN이 올 때까지 기한 없이 대기
    ///
    /// 핸드쉐이크가 실패하면 반쯤 열린 연결을 정리하고 다시 대기한다.
    pub async fn accept(&mut self) -> Result<Connection<N>> {
        if self.state != ConnectionState::Listening {
            return Err(Error::NotListening);
        }

        loop {
            let syn = self.wait_for_syn().await;
            if let Some(conn) = self.respond(syn).await? {
                return Ok(conn);
            }
        }
    }

    async fn wait_for_syn(&mut self) -> Packet {
        let wait = self.config().read_timeout();
        let mut task = self.spawn_receiver(PacketFilter::port(self.local.port()));

        loop {
            let Some(packet) = task.next_within(wait).await else {
                continue;
            };
            if !packet.has(flags::SYN) || packet.has(flags::ACK) {
                continue;
            }
            if self.answered.contains(&(packet.source, packet.seq)) {
                debug!("이미 응답한 SYN 재전송 무시: {}", packet.source);
                continue;
            }

            task.stop().await;
            return packet;
        }
    }

    /// SYN에 새 포트에서 SYN-ACK로 응답. 핸드쉐이크 실패 시 `None`
    async fn respond(&mut self, syn: Packet) -> Result<Option<Connection<N>>> {
        let transport = self.transport.clone();
        let port = transport.shared.ports.allocate()?;
        let socket = transport.open_socket(port)?;

        let peer = syn.source;
        self.answered.push_back((peer, syn.seq));
        if self.answered.len() > ANSWERED_SYN_MEMORY {
            self.answered.pop_front();
        }

        let local = SocketAddrV4::new(*self.local.ip(), port);
        let isn: u32 = rand::random();
        let mut conn = Connection::new(
            transport,
            socket,
            local,
            Some(peer),
            ConnectionState::SynReceived,
            isn,
            syn.seq.wrapping_add(1),
        );
        info!("SYN 수신: {} -> {}", peer, local);

        let syn_ack = conn.segment(peer, isn, conn.ack, flags::SYN | flags::ACK, Bytes::new());
        let expected_ack = isn.wrapping_add(1);

        // 핸드쉐이크 ACK 또는 ACK가 유실된 경우의 첫 데이터 세그먼트
        let reply = conn
            .handshake(&syn_ack, PacketFilter::session(port, peer), |packet| {
                !packet.has(flags::SYN) && packet.ack == expected_ack
            })
            .await?;

        if reply.is_none() {
            warn!("핸드쉐이크 실패: {} 응답 없음, 리스닝 재개", peer);
            conn.close().await?;
            return Ok(None);
        }

        conn.seq = expected_ack;
        conn.state = ConnectionState::Established;
        info!("ESTABLISHED {} <-> {}", local, peer);
        Ok(Some(conn))
    }

    /// 연결 종료
    ///
    /// 상대가 있으면 확인 없는 FIN 하나를 보내고 포트를 해제한다.
    pub async fn close(mut self) -> Result<()> {
        if let Some(peer) = self.peer {
            let fin = self.segment(peer, self.seq, self.ack, flags::FIN, Bytes::new());
            if let Err(e) = self.transmit(&fin).await {
                warn!("FIN 전송 실패: {}", e);
            }
        }

        self.state = ConnectionState::Closed;
        info!("CLOSE {} | {}", self.local, self.stats.summary());
        self.release_port()
    }

    fn release_port(&mut self) -> Result<()> {
        if !self.port_held {
            return Ok(());
        }
        self.port_held = false;
        self.transport.shared.ports.release(self.local.port())
    }

    /// 버퍼 앞에서 최대 `length` 바이트
    pub(crate) fn take_buffered(&mut self, length: usize) -> Bytes {
        let n = length.min(self.recv_buffer.len());
        self.recv_buffer.split_to(n).freeze()
    }
}

impl<N: Network> Drop for Connection<N> {
    /// close 없이 버려진 연결의 포트 회수
    fn drop(&mut self) {
        if let Err(e) = self.release_port() {
            warn!("포트 {} 해제 실패: {}", self.local.port(), e);
        }
    }
}
