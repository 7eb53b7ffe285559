//! 통합 테스트 공용 도우미

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::mpsc;

use rawstream::packet::flags;
use rawstream::sim::{Captured, MemoryHost};
use rawstream::{Config, Connection, MemoryNetwork, MemoryPortTable, Packet, Transport};

pub const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

pub type Conn = Connection<MemoryHost>;

/// 메모리 네트워크 위의 두 호스트
pub struct Pair {
    pub net: MemoryNetwork,
    pub client: Transport<MemoryHost>,
    pub server: Transport<MemoryHost>,
    pub client_ports: Arc<MemoryPortTable>,
    pub server_ports: Arc<MemoryPortTable>,
}

pub fn setup(config: Config) -> Pair {
    let net = MemoryNetwork::new();
    let client_ports = Arc::new(MemoryPortTable::new(config.ephemeral_ports.clone()));
    let server_ports = Arc::new(MemoryPortTable::new(config.ephemeral_ports.clone()));

    let client = Transport::new(net.host(CLIENT), client_ports.clone(), config.clone()).unwrap();
    let server = Transport::new(net.host(SERVER), server_ports.clone(), config).unwrap();

    Pair {
        net,
        client,
        server,
        client_ports,
        server_ports,
    }
}

/// 빠른 재전송 설정
pub fn fast_config() -> Config {
    Config {
        initial_time_limit_ms: 20,
        ..Config::default()
    }
}

/// 금방 포기하는 설정
pub fn impatient_config() -> Config {
    Config {
        initial_time_limit_ms: 1,
        max_attempts: 4,
        ..Config::default()
    }
}

/// 리스너를 열고 연결. (listener, client, server) 반환
pub async fn connect(pair: &Pair, port: u16) -> (Conn, Conn, Conn) {
    let mut listener = pair.server.listen(&format!("{}:{}", SERVER, port)).await.unwrap();
    let accept = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        (listener, conn)
    });

    let client = pair.client.dial(&format!("{}:{}", SERVER, port)).await.unwrap();
    let (listener, server) = accept.await.unwrap();
    (listener, client, server)
}

/// 클라이언트가 보내는 동안 서버가 `total` 바이트를 모을 때까지 읽음
pub async fn transfer(client: Conn, server: &mut Conn, data: Vec<u8>) -> (Conn, usize, Vec<u8>) {
    let total = data.len();
    let sender = tokio::spawn(async move {
        let mut client = client;
        let sent = client.send(&data).await.unwrap();
        (client, sent)
    });

    let received = read_exact(server, total).await;
    let (client, sent) = sender.await.unwrap();
    (client, sent, received)
}

/// 짧은 읽기가 나와도 `total`까지 반복, 빈 결과가 연속되면 중단
pub async fn read_exact(conn: &mut Conn, total: usize) -> Vec<u8> {
    let mut received = Vec::new();
    let mut empty_reads = 0;
    while received.len() < total && empty_reads < 3 {
        let chunk = conn.recv(total - received.len()).await.unwrap();
        if chunk.is_empty() {
            empty_reads += 1;
        }
        received.extend_from_slice(&chunk);
    }
    received
}

/// 0..len 패턴 데이터
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// 지금까지 탭에 쌓인 패킷
pub fn captured(tap: &mut mpsc::UnboundedReceiver<Captured>) -> Vec<(Captured, Packet)> {
    let mut packets = Vec::new();
    while let Ok(capture) = tap.try_recv() {
        if let Some(packet) = Packet::parse(&capture.bytes) {
            packets.push((capture, packet));
        }
    }
    packets
}

/// 원시 바이트에서 조건 검사
pub fn matches(bytes: &[u8], check: impl Fn(&Packet) -> bool) -> bool {
    Packet::parse(bytes).map_or(false, |packet| check(&packet))
}

pub fn is_data(packet: &Packet) -> bool {
    !packet.payload.is_empty() && !packet.has(flags::ACK)
}
