//! 패킷 코덱
//!
//! 고정 20바이트 IP 헤더 + 고정 20바이트 전송 헤더 + 페이로드.
//! 옵션은 쓰지도 해석하지도 않음.
//!
//! ```text
//!  0               1               2               3
//! +---------------+---------------+-------------------------------+
//! |  Ver=4 IHL=5  |      TOS      |          Total Length         |
//! |        Identification         |     Flags / Frag Offset       |
//! |    TTL=255    |  Proto=255    |      Header Checksum (0)      |
//! |                       Source Address                          |
//! |                    Destination Address                        |
//! +---------------+---------------+-------------------------------+
//! |          Source Port          |       Destination Port        |
//! |                        Sequence Number                        |
//! |                    Acknowledgment Number                      |
//! |  Offset=5     |     Flags     |            Window             |
//! |           Checksum            |        Urgent Pointer         |
//! +---------------+---------------+-------------------------------+
//! |                          Payload ...                          |
//! ```
//!
//! 체크섬은 이 구현끼리만 맞는 내부 규약이다: 의사 헤더(0, 프로토콜, 세그먼트 길이)
//! + 헤더(체크섬 0) + 페이로드를 리틀엔디안 16비트 워드로 더하고, 캐리를 접고,
//! 보수를 취한 뒤 두 바이트를 뒤바꾼다. 커널 TCP 스택과는 호환되지 않음.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// 플래그 비트
pub mod flags {
    pub const FIN: u8 = 1 << 0;
    pub const SYN: u8 = 1 << 1;
    pub const RST: u8 = 1 << 2;
    pub const PSH: u8 = 1 << 3;
    pub const ACK: u8 = 1 << 4;
    pub const URG: u8 = 1 << 5;
}

/// IP 헤더 길이 (옵션 없음)
pub const IP_HEADER_LEN: usize = 20;

/// 전송 헤더 길이 (옵션 없음)
pub const SEGMENT_HEADER_LEN: usize = 20;

/// 전체 헤더 길이
pub const HEADERS_LEN: usize = IP_HEADER_LEN + SEGMENT_HEADER_LEN;

/// 패킷 하나에 담을 수 있는 최대 페이로드
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - HEADERS_LEN;

/// IP 프로토콜 번호 (IPPROTO_RAW)
pub const PROTOCOL_ID: u8 = 255;

pub const TTL: u8 = 255;

/// IP Identification 필드 고정값
pub const IP_IDENTIFICATION: u16 = 54321;

/// 광고 윈도우 고정값
pub const ADVERTISED_WINDOW: u16 = 5840;

const VERSION_IHL: u8 = (4 << 4) | 5;
const DATA_OFFSET: u8 = 5 << 4;

// 전송 헤더 내 체크섬 위치
const OFF_CHECKSUM: usize = 16;

/// 디코딩된 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: Bytes,
}

impl Packet {
    /// 새 패킷 생성 (광고 윈도우는 고정값)
    pub fn new(
        source: SocketAddrV4,
        destination: SocketAddrV4,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: Bytes,
    ) -> Self {
        Self {
            source,
            destination,
            seq,
            ack,
            flags,
            window: ADVERTISED_WINDOW,
            payload,
        }
    }

    /// 플래그 포함 여부
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    /// 와이어 바이트로 인코딩
    ///
    /// 페이로드는 `MAX_PAYLOAD_LEN` 이하여야 한다 (IP 전체 길이가 16비트).
    pub fn encode(&self) -> Bytes {
        debug_assert!(
            self.payload.len() <= MAX_PAYLOAD_LEN,
            "페이로드 {} bytes: 최대 {}",
            self.payload.len(),
            MAX_PAYLOAD_LEN
        );
        let total_len = HEADERS_LEN + self.payload.len();
        let mut buf = BytesMut::with_capacity(total_len);

        buf.put_u8(VERSION_IHL);
        buf.put_u8(0);
        buf.put_u16(total_len as u16);
        buf.put_u16(IP_IDENTIFICATION);
        buf.put_u16(0);
        buf.put_u8(TTL);
        buf.put_u8(PROTOCOL_ID);
        buf.put_u16(0); // 커널이 채움
        buf.put_slice(&self.source.ip().octets());
        buf.put_slice(&self.destination.ip().octets());

        let header = self.segment_header(0);
        let checksum = segment_checksum(PROTOCOL_ID, &header, &self.payload);
        buf.put_slice(&self.segment_header(checksum));
        buf.put_slice(&self.payload);

        buf.freeze()
    }

    fn segment_header(&self, checksum: u16) -> [u8; SEGMENT_HEADER_LEN] {
        let mut header = [0u8; SEGMENT_HEADER_LEN];
        let mut out = &mut header[..];
        out.put_u16(self.source.port());
        out.put_u16(self.destination.port());
        out.put_u32(self.seq);
        out.put_u32(self.ack);
        out.put_u8(DATA_OFFSET);
        out.put_u8(self.flags);
        out.put_u16(self.window);
        out.put_u16(checksum);
        out.put_u16(0);
        header
    }

    /// 고정 헤더 파싱 + 체크섬 검증 (엔드포인트 필터 없음)
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADERS_LEN {
            return None;
        }

        let mut ip = &bytes[..IP_HEADER_LEN];
        if ip.get_u8() >> 4 != 4 {
            return None;
        }
        ip.advance(1);
        let total_len = ip.get_u16() as usize;
        if total_len < HEADERS_LEN || total_len > bytes.len() {
            return None;
        }
        ip.advance(5); // identification, fragment, ttl
        let protocol = ip.get_u8();
        ip.advance(2);
        let source_ip = Ipv4Addr::from(ip.get_u32());
        let destination_ip = Ipv4Addr::from(ip.get_u32());

        let mut header = [0u8; SEGMENT_HEADER_LEN];
        header.copy_from_slice(&bytes[IP_HEADER_LEN..HEADERS_LEN]);
        let payload = &bytes[HEADERS_LEN..total_len];

        let mut seg = &header[..];
        let source_port = seg.get_u16();
        let destination_port = seg.get_u16();
        let seq = seg.get_u32();
        let ack = seg.get_u32();
        seg.advance(1);
        let flags = seg.get_u8();
        let window = seg.get_u16();
        let stored = seg.get_u16();

        header[OFF_CHECKSUM] = 0;
        header[OFF_CHECKSUM + 1] = 0;
        if segment_checksum(protocol, &header, payload) != stored {
            return None;
        }

        Some(Self {
            source: SocketAddrV4::new(source_ip, source_port),
            destination: SocketAddrV4::new(destination_ip, destination_port),
            seq,
            ack,
            flags,
            window,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// 파싱 후 연결 필터 적용. 잘못되었거나 다른 연결의 패킷은 `None`
    pub fn decode(bytes: &[u8], filter: &PacketFilter) -> Option<Self> {
        Self::parse(bytes).filter(|packet| filter.accepts(packet))
    }
}

/// 연결 단위 수신 필터
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketFilter {
    /// 로컬 바인딩 포트
    pub local_port: u16,

    /// 수립된 세션의 상대 엔드포인트
    pub peer: Option<SocketAddrV4>,
}

impl PacketFilter {
    /// 목적지 포트만 확인 (핸드쉐이크 대기)
    pub fn port(local_port: u16) -> Self {
        Self {
            local_port,
            peer: None,
        }
    }

    /// 목적지 포트 + 상대 주소/포트 확인
    pub fn session(local_port: u16, peer: SocketAddrV4) -> Self {
        Self {
            local_port,
            peer: Some(peer),
        }
    }

    pub fn accepts(&self, packet: &Packet) -> bool {
        packet.destination.port() == self.local_port
            && self.peer.map_or(true, |peer| packet.source == peer)
    }
}

/// 1의 보수 체크섬 (내부 바이트 순서 규약)
pub fn checksum(data: &[u8]) -> u16 {
    finish(accumulate(0, data))
}

fn segment_checksum(protocol: u8, header: &[u8; SEGMENT_HEADER_LEN], payload: &[u8]) -> u16 {
    let segment_len = (SEGMENT_HEADER_LEN + payload.len()) as u16;
    let [len_hi, len_lo] = segment_len.to_be_bytes();
    let pseudo = [0, protocol, len_hi, len_lo];

    // 의사 헤더와 헤더는 짝수 길이라 워드 경계가 이어짐
    let sum = accumulate(0, &pseudo);
    let sum = accumulate(sum, header);
    finish(accumulate(sum, payload))
}

fn accumulate(mut sum: u64, data: &[u8]) -> u64 {
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u64::from(u16::from_le_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u64::from(*last);
    }
    sum
}

fn finish(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    (!(sum as u16)).swap_bytes()
}
