//! Raw IP 소켓 계층
//!
//! - `RawSocket`: IP 헤더를 포함한 패킷을 주고받는 소켓 핸들
//! - `Network`: 호스트에서 소켓 핸들을 여는 팩토리
//!
//! raw 소켓은 호스트로 들어오는 모든 패킷을 각 핸들이 복사해 받는다.
//! 어느 연결의 패킷인지는 코덱의 포트 필터가 고른다.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::packet::PROTOCOL_ID;

/// 패킷 단위 raw 소켓
pub trait RawSocket: Send + Sync + 'static {
    /// 바인딩된 로컬 IP
    fn local_ip(&self) -> Ipv4Addr;

    /// IP 헤더 포함 패킷 전송
    fn send_to<'a>(
        &'a self,
        packet: &'a [u8],
        dest: Ipv4Addr,
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a;

    /// IP 헤더 포함 패킷 수신, 송신자 IP 반환
    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<(usize, Ipv4Addr)>> + Send + 'a;
}

/// 소켓 팩토리
pub trait Network: Send + Sync + 'static {
    type Socket: RawSocket;

    /// 이 호스트의 IP
    fn local_ip(&self) -> Ipv4Addr;

    /// 새 소켓 핸들 열기
    fn open(&self) -> io::Result<Self::Socket>;
}

/// 커널 raw 소켓 네트워크
#[derive(Debug, Clone)]
pub struct RawNetwork {
    local_ip: Ipv4Addr,
}

impl RawNetwork {
    pub fn new(local_ip: Ipv4Addr) -> Self {
        Self { local_ip }
    }
}

impl Network for RawNetwork {
    type Socket = RawIpSocket;

    fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    fn open(&self) -> io::Result<RawIpSocket> {
        RawIpSocket::open(self.local_ip)
    }
}

/// AF_INET / SOCK_RAW / IPPROTO_RAW 소켓
///
/// IPPROTO_RAW는 IP_HDRINCL을 함의하므로 코덱이 만든 IP 헤더가 그대로 나간다.
/// CAP_NET_RAW 권한 필요.
#[derive(Debug)]
pub struct RawIpSocket {
    inner: UdpSocket,
    local_ip: Ipv4Addr,
}

impl RawIpSocket {
    /// 소켓 생성. tokio 런타임 안에서 호출해야 함
    pub fn open(local_ip: Ipv4Addr) -> io::Result<Self> {
        let socket = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(i32::from(PROTOCOL_ID))),
        )?;

        if !local_ip.is_unspecified() {
            let addr = SocketAddr::V4(SocketAddrV4::new(local_ip, 0));
            socket.bind(&addr.into())?;
        }
        socket.set_nonblocking(true)?;

        // 데이터그램 소켓과 같은 방식으로 tokio 리액터에 등록
        let inner = UdpSocket::from_std(socket.into())?;
        debug!("raw 소켓 열림: {}", local_ip);

        Ok(Self { inner, local_ip })
    }
}

impl RawSocket for RawIpSocket {
    fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    fn send_to<'a>(
        &'a self,
        packet: &'a [u8],
        dest: Ipv4Addr,
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        async move { self.inner.send_to(packet, SocketAddrV4::new(dest, 0)).await }
    }

    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<(usize, Ipv4Addr)>> + Send + 'a {
        async move {
            match self.inner.recv_from(buf).await? {
                (len, SocketAddr::V4(source)) => Ok((len, *source.ip())),
                (_, SocketAddr::V6(source)) => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("IPv6 송신자: {}", source),
                )),
            }
        }
    }
}
