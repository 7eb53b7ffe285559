//! # rawstream
//!
//! raw IP 패킷 위에서 동작하는 신뢰성 있는 순서 보장 바이트 스트림 전송
//!
//! ## 핵심 특징
//! - **3-way 핸드쉐이크**: SYN / SYN-ACK / ACK, 수락마다 새 임시 포트
//! - **슬라이딩 윈도우**: 누적 ACK, 구멍은 RST+ACK로 재동기화
//! - **지수 백오프**: 타임아웃마다 두 배, 상한에서 포기
//! - **수신 태스크**: 연산마다 소켓을 읽는 백그라운드 태스크 + 채널
//! - **포트 테이블**: 주입 가능한 바인딩 관리 (메모리 / 파일)
//! - **메모리 네트워크**: 손실/중복을 주입하는 시뮬레이션 (테스트용)
//!
//! ```no_run
//! # async fn run() -> rawstream::Result<()> {
//! use std::net::Ipv4Addr;
//! use rawstream::{Config, Transport};
//!
//! let transport = Transport::raw(Ipv4Addr::new(10, 0, 0, 1), Config::default())?;
//! let mut conn = transport.dial("10.0.0.2:80").await?;
//! conn.send(b"hello").await?;
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod packet;
pub mod ports;
mod reader;
pub mod receiver;
mod sender;
pub mod sim;
pub mod socket;
pub mod state;
pub mod stats;

pub use address::parse_address;
pub use backoff::Backoff;
pub use config::Config;
pub use connection::{Connection, Transport};
pub use error::{Error, Result};
pub use packet::{Packet, PacketFilter};
pub use ports::{FilePortTable, MemoryPortTable, PortTable};
pub use receiver::ReceiverTask;
pub use sim::{FaultModel, MemoryNetwork};
pub use socket::{Network, RawNetwork, RawSocket};
pub use state::ConnectionState;
pub use stats::ConnectionStats;

/// 기본 프래그먼트 크기 (바이트)
pub const DEFAULT_FRAGMENT_SIZE: usize = 1024;

/// IP 패킷 최대 크기 (바이트)
pub const MAX_PACKET_SIZE: usize = 65535;

/// raw 소켓 연결
pub type RawConnection = Connection<RawNetwork>;
