//! 에러 타입 정의

use std::net::SocketAddrV4;

use thiserror::Error;

/// rawstream 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("포트 테이블 저장 에러: {0}")]
    Persistence(#[from] bincode::Error),

    #[error("연결 수립 실패: {addr}")]
    DialFailed { addr: SocketAddrV4 },

    #[error("사용 가능한 포트 없음")]
    NoPortAvailable,

    #[error("포트 {port} 이미 사용 중")]
    PortOccupied { port: u16 },

    #[error("포트 {port} 바인딩되지 않음")]
    PortNotBound { port: u16 },

    #[error("유효하지 않은 주소: {0}")]
    InvalidAddress(String),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("LISTENING 상태가 아님")]
    NotListening,

    #[error("연결되지 않음")]
    NotConnected,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
