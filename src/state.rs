//! 연결 상태
//!
//! ```text
//!  CLOSED ──listen──▶ LISTENING ──SYN 수신──▶ (새 연결) SYN_RECEIVED ──ACK──▶ ESTABLISHED
//!  CLOSED ──dial────▶ SYN_SENT ──SYN-ACK──▶ ESTABLISHED
//!  * ──close──▶ CLOSED
//! ```
//! 리스너는 SYN을 받아도 LISTENING을 유지하고, 핸드쉐이크는 새 포트의 새 연결이 진행한다.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Listening,
    /// SYN 전송, SYN-ACK 대기
    SynSent,
    /// SYN-ACK 전송, ACK 대기
    SynReceived,
    Established,
}

impl ConnectionState {
    /// 데이터 송수신 가능 여부
    pub fn is_established(self) -> bool {
        self == Self::Established
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::Listening => "LISTENING",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
        };
        f.write_str(name)
    }
}
