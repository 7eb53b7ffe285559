//! 프로토콜 설정

use std::ops::RangeInclusive;
use std::time::Duration;

use crate::packet::HEADERS_LEN;
use crate::{Error, Result, DEFAULT_FRAGMENT_SIZE, MAX_PACKET_SIZE};

/// 한 전송의 최대 크기 (시퀀스 공간의 절반)
const MAX_TRANSFER_SIZE: usize = i32::MAX as usize;

/// rawstream 연결 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 패킷당 최대 페이로드 (바이트)
    pub fragment_size: usize,

    /// 송신 윈도우 크기 (프래그먼트 수)
    pub window_fragments: usize,

    /// 재전송 타임아웃 초기값 (밀리초)
    /// 타임아웃마다 두 배로 증가
    pub initial_time_limit_ms: u64,

    /// 백오프 최대 시도 횟수
    pub max_attempts: u32,

    /// 수신 태스크 소켓 읽기 타임아웃 (밀리초)
    /// 정지 신호를 빠르게 감지하기 위해 짧게 유지
    pub read_timeout_ms: u64,

    /// 포그라운드 루프 큐 대기 간격 (밀리초)
    pub poll_interval_ms: u64,

    /// 한 번의 전송으로 보낼 수 있는 최대 바이트
    /// 32비트 시퀀스 공간의 절반을 넘으면 상대 오프셋이 모호해짐
    pub max_transfer_size: usize,

    /// 임시 포트 범위
    pub ephemeral_ports: RangeInclusive<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            window_fragments: 20,
            initial_time_limit_ms: 250,
            max_attempts: 10,
            read_timeout_ms: 10,
            poll_interval_ms: 1,
            max_transfer_size: MAX_TRANSFER_SIZE,
            ephemeral_ports: 49152..=65535,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 초기 재전송 타임아웃
    pub fn initial_time_limit(&self) -> Duration {
        Duration::from_millis(self.initial_time_limit_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// 송신 윈도우 크기 (바이트), 넘치면 usize::MAX
    pub fn window_bytes(&self) -> usize {
        self.fragment_size.saturating_mul(self.window_fragments)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.fragment_size == 0 || self.fragment_size > MAX_PACKET_SIZE - HEADERS_LEN {
            return Err(Error::InvalidConfig(format!(
                "fragment_size {}: 1..={} 범위여야 함",
                self.fragment_size,
                MAX_PACKET_SIZE - HEADERS_LEN
            )));
        }
        if self.window_fragments == 0 {
            return Err(Error::InvalidConfig("window_fragments는 0일 수 없음".into()));
        }
        if self.initial_time_limit_ms == 0 || self.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "initial_time_limit_ms, max_attempts는 0일 수 없음".into(),
            ));
        }
        if self.read_timeout_ms == 0 || self.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "read_timeout_ms, poll_interval_ms는 0일 수 없음".into(),
            ));
        }
        if self.max_transfer_size == 0 || self.max_transfer_size > MAX_TRANSFER_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_transfer_size {}: 1..={} 범위여야 함",
                self.max_transfer_size, MAX_TRANSFER_SIZE
            )));
        }
        if self.ephemeral_ports.is_empty() || *self.ephemeral_ports.start() == 0 {
            return Err(Error::InvalidConfig("ephemeral_ports 범위가 비어 있음".into()));
        }
        Ok(())
    }

    /// 저지연 네트워크용 설정 (루프백, LAN)
    pub fn low_latency() -> Self {
        Self {
            window_fragments: 32,
            initial_time_limit_ms: 50,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn lossy_network() -> Self {
        Self {
            fragment_size: 512,               // 작은 프래그먼트
            window_fragments: 8,
            initial_time_limit_ms: 500,
            ..Self::default()
        }
    }
}
