//! 재전송 백오프 정책
//!
//! 타임아웃마다 시간 제한을 두 배로 늘리고, 시도 횟수가 상한에 도달하면 소진.
//! 값 타입이라 루프마다 새 상태를 돌려받는다.

use std::time::Duration;

use crate::Config;

/// 백오프 상태 (time_limit, attempts)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    quantum: Duration,
    time_limit: Duration,
    attempts: u32,
    ceiling: u32,
}

impl Backoff {
    pub fn new(quantum: Duration, ceiling: u32) -> Self {
        Self {
            quantum,
            time_limit: quantum,
            attempts: 0,
            ceiling,
        }
    }

    /// 설정값으로 생성
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.initial_time_limit(), config.max_attempts)
    }

    /// 현재 재전송 타임아웃
    pub fn time_limit(&self) -> Duration {
        self.time_limit
    }

    /// 연속 타임아웃 횟수
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.ceiling
    }

    /// 타임아웃 발생: 두 배로 늘린 상태 반환, 상한 도달 시 `None`
    pub fn escalate(self) -> Option<Self> {
        let next = Self {
            time_limit: self.time_limit.saturating_mul(2),
            attempts: self.attempts + 1,
            ..self
        };

        if next.is_exhausted() {
            None
        } else {
            Some(next)
        }
    }

    /// 진행이 관측되면 초기 상태로
    pub fn reset(self) -> Self {
        Self::new(self.quantum, self.ceiling)
    }
}
