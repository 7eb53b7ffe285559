//! 연결 통계

use std::time::{Duration, Instant};

/// 연결 단위 전송 통계
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub start_time: Instant,

    /// 전송한 데이터 세그먼트 수 (재전송 포함)
    pub segments_sent: u64,

    /// 재전송 세그먼트 수
    pub retransmitted_segments: u64,

    /// 상대가 확인한 송신 바이트
    pub bytes_sent: u64,

    /// 순서대로 받아들인 수신 바이트
    pub bytes_received: u64,

    pub acks_sent: u64,
    pub acks_received: u64,

    /// 이미 받은 오프셋의 중복 세그먼트
    pub duplicate_segments: u64,

    /// 순서 어긋남으로 보낸 RST 수
    pub resets_sent: u64,

    /// 되감기를 일으킨 RST 수
    pub resets_received: u64,

    /// 재전송 타임아웃 횟수
    pub timeouts: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            segments_sent: 0,
            retransmitted_segments: 0,
            bytes_sent: 0,
            bytes_received: 0,
            acks_sent: 0,
            acks_received: 0,
            duplicate_segments: 0,
            resets_sent: 0,
            resets_received: 0,
            timeouts: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 송수신 합계 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        (self.bytes_sent + self.bytes_received) as f64 / elapsed
    }

    /// 재전송 비율
    pub fn retransmission_rate(&self) -> f64 {
        if self.segments_sent == 0 {
            return 0.0;
        }
        self.retransmitted_segments as f64 / self.segments_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sent: {} bytes ({} segs, {:.1}% retx) | Received: {} bytes | Dups: {} | RST: {}/{} | Timeouts: {} | Throughput: {:.2} MB/s",
            self.elapsed().as_secs_f64(),
            self.bytes_sent,
            self.segments_sent,
            self.retransmission_rate() * 100.0,
            self.bytes_received,
            self.duplicate_segments,
            self.resets_sent,
            self.resets_received,
            self.timeouts,
            self.throughput() / 1_000_000.0,
        )
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}
