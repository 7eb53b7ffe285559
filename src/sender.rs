//! 슬라이딩 윈도우 송신
//!
//! - 윈도우 크기만큼 프래그먼트를 연속 전송, 마지막 프래그먼트에 FIN
//! - 누적 ACK로 윈도우 전진, RST로 구멍 위치까지 되감기
//! - 타임아웃마다 확인된 위치로 되감고 백오프, 소진 시 부분 결과 반환
//!
//! 와이어의 시퀀스 번호는 스트림 위치(mod 2^32)이고 루프 안에서는
//! 전송 시작 위치 기준 상대 오프셋으로 다룬다.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::packet::flags;
use crate::socket::Network;
use crate::{Connection, Result};

impl<N: Network> Connection<N> {
    /// 데이터 전송. 상대가 확인한 바이트 수 반환
    ///
    /// `max_transfer_size`보다 크면 독립된 전송 여러 개로 나눠 보낸다.
    /// 백오프가 소진되면 에러 대신 그때까지 확인된 바이트 수를 돌려준다.
    pub async fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.require_established()?;

        if data.is_empty() {
            return self.send_transfer(data).await;
        }

        let max = self.config().max_transfer_size;
        let mut total = 0;
        for chunk in data.chunks(max) {
            let sent = self.send_transfer(chunk).await?;
            total += sent;
            if sent < chunk.len() {
                warn!("전송 중단: {}/{} bytes", total, data.len());
                break;
            }
        }
        Ok(total)
    }

    async fn send_transfer(&mut self, data: &[u8]) -> Result<usize> {
        let peer = self.require_established()?;
        let poll = self.config().poll_interval();
        let window_bytes = self.config().window_bytes();
        let mut backoff = Backoff::from_config(self.config());

        let fragment = self.fragment_size;
        let len = data.len();
        let base = self.seq;
        // 빈 전송은 FIN 하나가 시퀀스 번호 하나를 차지
        let span = len.max(1);

        let mut task = self.session_receiver(peer);
        let mut window = 0usize;
        let mut confirmed = 0usize;
        let mut highest = 0usize;
        let mut fin_pending = true;
        let mut timer = Instant::now();

        debug!("send 시작: {} bytes -> {} (base {})", len, peer, base);

        let completed = 'transfer: loop {
            // (a) 수신 ACK 처리
            for packet in task.drain_within(poll).await {
                if packet.has(flags::SYN) {
                    self.answer_stray_syn(&packet).await?;
                    continue;
                }
                if !packet.has(flags::ACK) {
                    continue;
                }
                self.stats.acks_received += 1;

                let acked = packet.ack.wrapping_sub(base) as usize;
                if acked > span {
                    // 이전 전송의 늦은 ACK
                    continue;
                }
                if acked == span {
                    break 'transfer true;
                }

                if acked > confirmed {
                    confirmed = acked;
                    window = window.max(confirmed);
                    backoff = backoff.reset();
                    timer = Instant::now();
                }
                if packet.has(flags::RST) && acked <= confirmed && window > acked {
                    debug!("RST 수신: window {} -> {}", window, acked);
                    self.stats.resets_received += 1;
                    confirmed = acked;
                    window = acked;
                }
            }

            // (b) 타임아웃
            if timer.elapsed() > backoff.time_limit() {
                self.stats.timeouts += 1;
                let Some(next) = backoff.escalate() else {
                    warn!("전송 만료: {}/{} bytes 확인됨", confirmed, len);
                    break 'transfer false;
                };
                backoff = next;
                warn!(
                    "재전송 타임아웃: window {} -> {} (시도 {}, 제한 {:?})",
                    window,
                    confirmed,
                    backoff.attempts(),
                    backoff.time_limit()
                );
                window = confirmed;
                fin_pending = true;
                timer = Instant::now();
            }

            // (c) 윈도우 내 전송
            if len == 0 {
                if fin_pending {
                    let fin = self.segment(peer, base, self.ack, flags::FIN, Bytes::new());
                    self.transmit(&fin).await?;
                    self.stats.segments_sent += 1;
                    fin_pending = false;
                    timer = Instant::now();
                }
                continue;
            }

            let limit = len.min(confirmed.saturating_add(window_bytes));
            if window >= limit {
                continue;
            }

            while window < limit {
                let end = len.min(window + fragment);
                let segment_flags = if end == len { flags::FIN } else { 0 };
                let segment = self.segment(
                    peer,
                    base.wrapping_add(window as u32),
                    self.ack,
                    segment_flags,
                    Bytes::copy_from_slice(&data[window..end]),
                );
                self.transmit(&segment).await?;

                self.stats.segments_sent += 1;
                if window < highest {
                    self.stats.retransmitted_segments += 1;
                }
                window = end;
            }
            highest = highest.max(window);
            timer = Instant::now();
        };

        task.stop().await;
        self.backoff = backoff;

        let (sent, advance) = if completed {
            (len, span)
        } else {
            (confirmed, confirmed)
        };
        self.seq = base.wrapping_add(advance as u32);
        self.stats.bytes_sent += sent as u64;

        debug!("send 종료: {}/{} bytes", sent, len);
        Ok(sent)
    }
}
