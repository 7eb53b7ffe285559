//! 순서 보장 수신
//!
//! 기대 위치와 같은 세그먼트만 버퍼에 붙이고 누적 ACK를 보낸다.
//! 앞선 세그먼트(구멍)는 RST+ACK로 재동기화를 요청하고, 뒤처진 세그먼트는 ACK만 다시 보낸다.

use std::net::SocketAddrV4;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::packet::flags;
use crate::socket::Network;
use crate::{Connection, Result};

/// 읽기가 끝날 때 ACK를 보내는 횟수
const ENDING_ACKS: usize = 3;

impl<N: Network> Connection<N> {
    /// 최대 `length` 바이트 수신
    ///
    /// 버퍼가 `length`에 도달하거나 FIN을 보면 멈춘다. 짧은 결과는 스트림 끝 또는
    /// 백오프 소진을 뜻하며 에러가 아니다. 남은 바이트는 다음 호출을 위해 보관.
    pub async fn recv(&mut self, length: usize) -> Result<Bytes> {
        let peer = self.require_established()?;
        if self.recv_buffer.len() >= length {
            return Ok(self.take_buffered(length));
        }

        let poll = self.config().poll_interval();
        let mut backoff = Backoff::from_config(self.config());
        let mut task = self.session_receiver(peer);
        let start = self.ack;
        let mut timer = Instant::now();

        'read: loop {
            let packets = task.drain_within(poll).await;
            if !packets.is_empty() {
                timer = Instant::now();
            }

            for packet in packets {
                if packet.has(flags::SYN) {
                    self.answer_stray_syn(&packet).await?;
                    continue;
                }
                if packet.has(flags::ACK) {
                    continue;
                }

                let fin = packet.has(flags::FIN);
                // 직렬 번호 비교: 0 순서대로, 양수 구멍, 음수 중복
                let delta = packet.seq.wrapping_sub(self.ack) as i32;

                if packet.payload.is_empty() {
                    if !fin {
                        continue;
                    }
                    if delta < 0 {
                        // 이미 받은 빈 FIN의 재전송
                        self.send_ack(peer, flags::ACK, 1).await?;
                        continue;
                    }
                    if delta == 0 {
                        self.ack = self.ack.wrapping_add(1);
                        self.send_ack(peer, flags::ACK, ENDING_ACKS).await?;
                    }
                    debug!("FIN 수신: 스트림 종료 ({})", packet.source);
                    break 'read;
                }

                if delta > 0 {
                    let discarded = task.clear();
                    debug!(
                        "구멍 감지: seq {} (기대 {}), 대기 패킷 {}개 폐기",
                        packet.seq, self.ack, discarded
                    );
                    self.stats.resets_sent += 1;
                    self.send_ack(peer, flags::RST | flags::ACK, 1).await?;
                    continue 'read;
                }

                let behind = delta.unsigned_abs() as usize;
                if behind >= packet.payload.len() {
                    self.stats.duplicate_segments += 1;
                    self.send_ack(peer, flags::ACK, 1).await?;
                    continue;
                }

                // 기대 위치와 겹치면 새 꼬리만
                let fresh = packet.payload.slice(behind..);
                self.recv_buffer.extend_from_slice(&fresh);
                self.ack = self.ack.wrapping_add(fresh.len() as u32);
                self.stats.bytes_received += fresh.len() as u64;
                backoff = backoff.reset();

                let ending = fin || self.recv_buffer.len() >= length;
                let times = if ending { ENDING_ACKS } else { 1 };
                self.send_ack(peer, flags::ACK, times).await?;
                if ending {
                    break 'read;
                }
            }

            if timer.elapsed() > backoff.time_limit() {
                self.stats.timeouts += 1;
                let Some(next) = backoff.escalate() else {
                    warn!("수신 만료: {} bytes 버퍼", self.recv_buffer.len());
                    break 'read;
                };
                backoff = next;
                debug!("ACK 재전송: {} (제한 {:?})", self.ack, backoff.time_limit());
                self.send_ack(peer, flags::ACK, 1).await?;
                timer = Instant::now();
            }
        }

        task.stop().await;
        self.backoff = backoff;

        debug!(
            "recv 종료: {} bytes 수신, 버퍼 {} bytes",
            self.ack.wrapping_sub(start),
            self.recv_buffer.len()
        );
        Ok(self.take_buffered(length))
    }

    /// 현재 수신 확인 위치로 ACK (또는 RST+ACK) 전송
    async fn send_ack(&mut self, peer: SocketAddrV4, ack_flags: u8, times: usize) -> Result<()> {
        let packet = self.segment(peer, self.seq, self.ack, ack_flags, Bytes::new());
        for _ in 0..times {
            self.transmit(&packet).await?;
            self.stats.acks_sent += 1;
        }
        Ok(())
    }
}
