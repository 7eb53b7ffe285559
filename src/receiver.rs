//! 수신 태스크
//!
//! - 소켓을 짧은 타임아웃으로 반복해서 읽음
//! - 디코딩 + 포트 필터를 통과한 패킷만 큐에 적재
//! - 포그라운드 루프는 큐를 비차단으로 비움
//!
//! 연결 하나의 연산(핸드쉐이크, send, recv) 동안만 살아 있다.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::packet::{Packet, PacketFilter};
use crate::socket::RawSocket;
use crate::MAX_PACKET_SIZE;

/// 백그라운드 수신 태스크 핸들
pub struct ReceiverTask {
    running: Arc<AtomicBool>,
    queue: mpsc::UnboundedReceiver<Packet>,
    handle: Option<JoinHandle<()>>,
}

impl ReceiverTask {
    /// 수신 태스크 시작
    pub fn spawn<S: RawSocket>(socket: Arc<S>, filter: PacketFilter, read_timeout: Duration) -> Self {
        let (tx, queue) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let running_recv = running.clone();

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];

            while running_recv.load(Ordering::SeqCst) {
                match tokio::time::timeout(read_timeout, socket.recv_from(&mut buf)).await {
                    Ok(Ok((len, _source))) => {
                        let Some(packet) = Packet::decode(&buf[..len], &filter) else {
                            continue;
                        };
                        trace!(
                            "수신: {} -> {} seq={} ack={} flags={:#04x} len={}",
                            packet.source,
                            packet.destination,
                            packet.seq,
                            packet.ack,
                            packet.flags,
                            packet.payload.len()
                        );
                        if tx.send(packet).is_err() {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        warn!("수신 에러: {}", e);
                        tokio::time::sleep(read_timeout).await;
                    }
                    Err(_) => {
                        // 타임아웃, 계속
                    }
                }
            }
        });

        Self {
            running,
            queue,
            handle: Some(handle),
        }
    }

    /// 큐에서 하나 꺼냄 (비차단)
    pub fn try_next(&mut self) -> Option<Packet> {
        self.queue.try_recv().ok()
    }

    /// 최대 `wait`까지 기다려 하나 꺼냄
    pub async fn next_within(&mut self, wait: Duration) -> Option<Packet> {
        tokio::time::timeout(wait, self.queue.recv()).await.ok().flatten()
    }

    /// 첫 패킷을 최대 `wait`까지 기다린 뒤 큐에 쌓인 나머지를 모두 꺼냄
    pub async fn drain_within(&mut self, wait: Duration) -> Vec<Packet> {
        let mut packets = Vec::new();
        if let Some(first) = self.next_within(wait).await {
            packets.push(first);
            while let Some(packet) = self.try_next() {
                packets.push(packet);
            }
        }
        packets
    }

    /// 큐 비우기. 버린 패킷 수 반환
    pub fn clear(&mut self) -> usize {
        let mut discarded = 0;
        while self.try_next().is_some() {
            discarded += 1;
        }
        discarded
    }

    /// 정지 신호 후 태스크 종료 대기
    pub async fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for ReceiverTask {
    /// 연산이 중단된 경우에도 다음 읽기 타임아웃에 태스크가 끝나도록
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
