//! 메모리 네트워크
//!
//! raw 소켓 없이 프로토콜을 돌리기 위한 시뮬레이션. 호스트 IP마다 열린 소켓 목록을
//! 두고, 전송된 패킷을 목적지 호스트의 모든 소켓에 복사한다 (raw 소켓과 같은 의미).
//!
//! - 확률적 손실 / 중복 (`FaultModel`)
//! - 다음 한 패킷만 골라 버리거나 복제하는 규칙 (`drop_next`, `duplicate_next`)
//! - 전송된 모든 패킷과 그 운명을 보는 탭 (`tap`)

use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::trace;

use crate::socket::{Network, RawSocket};

type Delivery = (Bytes, Ipv4Addr);
type Matcher = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// 확률적 장애 모델
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultModel {
    /// 패킷 손실 확률 (0.0 ~ 1.0)
    pub loss_rate: f64,

    /// 패킷 중복 확률 (0.0 ~ 1.0)
    pub duplicate_rate: f64,
}

/// 패킷 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Delivered,
    Dropped,
    Duplicated,
}

/// 탭으로 관측된 패킷
#[derive(Debug, Clone)]
pub struct Captured {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub bytes: Bytes,
    pub fate: Fate,
}

struct Rule {
    matcher: Matcher,
    fate: Fate,
}

struct Endpoint {
    id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct Inner {
    hosts: DashMap<Ipv4Addr, Vec<Endpoint>>,
    next_id: AtomicU64,
    faults: Mutex<FaultModel>,
    rules: Mutex<Vec<Rule>>,
    taps: Mutex<Vec<mpsc::UnboundedSender<Captured>>>,
}

/// 공유 메모리 네트워크 (clone은 같은 네트워크를 가리킴)
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Inner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_faults(FaultModel::default())
    }

    pub fn with_faults(faults: FaultModel) -> Self {
        Self {
            inner: Arc::new(Inner {
                hosts: DashMap::new(),
                next_id: AtomicU64::new(0),
                faults: Mutex::new(faults),
                rules: Mutex::new(Vec::new()),
                taps: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 주어진 IP의 호스트 뷰
    pub fn host(&self, ip: Ipv4Addr) -> MemoryHost {
        MemoryHost {
            ip,
            network: self.clone(),
        }
    }

    pub fn set_faults(&self, faults: FaultModel) {
        *self.inner.faults.lock() = faults;
    }

    /// 조건에 맞는 다음 패킷 하나를 버림
    pub fn drop_next(&self, matcher: impl Fn(&[u8]) -> bool + Send + Sync + 'static) {
        self.push_rule(Box::new(matcher), Fate::Dropped);
    }

    /// 조건에 맞는 다음 패킷 하나를 두 번 전달
    pub fn duplicate_next(&self, matcher: impl Fn(&[u8]) -> bool + Send + Sync + 'static) {
        self.push_rule(Box::new(matcher), Fate::Duplicated);
    }

    fn push_rule(&self, matcher: Matcher, fate: Fate) {
        self.inner.rules.lock().push(Rule { matcher, fate });
    }

    /// 이후 전송되는 모든 패킷 관측
    pub fn tap(&self) -> mpsc::UnboundedReceiver<Captured> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.taps.lock().push(tx);
        rx
    }

    /// 호스트에 열린 소켓 수
    pub fn open_sockets(&self, ip: Ipv4Addr) -> usize {
        self.inner.hosts.get(&ip).map_or(0, |eps| eps.len())
    }

    fn decide(&self, bytes: &[u8]) -> Fate {
        {
            let mut rules = self.inner.rules.lock();
            if let Some(index) = rules.iter().position(|rule| (rule.matcher)(bytes)) {
                return rules.remove(index).fate;
            }
        }

        let faults = *self.inner.faults.lock();
        let mut rng = rand::thread_rng();
        if rng.gen_bool(faults.loss_rate.clamp(0.0, 1.0)) {
            Fate::Dropped
        } else if rng.gen_bool(faults.duplicate_rate.clamp(0.0, 1.0)) {
            Fate::Duplicated
        } else {
            Fate::Delivered
        }
    }

    fn transmit(&self, source: Ipv4Addr, destination: Ipv4Addr, packet: &[u8]) {
        let bytes = Bytes::copy_from_slice(packet);
        let fate = self.decide(packet);

        let copies = match fate {
            Fate::Dropped => 0,
            Fate::Delivered => 1,
            Fate::Duplicated => 2,
        };
        trace!("{} -> {}: {} bytes {:?}", source, destination, bytes.len(), fate);

        if copies > 0 {
            if let Some(mut endpoints) = self.inner.hosts.get_mut(&destination) {
                endpoints.retain(|ep| {
                    (0..copies).all(|_| ep.tx.send((bytes.clone(), source)).is_ok())
                });
            }
        }

        self.inner.taps.lock().retain(|tap| {
            tap.send(Captured {
                source,
                destination,
                bytes: bytes.clone(),
                fate,
            })
            .is_ok()
        });
    }

    fn attach(&self, ip: Ipv4Addr) -> (u64, mpsc::UnboundedReceiver<Delivery>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.hosts.entry(ip).or_default().push(Endpoint { id, tx });
        (id, rx)
    }

    fn detach(&self, ip: Ipv4Addr, id: u64) {
        if let Some(mut endpoints) = self.inner.hosts.get_mut(&ip) {
            endpoints.retain(|ep| ep.id != id);
        }
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// 메모리 네트워크 위의 한 호스트
#[derive(Clone)]
pub struct MemoryHost {
    ip: Ipv4Addr,
    network: MemoryNetwork,
}

impl Network for MemoryHost {
    type Socket = MemorySocket;

    fn local_ip(&self) -> Ipv4Addr {
        self.ip
    }

    fn open(&self) -> io::Result<MemorySocket> {
        let (id, rx) = self.network.attach(self.ip);
        Ok(MemorySocket {
            ip: self.ip,
            id,
            rx: tokio::sync::Mutex::new(rx),
            network: self.network.clone(),
        })
    }
}

/// 메모리 네트워크 소켓. drop 시 호스트에서 분리
pub struct MemorySocket {
    ip: Ipv4Addr,
    id: u64,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    network: MemoryNetwork,
}

impl RawSocket for MemorySocket {
    fn local_ip(&self) -> Ipv4Addr {
        self.ip
    }

    fn send_to<'a>(
        &'a self,
        packet: &'a [u8],
        dest: Ipv4Addr,
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        async move {
            self.network.transmit(self.ip, dest, packet);
            Ok(packet.len())
        }
    }

    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<(usize, Ipv4Addr)>> + Send + 'a {
        async move {
            let mut rx = self.rx.lock().await;
            let (bytes, source) = rx.recv().await.ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "memory socket detached")
            })?;

            let len = bytes.len().min(buf.len());
            buf[..len].copy_from_slice(&bytes[..len]);
            Ok((len, source))
        }
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.network.detach(self.ip, self.id);
    }
}
