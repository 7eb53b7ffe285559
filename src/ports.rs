//! 로컬 포트 테이블
//!
//! 바인딩된 포트를 추적하는 외부 협력자. 연결 간에 공유되는 유일한 상태이므로
//! 모든 갱신은 잠금 아래에서 전부 적용되거나 전혀 적용되지 않는다.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// 포트 테이블 인터페이스
pub trait PortTable: Send + Sync {
    /// 빈 임시 포트 하나를 예약하고 반환
    fn allocate(&self) -> Result<u16>;

    /// 지정 포트 예약
    fn reserve(&self, port: u16) -> Result<()>;

    /// 예약 해제
    fn release(&self, port: u16) -> Result<()>;

    /// 예약 여부
    fn is_bound(&self, port: u16) -> bool;
}

/// 범위 내 임의 지점부터 순회하며 빈 포트 탐색
fn pick_free_port(bound: &BTreeSet<u16>, range: &RangeInclusive<u16>) -> Option<u16> {
    let (start, end) = (*range.start() as u32, *range.end() as u32);
    if start > end {
        return None;
    }

    let span = end - start + 1;
    let offset = rand::thread_rng().gen_range(0..span);

    (0..span)
        .map(|i| (start + (offset + i) % span) as u16)
        .find(|port| !bound.contains(port))
}

/// 메모리 포트 테이블
pub struct MemoryPortTable {
    bound: Mutex<BTreeSet<u16>>,
    range: RangeInclusive<u16>,
}

impl MemoryPortTable {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            bound: Mutex::new(BTreeSet::new()),
            range,
        }
    }

    /// 바인딩된 포트 수
    pub fn len(&self) -> usize {
        self.bound.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.lock().is_empty()
    }
}

impl Default for MemoryPortTable {
    fn default() -> Self {
        Self::new(crate::Config::default().ephemeral_ports)
    }
}

impl PortTable for MemoryPortTable {
    fn allocate(&self) -> Result<u16> {
        let mut bound = self.bound.lock();
        let port = pick_free_port(&bound, &self.range).ok_or(Error::NoPortAvailable)?;
        bound.insert(port);
        Ok(port)
    }

    fn reserve(&self, port: u16) -> Result<()> {
        if self.bound.lock().insert(port) {
            Ok(())
        } else {
            Err(Error::PortOccupied { port })
        }
    }

    fn release(&self, port: u16) -> Result<()> {
        if self.bound.lock().remove(&port) {
            Ok(())
        } else {
            Err(Error::PortNotBound { port })
        }
    }

    fn is_bound(&self, port: u16) -> bool {
        self.bound.lock().contains(&port)
    }
}

/// 포트 테이블 파일 레코드
#[derive(Debug, Default, Serialize, Deserialize)]
struct PortFile {
    bound: BTreeSet<u16>,
}

/// 파일 기반 영속 포트 테이블
///
/// 프로세스가 재시작되어도 바인딩 정보가 유지된다.
/// 매 연산마다 파일을 다시 읽고, 임시 파일 + rename으로 원자적으로 기록.
pub struct FilePortTable {
    path: PathBuf,
    range: RangeInclusive<u16>,
    lock: Mutex<()>,
}

impl FilePortTable {
    pub fn open(path: impl AsRef<Path>, range: RangeInclusive<u16>) -> Result<Self> {
        let table = Self {
            path: path.as_ref().to_path_buf(),
            range,
            lock: Mutex::new(()),
        };
        // 손상된 파일은 여기서 드러나도록
        table.load()?;
        Ok(table)
    }

    fn load(&self) -> Result<BTreeSet<u16>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(bincode::deserialize::<PortFile>(&bytes)?.bound),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, bound: BTreeSet<u16>) -> Result<()> {
        let bytes = bincode::serialize(&PortFile { bound })?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// 잠금 아래에서 load -> 변경 -> store
    fn update<T>(&self, change: impl FnOnce(&mut BTreeSet<u16>) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock();
        let mut bound = self.load()?;
        let value = change(&mut bound)?;
        self.store(bound)?;
        Ok(value)
    }
}

impl PortTable for FilePortTable {
    fn allocate(&self) -> Result<u16> {
        let port = self.update(|bound| {
            let port = pick_free_port(bound, &self.range).ok_or(Error::NoPortAvailable)?;
            bound.insert(port);
            Ok(port)
        })?;
        debug!("포트 할당: {} ({:?})", port, self.path);
        Ok(port)
    }

    fn reserve(&self, port: u16) -> Result<()> {
        self.update(|bound| {
            if bound.insert(port) {
                Ok(())
            } else {
                Err(Error::PortOccupied { port })
            }
        })
    }

    fn release(&self, port: u16) -> Result<()> {
        self.update(|bound| {
            if bound.remove(&port) {
                Ok(())
            } else {
                Err(Error::PortNotBound { port })
            }
        })
    }

    fn is_bound(&self, port: u16) -> bool {
        let _guard = self.lock.lock();
        self.load().map(|bound| bound.contains(&port)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let table = MemoryPortTable::default();

        table.reserve(80).unwrap();
        assert!(table.is_bound(80));
        assert!(matches!(table.reserve(80), Err(Error::PortOccupied { port: 80 })));

        table.release(80).unwrap();
        assert!(!table.is_bound(80));
        assert!(matches!(table.release(80), Err(Error::PortNotBound { port: 80 })));
    }

    #[test]
    fn test_allocate_stays_in_range_and_exhausts() {
        let table = MemoryPortTable::new(5000..=5003);
        let mut ports: Vec<u16> = (0..4).map(|_| table.allocate().unwrap()).collect();
        ports.sort_unstable();

        assert_eq!(ports, vec![5000, 5001, 5002, 5003]);
        assert!(matches!(table.allocate(), Err(Error::NoPortAvailable)));

        table.release(5002).unwrap();
        assert_eq!(table.allocate().unwrap(), 5002);
    }

    #[test]
    fn test_allocate_skips_reserved() {
        let table = MemoryPortTable::new(6000..=6001);
        table.reserve(6000).unwrap();
        assert_eq!(table.allocate().unwrap(), 6001);
    }

    #[test]
    fn test_file_table_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.bin");

        {
            let table = FilePortTable::open(&path, 7000..=7010).unwrap();
            table.reserve(80).unwrap();
            let port = table.allocate().unwrap();
            assert!((7000..=7010).contains(&port));
        }

        let table = FilePortTable::open(&path, 7000..=7010).unwrap();
        assert!(table.is_bound(80));
        assert!(matches!(table.reserve(80), Err(Error::PortOccupied { port: 80 })));

        table.release(80).unwrap();
        assert!(matches!(table.release(80), Err(Error::PortNotBound { port: 80 })));
    }

    #[test]
    fn test_file_table_failed_update_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.bin");
        let table = FilePortTable::open(&path, 7000..=7000).unwrap();

        assert_eq!(table.allocate().unwrap(), 7000);
        assert!(matches!(table.allocate(), Err(Error::NoPortAvailable)));

        let reopened = FilePortTable::open(&path, 7000..=7000).unwrap();
        assert!(reopened.is_bound(7000));
    }

    #[test]
    fn test_corrupt_file_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.bin");
        fs::write(&path, [0xFF; 3]).unwrap();

        assert!(matches!(
            FilePortTable::open(&path, 7000..=7010),
            Err(Error::Persistence(_))
        ));
    }
}
