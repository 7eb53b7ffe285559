//! rawstream 클라이언트 (송신자)
//!
//! 서버에 연결해 파일(또는 테스트 데이터)을 보내고 닫는다.
//! raw 소켓을 쓰므로 root 또는 CAP_NET_RAW 필요.
//!
//! 사용법:
//!   cargo run --release --bin rawstream-client -- [OPTIONS]
//!
//! 예시:
//!   sudo rawstream-client --server 10.0.0.2:9000 --local 10.0.0.1 --file data.bin

use std::error::Error;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rawstream::socket::RawNetwork;
use rawstream::{Config, FilePortTable, Transport};

/// 클라이언트 설정
struct ClientConfig {
    server_addr: SocketAddrV4,
    local_ip: Ipv4Addr,
    file_path: Option<PathBuf>,
    ports_file: Option<PathBuf>,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000),
            local_ip: Ipv4Addr::LOCALHOST,
            file_path: None,
            ports_file: None,
            config: Config::default(),
        }
    }
}

fn parse_args() -> Result<ClientConfig, Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--server" | "-s", Some(value)) => {
                config.server_addr = rawstream::parse_address(value)?;
                i += 1;
            }
            ("--local" | "-l", Some(value)) => {
                config.local_ip = value.parse()?;
                i += 1;
            }
            ("--file" | "-f", Some(value)) => {
                config.file_path = Some(PathBuf::from(value));
                i += 1;
            }
            ("--fragment", Some(value)) => {
                config.config.fragment_size = value.parse()?;
                i += 1;
            }
            ("--ports-file", Some(value)) => {
                config.ports_file = Some(PathBuf::from(value));
                i += 1;
            }
            ("--help" | "-h", _) => {
                println!(
                    r#"rawstream client - raw IP 위의 순서 보장 바이트 스트림 송신

사용법:
  rawstream-client [OPTIONS]

옵션:
  -s, --server <ADDR>     서버 주소 (기본: 127.0.0.1:9000)
  -l, --local <IP>        로컬 IP (기본: 127.0.0.1)
  -f, --file <PATH>       보낼 파일 (없으면 1MB 테스트 데이터)
  --fragment <SIZE>       패킷당 최대 페이로드 (기본: 1024)
  --ports-file <PATH>     포트 테이블을 파일에 유지
  -h, --help              이 도움말 출력

로그 레벨은 RUST_LOG로 조정 (예: RUST_LOG=rawstream=debug)
"#
                );
                std::process::exit(0);
            }
            (flag, None) if flag.starts_with('-') => {
                return Err(format!("{} 값이 필요함", flag).into());
            }
            _ => {}
        }
        i += 1;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client_config = parse_args()?;
    let config = client_config.config.clone();

    info!("rawstream client starting...");
    info!("Server: {}", client_config.server_addr);
    info!("Local IP: {}", client_config.local_ip);

    let data = if let Some(path) = &client_config.file_path {
        info!("Loading file: {:?}", path);
        std::fs::read(path)?
    } else {
        // 테스트용 더미 데이터 (1MB)
        info!("Using test data (1MB)");
        (0..1024 * 1024).map(|i| (i % 251) as u8).collect()
    };

    let transport = match &client_config.ports_file {
        Some(path) => {
            let ports = FilePortTable::open(path, config.ephemeral_ports.clone())?;
            Transport::new(RawNetwork::new(client_config.local_ip), Arc::new(ports), config)?
        }
        None => Transport::raw(client_config.local_ip, config)?,
    };

    let start = Instant::now();
    let mut conn = transport.dial(&client_config.server_addr.to_string()).await?;
    info!("Connected: {} -> {:?}", conn.local_addr(), conn.peer_addr());

    let sent = conn.send(&data).await?;
    let elapsed = start.elapsed().as_secs_f64();

    if sent < data.len() {
        warn!("Partial send: {}/{} bytes", sent, data.len());
    } else {
        info!("Sent {} bytes in {:.2}s", sent, elapsed);
    }
    if elapsed > 0.0 {
        info!("Throughput: {:.2} MB/s", sent as f64 / elapsed / 1_000_000.0);
    }
    info!("{}", conn.stats().summary());

    conn.close().await?;
    Ok(())
}
