//! rawstream 서버 (수신자)
//!
//! 연결을 하나씩 수락하고 스트림 끝까지 읽은 뒤 닫는다.
//! raw 소켓을 쓰므로 root 또는 CAP_NET_RAW 필요.
//!
//! 사용법:
//!   cargo run --release --bin rawstream-server -- [OPTIONS]
//!
//! 예시:
//!   sudo rawstream-server --bind 10.0.0.2:9000 --output received.bin

use std::error::Error;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rawstream::socket::RawNetwork;
use rawstream::{Config, FilePortTable, Transport};

/// 한 번에 읽는 크기
const READ_SIZE: usize = 64 * 1024;

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddrV4,
    output: Option<PathBuf>,
    ports_file: Option<PathBuf>,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 9000),
            output: None,
            ports_file: None,
            config: Config::default(),
        }
    }
}

fn parse_args() -> Result<ServerConfig, Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--bind" | "-b", Some(value)) => {
                config.bind_addr = rawstream::parse_address(value)?;
                i += 1;
            }
            ("--output" | "-o", Some(value)) => {
                config.output = Some(PathBuf::from(value));
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
                    r#"rawstream server - raw IP 위의 순서 보장 바이트 스트림 수신

사용법:
  rawstream-server [OPTIONS]

옵션:
  -b, --bind <ADDR>       리스닝 주소 (기본: 0.0.0.0:9000)
  -o, --output <PATH>     수신 데이터를 기록할 파일
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

    let server_config = parse_args()?;
    let config = server_config.config.clone();

    info!("rawstream server starting...");
    info!("Bind address: {}", server_config.bind_addr);
    info!("Fragment size: {} bytes", config.fragment_size);

    let local_ip = *server_config.bind_addr.ip();
    let transport = match &server_config.ports_file {
        Some(path) => {
            info!("Port table: {:?}", path);
            let ports = FilePortTable::open(path, config.ephemeral_ports.clone())?;
            Transport::new(RawNetwork::new(local_ip), Arc::new(ports), config)?
        }
        None => Transport::raw(local_ip, config)?,
    };

    let mut listener = transport.listen(&server_config.bind_addr.to_string()).await?;
    info!("Waiting for connections on {}", listener.local_addr());

    loop {
        let mut conn = listener.accept().await?;
        let peer = conn.peer_addr();
        info!("Accepted: {:?} on {}", peer, conn.local_addr());

        let mut received = Vec::new();
        loop {
            let chunk = conn.recv(READ_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            received.extend_from_slice(&chunk);
        }

        info!("Received {} bytes from {:?}", received.len(), peer);
        info!("{}", conn.stats().summary());

        if let Some(path) = &server_config.output {
            std::fs::write(path, &received)?;
            info!("Written to {:?}", path);
        }

        conn.close().await?;
    }
}
