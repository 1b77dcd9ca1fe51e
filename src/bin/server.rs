//! CTP 에코 서버
//!
//! 핸드쉐이크 키가 맞는 연결만 수락하고, 받은 데이터를 같은 채널/전달 방식으로 되돌려줌.
//!
//! 사용법:
//!   cargo run --release --bin ctp-server -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin ctp-server -- --bind 0.0.0.0:9050 --key MyKey
//!   RUST_LOG=ctp=debug cargo run --bin ctp-server -- --low-latency

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ctp::{
    Config, Connection, ConnectionRequest, DeliveryMethod, DisconnectInfo, EventHandler, Host,
    Packet,
};

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddr,
    key: String,
    stats_interval: Duration,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9050)),
            key: "MyKey".to_string(),
            stats_interval: Duration::from_secs(10),
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--key" | "-k" => {
                if i + 1 < args.len() {
                    config.key = args[i + 1].clone();
                    i += 1;
                }
            }
            "--window" => {
                if i + 1 < args.len() {
                    config.config.window_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--timeout" => {
                if i + 1 < args.len() {
                    config.config.timeout_ms = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--stats" => {
                if i + 1 < args.len() {
                    let secs: u64 = args[i + 1].parse().expect("유효한 숫자 필요");
                    config.stats_interval = Duration::from_secs(secs.max(1));
                    i += 1;
                }
            }
            "--low-latency" => {
                config.config = Config::low_latency();
            }
            "--unstable" => {
                config.config = Config::unstable_network();
            }
            "--help" | "-h" => {
                println!(
                    r#"CTP Server - Channel Transport Protocol 에코 서버

사용법:
  cargo run --release --bin ctp-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>     바인드 주소 (기본: 0.0.0.0:9050)
  -k, --key <KEY>       핸드쉐이크 키 (기본: MyKey)
  --window <N>          신뢰 채널 윈도우 크기 (기본: 32)
  --timeout <MS>        연결 타임아웃 밀리초 (기본: 15000)
  --stats <SECS>        통계 출력 주기 (기본: 10)
  --low-latency         저지연 프리셋
  --unstable            불안정 네트워크 프리셋
  -h, --help            이 도움말 출력

로그 레벨은 RUST_LOG로 조정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            other => warn!("알 수 없는 옵션 무시: {}", other),
        }
        i += 1;
    }

    config
}

/// 에코 처리기
struct EchoServer {
    key: String,
    echoed: u64,
}

impl EventHandler for EchoServer {
    fn on_connection_request(&mut self, request: ConnectionRequest) {
        info!("Connection request from {}", request.remote_addr());
        request.accept_if_key(&self.key);
    }

    fn on_connected(&mut self, connection: Arc<Connection>) {
        info!("Client connected: {}", connection.remote_addr());
    }

    fn on_disconnected(&mut self, connection: Arc<Connection>, info: DisconnectInfo) {
        info!(
            "Client disconnected: {} ({:?})",
            connection.remote_addr(),
            info.reason
        );
    }

    fn on_data(
        &mut self,
        connection: Arc<Connection>,
        channel_id: u8,
        delivery: DeliveryMethod,
        packet: Packet,
    ) {
        match connection.send(packet.payload(), delivery, channel_id) {
            Ok(()) => self.echoed += 1,
            Err(e) => warn!("{} 에코 실패: {}", connection.remote_addr(), e),
        }
    }

    fn on_rtt_updated(&mut self, connection: Arc<Connection>, rtt: Duration) {
        tracing::debug!("{} RTT {:?}", connection.remote_addr(), rtt);
    }

    fn on_error(&mut self, addr: SocketAddr, error: ctp::Error) {
        if error.is_fatal_socket_error() {
            warn!("{}: {} (os error {:?}), 연결 종료됨", addr, error, error.raw_os_error());
        } else {
            warn!("{}: {}", addr, error);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server_config = parse_args();

    info!("CTP Server starting...");
    info!("Max packet size: {} bytes", server_config.config.max_packet_size);
    info!("Window size: {}", server_config.config.window_size);
    info!("Keep-alive: {}ms", server_config.config.keep_alive_interval_ms);

    let host = Host::new(server_config.config.clone())?;
    let local_addr = host.start(server_config.bind_addr).await?;
    info!("Server listening on {}", local_addr);

    let mut handler = EchoServer {
        key: server_config.key.clone(),
        echoed: 0,
    };
    let mut last_report = Instant::now();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_millis(15)) => {}
        }

        host.poll_events(&mut handler);

        if last_report.elapsed() >= server_config.stats_interval {
            last_report = Instant::now();
            info!(
                "Connections: {} | Echoed: {}",
                host.connection_count(),
                handler.echoed
            );
            for connection in host.connections() {
                info!(
                    "  {} rtt={:?} {}",
                    connection.remote_addr(),
                    connection.rtt(),
                    connection.stats().summary()
                );
            }
        }
    }

    info!("Shutting down...");
    host.stop().await;
    host.poll_events(&mut handler);
    Ok(())
}
