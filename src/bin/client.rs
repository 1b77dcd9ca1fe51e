//! CTP 테스트 클라이언트
//!
//! 서버에 연결해서 신뢰/비신뢰 채널로 메시지를 보내고 에코를 확인.
//!
//! 사용법:
//!   cargo run --release --bin ctp-client -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin ctp-client -- --server 127.0.0.1:9050 --count 1000

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ctp::{
    Config, Connection, ConnectionState, DeliveryMethod, DisconnectInfo, EventHandler, Host,
    Packet,
};

/// 신뢰 메시지 채널
const RELIABLE_CHANNEL: u8 = 0;

/// 비신뢰 메시지 채널
const UNRELIABLE_CHANNEL: u8 = 1;

/// 클라이언트 설정
struct ClientConfig {
    bind_addr: SocketAddr,
    server_addr: SocketAddr,
    key: String,
    count: u32,
    payload_size: usize,
    wait: Duration,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            server_addr: SocketAddr::from(([127, 0, 0, 1], 9050)),
            key: "MyKey".to_string(),
            count: 100,
            payload_size: 64,
            wait: Duration::from_secs(10),
            config: Config::default(),
        }
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--key" | "-k" => {
                if i + 1 < args.len() {
                    config.key = args[i + 1].clone();
                    i += 1;
                }
            }
            "--count" | "-n" => {
                if i + 1 < args.len() {
                    config.count = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--size" => {
                if i + 1 < args.len() {
                    config.payload_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--wait" => {
                if i + 1 < args.len() {
                    let secs: u64 = args[i + 1].parse().expect("유효한 숫자 필요");
                    config.wait = Duration::from_secs(secs);
                    i += 1;
                }
            }
            "--low-latency" => {
                config.config = Config::low_latency();
            }
            "--help" | "-h" => {
                println!(
                    r#"CTP Client - Channel Transport Protocol 테스트 클라이언트

사용법:
  cargo run --release --bin ctp-client -- [OPTIONS]

옵션:
  -b, --bind <ADDR>      로컬 바인드 주소 (기본: 0.0.0.0:0 = 자동 할당)
  -s, --server <ADDR>    서버 주소 (기본: 127.0.0.1:9050)
  -k, --key <KEY>        핸드쉐이크 키 (기본: MyKey)
  -n, --count <N>        채널별 전송 메시지 수 (기본: 100)
  --size <BYTES>         메시지 크기 (기본: 64, 최소 4)
  --wait <SECS>          에코 대기 시간 (기본: 10)
  --low-latency          저지연 프리셋
  -h, --help             이 도움말 출력
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

/// 에코 수신 기록
#[derive(Default)]
struct EchoClient {
    connected: bool,
    closed: Option<DisconnectInfo>,
    /// 신뢰 채널로 돌아온 다음 순번
    next_reliable: u32,
    out_of_order: u32,
    unreliable_received: u32,
}

impl EventHandler for EchoClient {
    fn on_connected(&mut self, connection: Arc<Connection>) {
        info!("Connected to {}", connection.remote_addr());
        self.connected = true;
    }

    fn on_disconnected(&mut self, connection: Arc<Connection>, info: DisconnectInfo) {
        info!("Disconnected from {} ({:?})", connection.remote_addr(), info.reason);
        self.closed = Some(info);
    }

    fn on_data(
        &mut self,
        _connection: Arc<Connection>,
        channel_id: u8,
        _delivery: DeliveryMethod,
        packet: Packet,
    ) {
        let index = match packet.reader().read_u32() {
            Ok(index) => index,
            Err(e) => {
                warn!("잘못된 에코: {}", e);
                return;
            }
        };

        if channel_id == RELIABLE_CHANNEL {
            if index != self.next_reliable {
                self.out_of_order += 1;
            }
            self.next_reliable = index + 1;
        } else {
            self.unreliable_received += 1;
        }
    }

    fn on_error(&mut self, addr: SocketAddr, error: ctp::Error) {
        if error.is_fatal_socket_error() {
            warn!("{}: {} (os error {:?}), 연결 종료됨", addr, error, error.raw_os_error());
        } else {
            warn!("{}: {}", addr, error);
        }
    }
}

fn message(index: u32, size: usize) -> Vec<u8> {
    let mut payload = vec![0xABu8; size.max(4)];
    payload[..4].copy_from_slice(&index.to_le_bytes());
    payload
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client_config = parse_args();

    info!("CTP Client starting...");
    info!("Server: {}", client_config.server_addr);

    let host = Host::new(client_config.config.clone())?;
    let local_addr = host.start(client_config.bind_addr).await?;
    info!("Bound to {}", local_addr);

    let connection = host.connect(client_config.server_addr, &client_config.key)?;
    let mut handler = EchoClient::default();

    // 핸드쉐이크 대기
    while !handler.connected && handler.closed.is_none() {
        host.poll_events(&mut handler);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    if let Some(info) = handler.closed {
        warn!("Connection failed: {:?}", info.reason);
        host.stop().await;
        return Ok(());
    }

    let start = Instant::now();
    for index in 0..client_config.count {
        let payload = message(index, client_config.payload_size);

        // 신뢰 큐가 가득 차면 비워질 때까지 대기
        loop {
            match connection.send(&payload, DeliveryMethod::Reliable, RELIABLE_CHANNEL) {
                Err(ctp::Error::SendQueueFull { .. }) => {
                    host.poll_events(&mut handler);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                result => {
                    result?;
                    break;
                }
            }
        }
        connection.send(&payload, DeliveryMethod::Unreliable, UNRELIABLE_CHANNEL)?;
    }
    info!("Sent {} messages per channel", client_config.count);

    let deadline = start + client_config.wait;
    while handler.next_reliable < client_config.count && Instant::now() < deadline {
        host.poll_events(&mut handler);
        if connection.state() != ConnectionState::Connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let elapsed = start.elapsed();
    info!("Echo complete in {:.2}s", elapsed.as_secs_f64());
    info!(
        "  Reliable: {}/{} (out of order: {})",
        handler.next_reliable, client_config.count, handler.out_of_order
    );
    info!(
        "  Unreliable: {}/{}",
        handler.unreliable_received, client_config.count
    );
    info!("  RTT: {:?} (jitter {:?})", connection.rtt(), connection.jitter());
    info!("  {}", connection.stats().summary());

    host.stop().await;
    host.poll_events(&mut handler);
    Ok(())
}
