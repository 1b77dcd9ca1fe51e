//! # CTP (Channel Transport Protocol)
//!
//! UDP 위의 연결 지향 메시지 전송 프로토콜
//!
//! ## 핵심 특징
//! - **핸드쉐이크**: 키를 담은 연결 요청, 애플리케이션이 수락/거절 결정
//! - **채널**: 연결당 최대 256개, 채널마다 전달 방식 선택
//! - **Unreliable**: 보내고 잊음, 큐가 넘치면 오래된 패킷부터 폐기
//! - **Reliable**: 슬라이딩 윈도우 + 지수 백오프 재전송 + 순서 보장
//! - **Keep-alive / RTT**: Ping/Pong 타임스탬프 에코, EWMA 평활
//! - **이벤트 큐**: 네트워크 태스크는 큐에 넣기만, 애플리케이션이 poll로 처리
//!
//! ## 사용 예
//! ```no_run
//! use ctp::{Config, DeliveryMethod, EventHandler, Host, ConnectionRequest};
//!
//! struct Server;
//!
//! impl EventHandler for Server {
//!     fn on_connection_request(&mut self, request: ConnectionRequest) {
//!         request.accept_if_key("MyKey");
//!     }
//! }
//!
//! # async fn run() -> ctp::Result<()> {
//! let host = Host::new(Config::default())?;
//! host.start("0.0.0.0:9050".parse().unwrap()).await?;
//! loop {
//!     host.poll_events(&mut Server);
//!     tokio::time::sleep(std::time::Duration::from_millis(15)).await;
//! }
//! # }
//! ```

pub mod channel;
pub mod clock;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod host;
pub mod packet;
pub mod pool;
pub mod reliable;
pub mod request;
pub mod rtt;
pub mod sequence;
pub mod stats;
pub mod transport;

pub use codec::{PacketReader, PacketWriter};
pub use config::Config;
pub use connection::{Connection, ConnectionState, DisconnectInfo, DisconnectReason};
pub use error::{Error, Result};
pub use event::{EventHandler, NetEvent};
pub use host::Host;
pub use packet::{DeliveryMethod, Packet, PacketFlags, PacketType};
pub use pool::{BufferPool, PooledBuffer};
pub use request::ConnectionRequest;
pub use rtt::RttEstimator;
pub use stats::StatsSnapshot;
pub use transport::Transport;

/// 기본 최대 데이터그램 크기 (바이트)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024;

/// 기본 신뢰 채널 윈도우 크기
pub const DEFAULT_WINDOW_SIZE: usize = 32;
