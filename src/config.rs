//! 프로토콜 설정

use std::time::Duration;

use crate::{Error, Result, DEFAULT_MAX_PACKET_SIZE, DEFAULT_WINDOW_SIZE};

/// CTP 호스트/연결 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 최대 데이터그램 크기 (바이트, 헤더 포함)
    pub max_packet_size: usize,

    /// Keep-alive Ping 간격 (밀리초)
    pub keep_alive_interval_ms: u64,

    /// 수신이 없을 때 연결 타임아웃 (밀리초)
    pub timeout_ms: u64,

    /// 유지보수 루프 주기 (밀리초)
    pub maintenance_interval_ms: u64,

    /// 송신 루프 주기 (밀리초)
    /// ACK/재전송 지연의 상한이 됨
    pub send_interval_ms: u64,

    /// 신뢰 채널 슬라이딩 윈도우 크기 (동시 in-flight 패킷 수)
    pub window_size: usize,

    /// 초기 재전송 타임아웃 (밀리초)
    pub initial_rto_ms: u64,

    /// 재전송 타임아웃 상한 (밀리초)
    pub max_rto_ms: u64,

    /// 비신뢰 채널 송신 큐 크기
    /// 넘치면 가장 오래된 패킷을 버림
    pub unreliable_queue_capacity: usize,

    /// 신뢰 채널 송신 큐 크기 (윈도우 대기분)
    /// 넘치면 send 실패
    pub reliable_queue_capacity: usize,

    /// 연결 요청 재전송 간격 (밀리초)
    pub connect_retry_interval_ms: u64,

    /// 연결 요청 최대 시도 횟수
    pub max_connect_attempts: u32,

    /// 버퍼 풀에 보관할 최대 버퍼 수
    pub pool_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            keep_alive_interval_ms: 3000,    // 3초
            timeout_ms: 15_000,              // 15초
            maintenance_interval_ms: 1000,   // 1초
            send_interval_ms: 10,            // 10ms
            window_size: DEFAULT_WINDOW_SIZE,
            initial_rto_ms: 250,
            max_rto_ms: 5000,
            unreliable_queue_capacity: 64,
            reliable_queue_capacity: 1024,
            connect_retry_interval_ms: 500,
            max_connect_attempts: 10,
            pool_capacity: 256,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 저지연 환경용 설정 (LAN, 실시간 게임)
    pub fn low_latency() -> Self {
        Self {
            keep_alive_interval_ms: 1000,
            timeout_ms: 5000,
            maintenance_interval_ms: 250,
            send_interval_ms: 2,
            initial_rto_ms: 100,
            max_rto_ms: 2000,
            connect_retry_interval_ms: 200,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            max_packet_size: 1000,            // 작은 데이터그램
            keep_alive_interval_ms: 2000,
            timeout_ms: 30_000,
            window_size: 16,
            initial_rto_ms: 400,
            max_rto_ms: 8000,
            unreliable_queue_capacity: 32,
            connect_retry_interval_ms: 1000,
            max_connect_attempts: 20,
            ..Self::default()
        }
    }

    /// 설정 값 검증
    pub fn validate(&self) -> Result<()> {
        if self.max_packet_size <= crate::packet::DATA_HEADER_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_packet_size {}는 헤더보다 커야 함",
                self.max_packet_size
            )));
        }
        if self.keep_alive_interval_ms == 0
            || self.timeout_ms == 0
            || self.maintenance_interval_ms == 0
            || self.send_interval_ms == 0
            || self.connect_retry_interval_ms == 0
        {
            return Err(Error::InvalidConfig("간격 값은 0일 수 없음".into()));
        }
        if self.window_size == 0 || self.window_size >= crate::sequence::HALF_RANGE as usize {
            return Err(Error::InvalidConfig(format!(
                "window_size {}는 1 이상 {} 미만이어야 함",
                self.window_size,
                crate::sequence::HALF_RANGE
            )));
        }
        if self.initial_rto_ms == 0 || self.max_rto_ms < self.initial_rto_ms {
            return Err(Error::InvalidConfig(format!(
                "RTO 범위가 잘못됨: initial={}ms, max={}ms",
                self.initial_rto_ms, self.max_rto_ms
            )));
        }
        if self.unreliable_queue_capacity == 0 {
            return Err(Error::InvalidConfig("unreliable_queue_capacity는 0일 수 없음".into()));
        }
        if self.reliable_queue_capacity == 0 {
            return Err(Error::InvalidConfig("reliable_queue_capacity는 0일 수 없음".into()));
        }
        Ok(())
    }

    /// 데이터 패킷 하나에 담을 수 있는 최대 페이로드
    pub fn max_payload_size(&self) -> usize {
        self.max_packet_size - crate::packet::DATA_HEADER_SIZE
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn initial_rto(&self) -> Duration {
        Duration::from_millis(self.initial_rto_ms)
    }

    pub fn max_rto(&self) -> Duration {
        Duration::from_millis(self.max_rto_ms)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }
}
