//! 채널 추상화
//!
//! 연결 하나에 채널 ID(u8)별로 독립된 전달 단위가 있음.
//! - Unreliable: 송신 큐만 있음, 넘치면 가장 오래된 패킷 폐기
//! - Reliable: 슬라이딩 윈도우 + 재전송 + 재정렬 (`reliable` 모듈)

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, trace};

use crate::packet::{DeliveryMethod, Packet, PacketFlags};
use crate::pool::BufferPool;
use crate::reliable::ReliableChannel;
use crate::stats::ConnectionStats;
use crate::{Config, Error, Result};

/// 채널 생성에 필요한 공유 설정
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub pool: Arc<BufferPool>,
    pub stats: Arc<ConnectionStats>,
    pub max_packet_size: usize,
    pub window_size: usize,
    pub initial_rto: Duration,
    pub max_rto: Duration,
    pub unreliable_queue_capacity: usize,
    pub reliable_queue_capacity: usize,
}

impl ChannelOptions {
    pub fn from_config(config: &Config, pool: Arc<BufferPool>, stats: Arc<ConnectionStats>) -> Self {
        Self {
            pool,
            stats,
            max_packet_size: config.max_packet_size,
            window_size: config.window_size,
            initial_rto: config.initial_rto(),
            max_rto: config.max_rto(),
            unreliable_queue_capacity: config.unreliable_queue_capacity,
            reliable_queue_capacity: config.reliable_queue_capacity,
        }
    }
}

/// 채널 (전달 방식별 변형)
#[derive(Debug)]
pub enum Channel {
    Unreliable(UnreliableChannel),
    Reliable(ReliableChannel),
}

impl Channel {
    /// 전달 방식에 맞는 채널 생성
    pub fn new(id: u8, delivery: DeliveryMethod, options: &ChannelOptions) -> Self {
        match delivery {
            DeliveryMethod::Unreliable => Channel::Unreliable(UnreliableChannel::new(id, options)),
            DeliveryMethod::Reliable => Channel::Reliable(ReliableChannel::new(id, options)),
        }
    }

    /// 수신 패킷 플래그로 채널 생성 (상대가 먼저 사용한 채널)
    pub fn for_flags(id: u8, flags: PacketFlags, options: &ChannelOptions) -> Self {
        Self::new(id, DeliveryMethod::from_flags(flags), options)
    }

    pub fn id(&self) -> u8 {
        match self {
            Channel::Unreliable(c) => c.id(),
            Channel::Reliable(c) => c.id(),
        }
    }

    pub fn delivery(&self) -> DeliveryMethod {
        match self {
            Channel::Unreliable(_) => DeliveryMethod::Unreliable,
            Channel::Reliable(_) => DeliveryMethod::Reliable,
        }
    }

    /// 페이로드를 송신 큐에 넣음 (블로킹 없음)
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        match self {
            Channel::Unreliable(c) => c.send(payload),
            Channel::Reliable(c) => c.send(payload),
        }
    }

    /// 수신 데이터 패킷 처리, 애플리케이션에 넘길 패킷은 `deliver`로 전달
    ///
    /// 비신뢰 채널에 신뢰 패킷이 오면 ACK만 보내고 `DeliveryMismatch` 반환.
    pub fn receive<D>(&self, packet: Packet, deliver: &mut D) -> Result<()>
    where
        D: FnMut(Packet),
    {
        match self {
            Channel::Unreliable(c) => c.receive(packet, deliver),
            Channel::Reliable(c) => {
                c.receive(packet, deliver);
                Ok(())
            }
        }
    }

    /// ACK 처리 (비신뢰 채널은 무시)
    pub fn receive_ack(&self, sequence: u16) -> bool {
        match self {
            Channel::Unreliable(_) => false,
            Channel::Reliable(c) => c.receive_ack(sequence),
        }
    }

    /// 송신 단계: 보낼 패킷을 `transmit`에 빌려줌
    pub fn process<T>(&self, now: Instant, transmit: &mut T)
    where
        T: FnMut(&Packet),
    {
        match self {
            Channel::Unreliable(c) => c.process(transmit),
            Channel::Reliable(c) => c.process(now, transmit),
        }
    }
}

/// 비신뢰 채널
///
/// 고정 크기 큐, 가득 차면 가장 오래된 패킷을 꺼내 버리고 새 패킷을 넣음.
#[derive(Debug)]
pub struct UnreliableChannel {
    id: u8,
    options: ChannelOptions,
    queue_tx: Sender<Packet>,
    queue_rx: Receiver<Packet>,

    /// 잘못 들어온 신뢰 패킷에 대한 ACK (상대 재전송 중단용)
    ack_tx: Sender<Packet>,
    ack_rx: Receiver<Packet>,
}

impl UnreliableChannel {
    pub fn new(id: u8, options: &ChannelOptions) -> Self {
        let (queue_tx, queue_rx) = bounded(options.unreliable_queue_capacity);
        let (ack_tx, ack_rx) = bounded(options.unreliable_queue_capacity);
        Self {
            id,
            options: options.clone(),
            queue_tx,
            queue_rx,
            ack_tx,
            ack_rx,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let mut packet = Packet::data(
            &self.options.pool,
            PacketFlags::NONE,
            self.id,
            0,
            payload,
            self.options.max_packet_size,
        )?;

        loop {
            match self.queue_tx.try_send(packet) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(rejected)) => {
                    if let Ok(evicted) = self.queue_rx.try_recv() {
                        trace!("채널 {} 큐 가득 참, 오래된 패킷 폐기 ({} bytes)", self.id, evicted.len());
                        self.options.stats.record_eviction();
                    }
                    packet = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return Err(Error::ConnectionClosed),
            }
        }
    }

    pub fn receive<D>(&self, packet: Packet, deliver: &mut D) -> Result<()>
    where
        D: FnMut(Packet),
    {
        if packet.flags().is_reliable() {
            debug!(
                "비신뢰 채널 {}에 신뢰 패킷 수신, ACK 후 폐기 (seq={})",
                self.id,
                packet.sequence()
            );
            // 가득 차면 상대가 다시 보냄
            let _ = self
                .ack_tx
                .try_send(Packet::ack(&self.options.pool, self.id, packet.sequence()));
            return Err(Error::DeliveryMismatch { channel_id: self.id });
        }
        deliver(packet);
        Ok(())
    }

    pub fn process<T>(&self, transmit: &mut T)
    where
        T: FnMut(&Packet),
    {
        while let Ok(ack) = self.ack_rx.try_recv() {
            transmit(&ack);
        }
        while let Ok(packet) = self.queue_rx.try_recv() {
            transmit(&packet);
        }
    }

    /// 대기 중인 패킷 수
    pub fn queued(&self) -> usize {
        self.queue_rx.len()
    }
}
