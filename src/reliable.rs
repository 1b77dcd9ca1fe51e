//! 신뢰 채널
//!
//! 송신 측:
//! - 시퀀스 번호는 송신 큐에 넣을 때 할당 (래핑 u16)
//! - 미확인 패킷은 최대 `window_size`개, 가장 오래된 미확인 패킷과의 거리도 `window_size` 미만
//! - RTO 만료 시 재전송, RTO는 두 배씩 늘어나고 `max_rto`에서 멈춤
//!
//! 수신 측:
//! - 윈도우 안의 모든 신뢰 패킷에 ACK (중복 포함, 앞선 ACK가 유실됐을 수 있음)
//! - 기대 시퀀스면 즉시 전달 후 재정렬 버퍼에서 연속 구간을 이어서 전달
//! - 앞선 시퀀스는 버퍼링, 지난 시퀀스는 폐기
//! - 기대 시퀀스보다 `window_size` 이상 앞선 패킷은 ACK 없이 폐기 (재정렬 버퍼 상한)

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::channel::ChannelOptions;
use crate::packet::{Packet, PacketFlags};
use crate::sequence::{distance, is_newer, Sequence};
use crate::{Error, Result};

/// 확인 대기 중인 패킷
#[derive(Debug)]
struct InFlight {
    packet: Packet,
    rto: Duration,
    retransmit_at: Instant,
    retransmits: u32,
}

/// 송신 윈도우 상태
#[derive(Debug)]
struct SendWindow {
    in_flight: HashMap<Sequence, InFlight>,

    /// 송신 큐에서 다음에 꺼낼 패킷의 시퀀스
    next_unsent: Sequence,
}

impl SendWindow {
    /// 다음 패킷을 보내도 상대 수신 윈도우를 넘지 않는지
    fn has_room(&self, window_size: usize) -> bool {
        self.in_flight.len() < window_size
            && self
                .in_flight
                .keys()
                .all(|&sequence| (distance(self.next_unsent, sequence) as usize) < window_size)
    }
}

/// 수신 순서 상태
#[derive(Debug, Default)]
struct ReceiveWindow {
    /// 다음에 전달할 시퀀스
    expected: Sequence,

    /// 먼저 도착한 패킷
    reorder: HashMap<Sequence, Packet>,
}

#[derive(Debug)]
pub struct ReliableChannel {
    id: u8,
    options: ChannelOptions,

    /// 다음 송신 시퀀스, 할당과 큐 삽입을 한 번에 잠금
    next_sequence: Mutex<Sequence>,
    send_tx: Sender<Packet>,
    send_rx: Receiver<Packet>,

    ack_tx: Sender<Packet>,
    ack_rx: Receiver<Packet>,

    window: Mutex<SendWindow>,
    receive: Mutex<ReceiveWindow>,
}

impl ReliableChannel {
    pub fn new(id: u8, options: &ChannelOptions) -> Self {
        let (send_tx, send_rx) = bounded(options.reliable_queue_capacity);
        let (ack_tx, ack_rx) = unbounded();

        Self {
            id,
            options: options.clone(),
            next_sequence: Mutex::new(0),
            send_tx,
            send_rx,
            ack_tx,
            ack_rx,
            window: Mutex::new(SendWindow {
                in_flight: HashMap::with_capacity(options.window_size),
                next_unsent: 0,
            }),
            receive: Mutex::new(ReceiveWindow::default()),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// 시퀀스 할당 후 송신 큐에 추가
    ///
    /// 큐가 가득 차면 시퀀스를 소비하지 않고 `SendQueueFull` 반환.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let mut next = self.next_sequence.lock();
        let packet = Packet::data(
            &self.options.pool,
            PacketFlags::RELIABLE,
            self.id,
            *next,
            payload,
            self.options.max_packet_size,
        )?;

        match self.send_tx.try_send(packet) {
            Ok(()) => {
                *next = next.wrapping_add(1);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(Error::SendQueueFull {
                channel_id: self.id,
                capacity: self.options.reliable_queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(Error::ConnectionClosed),
        }
    }

    /// 수신한 신뢰 패킷 처리
    pub fn receive<D>(&self, packet: Packet, deliver: &mut D)
    where
        D: FnMut(Packet),
    {
        if !packet.flags().is_reliable() {
            // 같은 채널 ID로 온 비신뢰 데이터는 순서 없이 바로 전달
            deliver(packet);
            return;
        }

        let sequence = packet.sequence();
        let mut window = self.receive.lock();
        let expected = window.expected;

        if is_newer(sequence, expected)
            && distance(sequence, expected) as usize >= self.options.window_size
        {
            debug!(
                "채널 {} 수신 윈도우 밖 패킷 폐기 (seq={}, expected={})",
                self.id, sequence, expected
            );
            return;
        }

        let _ = self
            .ack_tx
            .send(Packet::ack(&self.options.pool, self.id, sequence));

        if sequence == expected {
            window.expected = window.expected.wrapping_add(1);
            deliver(packet);

            loop {
                let expected = window.expected;
                let Some(next) = window.reorder.remove(&expected) else {
                    break;
                };
                window.expected = expected.wrapping_add(1);
                deliver(next);
            }
        } else if is_newer(sequence, expected) {
            match window.reorder.entry(sequence) {
                Entry::Occupied(_) => {
                    trace!("채널 {} 중복 패킷 (seq={}, 버퍼링됨)", self.id, sequence);
                    self.options.stats.record_duplicate();
                }
                Entry::Vacant(slot) => {
                    trace!(
                        "채널 {} 순서 어긋남 (seq={}, expected={})",
                        self.id,
                        sequence,
                        expected
                    );
                    slot.insert(packet);
                }
            }
        } else {
            trace!("채널 {} 지난 패킷 폐기 (seq={})", self.id, sequence);
            self.options.stats.record_duplicate();
        }
    }

    /// ACK 수신, 미확인 목록에서 제거 (제거된 경우 true)
    pub fn receive_ack(&self, sequence: Sequence) -> bool {
        self.window.lock().in_flight.remove(&sequence).is_some()
    }

    /// 송신 단계
    ///
    /// 1. 대기 중인 ACK 전송
    /// 2. 윈도우 여유만큼 새 패킷 전송 후 미확인 목록에 등록
    /// 3. RTO가 지난 패킷 재전송
    pub fn process<T>(&self, now: Instant, transmit: &mut T)
    where
        T: FnMut(&Packet),
    {
        while let Ok(ack) = self.ack_rx.try_recv() {
            transmit(&ack);
        }

        let mut window = self.window.lock();

        while window.has_room(self.options.window_size) {
            let Ok(packet) = self.send_rx.try_recv() else {
                break;
            };
            transmit(&packet);

            let rto = self.options.initial_rto;
            window.next_unsent = packet.sequence().wrapping_add(1);
            window.in_flight.insert(
                packet.sequence(),
                InFlight {
                    packet,
                    rto,
                    retransmit_at: now + rto,
                    retransmits: 0,
                },
            );
        }

        for (sequence, entry) in window.in_flight.iter_mut() {
            if now < entry.retransmit_at {
                continue;
            }
            entry.rto = (entry.rto * 2).min(self.options.max_rto);
            entry.retransmit_at = now + entry.rto;
            entry.retransmits += 1;
            debug!(
                "채널 {} 재전송 (seq={}, 횟수={}, rto={:?})",
                self.id, sequence, entry.retransmits, entry.rto
            );
            self.options.stats.record_retransmission();
            transmit(&entry.packet);
        }
    }

    /// 미확인 패킷 수
    pub fn in_flight(&self) -> usize {
        self.window.lock().in_flight.len()
    }

    /// 송신 대기 패킷 수
    pub fn queued(&self) -> usize {
        self.send_rx.len()
    }

    /// 다음 수신 기대 시퀀스
    pub fn expected_sequence(&self) -> Sequence {
        self.receive.lock().expected
    }

    /// 재정렬 버퍼에 보관된 패킷 수
    pub fn buffered(&self) -> usize {
        self.receive.lock().reorder.len()
    }

    #[cfg(test)]
    fn retransmit_deadline(&self, sequence: Sequence) -> Option<(Instant, Duration)> {
        self.window
            .lock()
            .in_flight
            .get(&sequence)
            .map(|entry| (entry.retransmit_at, entry.rto))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::packet::PacketType;
    use crate::pool::BufferPool;
    use crate::stats::ConnectionStats;
    use crate::Config;

    fn options() -> ChannelOptions {
        ChannelOptions::from_config(
            &Config::default(),
            BufferPool::new(64, 256),
            Arc::new(ConnectionStats::new()),
        )
    }

    fn incoming(options: &ChannelOptions, sequence: Sequence, payload: &[u8]) -> Packet {
        Packet::data(&options.pool, PacketFlags::RELIABLE, 0, sequence, payload, 1024).unwrap()
    }

    fn drain(channel: &ReliableChannel, now: Instant) -> Vec<(PacketType, Sequence)> {
        let mut sent = Vec::new();
        channel.process(now, &mut |p: &Packet| sent.push((p.packet_type(), p.sequence())));
        sent
    }

    #[test]
    fn test_sequences_are_assigned_in_order() {
        let opts = options();
        let channel = ReliableChannel::new(0, &opts);
        for _ in 0..3 {
            channel.send(b"data").unwrap();
        }

        let sent = drain(&channel, Instant::now());
        assert_eq!(
            sent,
            vec![(PacketType::Data, 0), (PacketType::Data, 1), (PacketType::Data, 2)]
        );
        assert_eq!(channel.in_flight(), 3);
    }

    #[test]
    fn test_window_limits_in_flight() {
        let mut opts = options();
        opts.window_size = 4;
        let channel = ReliableChannel::new(0, &opts);
        for _ in 0..10 {
            channel.send(b"x").unwrap();
        }

        let now = Instant::now();
        assert_eq!(drain(&channel, now).len(), 4);
        assert_eq!(channel.in_flight(), 4);
        assert_eq!(channel.queued(), 6);

        // ACK 두 개 → 두 개 더 보냄
        assert!(channel.receive_ack(0));
        assert!(channel.receive_ack(1));
        let sent = drain(&channel, now);
        assert_eq!(sent, vec![(PacketType::Data, 4), (PacketType::Data, 5)]);
    }

    #[test]
    fn test_window_waits_for_oldest_unacked() {
        let mut opts = options();
        opts.window_size = 4;
        let channel = ReliableChannel::new(0, &opts);
        for _ in 0..8 {
            channel.send(b"x").unwrap();
        }

        let now = Instant::now();
        assert_eq!(drain(&channel, now).len(), 4);

        // 0이 남아 있으면 4는 상대 수신 윈도우 밖
        for seq in 1..4 {
            assert!(channel.receive_ack(seq));
        }
        assert!(drain(&channel, now).is_empty());
        assert_eq!(channel.in_flight(), 1);

        assert!(channel.receive_ack(0));
        let sent = drain(&channel, now);
        assert_eq!(
            sent,
            vec![
                (PacketType::Data, 4),
                (PacketType::Data, 5),
                (PacketType::Data, 6),
                (PacketType::Data, 7)
            ]
        );
    }

    #[test]
    fn test_packets_beyond_window_are_dropped_without_ack() {
        let mut opts = options();
        opts.window_size = 4;
        let channel = ReliableChannel::new(0, &opts);
        let mut delivered = 0;

        let far: Vec<Packet> = [4u16, 100, 0x7FFF]
            .iter()
            .map(|&seq| incoming(&opts, seq, b"far"))
            .collect();
        for packet in far {
            channel.receive(packet, &mut |_: Packet| delivered += 1);
        }
        assert_eq!(channel.buffered(), 0);
        assert!(drain(&channel, Instant::now()).is_empty());
        // 폐기된 패킷 버퍼는 풀로 반환됨
        assert_eq!(opts.pool.available(), 3);

        channel.receive(incoming(&opts, 3, b"near"), &mut |_: Packet| delivered += 1);
        assert_eq!(channel.buffered(), 1);
        assert_eq!(drain(&channel, Instant::now()), vec![(PacketType::Ack, 3)]);
        assert_eq!(delivered, 0);
    }

    #[test]
    fn test_queue_full_does_not_consume_sequence() {
        let mut opts = options();
        opts.reliable_queue_capacity = 2;
        let channel = ReliableChannel::new(7, &opts);

        channel.send(b"a").unwrap();
        channel.send(b"b").unwrap();
        assert!(matches!(
            channel.send(b"c"),
            Err(Error::SendQueueFull {
                channel_id: 7,
                capacity: 2
            })
        ));

        drain(&channel, Instant::now());
        channel.send(b"c").unwrap();
        let sent = drain(&channel, Instant::now());
        assert_eq!(sent, vec![(PacketType::Data, 2)]);
    }

    #[test]
    fn test_retransmit_with_exponential_backoff() {
        let mut opts = options();
        opts.initial_rto = Duration::from_millis(100);
        opts.max_rto = Duration::from_millis(300);
        let channel = ReliableChannel::new(0, &opts);
        channel.send(b"x").unwrap();

        let start = Instant::now();
        assert_eq!(drain(&channel, start).len(), 1);
        assert_eq!(
            channel.retransmit_deadline(0),
            Some((start + Duration::from_millis(100), Duration::from_millis(100)))
        );

        // 만료 전에는 재전송 없음
        assert!(drain(&channel, start + Duration::from_millis(50)).is_empty());

        let t1 = start + Duration::from_millis(100);
        assert_eq!(drain(&channel, t1), vec![(PacketType::Data, 0)]);
        assert_eq!(
            channel.retransmit_deadline(0),
            Some((t1 + Duration::from_millis(200), Duration::from_millis(200)))
        );

        let t2 = t1 + Duration::from_millis(200);
        assert_eq!(drain(&channel, t2).len(), 1);
        // 상한에서 멈춤
        assert_eq!(
            channel.retransmit_deadline(0),
            Some((t2 + Duration::from_millis(300), Duration::from_millis(300)))
        );
        assert_eq!(opts.stats.snapshot().retransmissions, 2);

        // ACK 후에는 더 이상 재전송 없음
        assert!(channel.receive_ack(0));
        assert!(!channel.receive_ack(0));
        assert!(drain(&channel, t2 + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_in_order_delivery_acks_everything() {
        let opts = options();
        let channel = ReliableChannel::new(0, &opts);

        let mut delivered = Vec::new();
        for seq in 0..3 {
            channel.receive(incoming(&opts, seq, &[seq as u8]), &mut |p: Packet| {
                delivered.push(p.payload()[0])
            });
        }
        assert_eq!(delivered, vec![0, 1, 2]);

        let acks = drain(&channel, Instant::now());
        assert_eq!(
            acks,
            vec![(PacketType::Ack, 0), (PacketType::Ack, 1), (PacketType::Ack, 2)]
        );
    }

    #[test]
    fn test_reorder_buffer_drains_contiguous_run() {
        let opts = options();
        let channel = ReliableChannel::new(0, &opts);
        let mut delivered = Vec::new();

        for seq in [2u16, 1, 4] {
            channel.receive(incoming(&opts, seq, &[seq as u8]), &mut |p: Packet| {
                delivered.push(p.payload()[0])
            });
        }
        assert!(delivered.is_empty());
        assert_eq!(channel.buffered(), 3);

        channel.receive(incoming(&opts, 0, &[0]), &mut |p: Packet| {
            delivered.push(p.payload()[0])
        });
        assert_eq!(delivered, vec![0, 1, 2]);
        assert_eq!(channel.expected_sequence(), 3);
        assert_eq!(channel.buffered(), 1);

        channel.receive(incoming(&opts, 3, &[3]), &mut |p: Packet| {
            delivered.push(p.payload()[0])
        });
        assert_eq!(delivered, vec![0, 1, 2, 3, 4]);
        assert_eq!(channel.buffered(), 0);
    }

    #[test]
    fn test_duplicates_are_acked_but_not_delivered() {
        let opts = options();
        let channel = ReliableChannel::new(0, &opts);
        let mut delivered = 0;

        channel.receive(incoming(&opts, 0, b"a"), &mut |_: Packet| delivered += 1);
        channel.receive(incoming(&opts, 0, b"a"), &mut |_: Packet| delivered += 1);
        channel.receive(incoming(&opts, 5, b"f"), &mut |_: Packet| delivered += 1);
        channel.receive(incoming(&opts, 5, b"f"), &mut |_: Packet| delivered += 1);

        assert_eq!(delivered, 1);
        assert_eq!(channel.buffered(), 1);
        assert_eq!(opts.stats.snapshot().duplicates_dropped, 2);
        assert_eq!(drain(&channel, Instant::now()).len(), 4);
    }

    #[test]
    fn test_delivery_across_wraparound() {
        let opts = options();
        let sender = ReliableChannel::new(0, &opts);
        *sender.next_sequence.lock() = u16::MAX - 1;
        let receiver = ReliableChannel::new(0, &opts);
        receiver.receive.lock().expected = u16::MAX - 1;

        for i in 0u8..4 {
            sender.send(&[i]).unwrap();
        }

        let mut wire = Vec::new();
        sender.process(Instant::now(), &mut |p: &Packet| {
            wire.push((p.sequence(), p.payload().to_vec()))
        });
        assert_eq!(
            wire.iter().map(|(s, _)| *s).collect::<Vec<_>>(),
            vec![u16::MAX - 1, u16::MAX, 0, 1]
        );

        // 역순으로 도착해도 원래 순서대로 전달
        let mut delivered = Vec::new();
        for (sequence, payload) in wire.iter().rev() {
            receiver.receive(incoming(&opts, *sequence, payload), &mut |p: Packet| {
                delivered.push(p.payload()[0])
            });
        }
        assert_eq!(delivered, vec![0, 1, 2, 3]);
        assert_eq!(receiver.expected_sequence(), 2);
    }
}
