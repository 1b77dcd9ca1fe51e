//! 연결 통계

use std::sync::atomic::{AtomicU64, Ordering};

/// 연결별 카운터 (여러 태스크에서 동시에 갱신)
#[derive(Debug, Default)]
pub struct ConnectionStats {
    pub(crate) packets_sent: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) packets_received: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) retransmissions: AtomicU64,
    pub(crate) duplicates_dropped: AtomicU64,
    pub(crate) evicted: AtomicU64,
    pub(crate) send_errors: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_retransmission(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// 현재 값 복사
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// 통계 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// 보낸 데이터그램 수 (재전송 포함)
    pub packets_sent: u64,

    /// 보낸 바이트 (헤더 포함)
    pub bytes_sent: u64,

    /// 받은 데이터그램 수
    pub packets_received: u64,

    /// 받은 바이트
    pub bytes_received: u64,

    /// 재전송 횟수
    pub retransmissions: u64,

    /// 중복/오래된 신뢰 패킷 폐기 수
    pub duplicates_dropped: u64,

    /// 비신뢰 큐에서 밀려난 패킷 수
    pub evicted: u64,

    /// 송신 실패 수
    pub send_errors: u64,
}

impl StatsSnapshot {
    /// 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.retransmissions as f64 / self.packets_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Sent: {} pkts / {} bytes | Recv: {} pkts / {} bytes | Retx: {} ({:.2}%) | Dup: {} | Evicted: {} | Errors: {}",
            self.packets_sent,
            self.bytes_sent,
            self.packets_received,
            self.bytes_received,
            self.retransmissions,
            self.retransmit_ratio() * 100.0,
            self.duplicates_dropped,
            self.evicted,
            self.send_errors,
        )
    }
}
