//! RTT 추정기
//!
//! TCP 방식 지수 이동 평균:
//! `err = sample - srtt; srtt += alpha * err; jitter += beta * (|err| - jitter)`

use std::time::Duration;

/// 평활 RTT 가중치
pub const RTT_ALPHA: f64 = 0.125;

/// 지터 가중치
pub const JITTER_BETA: f64 = 0.25;

/// 평활 RTT / 지터 추정
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    /// 마지막 원본 샘플
    last_sample: Option<Duration>,

    /// 평활 RTT (마이크로초, f64로 누적)
    smoothed_us: f64,

    /// 지터 (마이크로초)
    jitter_us: f64,

    /// 샘플 수
    samples: u64,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 샘플 반영 후 평활 RTT 반환
    pub fn update(&mut self, sample: Duration) -> Duration {
        let sample_us = sample.as_secs_f64() * 1_000_000.0;

        if self.samples == 0 {
            self.smoothed_us = sample_us;
            self.jitter_us = 0.0;
        } else {
            let error = sample_us - self.smoothed_us;
            self.smoothed_us += RTT_ALPHA * error;
            self.jitter_us += JITTER_BETA * (error.abs() - self.jitter_us);
        }

        self.samples += 1;
        self.last_sample = Some(sample);
        self.smoothed()
    }

    /// 평활 RTT (샘플 없으면 0)
    pub fn smoothed(&self) -> Duration {
        Duration::from_secs_f64(self.smoothed_us.max(0.0) / 1_000_000.0)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_secs_f64(self.jitter_us.max(0.0) / 1_000_000.0)
    }

    pub fn last_sample(&self) -> Option<Duration> {
        self.last_sample
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }
}
