//! 프로세스 단위 단조 시계
//!
//! Ping/Pong 타임스탬프는 프로세스 기준 시점부터의 마이크로초.
//! 값은 보낸 쪽에서만 해석되므로 상대방 시계와 맞출 필요 없음.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// `instant`를 기준 시점부터의 마이크로초로 변환
pub fn to_micros(instant: Instant) -> u64 {
    instant.saturating_duration_since(epoch()).as_micros() as u64
}

/// 마이크로초 타임스탬프를 `Instant`로 되돌림
pub fn from_micros(micros: u64) -> Instant {
    epoch() + Duration::from_micros(micros)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_micros_are_monotonic() {
        let a = to_micros(Instant::now());
        std::thread::sleep(Duration::from_millis(2));
        let b = to_micros(Instant::now());
        assert!(b >= a + 1000);
    }

    #[test]
    fn test_conversion_round_trip() {
        let _ = epoch();
        let now = Instant::now();
        let micros = to_micros(now);
        let back = from_micros(micros);
        // 마이크로초 미만은 버려짐
        assert!(now.duration_since(back) < Duration::from_micros(1));
    }
}
