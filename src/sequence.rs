//! 16비트 시퀀스 번호 연산 (wraparound 고려)

/// 시퀀스 번호 타입
pub type Sequence = u16;

/// 시퀀스 공간의 절반 (2^15)
pub const HALF_RANGE: u16 = 0x8000;

/// `a`가 `b`보다 새로운지 여부
///
/// `(a - b) mod 2^16 < 2^15` 이면 새로운 것으로 본다. 같은 값은 새롭지 않음.
#[inline]
pub fn is_newer(a: Sequence, b: Sequence) -> bool {
    a != b && a.wrapping_sub(b) < HALF_RANGE
}

/// `b`에서 `a`까지의 전방 거리
#[inline]
pub fn distance(a: Sequence, b: Sequence) -> u16 {
    a.wrapping_sub(b)
}
