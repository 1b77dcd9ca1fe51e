//! 패킷 버퍼 풀
//!
//! - 수신/송신 버퍼를 재사용해서 할당 횟수를 줄임
//! - `PooledBuffer`는 버퍼의 유일한 소유자, drop 시 한 번만 풀로 반환됨

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// 공유 버퍼 풀
#[derive(Debug)]
pub struct BufferPool {
    /// 반환된 버퍼 목록
    free: Mutex<Vec<BytesMut>>,

    /// 새 버퍼의 기본 용량
    buffer_size: usize,

    /// 풀에 보관할 최대 버퍼 수
    capacity: usize,
}

impl BufferPool {
    /// 새 풀 생성
    pub fn new(buffer_size: usize, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            buffer_size,
            capacity,
        })
    }

    /// 빈 버퍼 대여 (최소 `min_capacity` 바이트)
    pub fn rent(self: &Arc<Self>, min_capacity: usize) -> PooledBuffer {
        let mut buf = self.free.lock().pop().unwrap_or_default();
        buf.clear();
        buf.reserve(min_capacity.max(self.buffer_size));

        PooledBuffer {
            buf,
            pool: Some(Arc::clone(self)),
        }
    }

    /// 수신용 버퍼 대여 (`len` 바이트로 0 초기화)
    pub fn rent_zeroed(self: &Arc<Self>, len: usize) -> PooledBuffer {
        let mut buffer = self.rent(len);
        buffer.resize(len, 0);
        buffer
    }

    /// 현재 풀에 남은 버퍼 수
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// 기본 버퍼 크기
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn release(&self, buf: BytesMut) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }
}

/// 풀에서 빌린 버퍼 핸들
///
/// 복제 불가. 소유권 이동으로만 전달되며 drop이 유일한 반환 지점.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Option<Arc<BufferPool>>,
}

impl PooledBuffer {
    /// 풀 없이 단독 버퍼 생성 (drop 시 그냥 해제)
    pub fn detached(buf: BytesMut) -> Self {
        Self { buf, pool: None }
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.buf));
        }
    }
}
