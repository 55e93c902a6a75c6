//! Fixed-size reusable byte buffers. A bounded free-list stands in for a GC
//! pool: buffers are exclusively owned between `get` and `put`, and
//! foreign-sized buffers are silently dropped so they never pollute the pool.

use std::sync::{Mutex, OnceLock};

/// Standard buffer size for transfer and hashing loops (256 KiB).
pub const BUFFER_SIZE: usize = 256 * 1024;

/// Upper bound on pooled buffers (32 MiB resident worst case).
const POOL_CAPACITY: usize = 128;

fn pool() -> &'static Mutex<Vec<Vec<u8>>> {
    static POOL: OnceLock<Mutex<Vec<Vec<u8>>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(Vec::new()))
}

/// Returns a zero-filled buffer of exactly [`BUFFER_SIZE`] bytes.
pub fn get() -> Vec<u8> {
    let recycled = {
        let mut free = pool().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        free.pop()
    };
    recycled.unwrap_or_else(|| vec![0u8; BUFFER_SIZE])
}

/// Returns a buffer to the pool. Buffers with capacity below [`BUFFER_SIZE`]
/// are dropped; larger ones are resliced back to the standard length.
pub fn put(mut buf: Vec<u8>) {
    if buf.capacity() < BUFFER_SIZE {
        return;
    }
    buf.clear();
    buf.resize(BUFFER_SIZE, 0);
    let mut free = pool().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if free.len() < POOL_CAPACITY {
        free.push(buf);
    }
}
