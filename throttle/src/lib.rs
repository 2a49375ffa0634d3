//! Resource throttling for remote share transfers
//!
//! Every transfer, download and archive build in sharecat funnels through the
//! process-wide limits defined here. All limits are disabled until configured.
//!
//! # Limits
//!
//! 1. **Open streams** - caps the number of file streams (remote reads and writes) held open at
//!    the same time. Permits are released when the returned guard is dropped.
//! 2. **Operations** - caps directory entries visited per second, which bounds the rate of
//!    listing and stat calls sent to a share.
//! 3. **Transfer chunks** - caps chunk-sized I/O per second. A file of `size` bytes costs
//!    `⌈size / chunk_size⌉` tokens, so this approximates a bandwidth limit.
//!
//! Rate limits are token buckets refilled by a background task:
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! # async fn example() {
//! throttle::set_max_open_streams(64);
//! throttle::init_ops_tokens(50);
//! tokio::spawn(throttle::run_ops_replenish_thread(50, Duration::from_millis(100)));
//!
//! throttle::get_ops_token().await;
//! throttle::get_transfer_tokens(64 * 1024, 1024 * 1024).await;
//! let _stream = throttle::open_stream_permit().await;
//! // open and copy the file while `_stream` is alive
//! # }
//! ```

mod semaphore;

static OPEN_STREAMS_LIMIT: semaphore::Semaphore = semaphore::Semaphore::new();
static OPS_THROTTLE: semaphore::Semaphore = semaphore::Semaphore::new();
static TRANSFER_THROTTLE: semaphore::Semaphore = semaphore::Semaphore::new();

pub fn set_max_open_streams(max_open_streams: usize) {
    OPEN_STREAMS_LIMIT.setup(max_open_streams);
}

/// Holds one open-stream slot until dropped.
pub struct OpenStreamGuard {
    _permit: Option<tokio::sync::SemaphorePermit<'static>>,
}

pub async fn open_stream_permit() -> OpenStreamGuard {
    OpenStreamGuard {
        _permit: OPEN_STREAMS_LIMIT.acquire().await,
    }
}

pub fn init_ops_tokens(ops_tokens: usize) {
    OPS_THROTTLE.setup(ops_tokens);
}

pub fn init_transfer_tokens(transfer_tokens: usize) {
    TRANSFER_THROTTLE.setup(transfer_tokens);
}

pub async fn get_ops_token() {
    OPS_THROTTLE.consume_many(1).await;
}

/// Number of chunk tokens a transfer of `size` bytes costs; zero-length files cost one.
#[must_use]
pub fn transfer_cost(chunk_size: u64, size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    1 + (std::cmp::max(1, size) - 1) / chunk_size
}

pub async fn get_transfer_tokens(chunk_size: u64, size: u64) {
    let tokens = transfer_cost(chunk_size, size);
    if tokens == 0 {
        return;
    }
    match u32::try_from(tokens) {
        Ok(tokens) => TRANSFER_THROTTLE.consume_many(tokens).await,
        Err(_) => tracing::error!(
            "chunk size: {} is too small to limit throughput for files this big, size: {}",
            chunk_size,
            size,
        ),
    }
}

pub async fn run_ops_replenish_thread(replenish: usize, interval: std::time::Duration) {
    OPS_THROTTLE.run_replenish_thread(replenish, interval).await;
}

pub async fn run_transfer_replenish_thread(replenish: usize, interval: std::time::Duration) {
    TRANSFER_THROTTLE
        .run_replenish_thread(replenish, interval)
        .await;
}
