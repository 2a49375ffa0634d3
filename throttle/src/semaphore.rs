use std::sync::atomic::{AtomicBool, Ordering};

/// A token bucket that is a no-op until configured with a non-zero capacity.
pub struct Semaphore {
    enabled: AtomicBool,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            sem: tokio::sync::Semaphore::const_new(0),
        }
    }

    pub fn setup(&self, value: usize) {
        self.enabled.store(value > 0, Ordering::Release);
        if value == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(value);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub async fn acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if !self.is_enabled() {
            return None;
        }
        // the semaphore is never closed so acquire only fails if that invariant breaks
        self.sem.acquire().await.ok()
    }

    pub async fn consume_many(&self, value: u32) {
        if !self.is_enabled() {
            return;
        }
        if let Ok(permit) = self.sem.acquire_many(value).await {
            permit.forget();
        }
    }

    pub async fn run_replenish_thread(&self, replenish: usize, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            let curr_permits = self.sem.available_permits();
            if curr_permits >= replenish {
                continue;
            }
            self.sem.add_permits(replenish - curr_permits);
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}
