use tracing::{event, instrument, Level};

#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<parking_lot::Mutex<u64>>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| parking_lot::Mutex::new(0));
        *mutex.lock() += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |x, y| x + *y.lock())
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ProgressCounter {
    started: TlsCounter,
    finished: TlsCounter,
}

impl Default for ProgressCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressGuard<'a> {
    progress: &'a ProgressCounter,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(progress: &'a ProgressCounter) -> Self {
        progress.started.inc();
        Self { progress }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.progress.finished.inc();
    }
}

pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self {
            started: TlsCounter::new(),
            finished: TlsCounter::new(),
        }
    }

    pub fn guard(&self) -> ProgressGuard<'_> {
        ProgressGuard::new(self)
    }

    #[instrument]
    pub fn get(&self) -> Status {
        let mut status = Status {
            started: self.started.get(),
            finished: self.finished.get(),
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

/// Process-wide counters shared by transfers, archive builds and scans.
pub struct Progress {
    pub ops: ProgressCounter,
    pub bytes_copied: TlsCounter,
    pub files_copied: TlsCounter,
    pub directories_created: TlsCounter,
    pub directories_unchanged: TlsCounter,
    pub archive_entries: TlsCounter,
    pub archive_bytes: TlsCounter,
    pub scan_entries: TlsCounter,
    pub scan_errors: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            ops: Default::default(),
            bytes_copied: Default::default(),
            files_copied: Default::default(),
            directories_created: Default::default(),
            directories_unchanged: Default::default(),
            archive_entries: Default::default(),
            archive_bytes: Default::default(),
            scan_entries: Default::default(),
            scan_errors: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_ops: u64,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_ops: progress.ops.get().finished,
            last_bytes: progress.bytes_copied.get() + progress.archive_bytes.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> String {
        let time_now = std::time::Instant::now();
        let ops = self.progress.ops.get();
        let total_duration_secs = self.progress.get_duration().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let average_ops_rate = ops.finished as f64 / total_duration_secs;
        let current_ops_rate = ops.finished.saturating_sub(self.last_ops) as f64 / curr_duration_secs;
        let bytes = self.progress.bytes_copied.get() + self.progress.archive_bytes.get();
        let average_bytes_rate = bytes as f64 / total_duration_secs;
        let current_bytes_rate = bytes.saturating_sub(self.last_bytes) as f64 / curr_duration_secs;
        self.last_ops = ops.finished;
        self.last_bytes = bytes;
        self.last_update = time_now;
        format!(
            "---------------------\n\
            OPS:\n\
            pending: {:>10}\n\
            average: {:>10.2} items/s\n\
            current: {:>10.2} items/s\n\
            -----------------------\n\
            TRANSFERRED:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}\n\
            \n\
            files:       {:>10}\n\
            directories: {:>10}\n\
            unchanged:   {:>10}\n\
            -----------------------\n\
            ARCHIVED:\n\
            entries:     {:>10}\n\
            -----------------------\n\
            SCANNED:\n\
            entries:     {:>10}\n\
            errors:      {:>10}",
            ops.started - ops.finished, // pending
            average_ops_rate,
            current_ops_rate,
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(bytes),
            self.progress.files_copied.get(),
            self.progress.directories_created.get(),
            self.progress.directories_unchanged.get(),
            self.progress.archive_entries.get(),
            self.progress.scan_entries.get(),
            self.progress.scan_errors.get(),
        )
    }
}
