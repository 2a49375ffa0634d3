//! Data-access core of sharecat
//!
//! Provides pooled sessions to remote shares and the engines built on top of them: recursive
//! transfers, streaming ZIP archives of remote directories and background catalog scans.
//!
//! # Layers
//!
//! - [`storage`] - the per-session [`storage::RemoteStorage`] capability and its connectors
//! - [`pool`] - one shared session per [`pool::ConnectionKey`], bounded by a connection ceiling
//! - [`transfer`], [`archive`], [`scan`] - engines that walk directory trees through a session
//! - [`service`] - the [`service::Catalog`] entry point used by the command line tool
//!
//! # Runtime
//!
//! Command line tools call [`run`], which sets up logging, the tokio runtime, throttling and
//! progress reporting before executing the given future:
//!
//! ```rust,no_run
//! let summary = common::run(
//!     None,
//!     common::OutputConfig::default(),
//!     common::RuntimeConfig::default(),
//!     common::ThrottleConfig::default(),
//!     || async { Ok::<_, anyhow::Error>("done") },
//! );
//! assert!(summary.is_some());
//! ```

pub mod archive;
pub mod catalog;
pub mod config;
pub mod location;
pub mod pool;
pub mod progress;
pub mod scan;
pub mod service;
pub mod storage;
pub mod stream;
pub mod transfer;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig};

use std::io::IsTerminal;

static PROGRESS: std::sync::LazyLock<progress::Progress> =
    std::sync::LazyLock::new(progress::Progress::new);

/// Process-wide progress counters.
pub fn get_progress() -> &'static progress::Progress {
    &PROGRESS
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Progress bar when stderr is a terminal, text updates otherwise
    #[default]
    #[value(alias = "Auto")]
    Auto,
    /// Spinner redrawn in place
    #[value(alias = "ProgressBar")]
    ProgressBar,
    /// Periodic multi-line reports
    #[value(alias = "TextUpdates")]
    TextUpdates,
}

#[derive(Debug, Clone)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Delay between updates, e.g. "200ms" or "10s"
    pub progress_delay: Option<String>,
}

impl ProgressSettings {
    fn interactive(&self) -> bool {
        match self.progress_type {
            ProgressType::Auto => std::io::stderr().is_terminal(),
            ProgressType::ProgressBar => true,
            ProgressType::TextUpdates => false,
        }
    }

    fn delay(&self, interactive: bool) -> Result<std::time::Duration, humantime::DurationError> {
        match &self.progress_delay {
            Some(delay) => humantime::parse_duration(delay),
            None if interactive => Ok(std::time::Duration::from_millis(200)),
            None => Ok(std::time::Duration::from_secs(10)),
        }
    }
}

struct ProgressTracker {
    done: std::sync::Arc<(parking_lot::Mutex<bool>, parking_lot::Condvar)>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ProgressTracker {
    fn start(interactive: bool, delay: std::time::Duration) -> Self {
        let done = std::sync::Arc::new((parking_lot::Mutex::new(false), parking_lot::Condvar::new()));
        let thread = {
            let done = done.clone();
            std::thread::spawn(move || {
                let mut printer = progress::ProgressPrinter::new(get_progress());
                let bar = interactive.then(|| {
                    let bar = indicatif::ProgressBar::new_spinner();
                    bar.enable_steady_tick(delay);
                    bar
                });
                let (lock, cvar) = &*done;
                let mut is_done = lock.lock();
                while !*is_done {
                    match &bar {
                        Some(bar) => bar.set_message(printer.print()),
                        None => eprintln!("{}", printer.print()),
                    }
                    cvar.wait_for(&mut is_done, delay);
                }
                if let Some(bar) = bar {
                    bar.finish_and_clear();
                }
            })
        };
        Self {
            done,
            thread: Some(thread),
        }
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.done;
        *lock.lock() = true;
        cvar.notify_one();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("progress reporting thread panicked");
        }
    }
}

/// Splits a per-second rate into a token refill amount and interval.
///
/// Refills happen ten times a second unless the rate is too low to split evenly, in which case
/// a single token is added at a proportionally longer interval.
fn replenish_schedule(per_second: usize) -> (usize, std::time::Duration) {
    if per_second >= 10 {
        (per_second / 10, std::time::Duration::from_millis(100))
    } else {
        let per_second = std::cmp::max(per_second, 1) as u64;
        (1, std::time::Duration::from_millis(1000 / per_second))
    }
}

fn verbosity_filter(verbose: u8) -> tracing::level_filters::LevelFilter {
    match verbose {
        0 => tracing::level_filters::LevelFilter::ERROR,
        1 => tracing::level_filters::LevelFilter::INFO,
        2 => tracing::level_filters::LevelFilter::DEBUG,
        _ => tracing::level_filters::LevelFilter::TRACE,
    }
}

fn init_tracing(output: &OutputConfig) {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(verbosity_filter(output.verbose).into())
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to initialize logging: {error}");
    }
}

fn start_throttling(throttle_config: &ThrottleConfig) {
    if let Some(max_open_streams) = throttle_config.max_open_streams {
        throttle::set_max_open_streams(max_open_streams);
    }
    if throttle_config.ops_throttle > 0 {
        let (replenish, interval) = replenish_schedule(throttle_config.ops_throttle);
        throttle::init_ops_tokens(replenish);
        tokio::spawn(throttle::run_ops_replenish_thread(replenish, interval));
    }
    if throttle_config.iops_throttle > 0 {
        let (replenish, interval) = replenish_schedule(throttle_config.iops_throttle);
        throttle::init_transfer_tokens(replenish);
        tokio::spawn(throttle::run_transfer_replenish_thread(replenish, interval));
    }
}

/// Runs `func` on a freshly built runtime and reports the outcome.
///
/// Returns `None` when setup or `func` failed; the error has already been printed unless
/// `output.quiet` is set.
pub fn run<Fut, Summary, Error>(
    progress_settings: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle_config: ThrottleConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display + std::fmt::Debug,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    init_tracing(&output);
    let report = |error: &dyn std::fmt::Display| {
        if !output.quiet {
            eprintln!("{error:#}");
        }
    };
    if let Err(error) = throttle_config.validate() {
        report(&error);
        return None;
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            report(&error);
            return None;
        }
    };
    let tracker = match &progress_settings {
        Some(settings) => {
            let interactive = settings.interactive();
            match settings.delay(interactive) {
                Ok(delay) => Some(ProgressTracker::start(interactive, delay)),
                Err(error) => {
                    report(&format_args!("invalid progress delay: {error}"));
                    return None;
                }
            }
        }
        None => None,
    };
    let result = runtime.block_on(async move {
        start_throttling(&throttle_config);
        func().await
    });
    drop(tracker);
    match result {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            tracing::debug!("run failed: {:?}", &error);
            report(&error);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replenish_schedule_splits_rates() {
        assert_eq!(
            replenish_schedule(100),
            (10, std::time::Duration::from_millis(100))
        );
        assert_eq!(
            replenish_schedule(25),
            (2, std::time::Duration::from_millis(100))
        );
        assert_eq!(
            replenish_schedule(4),
            (1, std::time::Duration::from_millis(250))
        );
        assert_eq!(
            replenish_schedule(0),
            (1, std::time::Duration::from_millis(1000))
        );
    }

    #[test]
    fn verbosity_maps_to_levels() {
        use tracing::level_filters::LevelFilter;
        assert_eq!(verbosity_filter(0), LevelFilter::ERROR);
        assert_eq!(verbosity_filter(1), LevelFilter::INFO);
        assert_eq!(verbosity_filter(2), LevelFilter::DEBUG);
        assert_eq!(verbosity_filter(7), LevelFilter::TRACE);
    }

    #[test]
    fn progress_delay_defaults_depend_on_mode() -> Result<(), anyhow::Error> {
        let settings = ProgressSettings {
            progress_type: ProgressType::TextUpdates,
            progress_delay: None,
        };
        assert!(!settings.interactive());
        assert_eq!(settings.delay(false)?, std::time::Duration::from_secs(10));
        assert_eq!(settings.delay(true)?, std::time::Duration::from_millis(200));
        let settings = ProgressSettings {
            progress_type: ProgressType::ProgressBar,
            progress_delay: Some("1s".to_string()),
        };
        assert!(settings.interactive());
        assert_eq!(settings.delay(true)?, std::time::Duration::from_secs(1));
        Ok(())
    }
}
