use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

use crate::stat::FileConstructorStat;

/// Construction progress counters with an optional periodic log line.
#[derive(Clone)]
pub struct ProgressStat {
    enabled: bool,
    interval: Duration,
    pub current_file: Arc<Mutex<String>>,
    pub files_done: Arc<AtomicUsize>,
    pub files_failed: Arc<AtomicUsize>,
    pub bytes_done: Arc<AtomicU64>,
    pub bytes_total: Arc<AtomicU64>,
    pub resuming: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    started: Arc<Mutex<Instant>>,
}

impl ProgressStat {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            interval: Duration::from_secs(5),
            current_file: Arc::new(Mutex::new(String::new())),
            files_done: Arc::new(AtomicUsize::new(0)),
            files_failed: Arc::new(AtomicUsize::new(0)),
            bytes_done: Arc::new(AtomicU64::new(0)),
            bytes_total: Arc::new(AtomicU64::new(0)),
            resuming: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            started: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn percent(&self) -> f64 {
        let total = self.bytes_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        (self.bytes_done.load(Ordering::Relaxed) as f64 / total as f64) * 100.0
    }

    pub fn start(&self) {
        if !self.enabled {
            return;
        }
        self.running.store(true, Ordering::Relaxed);
        if let Ok(mut t0) = self.started.lock() {
            *t0 = Instant::now();
        }
        let this = self.clone();
        thread::spawn(move || {
            while this.running.load(Ordering::Relaxed) {
                thread::sleep(this.interval);
                if !this.running.load(Ordering::Relaxed) {
                    break;
                }
                this.log_line();
            }
        });
    }

    /// Stops the ticker and logs one last line with the final counters.
    pub fn stop(&self) {
        if self.enabled && self.running.swap(false, Ordering::Relaxed) {
            self.log_line();
        }
    }

    pub fn line(&self) -> String {
        let elapsed = self.started.lock().map(|t| t.elapsed().as_secs()).unwrap_or_default();
        let file = self.current_file.lock().map(|s| s.clone()).unwrap_or_default();
        format!(
            "[{:>4}s] {} | files {} | bytes {}/{} ({}%)",
            elapsed,
            file,
            self.files_done.load(Ordering::Relaxed),
            self.bytes_done.load(Ordering::Relaxed),
            self.bytes_total.load(Ordering::Relaxed),
            self.percent() as i32
        )
    }

    fn log_line(&self) {
        info!("{}", self.line());
    }
}

impl FileConstructorStat for ProgressStat {
    fn on_total_required(&self, total_bytes: u64) {
        self.bytes_total.store(total_bytes, Ordering::Relaxed);
    }

    fn on_resume_started(&self) {
        self.resuming.store(true, Ordering::Relaxed);
    }

    fn on_resume_completed(&self) {
        self.resuming.store(false, Ordering::Relaxed);
    }

    fn on_file_started(&self, filename: &str, _size: u64) {
        if let Ok(mut cur) = self.current_file.lock() {
            *cur = filename.to_string();
        }
    }

    fn on_file_completed(&self, _filename: &str, success: bool) {
        if success {
            self.files_done.fetch_add(1, Ordering::Relaxed);
        } else {
            self.files_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_processed_data_updated(&self, bytes: u64) {
        self.bytes_done.store(bytes, Ordering::Relaxed);
    }
}
