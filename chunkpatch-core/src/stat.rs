/// Observer for file construction progress. All methods default to no-ops.
pub trait FileConstructorStat: Send + Sync {
    fn on_total_required(&self, _total_bytes: u64) {}
    fn on_resume_started(&self) {}
    fn on_resume_completed(&self) {}
    fn on_file_started(&self, _filename: &str, _size: u64) {}
    /// `written` is the byte count of `filename` produced or confirmed so far.
    fn on_file_progress(&self, _filename: &str, _written: u64) {}
    fn on_file_completed(&self, _filename: &str, _success: bool) {}
    fn on_processed_data_updated(&self, _bytes: u64) {}
}

pub struct NullStat;

impl FileConstructorStat for NullStat {}

/// Receives construction errors for reporting. Never consulted for control flow.
pub trait InstallerAnalytics: Send + Sync {
    fn record_construction_error(&self, filename: &str, os_code: i32, context: &str);
}

pub struct NullAnalytics;

impl InstallerAnalytics for NullAnalytics {
    fn record_construction_error(&self, _filename: &str, _os_code: i32, _context: &str) {}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstructionErrorEvent {
    pub filename: String,
    pub os_code: i32,
    pub context: String,
}

/// Keeps every recorded event in memory.
#[derive(Default)]
pub struct MemoryAnalytics {
    events: std::sync::Mutex<Vec<ConstructionErrorEvent>>,
}

impl MemoryAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ConstructionErrorEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl InstallerAnalytics for MemoryAnalytics {
    fn record_construction_error(&self, filename: &str, os_code: i32, context: &str) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).push(ConstructionErrorEvent {
            filename: filename.to_string(),
            os_code,
            context: context.to_string(),
        });
    }
}
