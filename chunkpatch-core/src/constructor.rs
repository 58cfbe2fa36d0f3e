//! Rebuilds build files inside a staging directory from chunk parts.
//!
//! A [`FileConstructor`] walks its file list in order, skipping files a previous
//! run already finished, resuming the one it was in the middle of, and writing
//! the rest from chunks handed out by a [`ChunkSource`]. Each finished file is
//! hashed and compared with the manifest before it counts as constructed.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::chunk_id::ChunkId;
use crate::chunk_source::ChunkSource;
use crate::control::Controller;
use crate::error::{ErrorCode, InstallError, InstallerError};
use crate::hash_cache::hash_file;
use crate::manifest::{BuildManifest, ChunkPart, FileManifest};
use crate::path_safety::staged_path;
use crate::platform::{Platform, StdPlatform};
use crate::reference_tracker::ChunkReferenceTracker;
use crate::resume::ResumeData;
use crate::stat::{FileConstructorStat, InstallerAnalytics, NullAnalytics, NullStat};

/// How much a file that already has its full size on disk is trusted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResumeVerifyMode {
    /// Matching size is enough to skip it.
    #[default]
    SizeOnly,
    /// Re-hash it first; a mismatch gets the file rebuilt.
    HashCompleted,
}

#[derive(Clone, Debug)]
pub struct ConstructorConfig {
    pub staging_dir: PathBuf,
    pub resume_verify: ResumeVerifyMode,
    pub preflight_disk_space: bool,
}

impl ConstructorConfig {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            resume_verify: ResumeVerifyMode::default(),
            preflight_disk_space: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstructionState {
    Idle,
    Resuming,
    Constructing,
    Completed,
    Aborted,
}

/// Progress figures readable from any thread while a construction runs.
pub struct ConstructionCounters {
    total_job_size: AtomicU64,
    bytes_processed: AtomicU64,
    state: Mutex<ConstructionState>,
}

impl Default for ConstructionCounters {
    fn default() -> Self {
        Self {
            total_job_size: AtomicU64::new(0),
            bytes_processed: AtomicU64::new(0),
            state: Mutex::new(ConstructionState::Idle),
        }
    }
}

impl ConstructionCounters {
    pub fn total_job_size(&self) -> u64 {
        self.total_job_size.load(Ordering::Acquire)
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConstructionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: ConstructionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }
}

#[derive(Clone, Debug)]
pub struct ConstructionReport {
    pub state: ConstructionState,
    pub constructed_files: Vec<String>,
    pub total_job_size: u64,
    pub bytes_processed: u64,
    pub error: Option<InstallError>,
    pub errors: Vec<InstallError>,
}

impl ConstructionReport {
    pub fn is_success(&self) -> bool {
        self.state == ConstructionState::Completed && self.error.is_none()
    }
}

/// A failure inside one file, before it is recorded.
struct FileFailure {
    code: ErrorCode,
    message: String,
    os_code: i32,
}

impl FileFailure {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), os_code: -1 }
    }

    fn io(code: ErrorCode, context: impl Into<String>, err: &io::Error) -> Self {
        Self {
            code,
            message: format!("{}: {}", context.into(), err),
            os_code: err.raw_os_error().unwrap_or(-1),
        }
    }
}

/// Per-run mutable state of the worker loop.
struct RunState {
    resume: ResumeData,
    resuming: bool,
    space_checked: bool,
    constructed: Vec<String>,
}

pub struct FileConstructor {
    config: ConstructorConfig,
    manifest: Arc<BuildManifest>,
    files: Vec<String>,
    source: Arc<dyn ChunkSource>,
    tracker: Arc<ChunkReferenceTracker>,
    error: Arc<InstallerError>,
    analytics: Arc<dyn InstallerAnalytics>,
    stat: Arc<dyn FileConstructorStat>,
    platform: Arc<dyn Platform>,
    controller: Controller,
    counters: Arc<ConstructionCounters>,
}

impl FileConstructor {
    pub fn new(
        config: ConstructorConfig,
        manifest: Arc<BuildManifest>,
        files: Vec<String>,
        source: Arc<dyn ChunkSource>,
        tracker: Arc<ChunkReferenceTracker>,
    ) -> Self {
        let controller = Controller::new();
        Self {
            config,
            manifest,
            files,
            source,
            tracker,
            error: Arc::new(InstallerError::new()),
            analytics: Arc::new(NullAnalytics),
            stat: Arc::new(NullStat),
            platform: Arc::new(StdPlatform),
            controller,
            counters: Arc::new(ConstructionCounters::default()),
        }
    }

    /// Uses `controller` for pause/abort. The first recorded error aborts it.
    pub fn with_controller(mut self, controller: Controller) -> Self {
        self.controller = controller;
        self
    }

    /// Shares an external error sink. Errors it already holds stop the run early.
    /// Errors recorded here still abort this constructor's controller.
    pub fn with_error(mut self, error: Arc<InstallerError>) -> Self {
        self.error = error;
        self
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn InstallerAnalytics>) -> Self {
        self.analytics = analytics;
        self
    }

    pub fn with_stat(mut self, stat: Arc<dyn FileConstructorStat>) -> Self {
        self.stat = stat;
        self
    }

    pub fn with_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = platform;
        self
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn counters(&self) -> Arc<ConstructionCounters> {
        self.counters.clone()
    }

    /// Runs the construction on a dedicated worker thread.
    pub fn spawn(self) -> io::Result<ConstructionHandle> {
        let controller = self.controller.clone();
        let counters = self.counters.clone();
        let error = self.error.clone();
        let join = thread::Builder::new()
            .name("file-constructor".into())
            .spawn(move || self.run())?;
        Ok(ConstructionHandle { controller, counters, error, join })
    }

    /// Runs the construction on the calling thread.
    pub fn run(&self) -> ConstructionReport {
        self.counters.set_state(ConstructionState::Idle);
        let staging = &self.config.staging_dir;
        if !staging.is_dir() {
            self.record(InstallError::new(
                ErrorCode::MissingStageDirectory,
                format!("staging directory {} does not exist", staging.display()),
            ));
            self.counters.set_state(ConstructionState::Aborted);
            return self.report(Vec::new());
        }

        let total = self.manifest.total_size(&self.files);
        self.counters.total_job_size.store(total, Ordering::Release);
        self.stat.on_total_required(total);

        let mut resume = ResumeData::new(staging, &self.manifest);
        if resume.has_incompatible_resume_data() {
            info!(version = %resume.patch_version(), "staged data belongs to another build");
            if let Err(e) = resume.wipe_staging() {
                self.record(InstallError::new(ErrorCode::StagingCleanFail, format!("{e:#}")));
                self.counters.set_state(ConstructionState::Aborted);
                return self.report(Vec::new());
            }
        }
        if let Err(e) = resume.save_out() {
            warn!("could not write resume descriptor: {e:#}");
        }

        let resuming = resume.has_resume_data();
        if resuming {
            info!(version = %resume.patch_version(), "resuming staged build");
            self.counters.set_state(ConstructionState::Resuming);
            self.stat.on_resume_started();
        } else {
            self.counters.set_state(ConstructionState::Constructing);
        }

        let mut run = RunState { resume, resuming, space_checked: false, constructed: Vec::new() };
        let mut queue: VecDeque<String> = self.files.iter().cloned().collect();
        while !queue.is_empty() && self.keep_going() {
            let Some(name) = queue.pop_front() else { break };
            let ok = self.construct_file(&mut run, &name, &queue);
            self.stat.on_file_completed(&name, ok);
            if !ok {
                break;
            }
            run.constructed.push(name);
        }
        if run.resuming {
            self.end_resume(&mut run);
        }

        let done = run.constructed.len() == self.files.len();
        if self.error.has_error() || !done {
            if !self.error.has_error() {
                self.record(InstallError::new(ErrorCode::UserRequested, "construction aborted"));
            }
            self.counters.set_state(ConstructionState::Aborted);
        } else {
            info!(
                files = run.constructed.len(),
                bytes = self.counters.bytes_processed(),
                "construction complete"
            );
            self.counters.set_state(ConstructionState::Completed);
        }
        self.report(run.constructed)
    }

    fn report(&self, constructed_files: Vec<String>) -> ConstructionReport {
        ConstructionReport {
            state: self.counters.state(),
            constructed_files,
            total_job_size: self.counters.total_job_size(),
            bytes_processed: self.counters.bytes_processed(),
            error: self.error.first(),
            errors: self.error.history(),
        }
    }

    /// Blocks while paused. False once the run should stop.
    fn keep_going(&self) -> bool {
        self.controller.wait_while_paused() && !self.error.has_error()
    }

    fn record(&self, err: InstallError) {
        if self.error.set_error(err.clone()) {
            error!(code = %err.code.short(), "{err}");
        } else {
            debug!(code = %err.code.short(), "follow-up error: {err}");
        }
        self.controller.abort();
    }

    fn fail(&self, filename: &str, failure: FileFailure) {
        self.analytics.record_construction_error(filename, failure.os_code, &failure.message);
        self.record(InstallError::new(failure.code, format!("{filename}: {}", failure.message)));
    }

    fn add_processed(&self, bytes: u64) {
        let now = self.counters.bytes_processed.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.stat.on_processed_data_updated(now);
    }

    fn end_resume(&self, run: &mut RunState) {
        run.resuming = false;
        self.stat.on_resume_completed();
        self.counters.set_state(ConstructionState::Constructing);
    }

    fn construct_file(&self, run: &mut RunState, name: &str, queue: &VecDeque<String>) -> bool {
        let Some(fe) = self.manifest.file(name) else {
            self.fail(name, FileFailure::new(ErrorCode::MissingFileInfo, "not in manifest"));
            return false;
        };
        self.stat.on_file_started(name, fe.size);
        let path = match staged_path(&self.config.staging_dir, name) {
            Ok(p) => p,
            Err(e) => {
                self.fail(name, FileFailure::new(ErrorCode::InvalidPath, format!("{e:#}")));
                return false;
            }
        };

        if let Some(target) = &fe.symlink_target {
            return match self.construct_symlink(run, fe, target, &path, queue) {
                Ok(()) => true,
                Err(failure) => {
                    self.fail(name, failure);
                    false
                }
            };
        }

        if run.resuming {
            run.resume.check_file(name);
            if run.resume.is_completed(name) && self.completed_copy_is_valid(run, fe, &path) {
                return self.skip_completed(fe);
            }
            self.end_resume(run);
        }

        let resume_existing = run.resume.is_started(name);
        match self.construct_from_chunks(run, fe, &path, resume_existing, queue) {
            Ok(true) => true,
            Ok(false) => false,
            Err(failure) => {
                let delete = failure.code.deletes_partial();
                self.fail(name, failure);
                if delete {
                    if let Err(e) = fs::remove_file(&path) {
                        warn!(file = %name, "could not remove corrupt output: {e}");
                    }
                }
                false
            }
        }
    }

    fn completed_copy_is_valid(&self, run: &mut RunState, fe: &FileManifest, path: &Path) -> bool {
        if self.config.resume_verify == ResumeVerifyMode::SizeOnly {
            return true;
        }
        match hash_file(path) {
            Ok(h) if h == fe.hash_hex => true,
            other => {
                match other {
                    Ok(_) => {
                        warn!(file = %fe.filename, "staged copy fails hash check, rebuilding")
                    }
                    Err(e) => {
                        warn!(file = %fe.filename, "staged copy unreadable ({e}), rebuilding")
                    }
                }
                let _ = fs::remove_file(path);
                run.resume.forget(&fe.filename);
                false
            }
        }
    }

    fn skip_completed(&self, fe: &FileManifest) -> bool {
        debug!(file = %fe.filename, "already staged, skipping");
        for part in &fe.chunk_parts {
            if !self.tracker.pop_reference(&part.chunk_id) {
                self.fail(
                    &fe.filename,
                    FileFailure::new(
                        ErrorCode::TrackingError,
                        format!("no references left for chunk {}", part.chunk_id),
                    ),
                );
                return false;
            }
        }
        self.add_processed(fe.size);
        self.stat.on_file_progress(&fe.filename, fe.size);
        true
    }

    /// Ok(false) means the run was stopped without a new failure for this file.
    fn construct_from_chunks(
        &self,
        run: &mut RunState,
        fe: &FileManifest,
        path: &Path,
        resume_existing: bool,
        queue: &VecDeque<String>,
    ) -> Result<bool, FileFailure> {
        let mut hasher = blake3::Hasher::new();
        let mut start_idx = 0usize;
        let mut position = 0u64;
        if resume_existing {
            match self.rehash_prefix(fe, path) {
                Ok((h, idx, pos)) => {
                    hasher = h;
                    start_idx = idx;
                    position = pos;
                }
                Err(e) => {
                    warn!(file = %fe.filename, "partial file unreadable ({e}), starting over")
                }
            }
            if !self.keep_going() {
                return Ok(false);
            }
            for part in &fe.chunk_parts[..start_idx] {
                self.pop(part.chunk_id)?;
            }
            if position > 0 {
                debug!(file = %fe.filename, position, parts = start_idx, "resuming partial file");
                self.add_processed(position);
                self.stat.on_file_progress(&fe.filename, position);
            }
        }

        self.preflight(run, fe.size.saturating_sub(position), queue)?;

        let file = self.open_output(fe, path, position)?;
        let mut out = BufWriter::new(file);
        let mut stopped = false;
        let mut result = Ok(());
        for part in &fe.chunk_parts[start_idx..] {
            if !self.keep_going() {
                stopped = true;
                break;
            }
            result = self.copy_part(fe, part, &mut out, &mut hasher);
            if result.is_err() {
                break;
            }
            position += u64::from(part.size);
            self.add_processed(u64::from(part.size));
            self.stat.on_file_progress(&fe.filename, position);
        }

        let closed = out
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|f| f.sync_all());
        result?;
        if let Err(e) = closed {
            return Err(FileFailure::io(ErrorCode::WriteFail, "flush output", &e));
        }
        if stopped {
            debug!(file = %fe.filename, position, "stopped mid-file, partial kept");
            return Ok(false);
        }

        let got = hasher.finalize().to_hex().to_string();
        if got != fe.hash_hex {
            return Err(FileFailure::new(
                ErrorCode::OutboundCorrupt,
                format!("hash mismatch: expected {}, got {}", fe.hash_hex, got),
            ));
        }
        if fe.executable {
            if let Err(e) = self.platform.set_executable(path) {
                warn!(file = %fe.filename, "could not set executable bit: {e}");
            }
        }
        debug!(file = %fe.filename, size = fe.size, "constructed");
        Ok(true)
    }

    /// One-time free space check before the first output is written.
    fn preflight(
        &self,
        run: &mut RunState,
        this_file: u64,
        queue: &VecDeque<String>,
    ) -> Result<(), FileFailure> {
        if run.space_checked || !self.config.preflight_disk_space {
            return Ok(());
        }
        run.space_checked = true;
        let rest: u64 = queue.iter().map(|f| self.manifest.file_size(f)).sum();
        let required = this_file + rest;
        match self.platform.available_space(&self.config.staging_dir) {
            Ok(avail) if avail < required => Err(FileFailure::new(
                ErrorCode::InitialSpace,
                format!("{required} bytes required, {avail} available"),
            )),
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("could not query free space: {e}");
                Ok(())
            }
        }
    }

    /// Links fetch no chunks, so they never end the resume phase. A link already
    /// pointing at the right target is left alone.
    fn construct_symlink(
        &self,
        run: &mut RunState,
        fe: &FileManifest,
        target: &str,
        path: &Path,
        queue: &VecDeque<String>,
    ) -> Result<(), FileFailure> {
        if fs::read_link(path).is_ok_and(|cur| cur == Path::new(target)) {
            debug!(file = %fe.filename, "link already staged, skipping");
            self.stat.on_file_progress(&fe.filename, 0);
            return Ok(());
        }
        self.preflight(run, 0, queue)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| FileFailure::io(ErrorCode::SymlinkCreateFail, "create parent", &e))?;
        }
        self.platform.create_symlink(target, path).map_err(|e| {
            FileFailure::io(ErrorCode::SymlinkCreateFail, format!("link to {target}"), &e)
        })?;
        self.stat.on_file_progress(&fe.filename, 0);
        Ok(())
    }

    /// Hashes every whole part already on disk. Returns the hasher, the index of
    /// the first part still missing and the byte position it starts at.
    fn rehash_prefix(
        &self,
        fe: &FileManifest,
        path: &Path,
    ) -> io::Result<(blake3::Hasher, usize, u64)> {
        let f = File::open(path)?;
        let len = f.metadata()?.len();
        let mut reader = BufReader::new(f);
        let mut hasher = blake3::Hasher::new();
        let mut buf = Vec::new();
        let mut pos = 0u64;
        let mut idx = 0usize;
        for part in &fe.chunk_parts {
            let end = pos + u64::from(part.size);
            if end > len {
                break;
            }
            buf.resize(part.size as usize, 0);
            reader.read_exact(&mut buf)?;
            hasher.update(&buf);
            pos = end;
            idx += 1;
        }
        Ok((hasher, idx, pos))
    }

    fn open_output(
        &self,
        fe: &FileManifest,
        path: &Path,
        position: u64,
    ) -> Result<File, FileFailure> {
        let opened = (|| -> io::Result<File> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            if position == 0 {
                return File::create(path);
            }
            let mut f = OpenOptions::new().write(true).open(path)?;
            f.set_len(position)?;
            f.seek(SeekFrom::Start(position))?;
            Ok(f)
        })();
        opened.map_err(|e| {
            if position == 0 {
                if let Ok(avail) = self.platform.available_space(&self.config.staging_dir) {
                    let need = fe.size;
                    if avail < need {
                        return FileFailure::io(
                            ErrorCode::DuringInstallation,
                            format!("{need} bytes required, {avail} available"),
                            &e,
                        );
                    }
                }
            }
            FileFailure::io(ErrorCode::FileCreateFail, format!("open {}", path.display()), &e)
        })
    }

    fn copy_part(
        &self,
        fe: &FileManifest,
        part: &ChunkPart,
        out: &mut impl Write,
        hasher: &mut blake3::Hasher,
    ) -> Result<(), FileFailure> {
        let data = self.source.get(&part.chunk_id).ok_or_else(|| {
            FileFailure::new(
                ErrorCode::MissingChunkData,
                format!("chunk {} unavailable", part.chunk_id),
            )
        })?;
        let start = part.offset as usize;
        let end = start + part.size as usize;
        if end > data.len() {
            return Err(FileFailure::new(
                ErrorCode::MissingChunkData,
                format!(
                    "chunk {} holds {} bytes, part needs {}..{}",
                    part.chunk_id,
                    data.len(),
                    start,
                    end
                ),
            ));
        }
        let bytes = &data[start..end];
        out.write_all(bytes).map_err(|e| {
            FileFailure::io(ErrorCode::WriteFail, format!("write {}", fe.filename), &e)
        })?;
        hasher.update(bytes);
        self.pop(part.chunk_id)
    }

    fn pop(&self, id: ChunkId) -> Result<(), FileFailure> {
        if self.tracker.pop_reference(&id) {
            Ok(())
        } else {
            Err(FileFailure::new(
                ErrorCode::TrackingError,
                format!("no references left for chunk {id}"),
            ))
        }
    }
}

/// Handle to a construction running on its worker thread.
pub struct ConstructionHandle {
    controller: Controller,
    counters: Arc<ConstructionCounters>,
    error: Arc<InstallerError>,
    join: JoinHandle<ConstructionReport>,
}

impl ConstructionHandle {
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn state(&self) -> ConstructionState {
        self.counters.state()
    }

    pub fn total_job_size(&self) -> u64 {
        self.counters.total_job_size()
    }

    pub fn bytes_processed(&self) -> u64 {
        self.counters.bytes_processed()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn wait(self) -> ConstructionReport {
        match self.join.join() {
            Ok(report) => report,
            Err(_) => {
                self.error.set_error(InstallError::new(
                    ErrorCode::UnknownFail,
                    "construction worker panicked",
                ));
                self.counters.set_state(ConstructionState::Aborted);
                ConstructionReport {
                    state: ConstructionState::Aborted,
                    constructed_files: Vec::new(),
                    total_job_size: self.counters.total_job_size(),
                    bytes_processed: self.counters.bytes_processed(),
                    error: self.error.first(),
                    errors: self.error.history(),
                }
            }
        }
    }
}
