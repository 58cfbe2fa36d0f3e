use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use chunkpatch_core::chunk_source::StoreChunkSource;
use chunkpatch_core::chunk_store::ChunkCodec;
use chunkpatch_core::constructor::{ConstructorConfig, FileConstructor, ResumeVerifyMode};
use chunkpatch_core::error::{ErrorCode, InstallError};
use chunkpatch_core::hash_cache::HashCache;
use chunkpatch_core::localize::FluentLoc;
use chunkpatch_core::manifest::BuildManifest;
use chunkpatch_core::packager::{Packager, PackagerConfig};
use chunkpatch_core::progress::ProgressStat;
use chunkpatch_core::reference_tracker::ChunkReferenceTracker;
use chunkpatch_core::resume::ResumeData;
use chunkpatch_core::stat::MemoryAnalytics;
use chunkpatch_core::verify::verify;

const DEFAULT_CHUNK: usize = 1 << 20;

#[derive(Parser)]
#[command(
    name = "chunkpatch",
    version,
    about = "Chunked build packaging and resumable reconstruction"
)]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Split a directory into a chunk store plus build manifest
    Package {
        root: PathBuf,
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        app: String,
        #[arg(long = "build-version")]
        build_version: String,
        #[arg(long, default_value_t = DEFAULT_CHUNK)]
        chunk_size: usize,
        #[arg(long, default_value_t = false)]
        compress: bool,
        #[arg(long)]
        include: Vec<String>,
        #[arg(long)]
        exclude: Vec<String>,
    },
    /// Rebuild build files in a staging directory, resuming earlier runs
    Construct {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        store: PathBuf,
        #[arg(long)]
        staging: PathBuf,
        /// Only construct these files (default: all, in manifest order)
        #[arg(long = "file")]
        files: Vec<String>,
        /// Re-hash files that already look complete instead of trusting their size
        #[arg(long, default_value_t = false)]
        verify_completed: bool,
        #[arg(long, default_value_t = false)]
        no_space_check: bool,
        #[arg(long, default_value_t = false)]
        progress: bool,
        /// Decoded chunks kept in memory
        #[arg(long, default_value_t = 64)]
        cache_chunks: usize,
    },
    /// Verify files under a directory against a manifest
    Verify { manifest: PathBuf, dir: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // --progress lines are info events; keep them visible at the default level
    let filter = match &cli.cmd {
        Cmd::Construct { progress: true, .. } if cli.verbose == 0 => {
            format!("{level},chunkpatch_core::progress=info")
        }
        _ => level.to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.cmd {
        Cmd::Package {
            root,
            store,
            app,
            build_version,
            chunk_size,
            compress,
            include,
            exclude,
        } => {
            let cfg = PackagerConfig {
                app_name: app,
                version_string: build_version,
                chunk_size,
                codec: if compress { ChunkCodec::Zstd } else { ChunkCodec::Raw },
                include,
                exclude,
                ..Default::default()
            };
            let m = Packager::package(&root, &store, &cfg)?;
            eprintln!("Packaged {} file(s) into {}", m.files().len(), store.display());
        }
        Cmd::Construct {
            manifest,
            store,
            staging,
            files,
            verify_completed,
            no_space_check,
            progress,
            cache_chunks,
        } => {
            let opts = ConstructOpts { verify_completed, no_space_check, progress, cache_chunks };
            construct(&manifest, &store, &staging, files, &opts)?;
        }
        Cmd::Verify { manifest, dir } => verify_dir(&manifest, &dir)?,
    }
    Ok(())
}

struct ConstructOpts {
    verify_completed: bool,
    no_space_check: bool,
    progress: bool,
    cache_chunks: usize,
}

fn construct(
    manifest_path: &Path,
    store: &Path,
    staging: &Path,
    files: Vec<String>,
    opts: &ConstructOpts,
) -> Result<()> {
    let loc = FluentLoc::builtin("en-GB");
    let manifest = Arc::new(BuildManifest::load(manifest_path)?);
    let files = if files.is_empty() { manifest.file_list() } else { files };
    let tracker = Arc::new(ChunkReferenceTracker::new(&manifest, &files));
    let source = Arc::new(StoreChunkSource::new(store, tracker.clone(), opts.cache_chunks.max(1)));

    let mut cfg = ConstructorConfig::new(staging);
    cfg.preflight_disk_space = !opts.no_space_check;
    if opts.verify_completed {
        cfg.resume_verify = ResumeVerifyMode::HashCompleted;
    }

    let stat = ProgressStat::new(opts.progress);
    let analytics = Arc::new(MemoryAnalytics::new());
    stat.start();
    let handle = FileConstructor::new(cfg, manifest, files, source, tracker)
        .with_stat(Arc::new(stat.clone()))
        .with_analytics(analytics.clone())
        .spawn()
        .context("start construction worker")?;
    let report = handle.wait();
    stat.stop();

    for ev in analytics.events() {
        info!(file = %ev.filename, os_code = ev.os_code, "{}", ev.context);
    }
    if let Some(err) = &report.error {
        for later in report.errors.iter().skip(1) {
            warn!("also: {later}");
        }
        bail!("{}", loc.error(err));
    }
    ResumeData::clear(staging)?;
    let files = report.constructed_files.len().to_string();
    let bytes = report.bytes_processed.to_string();
    let args = [("files", files.as_str()), ("bytes", bytes.as_str())];
    println!("{}", loc.msg("construct-done", &args));
    Ok(())
}

fn verify_dir(manifest_path: &Path, dir: &Path) -> Result<()> {
    let loc = FluentLoc::builtin("en-GB");
    let manifest = BuildManifest::load(manifest_path)?;
    let report = verify(&manifest, dir, &HashCache::new());
    eprintln!(
        "Files ok={}, bad={}, missing={}",
        report.files_ok,
        report.bad.len(),
        report.missing.len()
    );
    if report.is_ok() {
        println!("{}", loc.msg("verify-ok", &[]));
        return Ok(());
    }
    for f in &report.bad {
        println!("{}", loc.msg("verify-bad", &[("file", f.as_str())]));
    }
    for f in &report.missing {
        println!("{}", loc.msg("verify-missing", &[("file", f.as_str())]));
    }
    let detail = format!("{} bad, {} missing", report.bad.len(), report.missing.len());
    bail!("{}", loc.error(&InstallError::new(ErrorCode::FinalCheck, detail)));
}
