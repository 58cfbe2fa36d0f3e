mod common;

use chunkpatch_core::chunk_source::{ChunkSource, MemoryChunkSource};
use chunkpatch_core::constructor::{ConstructionState, ConstructorConfig, FileConstructor};
use chunkpatch_core::control::Controller;
use chunkpatch_core::error::{ErrorCategory, ErrorCode, InstallerError};
use chunkpatch_core::manifest::{BuildManifest, ChunkPart};
use chunkpatch_core::reference_tracker::ChunkReferenceTracker;
use chunkpatch_core::stat::MemoryAnalytics;
use common::*;
use std::sync::Arc;

fn fixture() -> Fixture {
    Fixture::split(&[("a.bin", random_bytes(200, 11)), ("b.bin", random_bytes(50, 12))], 64)
}

#[test]
fn wrong_chunk_bytes_fail_hash_and_delete_output() {
    let td = tempfile::tempdir().unwrap();
    let fx = fixture();
    let bad_id = fx.part_ids("a.bin")[1];
    let mut junk = fx.source.get(&bad_id).unwrap().to_vec();
    junk[0] ^= 0x55;
    fx.source.insert(bad_id, &junk);

    let analytics = Arc::new(MemoryAnalytics::new());
    let (fc, _) = constructor(td.path(), &fx.manifest, fx.files(), fx.source.clone());
    let report = fc.with_analytics(analytics.clone()).run();

    assert_eq!(report.state, ConstructionState::Aborted);
    let err = report.error.unwrap();
    assert_eq!(err.category, ErrorCategory::FileConstructionFail);
    assert_eq!(err.code, ErrorCode::OutboundCorrupt);
    assert!(!td.path().join("a.bin").exists());
    assert!(!td.path().join("b.bin").exists(), "run must stop after the first failure");
    let events = analytics.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].filename, "a.bin");
}

#[test]
fn missing_chunk_keeps_partial_for_resume() {
    let td = tempfile::tempdir().unwrap();
    let fx = fixture();
    let ids = fx.part_ids("a.bin");
    let held = fx.source.get(&ids[2]).unwrap().to_vec();
    fx.source.remove(&ids[2]);

    let (fc, _) = constructor(td.path(), &fx.manifest, fx.files(), fx.source.clone());
    let report = fc.run();
    assert_eq!(report.error.as_ref().unwrap().code, ErrorCode::MissingChunkData);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.bytes_processed, 128);
    assert_eq!(std::fs::metadata(td.path().join("a.bin")).unwrap().len(), 128);

    fx.source.insert(ids[2], &held);
    let counting = CountingSource::new(fx.source.clone());
    let (fc, tracker) = constructor(td.path(), &fx.manifest, fx.files(), counting.clone());
    let report = fc.run();
    assert!(report.is_success(), "{:?}", report.error);
    // two parts of a.bin plus b.bin
    assert_eq!(counting.gets(), 2 + 1);
    assert_eq!(tracker.total_references(), 0);
    fx.assert_staged(td.path(), "a.bin");
    fx.assert_staged(td.path(), "b.bin");
}

#[test]
fn part_outside_chunk_is_missing_data() {
    let td = tempfile::tempdir().unwrap();
    let fx = fixture();
    let id = fx.part_ids("b.bin")[0];
    fx.source.insert(id, &[1u8; 10]);
    let (fc, _) = constructor(td.path(), &fx.manifest, vec!["b.bin".into()], fx.source.clone());
    let report = fc.run();
    let err = report.error.unwrap();
    assert_eq!(err.code, ErrorCode::MissingChunkData);
    assert!(err.message.contains("10 bytes"), "{}", err.message);
}

#[test]
fn disk_space_gate_stops_before_any_fetch() {
    let td = tempfile::tempdir().unwrap();
    let fx = fixture();
    let counting = CountingSource::new(fx.source.clone());
    let tracker = Arc::new(ChunkReferenceTracker::new(&fx.manifest, &fx.files()));
    let report = FileConstructor::new(
        ConstructorConfig::new(td.path()),
        fx.manifest.clone(),
        fx.files(),
        counting.clone(),
        tracker,
    )
    .with_platform(Arc::new(FixedSpace(249)))
    .run();

    let err = report.error.unwrap();
    assert_eq!(err.category, ErrorCategory::OutOfDiskSpace);
    assert_eq!(err.code, ErrorCode::InitialSpace);
    assert_eq!(counting.gets(), 0);
    assert!(!td.path().join("a.bin").exists());
    assert!(!td.path().join("b.bin").exists());
}

#[test]
fn space_check_counts_only_what_is_left_to_write() {
    let td = tempfile::tempdir().unwrap();
    let fx = fixture();
    fx.write_descriptor(td.path());
    fx.stage(td.path(), "a.bin", &fx.contents["a.bin"]);
    let tracker = Arc::new(ChunkReferenceTracker::new(&fx.manifest, &fx.files()));
    let report = FileConstructor::new(
        ConstructorConfig::new(td.path()),
        fx.manifest.clone(),
        fx.files(),
        fx.source.clone(),
        tracker,
    )
    .with_platform(Arc::new(FixedSpace(50)))
    .run();
    assert!(report.is_success(), "{:?}", report.error);
}

#[test]
fn missing_staging_directory_is_initialization_error() {
    let td = tempfile::tempdir().unwrap();
    let fx = fixture();
    let absent = td.path().join("absent");
    let (fc, _) = constructor(&absent, &fx.manifest, fx.files(), fx.source.clone());
    let report = fc.run();
    assert_eq!(report.error.unwrap().category, ErrorCategory::InitializationError);
    assert_eq!(report.state, ConstructionState::Aborted);
}

#[test]
fn external_error_sink_keeps_history() {
    let td = tempfile::tempdir().unwrap();
    let fx = fixture();
    fx.source.remove(&fx.part_ids("a.bin")[0]);
    let sink = Arc::new(InstallerError::new());
    let (fc, _) = constructor(td.path(), &fx.manifest, fx.files(), fx.source.clone());
    let report = fc.with_error(sink.clone()).run();
    assert_eq!(report.error.unwrap().code, ErrorCode::MissingChunkData);
    assert_eq!(sink.history().len(), 1);
    assert!(!sink.is_cancelled());
}

#[test]
fn external_sink_and_controller_work_in_either_order() {
    for sink_first in [true, false] {
        let td = tempfile::tempdir().unwrap();
        let fx = fixture();
        fx.source.remove(&fx.part_ids("a.bin")[0]);
        let sink = Arc::new(InstallerError::new());
        let controller = Controller::new();
        let (fc, _) = constructor(td.path(), &fx.manifest, fx.files(), fx.source.clone());
        let fc = if sink_first {
            fc.with_error(sink.clone()).with_controller(controller.clone())
        } else {
            fc.with_controller(controller.clone()).with_error(sink.clone())
        };
        let report = fc.run();

        assert_eq!(report.error.unwrap().code, ErrorCode::MissingChunkData);
        assert_eq!(sink.first().unwrap().code, ErrorCode::MissingChunkData, "{sink_first}");
        assert!(controller.is_aborted(), "{sink_first}");
    }
}

#[test]
fn exhausted_reference_is_tracking_error_and_keeps_partial() {
    let td = tempfile::tempdir().unwrap();
    let fx = Fixture::split(&[("a.bin", random_bytes(32, 13))], 16);
    // tracker built for no files: every pop is rejected
    let tracker = Arc::new(ChunkReferenceTracker::new(&fx.manifest, &[]));
    let mut cfg = ConstructorConfig::new(td.path());
    cfg.preflight_disk_space = false;
    let report =
        FileConstructor::new(cfg, fx.manifest.clone(), fx.files(), fx.source.clone(), tracker)
            .run();

    let err = report.error.unwrap();
    assert_eq!(err.category, ErrorCategory::FileConstructionFail);
    assert_eq!(err.code, ErrorCode::TrackingError);
    assert_eq!(std::fs::metadata(td.path().join("a.bin")).unwrap().len(), 16);
}

#[test]
fn unopenable_output_reports_space_or_create_failure() {
    for (space, code, category) in [
        (0, ErrorCode::DuringInstallation, ErrorCategory::OutOfDiskSpace),
        (u64::MAX, ErrorCode::FileCreateFail, ErrorCategory::FileConstructionFail),
    ] {
        let td = tempfile::tempdir().unwrap();
        let fx = fixture();
        // a directory where the file should go
        std::fs::create_dir(td.path().join("a.bin")).unwrap();
        let counting = CountingSource::new(fx.source.clone());
        let (fc, _) = constructor(td.path(), &fx.manifest, fx.files(), counting.clone());
        let report = fc.with_platform(Arc::new(FixedSpace(space))).run();

        let err = report.error.unwrap();
        assert_eq!(err.code, code, "space {space}");
        assert_eq!(err.category, category);
        assert_eq!(counting.gets(), 0);
        assert!(td.path().join("a.bin").is_dir());
        assert!(!td.path().join("b.bin").exists());
    }
}

#[test]
fn failed_link_is_symlink_create_fail() {
    let td = tempfile::tempdir().unwrap();
    let data = random_bytes(20, 14);
    let src = MemoryChunkSource::new();
    let id = src.add(&data);
    let m = Arc::new(BuildManifest::new(
        "App",
        "1",
        32,
        vec![
            link_entry("link", "z.bin"),
            file_entry("z.bin", &data, vec![ChunkPart { chunk_id: id, offset: 0, size: 20 }]),
        ],
    ));
    let (fc, _) = constructor(td.path(), &m, m.file_list(), Arc::new(src));
    let report = fc.with_platform(Arc::new(NoLinks)).run();

    let err = report.error.unwrap();
    assert_eq!(err.code, ErrorCode::SymlinkCreateFail);
    assert_eq!(err.category, ErrorCategory::FileConstructionFail);
    assert!(std::fs::symlink_metadata(td.path().join("link")).is_err());
    assert!(!td.path().join("z.bin").exists());
}

#[cfg(target_os = "linux")]
#[test]
fn write_failure_deletes_output() {
    if !std::path::Path::new("/dev/full").exists() {
        return;
    }
    let td = tempfile::tempdir().unwrap();
    let fx = fixture();
    // writes through this link hit ENOSPC
    std::os::unix::fs::symlink("/dev/full", td.path().join("a.bin")).unwrap();
    let (fc, _) = constructor(td.path(), &fx.manifest, fx.files(), fx.source.clone());
    let report = fc.run();

    let err = report.error.unwrap();
    assert_eq!(err.code, ErrorCode::WriteFail);
    assert!(std::fs::symlink_metadata(td.path().join("a.bin")).is_err());
    assert!(!td.path().join("b.bin").exists());
}

#[cfg(unix)]
#[test]
fn leading_link_waits_for_space_gate() {
    let td = tempfile::tempdir().unwrap();
    let data = random_bytes(100, 15);
    let src = MemoryChunkSource::new();
    let id = src.add(&data);
    let m = Arc::new(BuildManifest::new(
        "App",
        "1",
        128,
        vec![
            link_entry("a-link", "b.bin"),
            file_entry("b.bin", &data, vec![ChunkPart { chunk_id: id, offset: 0, size: 100 }]),
        ],
    ));
    let tracker = Arc::new(ChunkReferenceTracker::new(&m, &m.file_list()));
    let cfg = ConstructorConfig::new(td.path());
    let report = FileConstructor::new(cfg, m.clone(), m.file_list(), Arc::new(src), tracker)
        .with_platform(Arc::new(FixedSpace(99)))
        .run();

    assert_eq!(report.error.unwrap().code, ErrorCode::InitialSpace);
    assert!(std::fs::symlink_metadata(td.path().join("a-link")).is_err());
    assert!(!td.path().join("b.bin").exists());
}

#[test]
fn unsafe_manifest_path_is_rejected() {
    let td = tempfile::tempdir().unwrap();
    let data = random_bytes(8, 5);
    let src = MemoryChunkSource::new();
    let id = src.add(&data);
    let parts = vec![ChunkPart { chunk_id: id, offset: 0, size: 8 }];
    let fe = file_entry("../escape.bin", &data, parts);
    let m = Arc::new(BuildManifest::new("App", "1", 8, vec![fe]));
    let (fc, _) = constructor(td.path(), &m, m.file_list(), Arc::new(src));
    let report = fc.run();
    assert_eq!(report.error.unwrap().code, ErrorCode::InvalidPath);
    assert!(!td.path().parent().unwrap().join("escape.bin").exists());
}

#[cfg(unix)]
#[test]
fn symlinks_and_executable_bits_are_applied() {
    use std::os::unix::fs::PermissionsExt;
    let td = tempfile::tempdir().unwrap();
    let data = random_bytes(30, 9);
    let src = MemoryChunkSource::new();
    let id = src.add(&data);
    let mut tool =
        file_entry("bin/tool", &data, vec![ChunkPart { chunk_id: id, offset: 0, size: 30 }]);
    tool.executable = true;
    let link = link_entry("bin/tool-link", "tool");
    let m = Arc::new(BuildManifest::new("App", "1", 64, vec![tool, link]));
    let (fc, _) = constructor(td.path(), &m, m.file_list(), Arc::new(src));
    let report = fc.run();
    assert!(report.is_success(), "{:?}", report.error);
    let mode = std::fs::metadata(td.path().join("bin/tool")).unwrap().permissions().mode();
    assert_eq!(mode & 0o111, 0o111);
    assert_eq!(
        std::fs::read_link(td.path().join("bin/tool-link")).unwrap(),
        std::path::Path::new("tool")
    );
    assert_eq!(std::fs::read(td.path().join("bin/tool-link")).unwrap(), data);
}
