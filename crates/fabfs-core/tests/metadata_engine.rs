//! End-to-end scenarios over a materialized filesystem instance: mkfs,
//! locked-log mutation, log replay, and fsck against a mount-root tempdir.

use fabfs_core::{
    FixedIdentity, FsckOptions, LOG_RELPATH, LockMode, MkfsOptions, Role, SB_RELPATH,
    SysDeviceProbe, fsck, init_locked_log, mkfs_at, resolve_role,
};
use fabfs_error::FabError;
use fabfs_ondisk::Superblock;
use fabfs_types::{FABFS_ALLOC_UNIT, LOG_ENTRY_SIZE, LOG_HEADER_SIZE};
use std::fs;
use std::path::Path;

const GIB: u64 = 1024 * 1024 * 1024;
const MASTER_ID: FixedIdentity = FixedIdentity([0xAA; 16]);
const OTHER_HOST_ID: FixedIdentity = FixedIdentity([0xBB; 16]);

fn mkfs_dir(root: &Path, device_size: u64, log_len: Option<u64>) -> Superblock {
    mkfs_at(
        root,
        Some(device_size),
        &MASTER_ID,
        &SysDeviceProbe,
        &MkfsOptions {
            log_len,
            ..MkfsOptions::default()
        },
    )
    .expect("mkfs")
}

fn small_log(slots: usize) -> Option<u64> {
    Some((LOG_HEADER_SIZE + slots * LOG_ENTRY_SIZE) as u64)
}

#[test]
fn end_to_end_one_gib_fills_at_502_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    mkfs_dir(dir.path(), GIB, None);

    let mut log = init_locked_log(dir.path(), &MASTER_ID, LockMode::Blocking).expect("init");
    assert_eq!(log.allocator().free_units(), 502);

    for i in 0..502 {
        let path = dir.path().join(format!("{i:04}"));
        let record = log
            .mkfile(&path, 0o644, 0, 0, 1024 * 1024)
            .unwrap_or_else(|err| panic!("file {i} should fit: {err}"));
        // A 1 MiB file occupies one whole allocation unit.
        assert_eq!(record.extents.iter().map(|e| e.len).sum::<u64>(), FABFS_ALLOC_UNIT);
    }

    let overflow = log.mkfile(&dir.path().join("0502"), 0o644, 0, 0, 1024 * 1024);
    assert!(
        matches!(overflow, Err(FabError::NoSpace)),
        "the 503rd file must exhaust capacity"
    );
    assert_eq!(log.allocator().free_units(), 0);
    assert_eq!(log.namespace().files.len(), 502);
    log.release().expect("release");

    // Replay through fsck reconstructs exactly 502 files and 0 directories,
    // with both load policies.
    for mmap in [false, true] {
        let report = fsck(dir.path(), &SysDeviceProbe, &FsckOptions { mmap }).expect("fsck");
        assert!(report.valid);
        assert_eq!(report.files, 502);
        assert_eq!(report.directories, 0);
        assert_eq!(report.bytes_allocated, 502 * FABFS_ALLOC_UNIT);
        assert_eq!(report.free_bytes, 0);
        assert_eq!(report.slots_used, 502);
        assert_eq!(report.halted_at, None);
    }
}

#[test]
fn reopening_the_locked_log_rebuilds_state_from_the_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    mkfs_dir(dir.path(), GIB, None);

    let mut log = init_locked_log(dir.path(), &MASTER_ID, LockMode::Blocking).expect("init");
    log.mkdir_parents(&dir.path().join("a/b/c"), 0o755, 0, 0)
        .expect("mkdir -p");
    log.mkfile(&dir.path().join("a/b/c/data"), 0o644, 0, 0, 3 * 1024 * 1024)
        .expect("mkfile");
    log.log_access(&dir.path().join("a/b/c/data"))
        .expect("access event");
    let used = log.allocator().used_bytes();
    log.release().expect("release");

    let reopened = init_locked_log(dir.path(), &MASTER_ID, LockMode::Blocking).expect("reopen");
    assert!(reopened.namespace().contains_dir("a/b/c"));
    assert!(reopened.namespace().contains_file("a/b/c/data"));
    assert_eq!(reopened.allocator().used_bytes(), used);
    // 3 mkdirs + 1 file + 1 access.
    assert_eq!(
        reopened.superblock().log_capacity() - reopened.slots_available(),
        5
    );
}

#[test]
fn log_capacity_exhaustion_is_exact() {
    let dir = tempfile::tempdir().expect("tempdir");
    mkfs_dir(dir.path(), GIB, small_log(8));

    let mut log = init_locked_log(dir.path(), &MASTER_ID, LockMode::Blocking).expect("init");
    assert_eq!(log.slots_available(), 8);
    for i in 0..8 {
        log.mkdir(&dir.path().join(format!("d{i}")), 0o755, 0, 0)
            .expect("slot available");
    }
    assert_eq!(log.slots_available(), 0);
    assert!(matches!(
        log.mkdir(&dir.path().join("d8"), 0o755, 0, 0),
        Err(FabError::LogFull)
    ));

    // Re-creating an existing directory consumes nothing even when full.
    log.mkdir(&dir.path().join("d3"), 0o755, 0, 0)
        .expect("existing dir is a no-op");
    log.release().expect("release");

    let report = fsck(dir.path(), &SysDeviceProbe, &FsckOptions::default()).expect("fsck");
    assert!(report.valid);
    assert_eq!(report.directories, 8);
    assert_eq!(report.slots_free, 0);
}

#[test]
fn mkdir_parents_commits_its_prefix_then_reports_full() {
    let dir = tempfile::tempdir().expect("tempdir");
    mkfs_dir(dir.path(), GIB, small_log(25));

    let mut log = init_locked_log(dir.path(), &MASTER_ID, LockMode::Blocking).expect("init");

    // Each of these creates ten fresh components.
    for i in 0..2 {
        log.mkdir_parents(
            &dir.path().join(format!("dir{i:04}/a/b/c/d/e/f/g/h/i")),
            0o755,
            0,
            0,
        )
        .expect("ten slots available");
    }
    assert_eq!(log.slots_available(), 5);

    // The third needs ten slots with five remaining: the five leading
    // components commit, then the sixth append reports the log full.
    let overflow = log.mkdir_parents(&dir.path().join("dir0002/a/b/c/d/e/f/g/h/i"), 0o755, 0, 0);
    assert!(matches!(overflow, Err(FabError::LogFull)));
    assert_eq!(log.slots_available(), 0);
    assert!(log.namespace().contains_dir("dir0002/a/b/c/d"));
    assert!(!log.namespace().contains_dir("dir0002/a/b/c/d/e"));
    log.release().expect("release");

    // The partially-committed prefix is replay-consistent.
    let report = fsck(dir.path(), &SysDeviceProbe, &FsckOptions::default()).expect("fsck");
    assert!(report.valid);
    assert_eq!(report.directories, 25);
}

#[test]
fn client_role_never_gets_the_lock() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sb = mkfs_dir(dir.path(), GIB, small_log(8));

    assert_eq!(
        resolve_role(Some(&sb), &MASTER_ID).expect("role"),
        Role::Master
    );
    assert_eq!(
        resolve_role(Some(&sb), &OTHER_HOST_ID).expect("role"),
        Role::Client
    );
    assert_eq!(resolve_role(None, &MASTER_ID).expect("role"), Role::NoSuper);

    // The lock is free, but the role check alone must reject a client.
    assert!(matches!(
        init_locked_log(dir.path(), &OTHER_HOST_ID, LockMode::Blocking),
        Err(FabError::RoleViolation(_))
    ));
    assert!(matches!(
        init_locked_log(dir.path(), &OTHER_HOST_ID, LockMode::NonBlocking),
        Err(FabError::RoleViolation(_))
    ));
}

#[test]
fn missing_superblock_is_a_role_violation() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir(dir.path().join(".meta")).expect("meta dir");
    assert!(matches!(
        init_locked_log(dir.path(), &MASTER_ID, LockMode::Blocking),
        Err(FabError::RoleViolation(_))
    ));
}

#[test]
fn unwritable_log_file_fails_with_io() {
    if nix::unistd::geteuid().is_root() {
        // Permission bits do not bind root; the scenario is untestable here.
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    mkfs_dir(dir.path(), GIB, small_log(8));

    let log_path = dir.path().join(LOG_RELPATH);
    let mut perms = fs::metadata(&log_path).expect("stat").permissions();
    perms.set_readonly(true);
    fs::set_permissions(&log_path, perms).expect("chmod");

    assert!(matches!(
        init_locked_log(dir.path(), &MASTER_ID, LockMode::Blocking),
        Err(FabError::Io(_))
    ));
}

#[test]
fn second_holder_sees_busy_until_release() {
    let dir = tempfile::tempdir().expect("tempdir");
    mkfs_dir(dir.path(), GIB, small_log(8));

    let first = init_locked_log(dir.path(), &MASTER_ID, LockMode::Blocking).expect("first");
    assert!(matches!(
        init_locked_log(dir.path(), &MASTER_ID, LockMode::NonBlocking),
        Err(FabError::Busy)
    ));
    first.release().expect("release");

    let second = init_locked_log(dir.path(), &MASTER_ID, LockMode::NonBlocking)
        .expect("lock is free again");
    second.release().expect("release");
}

#[test]
fn mkfs_lifecycle_force_and_kill() {
    let dir = tempfile::tempdir().expect("tempdir");
    let probe = SysDeviceProbe;
    mkfs_dir(dir.path(), GIB, small_log(8));

    // A valid superblock blocks a plain re-mkfs.
    let again = mkfs_at(
        dir.path(),
        Some(GIB),
        &MASTER_ID,
        &probe,
        &MkfsOptions {
            log_len: small_log(8),
            ..MkfsOptions::default()
        },
    );
    assert!(matches!(again, Err(FabError::AlreadyFormatted)));

    // Kill plus force wipes and recreates.
    mkfs_at(
        dir.path(),
        Some(GIB),
        &MASTER_ID,
        &probe,
        &MkfsOptions {
            force: true,
            kill: true,
            log_len: small_log(8),
        },
    )
    .expect("kill + force");

    // Plain mkfs still refuses over the fresh valid superblock...
    assert!(matches!(
        mkfs_at(
            dir.path(),
            Some(GIB),
            &MASTER_ID,
            &probe,
            &MkfsOptions {
                log_len: small_log(8),
                ..MkfsOptions::default()
            },
        ),
        Err(FabError::AlreadyFormatted)
    ));

    // ...force alone overwrites it.
    mkfs_at(
        dir.path(),
        Some(GIB),
        &MASTER_ID,
        &probe,
        &MkfsOptions {
            force: true,
            kill: false,
            log_len: small_log(8),
        },
    )
    .expect("force");

    let report = fsck(dir.path(), &SysDeviceProbe, &FsckOptions::default()).expect("fsck");
    assert!(report.valid);
    assert_eq!(report.slots_used, 0);
}

#[test]
fn fsck_rejects_truncated_superblock_without_crashing() {
    let dir = tempfile::tempdir().expect("tempdir");
    mkfs_dir(dir.path(), GIB, small_log(8));
    let sb_path = dir.path().join(SB_RELPATH);

    // Extra bytes past the record are harmless, and naming the superblock
    // file directly resolves its sibling log.
    let mut padded = fs::read(&sb_path).expect("read");
    padded.resize(8192, 0);
    fs::write(&sb_path, &padded).expect("pad");
    assert!(
        fsck(dir.path(), &SysDeviceProbe, &FsckOptions::default())
            .expect("fsck")
            .valid
    );
    assert!(
        fsck(&sb_path, &SysDeviceProbe, &FsckOptions::default())
            .expect("fsck via superblock file")
            .valid
    );

    // Seven bytes cannot hold the record.
    fs::write(&sb_path, &padded[..7]).expect("truncate");
    for mmap in [false, true] {
        assert!(matches!(
            fsck(dir.path(), &SysDeviceProbe, &FsckOptions { mmap }),
            Err(FabError::Structural(_))
        ));
    }
}

#[test]
fn fsck_distinguishes_truncated_log_from_absent_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    mkfs_dir(dir.path(), GIB, None);

    let mut log = init_locked_log(dir.path(), &MASTER_ID, LockMode::Blocking).expect("init");
    for i in 0..64 {
        log.mkdir(&dir.path().join(format!("d{i}")), 0o755, 0, 0)
            .expect("mkdir");
    }
    log.release().expect("release");

    let log_path = dir.path().join(LOG_RELPATH);
    let full = fs::read(&log_path).expect("read log");

    // Chop the committed entry area short.
    fs::write(&log_path, &full[..8192]).expect("truncate");
    assert!(matches!(
        fsck(dir.path(), &SysDeviceProbe, &FsckOptions::default()),
        Err(FabError::Structural(_))
    ));

    // Remove it altogether: a distinct "log absent" failure.
    fs::remove_file(&log_path).expect("unlink");
    assert!(matches!(
        fsck(dir.path(), &SysDeviceProbe, &FsckOptions::default()),
        Err(FabError::NotFound(_))
    ));
}

#[test]
fn fsck_rejects_unsupported_target_types_before_reading() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pipe = dir.path().join("testpipe");
    nix::unistd::mkfifo(&pipe, nix::sys::stat::Mode::S_IRWXU).expect("mkfifo");
    assert!(matches!(
        fsck(&pipe, &SysDeviceProbe, &FsckOptions::default()),
        Err(FabError::TypeMismatch(_))
    ));

    assert!(matches!(
        fsck(
            Path::new("/nonexistent-fabfs-target"),
            &SysDeviceProbe,
            &FsckOptions::default()
        ),
        Err(FabError::Io(_))
    ));
}

#[test]
fn fsck_checks_a_regular_file_as_a_device_image() {
    let dir = tempfile::tempdir().expect("tempdir");
    let image = dir.path().join("fab.img");
    // A 64 MiB image file: superblock at 0, log at its device offset.
    let image_file = fs::File::create(&image).expect("create");
    image_file
        .set_len(fabfs_types::FABFS_MIN_DEVSIZE)
        .expect("set_len");
    drop(image_file);

    mkfs_at(
        &image,
        None,
        &MASTER_ID,
        &SysDeviceProbe,
        &MkfsOptions::default(),
    )
    .expect("mkfs on image");

    let report = fsck(&image, &SysDeviceProbe, &FsckOptions::default()).expect("fsck");
    assert!(report.valid);
    assert_eq!(report.device_size, fabfs_types::FABFS_MIN_DEVSIZE);
    assert_eq!(report.files, 0);
}
