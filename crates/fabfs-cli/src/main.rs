#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use fabfs_core::{
    FileIdentity, FsckOptions, LOG_RELPATH, MkfsOptions, ReadPolicy, SB_RELPATH, SysDeviceProbe,
    ascend_to_meta, fsck, load_region, mkfs_at,
};
use fabfs_ondisk::Superblock;
use fabfs_replay::Replay;
use std::env;
use std::path::Path;

/// Default location of the host's system UUID bootstrap file.
const SYSTEM_UUID_FILE: &str = "/etc/fabfs/system_uuid";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "mkfs" => {
            let Some(path) = args.next() else {
                bail!("mkfs requires a target path");
            };
            let rest: Vec<String> = args.collect();
            let size = flag_value(&rest, "--size")?
                .map(|raw| raw.parse::<u64>().context("--size must be a byte count"))
                .transpose()?;
            let uuid_file = flag_value(&rest, "--uuid-file")?
                .unwrap_or_else(|| SYSTEM_UUID_FILE.to_owned());
            let opts = MkfsOptions {
                force: rest.iter().any(|a| a == "--force"),
                kill: rest.iter().any(|a| a == "--kill"),
                log_len: None,
            };
            mkfs_cmd(Path::new(&path), size, &uuid_file, &opts)
        }
        "fsck" => {
            let Some(path) = args.next() else {
                bail!("fsck requires a target path");
            };
            let rest: Vec<String> = args.collect();
            let opts = FsckOptions {
                mmap: rest.iter().any(|a| a == "--mmap"),
            };
            fsck_cmd(Path::new(&path), &opts, rest.iter().any(|a| a == "--json"))
        }
        "logplay" => {
            let Some(path) = args.next() else {
                bail!("logplay requires a path inside the mount");
            };
            let json = args.any(|a| a == "--json");
            logplay_cmd(Path::new(&path), json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("fabfs\n");
    println!("USAGE:");
    println!("  fabfs mkfs <path> [--size <bytes>] [--force] [--kill] [--uuid-file <path>]");
    println!("  fabfs fsck <path> [--mmap] [--json]");
    println!("  fabfs logplay <path> [--json]");
}

/// Pull the value following a `--flag` out of trailing arguments.
fn flag_value(rest: &[String], flag: &str) -> Result<Option<String>> {
    let Some(pos) = rest.iter().position(|a| a == flag) else {
        return Ok(None);
    };
    rest.get(pos + 1)
        .cloned()
        .map(Some)
        .with_context(|| format!("{flag} requires a value"))
}

fn mkfs_cmd(path: &Path, size: Option<u64>, uuid_file: &str, opts: &MkfsOptions) -> Result<()> {
    let identity = FileIdentity::new(uuid_file);
    let sb = mkfs_at(path, size, &identity, &SysDeviceProbe, opts)
        .with_context(|| format!("mkfs failed at {}", path.display()))?;
    println!(
        "created filesystem: device_size={} log_capacity={} slots",
        sb.device_size,
        sb.log_capacity()
    );
    Ok(())
}

fn fsck_cmd(path: &Path, opts: &FsckOptions, json: bool) -> Result<()> {
    let report = fsck(path, &SysDeviceProbe, opts)
        .with_context(|| format!("fsck failed at {}", path.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        println!("FabFS fsck: {}", path.display());
        println!("valid: {}", report.valid);
        println!("device_size: {}", report.device_size);
        println!("files: {}", report.files);
        println!("directories: {}", report.directories);
        println!("bytes_allocated: {}", report.bytes_allocated);
        println!("free_bytes: {}", report.free_bytes);
        println!("log slots used/free: {}/{}", report.slots_used, report.slots_free);
        for error in &report.errors {
            println!("error: {error}");
        }
    }

    if !report.valid {
        bail!("filesystem is inconsistent");
    }
    Ok(())
}

fn logplay_cmd(path: &Path, json: bool) -> Result<()> {
    let root = ascend_to_meta(path).context("locating the metadata directory")?;
    let sb_region = load_region(&root.join(SB_RELPATH), ReadPolicy::Buffered)
        .context("loading superblock")?;
    let sb = Superblock::parse_from_bytes(&sb_region).context("parsing superblock")?;
    sb.validate().context("validating superblock")?;
    let log_region =
        load_region(&root.join(LOG_RELPATH), ReadPolicy::Buffered).context("loading log")?;

    let replay = Replay::run(&log_region, &sb).context("replaying log")?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&replay.stats).context("serialize stats")?
        );
    } else {
        println!("FabFS logplay: {}", root.display());
        println!("entries_applied: {}", replay.stats.entries_applied);
        println!("files_created: {}", replay.stats.files_created);
        println!("dirs_created: {}", replay.stats.dirs_created);
        println!("accesses_seen: {}", replay.stats.accesses_seen);
        println!("bytes_allocated: {}", replay.stats.bytes_allocated);
    }

    if let Some(halt) = &replay.halted {
        bail!("replay halted at entry {}: {}", halt.index, halt.error);
    }
    Ok(())
}
