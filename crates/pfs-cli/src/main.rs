#![forbid(unsafe_code)]
//! Operator tool for inspecting poolfs pool directories offline.
//!
//! Works directly on the metadata and data directories without a
//! namespace connection, so it never repairs anything; `check` only
//! reports what the repository's reconciler would have to deal with.

use anyhow::{bail, Context, Result};
use poolfs::{
    BlobStore, CacheEntry, DirBlobStore, EntryState, EventBroadcaster, FileMetaStore,
    MetaDataStore, now_millis,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::sync::Arc;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
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
        bail!("missing command");
    };

    let mut json = false;
    let mut pool_dir = None;
    for arg in args {
        match arg.as_str() {
            "--json" => json = true,
            other if pool_dir.is_none() => pool_dir = Some(other.to_owned()),
            other => bail!("unexpected argument: {other}"),
        }
    }
    let Some(pool_dir) = pool_dir else {
        print_usage();
        bail!("missing <pool-dir>");
    };
    let pool_dir = Path::new(&pool_dir);

    match command.as_str() {
        "info" => cmd_info(pool_dir, json),
        "ls" => cmd_ls(pool_dir, json),
        "check" => cmd_check(pool_dir, json),
        other => {
            print_usage();
            bail!("unknown command: {other}");
        }
    }
}

fn print_usage() {
    eprintln!("usage: pfs <command> <pool-dir> [--json]");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  info    summarize replica states and space usage");
    eprintln!("  ls      list all replicas with state, size, and pins");
    eprintln!("  check   cross-check metadata against data files");
}

fn load_entries(pool_dir: &Path) -> Result<Vec<CacheEntry>> {
    let store = FileMetaStore::open(pool_dir, Arc::new(EventBroadcaster::new()))
        .with_context(|| format!("opening metadata under {}", pool_dir.display()))?;
    let mut entries = Vec::new();
    for id in store.list().context("listing metadata")? {
        if let Some(record) = store
            .get(&id)
            .with_context(|| format!("reading record {id}"))?
        {
            entries.push(record.snapshot());
        }
    }
    Ok(entries)
}

#[derive(Debug, Serialize)]
struct PoolInfo {
    files: usize,
    bytes: u64,
    precious_bytes: u64,
    pinned: usize,
    by_state: BTreeMap<String, usize>,
}

fn cmd_info(pool_dir: &Path, json: bool) -> Result<()> {
    let entries = load_entries(pool_dir)?;
    let now = now_millis();

    let mut by_state = BTreeMap::new();
    let mut bytes = 0_u64;
    let mut precious_bytes = 0_u64;
    let mut pinned = 0_usize;
    for entry in &entries {
        *by_state.entry(entry.state.to_string()).or_insert(0) += 1;
        bytes = bytes.saturating_add(entry.size);
        if entry.state == EntryState::Precious {
            precious_bytes = precious_bytes.saturating_add(entry.size);
        }
        if entry.is_sticky_at(now) {
            pinned += 1;
        }
    }
    let info = PoolInfo {
        files: entries.len(),
        bytes,
        precious_bytes,
        pinned,
        by_state,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("Files    : {}", info.files);
        println!("Bytes    : {}", info.bytes);
        println!("Precious : {}", info.precious_bytes);
        println!("Pinned   : {}", info.pinned);
        println!("States");
        for (state, count) in &info.by_state {
            println!("    {state:<12}: {count}");
        }
    }
    Ok(())
}

fn cmd_ls(pool_dir: &Path, json: bool) -> Result<()> {
    let entries = load_entries(pool_dir)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    let now = now_millis();
    for entry in &entries {
        let pin = if entry.is_sticky_at(now) { "sticky" } else { "-" };
        println!(
            "{} {:<12} {:>12} {}",
            entry.id, entry.state, entry.size, pin
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CheckReport {
    replicas: usize,
    data_without_metadata: Vec<String>,
    metadata_without_data: Vec<String>,
    size_mismatches: Vec<SizeMismatch>,
    transfer_leftovers: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SizeMismatch {
    id: String,
    recorded: u64,
    on_disk: u64,
}

impl CheckReport {
    fn is_clean(&self) -> bool {
        self.data_without_metadata.is_empty()
            && self.metadata_without_data.is_empty()
            && self.size_mismatches.is_empty()
            && self.transfer_leftovers.is_empty()
    }
}

fn cmd_check(pool_dir: &Path, json: bool) -> Result<()> {
    let entries = load_entries(pool_dir)?;
    let blob = DirBlobStore::open(pool_dir, 0)
        .with_context(|| format!("opening data under {}", pool_dir.display()))?;

    let mut report = CheckReport {
        replicas: entries.len(),
        data_without_metadata: Vec::new(),
        metadata_without_data: Vec::new(),
        size_mismatches: Vec::new(),
        transfer_leftovers: Vec::new(),
    };

    for id in blob.list().context("listing data files")? {
        if !entries.iter().any(|entry| entry.id == id) {
            report.data_without_metadata.push(id.to_string());
        }
    }
    for entry in &entries {
        match blob.len(&entry.id).context("probing data file")? {
            None => report.metadata_without_data.push(entry.id.to_string()),
            Some(on_disk) => {
                if entry.state.is_resident() && on_disk != entry.size {
                    report.size_mismatches.push(SizeMismatch {
                        id: entry.id.to_string(),
                        recorded: entry.size,
                        on_disk,
                    });
                }
            }
        }
        if entry.state.is_transfer() || entry.state == EntryState::New {
            report.transfer_leftovers.push(entry.id.to_string());
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Replicas            : {}", report.replicas);
        println!("Data w/o metadata   : {}", report.data_without_metadata.len());
        println!("Metadata w/o data   : {}", report.metadata_without_data.len());
        println!("Size mismatches     : {}", report.size_mismatches.len());
        println!("Transfer leftovers  : {}", report.transfer_leftovers.len());
        for id in &report.data_without_metadata {
            println!("    orphan data: {id}");
        }
        for id in &report.metadata_without_data {
            println!("    orphan metadata: {id}");
        }
        for mismatch in &report.size_mismatches {
            println!(
                "    size mismatch: {} recorded={} on_disk={}",
                mismatch.id, mismatch.recorded, mismatch.on_disk
            );
        }
        for id in &report.transfer_leftovers {
            println!("    interrupted transfer: {id}");
        }
    }

    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}
