//! Operator surface for batches that exhausted their upload attempts.
//!
//! `list` and `export` only read `failed/` and are safe while the agent
//! runs. `requeue` mutates the queue and refuses while the agent holds the
//! data directory lock.

use crate::buffer::{export_failed_files, read_failed_files, BufferSettings, OfflineBuffer, PendingFile};
use crate::config::parse::load_config;
use crate::config::types::Config;
use std::io::Write;
use std::path::{Path, PathBuf};

fn load(config_path: Option<PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;
    Ok(load_config(&path)?)
}

pub fn list(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(config_path)?;
    let failed = read_failed_files(&config.data_dir)?;
    let mut out = std::io::stdout().lock();
    write_listing(&mut out, &config.data_dir, &failed)?;
    Ok(())
}

pub fn write_listing(out: &mut impl Write, data_dir: &Path, failed: &[PendingFile]) -> std::io::Result<()> {
    if failed.is_empty() {
        writeln!(out, "No failed batches under {}", data_dir.display())?;
        return Ok(());
    }

    writeln!(out, "{} failed batch(es) under {}:", failed.len(), data_dir.display())?;
    for file in failed {
        writeln!(
            out,
            "  {}  {} bytes  attempts={}  created={}",
            file.relative_path.display(),
            file.size_bytes,
            file.attempt_count,
            file.created_at.format("%Y-%m-%dT%H:%M:%SZ"),
        )?;
        if let Some(error) = &file.last_error {
            writeln!(out, "      last error: {}", error)?;
        }
    }
    Ok(())
}

pub fn requeue(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(config_path)?;
    let settings = BufferSettings::from_config(&config.buffer, &config.upload);
    let buffer = OfflineBuffer::open(&config.data_dir, settings)?;
    let requeued = buffer.requeue_failed()?;
    println!("Requeued {} failed batch(es) for upload", requeued);
    Ok(())
}

pub fn export(config_path: Option<PathBuf>, dest: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = load(config_path)?;
    let failed = read_failed_files(&config.data_dir)?;
    let exported = export_failed_files(&failed, dest)?;
    println!("Exported {} failed batch(es) to {}", exported, dest.display());
    Ok(())
}
