use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Errors that can occur while scanning a trial directory or reading/writing
/// the timestamps table.
#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Seed scan I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Seed scan walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Timestamps table error: {0}")]
    Csv(#[from] csv::Error),
}

/// The category directory a seed was discovered in.
///
/// Fuzzers place generated testcases under `queue`, `crashes`, or `hangs`.
/// The series merger measures coverage growth on productive discoveries only,
/// so crash-category seeds are excluded from coverage curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeedCategory {
    Queue,
    Crashes,
    Hangs,
}

impl SeedCategory {
    /// All category directories scanned during discovery, in scan order.
    pub const ALL: [SeedCategory; 3] =
        [SeedCategory::Queue, SeedCategory::Crashes, SeedCategory::Hangs];

    pub fn dir_name(&self) -> &'static str {
        match self {
            SeedCategory::Queue => "queue",
            SeedCategory::Crashes => "crashes",
            SeedCategory::Hangs => "hangs",
        }
    }

    pub fn from_dir_name(name: &str) -> Option<Self> {
        match name {
            "queue" => Some(SeedCategory::Queue),
            "crashes" => Some(SeedCategory::Crashes),
            "hangs" => Some(SeedCategory::Hangs),
            _ => None,
        }
    }
}

/// One discovered testcase: identity, category, size, and creation time.
///
/// Ordering by `unix_time` defines the discovery timeline of a trial.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedRecord {
    /// Full path to the seed file.
    pub path: PathBuf,
    pub category: SeedCategory,
    /// File size in bytes.
    pub size: u64,
    /// Creation timestamp, seconds since the Unix epoch.
    pub unix_time: f64,
}

impl SeedRecord {
    /// File name of the seed, without any directory components.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// AFL-style seed names start with `id:` (or `id_` on filesystems that
/// forbid colons).
fn is_seed_name(name: &str) -> bool {
    name.starts_with("id:") || name.starts_with("id_")
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

#[cfg(unix)]
fn creation_time(metadata: &std::fs::Metadata) -> f64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ctime() as f64 + metadata.ctime_nsec() as f64 * 1e-9
}

#[cfg(not(unix))]
fn creation_time(metadata: &std::fs::Metadata) -> f64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Scans the `queue`, `crashes`, and `hangs` directories of a fuzzer output
/// directory and records a [`SeedRecord`] per testcase.
///
/// Hidden directories are skipped and only AFL-named (`id:`/`id_`-prefixed)
/// files are considered. The result is sorted by creation time, restoring a
/// deterministic discovery order regardless of filesystem iteration order.
pub fn discover_seeds(out_dir: &Path) -> Result<Vec<SeedRecord>, SeedError> {
    let mut records = Vec::new();

    for category in SeedCategory::ALL {
        let dir = out_dir.join(category.dir_name());
        if !dir.is_dir() {
            continue;
        }

        for entry in WalkDir::new(&dir)
            .into_iter()
            .filter_entry(|e| !(e.file_type().is_dir() && is_hidden(e)))
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !is_seed_name(&name) {
                continue;
            }

            let metadata = entry.metadata()?;
            records.push(SeedRecord {
                path: entry.path().to_path_buf(),
                category,
                size: metadata.len(),
                unix_time: creation_time(&metadata),
            });
        }
    }

    records.sort_by(|a, b| a.unix_time.total_cmp(&b.unix_time));
    Ok(records)
}

/// One row of the timestamps table (`seed,size,unix_time`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampRow {
    pub seed: String,
    pub size: u64,
    pub unix_time: f64,
}

impl TimestampRow {
    /// Name of the category directory the seed sits in, if recognizable.
    pub fn category(&self) -> Option<SeedCategory> {
        Path::new(&self.seed)
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(SeedCategory::from_dir_name)
    }

    /// File name of the seed, without directory components.
    pub fn name(&self) -> String {
        Path::new(&self.seed)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Writes the timestamps table for a set of discovered seeds.
pub fn write_timestamps<W: Write>(records: &[SeedRecord], writer: W) -> Result<(), SeedError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for record in records {
        csv_writer.serialize(TimestampRow {
            seed: record.path.to_string_lossy().into_owned(),
            size: record.size,
            unix_time: record.unix_time,
        })?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// Reads a timestamps table previously written by [`write_timestamps`].
pub fn read_timestamps<R: Read>(reader: R) -> Result<Vec<TimestampRow>, SeedError> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut rows = Vec::new();
    for row in csv_reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}
