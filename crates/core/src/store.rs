//! On-disk layout of WAL segments
//!
//! Manages the WAL root directory:
//! ```text
//! <wal_root>/
//!   LOCK
//!   work/
//!     0000000000000042.wal        active segment
//!   archive/
//!     0000000000000040.wal        archived
//!     0000000000000041.wal.zst    archived + compressed
//!   history/                      checkpoint history journal (sled)
//!   tmp/
//! ```

use crate::config::WalMode;
use crate::error::{Result, WalError};
use crate::segment::SegmentMeta;
use crate::types::{unix_time_ms, SegmentIndex, SegmentState};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const SEGMENT_EXT: &str = ".wal";
const COMPRESSED_EXT: &str = ".wal.zst";

/// File name of a raw segment
pub fn segment_file_name(index: SegmentIndex) -> String {
    format!("{:016}{}", index, SEGMENT_EXT)
}

/// File name of a compressed segment
pub fn compressed_file_name(index: SegmentIndex) -> String {
    format!("{:016}{}", index, COMPRESSED_EXT)
}

/// Parse a segment file name into its index and whether it is compressed
pub fn parse_segment_file_name(name: &str) -> Option<(SegmentIndex, bool)> {
    let (stem, compressed) = if let Some(stem) = name.strip_suffix(COMPRESSED_EXT) {
        (stem, true)
    } else {
        (name.strip_suffix(SEGMENT_EXT)?, false)
    };

    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok().map(|index| (index, compressed))
}

/// Segment files of one WAL root
#[derive(Debug, Clone)]
pub struct SegmentStore {
    root: PathBuf,
    work_dir: PathBuf,
    archive_dir: PathBuf,
    history_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl SegmentStore {
    /// Create (or reuse) the directory layout under `root`
    pub fn init(root: &Path) -> Result<Self> {
        let store = Self {
            root: root.to_path_buf(),
            work_dir: root.join("work"),
            archive_dir: root.join("archive"),
            history_dir: root.join("history"),
            tmp_dir: root.join("tmp"),
        };

        for dir in [
            &store.work_dir,
            &store.archive_dir,
            &store.history_dir,
            &store.tmp_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }

        store.clear_tmp()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn history_dir(&self) -> &Path {
        &self.history_dir
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn work_path(&self, index: SegmentIndex) -> PathBuf {
        self.work_dir.join(segment_file_name(index))
    }

    pub fn archive_path(&self, index: SegmentIndex) -> PathBuf {
        self.archive_dir.join(segment_file_name(index))
    }

    pub fn compressed_path(&self, index: SegmentIndex) -> PathBuf {
        self.archive_dir.join(compressed_file_name(index))
    }

    /// Where a segment in `state` lives on disk
    pub fn path_for(&self, index: SegmentIndex, state: SegmentState) -> Result<PathBuf> {
        match state {
            SegmentState::Active => Ok(self.work_path(index)),
            SegmentState::Archived => Ok(self.archive_path(index)),
            SegmentState::Compressed => Ok(self.compressed_path(index)),
            SegmentState::Deleted => Err(WalError::UnknownSegment(index)),
        }
    }

    /// Create an empty active segment file
    pub fn create_active(&self, index: SegmentIndex, mode: WalMode) -> Result<ActiveSegment> {
        let path = self.work_path(index);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        sync_dir(&self.work_dir)?;

        Ok(ActiveSegment {
            index,
            file,
            written: 0,
            mode,
        })
    }

    /// Reopen the active segment found during recovery and append after its end
    pub fn open_active(&self, index: SegmentIndex, mode: WalMode) -> Result<ActiveSegment> {
        let path = self.work_path(index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        Ok(ActiveSegment {
            index,
            file,
            written,
            mode,
        })
    }

    /// Move a sealed segment from `work/` to `archive/`
    ///
    /// Returns the segment size in bytes.
    pub fn archive(&self, index: SegmentIndex) -> Result<u64> {
        let from = self.work_path(index);
        let to = self.archive_path(index);

        let size = std::fs::metadata(&from)?.len();
        std::fs::rename(&from, &to)?;
        sync_dir(&self.archive_dir)?;

        tracing::debug!("Archived segment {} ({} bytes)", index, size);
        Ok(size)
    }

    /// Write the zstd-compressed copy of an archived segment
    ///
    /// The raw file stays in place until the caller removes it with
    /// `remove(index, SegmentState::Archived)`, so readers that still see the
    /// segment as archived keep working. Returns the compressed size in bytes.
    pub fn compress(&self, index: SegmentIndex, level: i32) -> Result<u64> {
        let raw = std::fs::read(self.archive_path(index))?;
        let compressed = zstd::encode_all(raw.as_slice(), level)?;

        atomic_write(&self.tmp_dir, &self.compressed_path(index), &compressed)?;

        tracing::debug!(
            "Compressed segment {}: {} -> {} bytes",
            index,
            raw.len(),
            compressed.len()
        );
        Ok(compressed.len() as u64)
    }

    /// Remove a segment file
    ///
    /// A file that is already gone counts as removed.
    pub fn remove(&self, index: SegmentIndex, state: SegmentState) -> Result<()> {
        let path = self.path_for(index, state)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Segment file {} already removed", path.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Full contents of a segment, decompressed if needed
    pub fn read_segment(&self, index: SegmentIndex, state: SegmentState) -> Result<Vec<u8>> {
        let path = self.path_for(index, state)?;
        let data = std::fs::read(&path)?;

        if state == SegmentState::Compressed {
            return Ok(zstd::decode_all(data.as_slice())?);
        }
        Ok(data)
    }

    /// Discover every segment on disk
    ///
    /// Finishes interrupted operations on the way: extra files in `work/` are
    /// moved to `archive/` (an interrupted rollover) and a raw archive file that
    /// also has a compressed twin is dropped (an interrupted compression).
    pub fn scan(&self) -> Result<Vec<SegmentMeta>> {
        let mut work = list_segment_files(&self.work_dir)?;
        let archived = list_segment_files(&self.archive_dir)?;

        let mut found: BTreeMap<SegmentIndex, SegmentMeta> = BTreeMap::new();

        for (index, files) in archived {
            let meta = match (files.raw, files.compressed) {
                (Some(raw), Some(zst)) => {
                    tracing::warn!("Dropping raw copy of compressed segment {}", index);
                    std::fs::remove_file(&raw.path)?;
                    compressed_meta(index, zst.len)
                }
                (None, Some(zst)) => compressed_meta(index, zst.len),
                (Some(raw), None) => SegmentMeta::new(index, SegmentState::Archived, raw.len, unix_time_ms()),
                (None, None) => continue,
            };
            found.insert(index, meta);
        }

        let active = work.keys().next_back().copied();
        if let Some(active) = active {
            let sealed: Vec<_> = work.range(..active).map(|(&index, _)| index).collect();
            for index in sealed {
                tracing::warn!("Finishing interrupted rollover of segment {}", index);
                let size = self.archive(index)?;
                found.insert(
                    index,
                    SegmentMeta::new(index, SegmentState::Archived, size, unix_time_ms()),
                );
            }

            if let Some(file) = work.remove(&active).and_then(|files| files.raw) {
                found.insert(
                    active,
                    SegmentMeta::new(active, SegmentState::Active, file.len, unix_time_ms()),
                );
            }
        }

        Ok(found.into_values().collect())
    }

    fn clear_tmp(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.tmp_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                tracing::debug!("Removing leftover temp file {}", entry.path().display());
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// Write handle for the active segment
#[derive(Debug)]
pub struct ActiveSegment {
    index: SegmentIndex,
    file: File,
    written: u64,
    mode: WalMode,
}

impl ActiveSegment {
    pub fn index(&self) -> SegmentIndex {
        self.index
    }

    /// Bytes in the segment so far
    pub fn len(&self) -> u64 {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    /// Append one record, syncing as the WAL mode requires
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        self.file.write_all(data)?;
        match self.mode {
            WalMode::Full => self.file.sync_data()?,
            WalMode::LogOnly => self.file.flush()?,
            WalMode::Background | WalMode::None => {}
        }
        self.written += data.len() as u64;
        Ok(self.written)
    }

    /// Force contents to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Atomic write helper
///
/// Writes data to a temporary file, fsyncs it, then renames it to the target path.
pub fn atomic_write(tmp_dir: &Path, target: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = tmp_dir.join(format!("{}.tmp", ulid::Ulid::new()));

    let mut file = File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = std::fs::rename(&tmp_path, target) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    if let Some(parent) = target.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn compressed_meta(index: SegmentIndex, len: u64) -> SegmentMeta {
    let mut meta = SegmentMeta::new(index, SegmentState::Compressed, len, unix_time_ms());
    meta.compressed_size = Some(len);
    meta
}

struct FoundFile {
    path: PathBuf,
    len: u64,
}

#[derive(Default)]
struct FoundSegment {
    raw: Option<FoundFile>,
    compressed: Option<FoundFile>,
}

fn list_segment_files(dir: &Path) -> Result<BTreeMap<SegmentIndex, FoundSegment>> {
    let mut found: BTreeMap<SegmentIndex, FoundSegment> = BTreeMap::new();

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| WalError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        let Some((index, compressed)) = parse_segment_file_name(&name) else {
            tracing::debug!("Ignoring unrecognized file {}", entry.path().display());
            continue;
        };

        let file = FoundFile {
            path: entry.path().to_path_buf(),
            len: entry.metadata().map_err(|e| WalError::Io(e.into()))?.len(),
        };

        let slot = found.entry(index).or_default();
        if compressed {
            slot.compressed = Some(file);
        } else {
            slot.raw = Some(file);
        }
    }

    Ok(found)
}
