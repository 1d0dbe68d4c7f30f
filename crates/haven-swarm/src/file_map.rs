/// Maps one logical offset space onto the physical files of a multi-file payload.
///
/// ```text
///  logical   0 ──────── 50 ──────── 80
///            │  a.bin    │  b.bin    │
///  resolve(40, 20) ─► a.bin @ 40 (10 bytes), b.bin @ 0 (10 bytes)
/// ```

use std::path::{Path, PathBuf};

use crate::error::{Result, SwarmError};
use crate::range::Range;

/// One physical file of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    /// Logical offset of the first byte of this file.
    pub offset: u64,
}

/// Piece of a logical write that lands in a single physical file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFragment {
    /// Index into `LogicalFileMap::entries`.
    pub file_index: usize,
    pub path: PathBuf,
    /// Offset inside the physical file.
    pub file_offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct LogicalFileMap {
    entries: Vec<FileEntry>,
    total_length: u64,
}

impl LogicalFileMap {
    /// Build from ordered `(relative path, length)` pairs. Fails when the
    /// lengths do not fit one `u64` offset space.
    pub fn new<P: AsRef<Path>>(files: impl IntoIterator<Item = (P, u64)>) -> Result<Self> {
        let mut entries = Vec::new();
        let mut offset = 0u64;
        for (path, length) in files {
            let path = path.as_ref().to_path_buf();
            let end = offset
                .checked_add(length)
                .ok_or_else(|| SwarmError::LengthOverflow { path: path.clone() })?;
            entries.push(FileEntry { path, length, offset });
            offset = end;
        }
        Ok(Self {
            entries,
            total_length: offset,
        })
    }

    /// Payload made of a single file.
    pub fn single(path: impl AsRef<Path>, length: u64) -> Self {
        Self {
            entries: vec![FileEntry {
                path: path.as_ref().to_path_buf(),
                length,
                offset: 0,
            }],
            total_length: length,
        }
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Split `[offset, offset + length)` into per-file fragments, in order.
    pub fn resolve(&self, offset: u64, length: u64) -> Result<Vec<FileFragment>> {
        let range = Range::with_len(offset, length)?;
        range.check_bounds(self.total_length)?;
        Ok(self.resolve_range(range))
    }

    pub(crate) fn resolve_range(&self, range: Range) -> Vec<FileFragment> {
        // First entry whose end lies past the range start; skips empty files.
        let first = self
            .entries
            .partition_point(|e| e.offset + e.length <= range.start());

        let mut fragments = Vec::new();
        for (file_index, entry) in self.entries.iter().enumerate().skip(first) {
            if entry.offset >= range.end() {
                break;
            }
            if entry.length == 0 {
                continue;
            }
            let start = range.start().max(entry.offset);
            let end = range.end().min(entry.offset + entry.length);
            fragments.push(FileFragment {
                file_index,
                path: entry.path.clone(),
                file_offset: start - entry.offset,
                length: end - start,
            });
        }
        fragments
    }
}
