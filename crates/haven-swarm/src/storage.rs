use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;
use crate::file_map::LogicalFileMap;
use crate::range::Range;
use crate::verifier::BlockReader;

/// On-disk destination for a swarm download.
///
/// Every physical file of the map lives at `{root}/{relative path}` and is
/// pre-allocated to its final length. Handles stay open for the lifetime of
/// the set; all I/O is positioned, so writers on disjoint ranges never share
/// a cursor.
pub struct FileSet {
    root: PathBuf,
    map: LogicalFileMap,
    files: Vec<File>,
}

impl FileSet {
    /// Create (or truncate-extend) every file of `map` under `root`.
    pub fn create(root: impl Into<PathBuf>, map: LogicalFileMap) -> Result<Self> {
        let root = root.into();
        let mut files = Vec::with_capacity(map.entries().len());
        for entry in map.entries() {
            let path = root.join(&entry.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            file.set_len(entry.length)?;
            files.push(file);
        }
        info!(
            "Allocated {} file(s), {} bytes under {}",
            files.len(),
            map.total_length(),
            root.display()
        );
        Ok(Self { root, map, files })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn map(&self) -> &LogicalFileMap {
        &self.map
    }

    pub fn total_length(&self) -> u64 {
        self.map.total_length()
    }

    /// Write `data` at logical `offset`, split across physical files.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let fragments = self.map.resolve(offset, data.len() as u64)?;
        let mut consumed = 0usize;
        for fragment in fragments {
            let len = fragment.length as usize;
            write_all_at(
                &self.files[fragment.file_index],
                &data[consumed..consumed + len],
                fragment.file_offset,
            )?;
            consumed += len;
        }
        Ok(())
    }

    /// Read a logical range back, stitching physical files together.
    pub fn read_at(&self, range: Range) -> Result<Vec<u8>> {
        range.check_bounds(self.map.total_length())?;
        let len = usize::try_from(range.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("range {} too large to buffer", range)))?;
        let mut buf = vec![0u8; len];
        let mut filled = 0usize;
        for fragment in self.map.resolve_range(range) {
            let len = fragment.length as usize;
            read_exact_at(
                &self.files[fragment.file_index],
                &mut buf[filled..filled + len],
                fragment.file_offset,
            )?;
            filled += len;
        }
        Ok(buf)
    }

    /// Flush file contents and metadata to disk.
    pub fn sync(&self) -> Result<()> {
        for file in &self.files {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl BlockReader for FileSet {
    fn read_range(&self, range: Range) -> io::Result<Vec<u8>> {
        self.read_at(range).map_err(|e| match e {
            crate::error::SwarmError::Io(io) => io,
            other => io::Error::new(io::ErrorKind::InvalidInput, other.to_string()),
        })
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
