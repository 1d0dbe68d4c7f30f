/// JSON download manifest.
///
/// ```json
/// {
///   "files": [{ "path": "album/a.flac", "length": 52428800 }],
///   "block_size": 262144,
///   "block_hashes": ["9f86d08...", "..."],
///   "sources": [
///     { "label": "mirror-1", "path": "/srv/mirror/album.bin" },
///     { "path": "/mnt/partial.bin", "available": [[0, 1048576]] }
///   ]
/// }
/// ```
///
/// `sha256` (whole payload) may replace `block_size` + `block_hashes`;
/// with neither, downloaded data is not verified.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use haven_swarm::{
    BlockHashVerifier, BlockVerifier, LogicalFileMap, NoopVerifier, Range, RangeSet,
};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct Manifest {
    pub files: Vec<ManifestFile>,
    #[serde(default)]
    pub block_size: Option<u64>,
    #[serde(default)]
    pub block_hashes: Vec<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    pub sources: Vec<ManifestSource>,
}

#[derive(Debug, Deserialize)]
pub struct ManifestFile {
    pub path: PathBuf,
    pub length: u64,
}

#[derive(Debug, Deserialize)]
pub struct ManifestSource {
    #[serde(default)]
    pub label: Option<String>,
    /// Local copy of the concatenated payload.
    pub path: PathBuf,
    /// `[start, end)` pairs the copy actually holds.
    #[serde(default)]
    pub available: Option<Vec<Range>>,
}

impl ManifestSource {
    pub fn label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.path.display().to_string())
    }

    pub fn available(&self) -> Option<RangeSet> {
        self.available
            .as_ref()
            .map(|ranges| ranges.iter().copied().collect())
    }
}

impl Manifest {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading manifest {}", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&text)
            .with_context(|| format!("parsing manifest {}", path.display()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.files.is_empty() {
            bail!("manifest lists no files");
        }
        for file in &self.files {
            let escapes = file.path.components().any(|c| {
                matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))
            });
            if escapes || file.path.as_os_str().is_empty() {
                bail!("file path {} must be relative to the output directory", file.path.display());
            }
        }
        let Some(total) = self.checked_total_length() else {
            bail!("file lengths add up to more than {} bytes", u64::MAX);
        };
        if total == 0 {
            bail!("payload is empty");
        }
        Ok(())
    }

    fn checked_total_length(&self) -> Option<u64> {
        self.files
            .iter()
            .try_fold(0u64, |total, f| total.checked_add(f.length))
    }

    /// Payload size. Saturates for manifests that skipped `validate`.
    pub fn total_length(&self) -> u64 {
        self.checked_total_length().unwrap_or(u64::MAX)
    }

    pub fn file_map(&self) -> anyhow::Result<LogicalFileMap> {
        Ok(LogicalFileMap::new(self.files.iter().map(|f| (&f.path, f.length)))?)
    }

    pub fn verifier(&self) -> anyhow::Result<Arc<dyn BlockVerifier>> {
        let total = self.total_length();
        match (self.block_size, &self.sha256) {
            (Some(block_size), _) => {
                if block_size == 0 {
                    bail!("block_size must be positive");
                }
                let expected = total.div_ceil(block_size);
                if self.block_hashes.len() as u64 != expected {
                    bail!(
                        "expected {} block hashes for {} bytes at block size {}, got {}",
                        expected,
                        total,
                        block_size,
                        self.block_hashes.len()
                    );
                }
                Ok(Arc::new(BlockHashVerifier::new(
                    block_size,
                    total,
                    self.block_hashes.clone(),
                )))
            }
            (None, Some(sha256)) => Ok(Arc::new(BlockHashVerifier::whole_file(total, sha256.clone()))),
            (None, None) => {
                warn!("manifest carries no hashes, data will not be verified");
                Ok(Arc::new(NoopVerifier))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> anyhow::Result<Manifest> {
        let manifest: Manifest = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    #[test]
    fn test_parse_multi_file_manifest() {
        let manifest = parse(
            r#"{
                "files": [{"path": "a.bin", "length": 50}, {"path": "b.bin", "length": 30}],
                "block_size": 32,
                "block_hashes": ["00", "11", "22"],
                "sources": [{"path": "/tmp/m1"}, {"label": "half", "path": "/tmp/m2", "available": [[0, 40]]}]
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.total_length(), 80);
        assert_eq!(manifest.file_map().unwrap().entries()[1].offset, 50);
        assert_eq!(manifest.sources[0].label(), "/tmp/m1");
        assert_eq!(
            manifest.sources[1].available(),
            Some(RangeSet::from_range(Range::new(0, 40).unwrap()))
        );
        assert!(manifest.verifier().is_ok());
    }

    #[test]
    fn test_hash_count_checked() {
        let manifest = parse(
            r#"{"files": [{"path": "a.bin", "length": 100}], "block_size": 32,
                "block_hashes": ["00"], "sources": []}"#,
        )
        .unwrap();
        assert!(manifest.verifier().is_err());
    }

    #[test]
    fn test_rejects_escaping_paths() {
        assert!(parse(r#"{"files": [{"path": "../etc/passwd", "length": 1}], "sources": []}"#).is_err());
        assert!(parse(r#"{"files": [{"path": "/abs", "length": 1}], "sources": []}"#).is_err());
        assert!(parse(r#"{"files": [{"path": "empty", "length": 0}], "sources": []}"#).is_err());
    }

    #[test]
    fn test_rejects_overflowing_lengths() {
        let json = format!(
            r#"{{"files": [{{"path": "a", "length": {max}}}, {{"path": "b", "length": {max}}}], "sources": []}}"#,
            max = u64::MAX
        );
        let err = parse(&json).unwrap_err();
        assert!(err.to_string().contains("add up to more than"), "{}", err);
    }

    #[test]
    fn test_rejects_inverted_available_range() {
        let result = parse(
            r#"{"files": [{"path": "a", "length": 10}], "sources": [{"path": "m", "available": [[8, 2]]}]}"#,
        );
        assert!(result.is_err());
    }
}
