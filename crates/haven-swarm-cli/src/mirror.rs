use std::io::SeekFrom;
use std::path::PathBuf;

use bytes::Bytes;
use haven_swarm::{FetchReply, Range, RangeSet, SourceTransport};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::manifest::ManifestSource;

/// Largest read per fetch, so big assignments are written in pieces.
const READ_CHUNK: u64 = 256 * 1024;

#[derive(Error, Debug)]
#[error("mirror {path}: {source}")]
pub struct MirrorError {
    path: String,
    #[source]
    source: std::io::Error,
}

/// Source backed by a local copy of the concatenated payload.
pub struct MirrorSource {
    label: String,
    path: PathBuf,
    available: Option<RangeSet>,
    file: Option<File>,
}

impl MirrorSource {
    pub fn new(source: &ManifestSource) -> Self {
        Self {
            label: source.label(),
            path: source.path.clone(),
            available: source.available(),
            file: None,
        }
    }

    fn err(&self, source: std::io::Error) -> MirrorError {
        MirrorError {
            path: self.path.display().to_string(),
            source,
        }
    }

    async fn read(&mut self, range: Range) -> std::io::Result<Vec<u8>> {
        if self.file.is_none() {
            self.file = Some(File::open(&self.path).await?);
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(Vec::new());
        };
        file.seek(SeekFrom::Start(range.start())).await?;
        let mut buf = vec![0u8; range.len().min(READ_CHUNK) as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

impl SourceTransport for MirrorSource {
    type Error = MirrorError;

    fn label(&self) -> String {
        self.label.clone()
    }

    fn available(&self) -> Option<RangeSet> {
        self.available.clone()
    }

    async fn fetch(&mut self, range: Range) -> Result<FetchReply, MirrorError> {
        match self.read(range).await {
            // Copy ends before the payload does.
            Ok(buf) if buf.is_empty() => Ok(FetchReply::Exhausted),
            Ok(buf) => Ok(FetchReply::Data(Bytes::from(buf))),
            Err(e) => Err(self.err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_in_chunks_and_exhausts() {
        let path = std::env::temp_dir().join(format!("haven-mirror-{}", std::process::id()));
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let mut source = MirrorSource {
            label: "m".into(),
            path: path.clone(),
            available: None,
            file: None,
        };

        let range = Range::new(10, 300_000).unwrap();
        let FetchReply::Data(first) = source.fetch(range).await.unwrap() else {
            panic!("expected data");
        };
        assert_eq!(first.len() as u64, READ_CHUNK);
        assert_eq!(&first[..], &data[10..10 + READ_CHUNK as usize]);

        let past_end = Range::new(300_000, 300_100).unwrap();
        assert!(matches!(source.fetch(past_end).await.unwrap(), FetchReply::Exhausted));

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let mut source = MirrorSource {
            label: "gone".into(),
            path: std::env::temp_dir().join("haven-mirror-does-not-exist"),
            available: None,
            file: None,
        };
        let err = source.fetch(Range::new(0, 10).unwrap()).await.unwrap_err();
        assert!(err.to_string().contains("haven-mirror-does-not-exist"));
    }
}
