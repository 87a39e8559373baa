//! Image catalog: the `images/` directory resolved into byte streams.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use lzma_rust2::XzReaderMt;
use serde::Serialize;

use crate::core::models::{ErrorKind, JobError};
use crate::core::progress::human_size;

const DECOMPRESS_BUFFER_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
}

/// Immutable descriptor for one file in the image directory. Created on
/// listing, thrown away on the next scan.
#[derive(Debug, Clone, Serialize)]
pub struct Image {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub size_human: String,
    pub mtime: DateTime<Utc>,
    pub img_type: String,
    #[serde(skip)]
    pub compression: Compression,
}

impl Image {
    /// Known only for plain images; a compressed stream's length is not
    /// derivable without reading it through.
    pub fn uncompressed_len(&self) -> Option<u64> {
        match self.compression {
            Compression::None => Some(self.size_bytes),
            _ => None,
        }
    }

    /// Open the raw image bytes, decompressing transparently by suffix.
    pub fn open_stream(&self) -> std::io::Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path)?;
        match self.compression {
            Compression::None => Ok(Box::new(BufReader::with_capacity(
                DECOMPRESS_BUFFER_SIZE,
                file,
            ))),
            Compression::Gzip => Ok(Box::new(GzDecoder::new(BufReader::with_capacity(
                DECOMPRESS_BUFFER_SIZE,
                file,
            )))),
            Compression::Xz => {
                let threads = std::thread::available_parallelism()
                    .map(|n| n.get().min(4) as u32)
                    .unwrap_or(1);
                let reader = XzReaderMt::new(file, false, threads).map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                })?;
                Ok(Box::new(reader))
            }
        }
    }
}

/// Classify a file name into its compression and display type.
fn classify(name: &str) -> Option<(Compression, &'static str)> {
    if name.ends_with(".img.gz") {
        Some((Compression::Gzip, "img.gz"))
    } else if name.ends_with(".img.xz") {
        Some((Compression::Xz, "img.xz"))
    } else if name.ends_with(".img") {
        Some((Compression::None, "img"))
    } else if name.ends_with(".iso") {
        Some((Compression::None, "iso"))
    } else {
        None
    }
}

pub struct ImageCatalog {
    dir: PathBuf,
}

impl ImageCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Scan the image directory. Unrecognised files are skipped.
    pub fn list(&self) -> Result<Vec<Image>> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating image directory {}", self.dir.display()))?;

        let mut images = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("reading image directory {}", self.dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some((compression, img_type)) = classify(&name) else {
                continue;
            };
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let mtime = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            images.push(Image {
                name,
                path: entry.path(),
                size_bytes: meta.len(),
                size_human: human_size(meta.len()),
                mtime,
                img_type: img_type.to_string(),
                compression,
            });
        }
        images.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(images)
    }

    pub fn resolve(&self, name: &str) -> Result<Image, JobError> {
        let images = self
            .list()
            .map_err(|e| JobError::new(ErrorKind::Internal, e.to_string()))?;
        images.into_iter().find(|img| img.name == name).ok_or_else(|| {
            JobError::new(ErrorKind::ImageNotFound, format!("image '{name}' not found"))
        })
    }
}
