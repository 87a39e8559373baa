//! Verify stage: hash the written device prefix and compare it to the
//! digest computed while the image streamed through the write stage.

use tokio::io::AsyncReadExt;

use super::{send_log, StageEvent, StageSender, WriteOutcome};
use crate::core::cancel::CancelToken;
use crate::core::image::Image;
use crate::core::models::{ErrorKind, JobError};

/// Small enough that the cancellation check between chunks stays well
/// under the 250 ms bound even on slow media.
const VERIFY_CHUNK: usize = 1024 * 1024;

fn hex(digest: &[u8; 32]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub(super) async fn verify_device(
    device_path: &str,
    image: &Image,
    written: &WriteOutcome,
    tx: StageSender,
    cancel: &CancelToken,
) -> Result<(), JobError> {
    let length = written.bytes_written;
    if length == 0 {
        send_log(&tx, "nothing was written, skipping verify").await;
        return Ok(());
    }

    send_log(&tx, format!("verifying {length} bytes against image digest")).await;
    let device_digest = hash_device_prefix(device_path, length, &tx, cancel).await?;

    send_log(&tx, format!("image  blake3: {}", hex(&written.digest))).await;
    send_log(&tx, format!("device blake3: {}", hex(&device_digest))).await;

    if device_digest == written.digest {
        send_log(&tx, "verify OK").await;
        return Ok(());
    }

    // Digests differ; a second pass against the image stream pins down the
    // first differing byte for the log.
    match locate_mismatch(image, device_path, length, cancel).await {
        Ok(Some(offset)) => {
            send_log(&tx, format!("verify mismatch at byte offset {offset}")).await;
            Err(JobError::new(
                ErrorKind::VerifyMismatch,
                format!("device content differs from image at offset {offset}"),
            ))
        }
        Ok(None) | Err(_) => Err(JobError::new(
            ErrorKind::VerifyMismatch,
            "device content differs from image",
        )),
    }
}

async fn hash_device_prefix(
    device_path: &str,
    length: u64,
    tx: &StageSender,
    cancel: &CancelToken,
) -> Result<[u8; 32], JobError> {
    let mut file = tokio::fs::File::open(device_path).await.map_err(|e| {
        JobError::new(
            ErrorKind::VerifyIoError,
            format!("opening {device_path}: {e}"),
        )
    })?;

    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; VERIFY_CHUNK];
    let mut done: u64 = 0;

    while done < length {
        if cancel.is_cancelled() {
            return Err(JobError::cancelled());
        }
        let want = ((length - done) as usize).min(buf.len());
        let n = file.read(&mut buf[..want]).await.map_err(|e| {
            JobError::new(
                ErrorKind::VerifyIoError,
                format!("reading {device_path}: {e}"),
            )
        })?;
        if n == 0 {
            return Err(JobError::new(
                ErrorKind::VerifyIoError,
                format!("device ended after {done} of {length} bytes"),
            ));
        }
        hasher.update(&buf[..n]);
        done += n as u64;
        let _ = tx
            .send(StageEvent::Progress {
                bytes_done: done,
                bytes_total: Some(length),
            })
            .await;
    }
    Ok(*hasher.finalize().as_bytes())
}

/// Byte-compare the image stream against the device to find the first
/// differing offset. Only runs after a digest mismatch, so the extra pass
/// is paid on failures alone.
async fn locate_mismatch(
    image: &Image,
    device_path: &str,
    length: u64,
    cancel: &CancelToken,
) -> Result<Option<u64>, JobError> {
    let image = image.clone();
    let device_path = device_path.to_string();
    let cancel = cancel.clone();

    tokio::task::spawn_blocking(move || {
        let mut img = image.open_stream().map_err(|e| {
            JobError::new(ErrorKind::ImageReadError, format!("reopening image: {e}"))
        })?;
        let mut dev = std::fs::File::open(&device_path).map_err(|e| {
            JobError::new(ErrorKind::VerifyIoError, format!("reopening device: {e}"))
        })?;

        let mut img_buf = vec![0u8; 64 * 1024];
        let mut dev_buf = vec![0u8; 64 * 1024];
        let mut offset: u64 = 0;

        while offset < length {
            if cancel.is_cancelled() {
                return Err(JobError::cancelled());
            }
            let want = ((length - offset) as usize).min(img_buf.len());

            let img_n = fill(&mut *img, &mut img_buf[..want])
                .map_err(|e| JobError::new(ErrorKind::ImageReadError, e.to_string()))?;
            let dev_n = fill(&mut dev, &mut dev_buf[..want])
                .map_err(|e| JobError::new(ErrorKind::VerifyIoError, e.to_string()))?;

            let common = img_n.min(dev_n);
            for i in 0..common {
                if img_buf[i] != dev_buf[i] {
                    return Ok(Some(offset + i as u64));
                }
            }
            if img_n != dev_n {
                return Ok(Some(offset + common as u64));
            }
            if common == 0 {
                break;
            }
            offset += common as u64;
        }
        Ok(None)
    })
    .await
    .map_err(|e| JobError::new(ErrorKind::Internal, e.to_string()))?
}

fn fill(reader: &mut dyn std::io::Read, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::io::Read;

    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::image::ImageCatalog;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    fn payload() -> Vec<u8> {
        (0..1_000_000u32).map(|i| (i % 251) as u8).collect()
    }

    async fn drain(mut rx: mpsc::Receiver<StageEvent>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(ev) = rx.recv().await {
            if let StageEvent::Log(line) = ev {
                lines.push(line);
            }
        }
        lines
    }

    #[tokio::test]
    async fn matching_prefix_verifies() {
        let dir = tempdir().unwrap();
        let data = payload();
        std::fs::write(dir.path().join("test.img"), &data).unwrap();
        // Device is larger than the image; only the prefix counts.
        let mut device_content = data.clone();
        device_content.extend_from_slice(&[0xfe; 4096]);
        let device = dir.path().join("device");
        std::fs::write(&device, &device_content).unwrap();

        let image = ImageCatalog::new(dir.path()).resolve("test.img").unwrap();
        let written = WriteOutcome {
            bytes_written: data.len() as u64,
            digest: *blake3::hash(&data).as_bytes(),
        };

        let (tx, rx) = mpsc::channel(1024);
        let result = verify_device(
            device.to_str().unwrap(),
            &image,
            &written,
            tx,
            &CancelToken::new(),
        )
        .await;
        assert!(result.is_ok(), "{result:?}");
        let lines = drain(rx).await;
        assert!(lines.iter().any(|l| l == "verify OK"));
    }

    #[tokio::test]
    async fn mismatch_reports_first_differing_offset() {
        let dir = tempdir().unwrap();
        let data = payload();
        std::fs::write(dir.path().join("test.img"), &data).unwrap();

        let mut corrupted = data.clone();
        let corrupt_at = 123_456;
        corrupted[corrupt_at] ^= 0xff;
        let device = dir.path().join("device");
        std::fs::write(&device, &corrupted).unwrap();

        let image = ImageCatalog::new(dir.path()).resolve("test.img").unwrap();
        let written = WriteOutcome {
            bytes_written: data.len() as u64,
            digest: *blake3::hash(&data).as_bytes(),
        };

        let (tx, rx) = mpsc::channel(1024);
        let err = verify_device(
            device.to_str().unwrap(),
            &image,
            &written,
            tx,
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::VerifyMismatch);
        assert!(err.message.contains(&corrupt_at.to_string()), "{err}");
        let lines = drain(rx).await;
        assert!(lines
            .iter()
            .any(|l| l.contains(&format!("offset {corrupt_at}"))));
    }

    #[tokio::test]
    async fn short_device_is_an_io_error() {
        let dir = tempdir().unwrap();
        let data = payload();
        std::fs::write(dir.path().join("test.img"), &data).unwrap();
        let device = dir.path().join("device");
        std::fs::write(&device, &data[..1000]).unwrap();

        let image = ImageCatalog::new(dir.path()).resolve("test.img").unwrap();
        let written = WriteOutcome {
            bytes_written: data.len() as u64,
            digest: *blake3::hash(&data).as_bytes(),
        };

        let (tx, _rx) = mpsc::channel(1024);
        let err = verify_device(
            device.to_str().unwrap(),
            &image,
            &written,
            tx,
            &CancelToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::VerifyIoError);
    }

    #[tokio::test]
    async fn cancellation_interrupts_hashing() {
        let dir = tempdir().unwrap();
        let data = payload();
        std::fs::write(dir.path().join("test.img"), &data).unwrap();
        let device = dir.path().join("device");
        std::fs::write(&device, &data).unwrap();

        let image = ImageCatalog::new(dir.path()).resolve("test.img").unwrap();
        let written = WriteOutcome {
            bytes_written: data.len() as u64,
            digest: *blake3::hash(&data).as_bytes(),
        };

        let cancel = CancelToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::channel(1024);
        let err = verify_device(device.to_str().unwrap(), &image, &written, tx, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }
}
