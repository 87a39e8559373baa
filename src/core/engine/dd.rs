//! The real flash engine: image bytes piped into `dd`, growth and eject
//! tools supervised as short-lived children.

use std::io::Read;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::{
    eject, grow, send_log, terminate_child, verify, FlashEngine, StageEvent, StageSender,
    WriteOutcome,
};
use crate::core::cancel::CancelToken;
use crate::core::image::Image;
use crate::core::inventory::DriveProvider;
use crate::core::models::{ErrorKind, JobError};

/// Block size fed to dd and used for the stdin pipe.
pub const WRITE_BLOCK_SIZE: usize = 4 * 1024 * 1024;

pub struct DdEngine {
    inventory: Arc<dyn DriveProvider>,
}

impl DdEngine {
    pub fn new(inventory: Arc<dyn DriveProvider>) -> Self {
        Self { inventory }
    }
}

/// Fill `buf` as far as the reader allows; a short count means EOF.
fn read_block<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
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

#[async_trait]
impl FlashEngine for DdEngine {
    async fn write(
        &self,
        device_path: &str,
        image: &Image,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<WriteOutcome, JobError> {
        let total = image.uncompressed_len();
        let mut source = image.open_stream().map_err(|e| {
            JobError::new(
                ErrorKind::ImageReadError,
                format!("opening image '{}': {e}", image.name),
            )
        })?;

        send_log(
            &tx,
            format!("$ dd of={device_path} bs=4M conv=fsync status=progress"),
        )
        .await;

        let mut child = Command::new("dd")
            .arg(format!("of={device_path}"))
            .arg("bs=4M")
            .arg("conv=fsync")
            .arg("status=progress")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                JobError::new(ErrorKind::WriteIoError, format!("failed to spawn dd: {e}"))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| JobError::new(ErrorKind::Internal, "dd stdin unavailable"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| JobError::new(ErrorKind::Internal, "dd stderr unavailable"))?;

        // Feeder: pull fixed-size blocks off the (possibly decompressing)
        // image stream, hashing and counting them on the way to dd. The
        // digest and exact byte count drop out for free for the verify
        // stage.
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<std::io::Result<Vec<u8>>>(4);
        let feeder = tokio::task::spawn_blocking(move || {
            let mut hasher = blake3::Hasher::new();
            let mut fed: u64 = 0;
            loop {
                let mut buf = vec![0u8; WRITE_BLOCK_SIZE];
                match read_block(source.as_mut(), &mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        buf.truncate(n);
                        hasher.update(&buf);
                        fed += n as u64;
                        if chunk_tx.blocking_send(Ok(buf)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = chunk_tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
            (*hasher.finalize().as_bytes(), fed)
        });

        let writer = tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                match chunk {
                    Ok(bytes) => {
                        if let Err(e) = stdin.write_all(&bytes).await {
                            return Err(JobError::new(
                                ErrorKind::WriteIoError,
                                format!("writing to dd: {e}"),
                            ));
                        }
                    }
                    Err(e) => {
                        return Err(JobError::new(
                            ErrorKind::ImageReadError,
                            format!("reading image: {e}"),
                        ))
                    }
                }
            }
            let _ = stdin.shutdown().await;
            Ok(())
        });

        // dd reports progress on stderr; turn its status lines into
        // progress counters and keep the raw lines for the job log.
        let parse_tx = tx.clone();
        let stderr_task = tokio::spawn(async move {
            let re = Regex::new(r"(?i)(\d[\d\s,]*)\s*bytes").unwrap();
            let mut buf = [0u8; 8192];
            let mut line: Vec<u8> = Vec::new();
            let mut last_line = String::new();
            loop {
                let n = match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                for &b in &buf[..n] {
                    if b != b'\r' && b != b'\n' {
                        line.push(b);
                        continue;
                    }
                    let text = String::from_utf8_lossy(&line).trim().to_string();
                    line.clear();
                    if text.is_empty() {
                        continue;
                    }
                    if let Some(caps) = re.captures(&text) {
                        let digits = caps[1].replace(' ', "").replace(',', "");
                        if let Ok(done) = digits.parse::<u64>() {
                            let _ = parse_tx
                                .send(StageEvent::Progress {
                                    bytes_done: done,
                                    bytes_total: total,
                                })
                                .await;
                        }
                    }
                    let _ = parse_tx.send(StageEvent::Log(text.clone())).await;
                    last_line = text;
                }
            }
            if !line.is_empty() {
                let text = String::from_utf8_lossy(&line).trim().to_string();
                if !text.is_empty() {
                    let _ = parse_tx.send(StageEvent::Log(text.clone())).await;
                    last_line = text;
                }
            }
            last_line
        });

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                terminate_child(&mut child).await;
                writer.abort();
                stderr_task.abort();
                send_log(&tx, "cancelled: dd terminated").await;
                return Err(JobError::cancelled());
            }
            status = child.wait() => status.map_err(|e| {
                JobError::new(ErrorKind::Internal, format!("waiting for dd: {e}"))
            })?,
        };

        let last_line = stderr_task.await.unwrap_or_default();
        let writer_result = writer
            .await
            .map_err(|e| JobError::new(ErrorKind::Internal, e.to_string()))?;
        let (digest, bytes_written) = feeder
            .await
            .map_err(|e| JobError::new(ErrorKind::Internal, e.to_string()))?;

        if cancel.is_cancelled() {
            return Err(JobError::cancelled());
        }

        match status.code() {
            Some(0) => {
                writer_result?;
                let _ = tx
                    .send(StageEvent::Progress {
                        bytes_done: bytes_written,
                        bytes_total: Some(bytes_written),
                    })
                    .await;
                send_log(&tx, format!("wrote {bytes_written} bytes")).await;
                Ok(WriteOutcome {
                    bytes_written,
                    digest,
                })
            }
            Some(code) => Err(JobError::new(
                ErrorKind::WriteIoError,
                format!("dd exited with code {code}: {last_line}"),
            )),
            None => Err(JobError::new(
                ErrorKind::SubprocessExit,
                "dd terminated by signal",
            )),
        }
    }

    async fn verify(
        &self,
        device_path: &str,
        image: &Image,
        written: &WriteOutcome,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<(), JobError> {
        verify::verify_device(device_path, image, written, tx, cancel).await
    }

    async fn expand(
        &self,
        device_path: &str,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<Option<String>, JobError> {
        grow::expand(&self.inventory, device_path, &tx, cancel).await
    }

    async fn resize(
        &self,
        device_path: &str,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<Option<String>, JobError> {
        grow::resize(&self.inventory, device_path, &tx, cancel).await
    }

    async fn eject(
        &self,
        device_path: &str,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<Option<String>, JobError> {
        eject::eject(&self.inventory, device_path, &tx, cancel).await
    }

    async fn unmount(
        &self,
        device_path: &str,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<Option<String>, JobError> {
        eject::unmount(&self.inventory, device_path, &tx, cancel).await
    }
}
