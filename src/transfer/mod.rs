//! Chunked file send/receive over the shared peer stream, with periodic
//! progress and speed reporting and cooperative cancellation.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::CoreError;
use crate::protocol::message::TransferHeader;
use crate::protocol::framing::{FrameReader, encode_header};
use crate::session::events::{Event, EventSender};
use crate::utils;

/// Transfer direction, from the local side's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// How a transfer task ended, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Cancelled,
}

/// Engine tunables, derived from the application config.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub progress_interval: Duration,
    pub receive_timeout: Duration,
}

impl TransferSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            progress_interval: config.progress_interval(),
            receive_timeout: config.receive_timeout(),
        }
    }
}

/// Emits a percent value only when it changes, so progress is monotone and
/// 100 is reported exactly once.
struct ProgressTracker {
    total: u64,
    last_percent: Option<u8>,
}

impl ProgressTracker {
    fn new(total: u64) -> Self {
        Self {
            total,
            last_percent: None,
        }
    }

    fn update(&mut self, bytes: u64) -> Option<u8> {
        let percent = if self.total == 0 {
            100
        } else {
            (bytes.min(self.total) * 100 / self.total) as u8
        };
        if self.last_percent == Some(percent) {
            return None;
        }
        self.last_percent = Some(percent);
        Some(percent)
    }
}

/// Sliding-window throughput: rate over the bytes moved since the last
/// sample, with the baseline reset each time a sample is taken. Cheaper and
/// smoother than a per-chunk cumulative average.
struct SpeedSampler {
    min_interval: Duration,
    last_instant: Instant,
    last_bytes: u64,
}

impl SpeedSampler {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_instant: Instant::now(),
            last_bytes: 0,
        }
    }

    fn sample(&mut self, bytes_now: u64) -> Option<f64> {
        self.sample_at(bytes_now, Instant::now())
    }

    fn sample_at(&mut self, bytes_now: u64, now: Instant) -> Option<f64> {
        let elapsed = now.duration_since(self.last_instant);
        if elapsed < self.min_interval {
            return None;
        }
        let rate = bytes_now.saturating_sub(self.last_bytes) as f64 / elapsed.as_secs_f64();
        self.last_instant = now;
        self.last_bytes = bytes_now;
        Some(rate)
    }
}

/// Stream a local file to the peer: header frame, then exactly `size` raw
/// bytes in fixed chunks.
///
/// `with_checksum` is set on the push path; serving a peer's pull request
/// sends no checksum. The caller must hold exclusive use of `writer` for
/// the whole call so control frames cannot interleave with file bytes.
pub async fn send_file<W: AsyncWrite + Unpin>(
    writer: &mut W,
    path: &Path,
    dest_dir: &str,
    with_checksum: bool,
    settings: &TransferSettings,
    events: &EventSender,
    cancel: &AtomicBool,
) -> Result<Outcome, CoreError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(CoreError::FileSystem)?;
    if !metadata.is_file() {
        return Err(CoreError::FileSystem(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a file", path.display()),
        )));
    }
    let size = metadata.len();
    let name = utils::get_filename(path)
        .ok_or_else(|| CoreError::IntegrityPolicy("file has no usable name".into()))?;

    let checksum = if with_checksum {
        Some(utils::sha256_file(path).await.map_err(CoreError::FileSystem)?)
    } else {
        None
    };

    let header = TransferHeader {
        name: name.clone(),
        size,
        dest_dir: dest_dir.to_string(),
        checksum,
    };

    let mut file = File::open(path).await.map_err(CoreError::FileSystem)?;

    writer
        .write_all(&encode_header(&header))
        .await
        .map_err(CoreError::Connection)?;

    let transfer_id = Uuid::new_v4();
    info!(%transfer_id, name = %name, size, "sending file");
    events.emit(Event::TransferStarted {
        name: name.clone(),
        direction: Direction::Send,
    });

    let mut progress = ProgressTracker::new(size);
    let mut speed = SpeedSampler::new(settings.progress_interval);
    let mut buf = vec![0u8; settings.chunk_size];
    let mut sent: u64 = 0;

    while sent < size {
        if cancel.load(Ordering::Relaxed) {
            warn!(name = %name, sent, "send cancelled");
            events.emit(Event::Cancelled { name });
            return Ok(Outcome::Cancelled);
        }

        let want = buf.len().min((size - sent) as usize);
        let n = file
            .read(&mut buf[..want])
            .await
            .map_err(CoreError::FileSystem)?;
        if n == 0 {
            // The file shrank under us after the header promised `size`
            // bytes; the stream can no longer be trusted.
            return Err(CoreError::Connection(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{name} truncated mid-send"),
            )));
        }

        writer
            .write_all(&buf[..n])
            .await
            .map_err(CoreError::Connection)?;
        sent += n as u64;

        if let Some(percent) = progress.update(sent) {
            events.emit(Event::ProgressUpdated { percent });
        }
        if let Some(rate) = speed.sample(sent) {
            events.emit(Event::SpeedUpdated {
                bytes_per_sec: rate,
            });
        }
    }
    writer.flush().await.map_err(CoreError::Connection)?;

    if let Some(percent) = progress.update(sent) {
        events.emit(Event::ProgressUpdated { percent });
    }
    info!(%transfer_id, name = %name, "send complete");
    events.emit(Event::Completed {
        label: format!("sent {name}"),
    });
    events.emit(Event::SpeedUpdated { bytes_per_sec: 0.0 });
    Ok(Outcome::Completed)
}

/// Receive the file announced by `header`: create the destination, drain
/// any body bytes the framer already buffered, then read chunks until
/// `size` bytes landed, and verify the checksum when one was sent.
///
/// A filesystem failure mid-receive drains the remaining body bytes before
/// returning, so the connection stays usable after a task-fatal error.
pub async fn receive_file<R: AsyncRead + Unpin>(
    framer: &mut FrameReader<R>,
    header: &TransferHeader,
    fallback_dir: &Path,
    settings: &TransferSettings,
    events: &EventSender,
    cancel: &AtomicBool,
) -> Result<Outcome, CoreError> {
    let dest_dir = if header.dest_dir.is_empty() {
        fallback_dir.to_path_buf()
    } else {
        header.dest_dir.clone().into()
    };

    let dest_path = dest_dir.join(&header.name);
    let prepared = async {
        utils::ensure_dir(&dest_dir).await?;
        File::create(&dest_path).await
    }
    .await;
    let mut file = match prepared {
        Ok(f) => f,
        Err(e) => {
            // Task-fatal, but the announced bytes still have to be
            // consumed for the stream to stay usable.
            drain_body(framer, header.size, settings).await?;
            return Err(CoreError::FileSystem(e));
        }
    };

    let transfer_id = Uuid::new_v4();
    info!(%transfer_id, name = %header.name, size = header.size, dest = %dest_path.display(), "receiving file");
    events.emit(Event::TransferStarted {
        name: header.name.clone(),
        direction: Direction::Receive,
    });

    let mut progress = ProgressTracker::new(header.size);
    let mut speed = SpeedSampler::new(settings.progress_interval);
    let mut buf = vec![0u8; settings.chunk_size];
    let mut received: u64 = 0;

    while received < header.size {
        if cancel.load(Ordering::Relaxed) {
            // Partial file stays on disk; the rest of the body is drained
            // so the session remains healthy.
            drain_body(framer, header.size - received, settings).await?;
            warn!(name = %header.name, received, "receive cancelled");
            events.emit(Event::Cancelled {
                name: header.name.clone(),
            });
            return Ok(Outcome::Cancelled);
        }

        let want = buf.len().min((header.size - received) as usize);
        let n = framer
            .read_body(&mut buf[..want], settings.receive_timeout)
            .await?;
        if n == 0 {
            return Err(CoreError::Connection(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("peer closed mid-transfer of {}", header.name),
            )));
        }

        if let Err(e) = file.write_all(&buf[..n]).await {
            drain_body(framer, header.size - received - n as u64, settings).await?;
            return Err(CoreError::FileSystem(e));
        }
        received += n as u64;

        if let Some(percent) = progress.update(received) {
            events.emit(Event::ProgressUpdated { percent });
        }
        if let Some(rate) = speed.sample(received) {
            events.emit(Event::SpeedUpdated {
                bytes_per_sec: rate,
            });
        }
    }
    file.flush().await.map_err(CoreError::FileSystem)?;
    drop(file);

    if let Some(expected) = &header.checksum {
        let actual = utils::sha256_file(&dest_path)
            .await
            .map_err(CoreError::FileSystem)?;
        if &actual != expected {
            // Task-fatal only; the file is kept for inspection.
            return Err(CoreError::Checksum {
                name: header.name.clone(),
                expected: expected.clone(),
                actual,
            });
        }
        debug!(name = %header.name, "checksum verified");
    }

    if let Some(percent) = progress.update(received) {
        events.emit(Event::ProgressUpdated { percent });
    }
    info!(%transfer_id, name = %header.name, "receive complete");
    events.emit(Event::Completed {
        label: format!("received {}", header.name),
    });
    events.emit(Event::SpeedUpdated { bytes_per_sec: 0.0 });
    Ok(Outcome::Completed)
}

/// Consume and discard `remaining` body bytes so the stream position lines
/// up with the next frame boundary.
async fn drain_body<R: AsyncRead + Unpin>(
    framer: &mut FrameReader<R>,
    mut remaining: u64,
    settings: &TransferSettings,
) -> Result<(), CoreError> {
    let mut scratch = vec![0u8; settings.chunk_size.min(64 * 1024)];
    while remaining > 0 {
        let want = scratch.len().min(remaining as usize);
        let n = framer
            .read_body(&mut scratch[..want], settings.receive_timeout)
            .await?;
        if n == 0 {
            return Err(CoreError::Connection(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed while discarding transfer body",
            )));
        }
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_monotone_single_hundred() {
        let mut tracker = ProgressTracker::new(1000);
        let mut seen = Vec::new();
        for bytes in [0, 100, 100, 250, 999, 1000, 1000] {
            if let Some(p) = tracker.update(bytes) {
                seen.push(p);
            }
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
        assert_eq!(seen.iter().filter(|&&p| p == 100).count(), 1);
        assert_eq!(*seen.last().unwrap(), 100);
    }

    #[test]
    fn test_progress_zero_total_is_immediately_complete() {
        let mut tracker = ProgressTracker::new(0);
        assert_eq!(tracker.update(0), Some(100));
        assert_eq!(tracker.update(0), None);
    }

    #[test]
    fn test_speed_sampler_resets_baseline() {
        let mut sampler = SpeedSampler::new(Duration::from_millis(100));
        let start = sampler.last_instant;

        // Below the minimum interval: no sample.
        assert_eq!(sampler.sample_at(500, start + Duration::from_millis(50)), None);

        // 1000 bytes over 200ms -> 5000 B/s.
        let rate = sampler
            .sample_at(1000, start + Duration::from_millis(200))
            .unwrap();
        assert!((rate - 5000.0).abs() < 1.0, "rate {rate}");

        // Baseline moved: next window only counts the delta.
        let rate = sampler
            .sample_at(1500, start + Duration::from_millis(400))
            .unwrap();
        assert!((rate - 2500.0).abs() < 1.0, "rate {rate}");
    }
}
