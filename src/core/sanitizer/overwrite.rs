use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Instant;
use nix::fcntl::{OFlag, PosixFadviseAdvice, posix_fadvise};
use tracing::{debug, info, info_span, warn};

use super::{SanitizeControl, SanitizeFuture, SanitizeReport, SanitizeRequest, SanitizeStatus, Sanitizer};
use crate::core::error::WipeError;
use crate::core::methods::Pattern;
use crate::core::verifier;

/// Write size per syscall (1MB)
const CHUNK_SIZE: usize = 1024 * 1024;

/// Bytes between progress reports (64MB)
const REPORT_EVERY: u64 = 64 * 1024 * 1024;

const PATTERN_CONTEXT: &str = "sanitd 2024-06 overwrite pattern stream";

/// Host-driven multi-pass overwrite with read-back of the final pass.
pub struct OverwriteEngine {
    pub chunk_size: usize,
    pub report_every: u64,
    pub verify: bool,
}

impl Default for OverwriteEngine {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            report_every: REPORT_EVERY,
            verify: true,
        }
    }
}

impl Sanitizer for OverwriteEngine {
    fn sanitize(&self, req: &SanitizeRequest, ctl: SanitizeControl) -> SanitizeFuture {
        let req = req.clone();
        let opts = PassOptions {
            chunk_size: self.chunk_size.max(4096),
            report_every: self.report_every.max(1),
            verify: self.verify,
        };

        Box::pin(async move {
            let passes = req.method.passes();
            if passes.is_empty() {
                return Err(WipeError::UnknownMethod {
                    device_id: req.device_id.clone(),
                    method: req.method.to_string(),
                });
            }

            let _ = ctl.progress.send(SanitizeStatus::Preparing).await;

            let device_id = req.device_id.clone();
            let span = info_span!("overwrite", device_id = %req.device_id, method = %req.method);

            tokio::task::spawn_blocking(move || {
                let _entered = span.enter();
                run_passes(&req, passes, &opts, &ctl)
            })
            .await
            .map_err(|e| WipeError::HardwareIo {
                device_id,
                message: format!("overwrite task aborted: {}", e),
            })?
        })
    }
}

struct PassOptions {
    chunk_size: usize,
    report_every: u64,
    verify: bool,
}

fn run_passes(
    req: &SanitizeRequest,
    passes: &[Pattern],
    opts: &PassOptions,
    ctl: &SanitizeControl,
) -> Result<SanitizeReport, WipeError> {
    let start_time = Instant::now();

    let mut file = open_target(&req.path)
        .map_err(|e| hardware(req, format!("cannot open {}", req.path.display()), e))?;
    let total = file
        .seek(SeekFrom::End(0))
        .map_err(|e| hardware(req, "cannot determine device size", e))?;

    if total == 0 {
        return Err(WipeError::HardwareIo {
            device_id: req.device_id.clone(),
            message: "device reports zero capacity".to_string(),
        });
    }

    info!(total_bytes = total, passes = passes.len(), "Starting overwrite");

    let seed = PatternSeed::generate(&req.device_id);
    let steps = passes.len() as u64 + u64::from(opts.verify);
    let mut buf = vec![0u8; opts.chunk_size];
    let mut written = 0u64;

    for (index, pattern) in passes.iter().enumerate() {
        let pass = index + 1;
        let final_pass = pass == passes.len();

        if final_pass {
            if ctl.cancel.is_cancelled() {
                return Err(cancelled(req, pass, passes.len(), written));
            }
            let _ = ctl.progress.blocking_send(SanitizeStatus::PointOfNoReturn);
        }

        file.seek(SeekFrom::Start(0))
            .map_err(|e| hardware(req, format!("seek failed before pass {}", pass), e))?;

        let mut stream = seed.stream(*pattern, index);
        let mut done = 0u64;
        let mut last_report = 0u64;

        while done < total {
            if !final_pass && ctl.cancel.is_cancelled() {
                return Err(cancelled(req, pass, passes.len(), written));
            }

            let n = (total - done).min(opts.chunk_size as u64) as usize;
            stream.fill(&mut buf[..n]);
            file.write_all(&buf[..n]).map_err(|e| {
                hardware(req, format!("write failed at offset {} during pass {}", done, pass), e)
            })?;

            done += n as u64;
            written += n as u64;

            if done - last_report >= opts.report_every || done == total {
                last_report = done;
                let _ = ctl.progress.blocking_send(SanitizeStatus::Overwriting {
                    pass,
                    total_passes: passes.len(),
                    bytes_done: done,
                    total_bytes: total,
                    percentage: overall(index as u64, done, total, steps),
                });
            }
        }

        file.sync_all()
            .map_err(|e| hardware(req, format!("flush failed after pass {}", pass), e))?;
        debug!(pass, bytes = done, "Overwrite pass complete");
    }

    let verified = if opts.verify {
        if let Err(errno) = drop_cached_pages(&file) {
            warn!(%errno, "posix_fadvise failed, verification may read cached pages");
        }

        let last = passes.len() - 1;
        let mut expected = seed.stream(passes[last], last);
        file.seek(SeekFrom::Start(0))
            .map_err(|e| hardware(req, "seek failed before verification", e))?;

        let mut last_report = 0u64;
        verifier::verify_pattern(&mut file, &mut expected, total, opts.chunk_size, |done| {
            if done - last_report >= opts.report_every || done == total {
                last_report = done;
                let _ = ctl.progress.blocking_send(SanitizeStatus::Verifying {
                    bytes_done: done,
                    total_bytes: total,
                    percentage: overall(steps - 1, done, total, steps),
                });
            }
        })
        .map_err(|e| WipeError::HardwareIo {
            device_id: req.device_id.clone(),
            message: format!("{:#}", e),
        })?;
        true
    } else {
        false
    };

    let duration_secs = start_time.elapsed().as_secs();
    info!(bytes_written = written, duration_secs, verified, "Overwrite complete");

    Ok(SanitizeReport {
        bytes_processed: written,
        duration_secs,
        verified,
    })
}

/// Open the target for writing. Block devices are opened `O_EXCL`, which the
/// kernel refuses while any partition is mounted or claimed.
fn open_target(path: &Path) -> io::Result<File> {
    let is_block = std::fs::metadata(path)?.file_type().is_block_device();

    let mut options = OpenOptions::new();
    options.read(true).write(true);
    if is_block {
        options.custom_flags(OFlag::O_EXCL.bits());
    }
    options.open(path)
}

/// Ask the kernel to forget cached pages so read-back hits the medium.
fn drop_cached_pages(file: &File) -> nix::Result<()> {
    posix_fadvise(file.as_raw_fd(), 0, 0, PosixFadviseAdvice::POSIX_FADV_DONTNEED)
}

/// Overall progress across all passes plus verification, held below 100
/// until the engine declares success.
fn overall(step: u64, done: u64, total: u64, steps: u64) -> u8 {
    let numerator = (step as u128 * total as u128 + done as u128) * 100;
    let denominator = (steps as u128 * total as u128).max(1);
    (numerator / denominator).min(99) as u8
}

fn hardware(req: &SanitizeRequest, what: impl std::fmt::Display, err: io::Error) -> WipeError {
    WipeError::HardwareIo {
        device_id: req.device_id.clone(),
        message: format!("{}: {}", what, err),
    }
}

fn cancelled(req: &SanitizeRequest, pass: usize, total_passes: usize, written: u64) -> WipeError {
    let detail = if written == 0 {
        "cancelled before any data was written; device contents unchanged".to_string()
    } else {
        format!(
            "cancelled at pass {} of {} after {} bytes; device contents are partially overwritten",
            pass, total_passes, written
        )
    };
    WipeError::Cancelled {
        device_id: req.device_id.clone(),
        detail,
    }
}

/// Per-run key for the random passes; the same seed regenerates the same stream
/// for verification.
pub struct PatternSeed([u8; 32]);

impl PatternSeed {
    pub fn generate(device_id: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(uuid::Uuid::now_v7().as_bytes());
        hasher.update(device_id.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn stream(&self, pattern: Pattern, pass_index: usize) -> PatternStream {
        match pattern.byte() {
            Some(byte) => PatternStream::Fixed(byte),
            None => {
                let mut hasher = blake3::Hasher::new_derive_key(PATTERN_CONTEXT);
                hasher.update(&self.0);
                hasher.update(&(pass_index as u64).to_le_bytes());
                PatternStream::Random(Box::new(hasher.finalize_xof()))
            }
        }
    }
}

/// Byte source for one pass.
pub enum PatternStream {
    Fixed(u8),
    Random(Box<blake3::OutputReader>),
}

impl PatternStream {
    pub fn fill(&mut self, buf: &mut [u8]) {
        match self {
            Self::Fixed(byte) => buf.fill(*byte),
            Self::Random(reader) => reader.fill(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_stream_is_reproducible_per_pass() {
        let seed = PatternSeed::from_bytes([7u8; 32]);

        let mut a = vec![0u8; 4096];
        let mut b = vec![0u8; 4096];
        seed.stream(Pattern::Random, 0).fill(&mut a);
        seed.stream(Pattern::Random, 0).fill(&mut b);
        assert_eq!(a, b);

        // Chunked reads continue the same stream.
        let mut stream = seed.stream(Pattern::Random, 0);
        let mut chunked = vec![0u8; 4096];
        stream.fill(&mut chunked[..1000]);
        stream.fill(&mut chunked[1000..]);
        assert_eq!(a, chunked);

        seed.stream(Pattern::Random, 1).fill(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn fixed_patterns_fill_constant_bytes() {
        let seed = PatternSeed::from_bytes([0u8; 32]);
        let mut buf = vec![0x55u8; 64];
        seed.stream(Pattern::Ones, 0).fill(&mut buf);
        assert!(buf.iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn regular_files_open_without_exclusive_claim_and_drop_cache() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0xAAu8; 8192]).unwrap();

        let file = open_target(&path).unwrap();
        assert!(drop_cached_pages(&file).is_ok());

        // A second open succeeds because O_EXCL only applies to block devices.
        assert!(open_target(&path).is_ok());
    }

    #[test]
    fn overall_progress_spans_all_steps() {
        assert_eq!(overall(0, 0, 100, 4), 0);
        assert_eq!(overall(1, 50, 100, 4), 37);
        assert_eq!(overall(3, 100, 100, 4), 99);
    }
}
