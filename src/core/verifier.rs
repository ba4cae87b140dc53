use anyhow::{Context, Result, bail};
use std::io::Read;
use tracing::{debug, info};

use crate::core::sanitizer::overwrite::PatternStream;

/// Result of a successful read-back
#[derive(Debug)]
pub struct VerifyResult {
    pub bytes_verified: u64,
}

/// Mismatched chunks listed individually; the rest are only counted.
const REPORTED_MISMATCHES: usize = 10;

/// A chunk whose contents differ from the expected pattern
#[derive(Debug)]
pub struct ChunkMismatch {
    /// Absolute offset of the first differing byte
    pub offset: u64,
    /// Differing bytes within the chunk
    pub differing: usize,
}

/// Running tally of mismatched chunks, bounded in memory.
#[derive(Debug, Default)]
struct MismatchLog {
    chunks: u64,
    first: Vec<ChunkMismatch>,
}

impl MismatchLog {
    fn record(&mut self, mismatch: ChunkMismatch) {
        self.chunks += 1;
        if self.first.len() < REPORTED_MISMATCHES {
            self.first.push(mismatch);
        }
    }

    fn is_empty(&self) -> bool {
        self.chunks == 0
    }
}

/// Read `total` bytes back and compare them with the pattern stream that
/// produced the final pass.
///
/// Every chunk is checked; the error lists the first mismatches found.
pub fn verify_pattern<R: Read>(
    reader: &mut R,
    expected: &mut PatternStream,
    total: u64,
    chunk_size: usize,
    mut on_progress: impl FnMut(u64),
) -> Result<VerifyResult> {
    info!(total_bytes = total, "Starting read-back verification");

    let chunk_size = chunk_size.max(1);
    let mut actual = vec![0u8; chunk_size];
    let mut wanted = vec![0u8; chunk_size];
    let mut mismatches = MismatchLog::default();
    let mut done = 0u64;

    while done < total {
        let n = (total - done).min(chunk_size as u64) as usize;

        reader
            .read_exact(&mut actual[..n])
            .with_context(|| format!("read-back failed at offset {}", done))?;
        expected.fill(&mut wanted[..n]);

        if actual[..n] != wanted[..n] {
            let first = actual[..n]
                .iter()
                .zip(&wanted[..n])
                .position(|(a, w)| a != w)
                .unwrap_or(0);
            let differing = actual[..n]
                .iter()
                .zip(&wanted[..n])
                .filter(|(a, w)| a != w)
                .count();
            debug!(offset = done + first as u64, differing, "Chunk mismatch");
            mismatches.record(ChunkMismatch {
                offset: done + first as u64,
                differing,
            });
        }

        done += n as u64;
        on_progress(done);
    }

    if !mismatches.is_empty() {
        info!(mismatches = mismatches.chunks, "Verification failed");
        bail!(format_mismatch_error(&mismatches));
    }

    info!(bytes_verified = done, "Verification complete");
    Ok(VerifyResult {
        bytes_verified: done,
    })
}

/// Format mismatches into a human-readable message
fn format_mismatch_error(mismatches: &MismatchLog) -> String {
    let mut msg = format!(
        "Verification failed: {} chunk(s) did not match the final pass",
        mismatches.chunks
    );

    for m in &mismatches.first {
        msg.push_str(&format!(
            "\n  - offset {}: {} byte(s) differ",
            m.offset, m.differing
        ));
    }

    let unlisted = mismatches.chunks - mismatches.first.len() as u64;
    if unlisted > 0 {
        msg.push_str(&format!("\n  ... and {} more", unlisted));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::methods::Pattern;
    use crate::core::sanitizer::overwrite::PatternSeed;
    use std::io::Cursor;

    #[test]
    fn test_verify_matching_content() {
        let seed = PatternSeed::from_bytes([3u8; 32]);
        let mut data = vec![0u8; 10_000];
        seed.stream(Pattern::Random, 2).fill(&mut data);

        let mut progress = Vec::new();
        let result = verify_pattern(
            &mut Cursor::new(data),
            &mut seed.stream(Pattern::Random, 2),
            10_000,
            4096,
            |done| progress.push(done),
        )
        .unwrap();

        assert_eq!(result.bytes_verified, 10_000);
        assert_eq!(progress, vec![4096, 8192, 10_000]);
    }

    #[test]
    fn test_verify_reports_mismatch_offsets() {
        let mut data = vec![0u8; 8192];
        data[5000] = 0x01;
        data[5001] = 0x02;

        let err = verify_pattern(
            &mut Cursor::new(data),
            &mut PatternStream::Fixed(0),
            8192,
            4096,
            |_| {},
        )
        .unwrap_err()
        .to_string();

        assert!(err.contains("1 chunk(s) did not match"));
        assert!(err.contains("offset 5000: 2 byte(s) differ"));
    }

    #[test]
    fn test_verify_keeps_only_first_mismatches() {
        let chunks = 1_000u64;
        let data = vec![0xffu8; (chunks * 16) as usize];

        let mut log = MismatchLog::default();
        for i in 0..chunks {
            log.record(ChunkMismatch {
                offset: i * 16,
                differing: 16,
            });
        }
        assert_eq!(log.chunks, chunks);
        assert_eq!(log.first.len(), REPORTED_MISMATCHES);
        assert_eq!(log.first.last().unwrap().offset, 9 * 16);

        let err = verify_pattern(
            &mut Cursor::new(data),
            &mut PatternStream::Fixed(0),
            chunks * 16,
            16,
            |_| {},
        )
        .unwrap_err()
        .to_string();

        assert!(err.contains("1000 chunk(s) did not match"));
        assert!(err.contains("offset 144: 16 byte(s) differ"));
        assert!(!err.contains("offset 160:"));
        assert!(err.contains("... and 990 more"));
    }

    #[test]
    fn test_verify_short_read_fails() {
        let data = vec![0u8; 100];
        let err = verify_pattern(
            &mut Cursor::new(data),
            &mut PatternStream::Fixed(0),
            4096,
            4096,
            |_| {},
        )
        .unwrap_err();

        assert!(format!("{:#}", err).contains("read-back failed at offset 0"));
    }
}
