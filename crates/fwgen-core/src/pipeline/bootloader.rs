//! Chunked raw bootloader transfer.

use std::io::SeekFrom;
use std::path::Path;

use tracing::{debug, warn};

use crate::device::{BlockBackend, RawDevice};
use crate::error::AssemblyError;
use crate::progress::TransferProgress;

/// Transfer unit of the bootloader write.
pub const CHUNK_SIZE: usize = 128 * 1024;

/// Check that a bootloader payload is a non-empty whole number of chunks.
pub fn validate_payload_len(path: &Path, len: u64) -> Result<(), AssemblyError> {
    if len == 0 {
        return Err(AssemblyError::InvalidPayload {
            path: path.to_path_buf(),
            reason: "payload is empty".into(),
        });
    }
    if len % CHUNK_SIZE as u64 != 0 {
        return Err(AssemblyError::InvalidPayload {
            path: path.to_path_buf(),
            reason: format!(
                "length {} is not a multiple of the {} byte chunk size",
                len, CHUNK_SIZE
            ),
        });
    }
    Ok(())
}

/// Write `payload` from offset 0 in [`CHUNK_SIZE`] pieces.
///
/// `on_chunk` sees the progress after every chunk. Only whole chunks are
/// written; callers validate the length first. Returns the bytes written.
pub fn write_chunks<B, F>(
    device: &mut RawDevice<B>,
    payload: &[u8],
    mut on_chunk: F,
) -> Result<u64, AssemblyError>
where
    B: BlockBackend,
    F: FnMut(&TransferProgress),
{
    device.seek(SeekFrom::Start(0))?;

    let chunks = payload.chunks_exact(CHUNK_SIZE);
    let trailing = chunks.remainder().len();
    let mut progress = TransferProgress::new((payload.len() - trailing) as u64);

    for chunk in chunks {
        device.write(chunk)?;
        progress.advance(chunk.len() as u64);
        on_chunk(&progress);
    }
    device.flush()?;

    if trailing > 0 {
        warn!(bytes = trailing, "Trailing partial chunk not written");
    }
    debug!(bytes = progress.transferred(), "Bootloader transfer complete");
    Ok(progress.transferred())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{AccessMode, IoRecord, MockBlockDevice};

    #[test]
    fn test_validate_payload_len() {
        let path = Path::new("bootloader.bin");
        assert!(validate_payload_len(path, CHUNK_SIZE as u64 * 3).is_ok());

        let err = validate_payload_len(path, 0).unwrap_err();
        assert!(matches!(err, AssemblyError::InvalidPayload { .. }));

        let err = validate_payload_len(path, CHUNK_SIZE as u64 + 512).unwrap_err();
        assert!(err.to_string().contains("not a multiple"));
    }

    #[test]
    fn test_write_chunks_from_offset_zero() {
        let media = MockBlockDevice::new(CHUNK_SIZE * 4, 512);
        let mut device = RawDevice::acquire(media.clone(), AccessMode::ReadWrite).unwrap();
        device.seek(SeekFrom::Start(4096)).unwrap();

        let payload: Vec<u8> = (0..CHUNK_SIZE * 3).map(|i| (i % 253) as u8).collect();
        let mut seen = Vec::new();
        let written = write_chunks(&mut device, &payload, |p| seen.push(p.transferred())).unwrap();

        assert_eq!(written, payload.len() as u64);
        assert_eq!(
            seen,
            vec![CHUNK_SIZE as u64, 2 * CHUNK_SIZE as u64, 3 * CHUNK_SIZE as u64]
        );
        assert_eq!(
            media.writes(),
            (0..3)
                .map(|i| IoRecord {
                    offset: (i * CHUNK_SIZE) as u64,
                    len: CHUNK_SIZE
                })
                .collect::<Vec<_>>()
        );
        assert_eq!(&media.data()[..payload.len()], &payload[..]);
    }

    #[test]
    fn test_trailing_bytes_are_not_written() {
        let media = MockBlockDevice::new(CHUNK_SIZE * 2, 512);
        let mut device = RawDevice::acquire(media.clone(), AccessMode::ReadWrite).unwrap();

        let payload = vec![0xEEu8; CHUNK_SIZE + 100];
        let written = write_chunks(&mut device, &payload, |_| {}).unwrap();

        assert_eq!(written, CHUNK_SIZE as u64);
        assert_eq!(media.writes().len(), 1);
        assert_eq!(media.data()[CHUNK_SIZE], 0);
    }

    #[test]
    fn test_write_failure_propagates() {
        let media = MockBlockDevice::new(CHUNK_SIZE * 2, 512);
        media.fail_writes(true);
        let mut device = RawDevice::acquire(media.clone(), AccessMode::ReadWrite).unwrap();

        let err = write_chunks(&mut device, &vec![1u8; CHUNK_SIZE], |_| {}).unwrap_err();
        assert!(matches!(err, AssemblyError::Device(_)));
    }
}
