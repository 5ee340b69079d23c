use stevedore_protocol::{ByteRange, ChunkState};

use crate::TransferError;

/// Partitions `[0, total_size)` into ordered chunks of `chunk_size` bytes.
///
/// Every chunk is full-sized except possibly the last. A zero-byte
/// resource still gets one zero-length chunk so the transfer has a unit of
/// work to complete.
pub fn plan(total_size: u64, chunk_size: u64) -> Result<Vec<ChunkState>, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidChunkSize);
    }
    if total_size == 0 {
        return Ok(vec![ChunkState::new(0, ByteRange::new(0, 0))]);
    }

    let count = total_size.div_ceil(chunk_size);
    let Ok(count32) = u32::try_from(count) else {
        return Err(TransferError::TooManyChunks {
            count,
            limit: u64::from(u32::MAX),
        });
    };
    let chunks = (0..count32)
        .map(|i| {
            let start = u64::from(i) * chunk_size;
            let end = (start + chunk_size).min(total_size);
            ChunkState::new(i, ByteRange::new(start, end))
        })
        .collect();
    Ok(chunks)
}
