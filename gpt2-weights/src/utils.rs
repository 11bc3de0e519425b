use crate::error::{Result, WeightsError};
use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;
use std::fs::File;

/// Number of floats converted per chunk when encoding to bytes.
const ENCODE_CHUNK: usize = 1 << 20;

/// Read-only memory mapping of a cached weight file.
#[derive(Debug)]
pub(crate) struct MemoryMapper {
    mmap: Mmap,
}

impl MemoryMapper {
    pub fn new(file: &File) -> Result<Self> {
        // SAFETY: the mapping is read-only and dropped before the store touches the file again.
        let mmap = unsafe { memmap2::MmapOptions::new().map(file) }
            .map_err(|e| WeightsError::CacheRead(format!("failed to create memory mapping: {e}")))?;
        Ok(Self { mmap })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Decodes the whole mapping as little-endian f32 values.
    pub fn read_f32_all(&self) -> Result<Vec<f32>> {
        bytes_to_f32(&self.mmap)
    }
}

/// Reinterprets a little-endian byte payload as f32 values.
///
/// Fails when the payload length is not a multiple of four; the tail is never dropped.
pub fn bytes_to_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % std::mem::size_of::<f32>() != 0 {
        return Err(WeightsError::MisalignedPayload { len: bytes.len() });
    }

    let mut values = vec![0.0f32; bytes.len() / std::mem::size_of::<f32>()];
    LittleEndian::read_f32_into(bytes, &mut values);
    Ok(values)
}

/// Encodes f32 values as little-endian bytes, handing each chunk to `sink`.
pub(crate) fn for_each_le_chunk<F>(values: &[f32], mut sink: F) -> std::io::Result<()>
where
    F: FnMut(&[u8]) -> std::io::Result<()>,
{
    let mut buffer = vec![0u8; ENCODE_CHUNK.min(values.len()) * std::mem::size_of::<f32>()];
    for chunk in values.chunks(ENCODE_CHUNK) {
        let bytes = &mut buffer[..chunk.len() * std::mem::size_of::<f32>()];
        LittleEndian::write_f32_into(chunk, bytes);
        sink(bytes)?;
    }
    Ok(())
}
