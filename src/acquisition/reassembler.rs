// src/acquisition/reassembler.rs
//! Merges per-device transfers into one scan-major sample block
//!
//! Within each scan the devices appear in reverse call order (master first), each
//! contributing its channels contiguously. Samples are native-endian float32 and are
//! copied without any numeric transformation.

use crate::config::constants::device::BYTES_PER_SAMPLE;
use crate::error::BufferError;

/// Fixed geometry of one reassembled block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanLayout {
    channel_counts: Vec<usize>,
    scan_offsets: Vec<usize>,
    scans_per_transfer: usize,
    header_size: usize,
    total_channels: usize,
}

impl ScanLayout {
    /// `channel_counts` in call-sequence order
    pub fn new(channel_counts: &[usize], scans_per_transfer: usize, header_size: usize) -> Self {
        let mut scan_offsets = vec![0; channel_counts.len()];
        let mut offset = 0;
        for device in (0..channel_counts.len()).rev() {
            scan_offsets[device] = offset;
            offset += channel_counts[device];
        }

        Self {
            channel_counts: channel_counts.to_vec(),
            scan_offsets,
            scans_per_transfer,
            header_size,
            total_channels: offset,
        }
    }

    pub fn device_count(&self) -> usize {
        self.channel_counts.len()
    }

    pub fn channel_count(&self, device: usize) -> usize {
        self.channel_counts.get(device).copied().unwrap_or(0)
    }

    pub fn total_channels(&self) -> usize {
        self.total_channels
    }

    pub fn scans_per_transfer(&self) -> usize {
        self.scans_per_transfer
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Samples in one reassembled block
    pub fn block_len(&self) -> usize {
        self.scans_per_transfer * self.total_channels
    }

    /// Exact byte count of one completed transfer from `device`
    pub fn transfer_bytes(&self, device: usize) -> usize {
        self.header_size + self.scans_per_transfer * self.channel_count(device) * BYTES_PER_SAMPLE
    }

    /// Sample offset of `device`'s channel group inside every scan
    pub fn scan_offset(&self, device: usize) -> usize {
        self.scan_offsets.get(device).copied().unwrap_or(0)
    }

    /// Device indices in the order their channels appear within a scan
    pub fn interleave_order(&self) -> Vec<usize> {
        (0..self.channel_counts.len()).rev().collect()
    }
}

/// Reusable output block for one pipeline index
#[derive(Debug, Clone)]
pub struct ScanReassembler {
    layout: ScanLayout,
    block: Vec<f32>,
}

impl ScanReassembler {
    pub fn new(layout: ScanLayout) -> Self {
        let block = vec![0.0; layout.block_len()];
        Self { layout, block }
    }

    /// Copy every scan of `device`'s transfer into its place in the block
    pub fn place(&mut self, device: usize, raw: &[u8]) -> Result<(), BufferError> {
        if device >= self.layout.device_count() {
            return Err(BufferError::InvalidArgument(format!(
                "device index {} outside call sequence of {}",
                device,
                self.layout.device_count()
            )));
        }

        let channels = self.layout.channel_count(device);
        if channels == 0 {
            return Ok(());
        }
        let expected = self.layout.transfer_bytes(device);
        let payload = raw.get(self.layout.header_size..expected).ok_or_else(|| {
            BufferError::InvalidArgument(format!(
                "transfer of device {} holds {} bytes, {} required",
                device,
                raw.len(),
                expected
            ))
        })?;

        let stride = self.layout.total_channels;
        let offset = self.layout.scan_offset(device);
        for (scan, group) in payload.chunks_exact(channels * BYTES_PER_SAMPLE).enumerate() {
            let start = scan * stride + offset;
            for (slot, bytes) in self.block[start..start + channels]
                .iter_mut()
                .zip(group.chunks_exact(BYTES_PER_SAMPLE))
            {
                *slot = f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
        }
        Ok(())
    }

    /// The block as assembled so far
    pub fn block(&self) -> &[f32] {
        &self.block
    }
}

/// Reassemble one transfer per device into a single ordered block
///
/// Each entry is `(call_sequence_index, raw_transfer)`; the indices must cover
/// `0..buffers.len()` exactly once. Channel counts are derived from the buffer sizes.
pub fn reassemble(
    buffers: &[(usize, &[u8])],
    scans_per_transfer: usize,
    header_size: usize,
) -> Result<Vec<f32>, BufferError> {
    if scans_per_transfer == 0 {
        return Err(BufferError::InvalidArgument("scans per transfer must be positive".to_string()));
    }

    let mut channel_counts: Vec<Option<usize>> = vec![None; buffers.len()];
    for &(device, raw) in buffers {
        let payload = raw.len().checked_sub(header_size).ok_or_else(|| {
            BufferError::InvalidArgument(format!("transfer of device {} is shorter than its header", device))
        })?;
        let scan_bytes = scans_per_transfer * BYTES_PER_SAMPLE;
        if payload % scan_bytes != 0 {
            return Err(BufferError::InvalidArgument(format!(
                "transfer of device {} is not a whole number of scans",
                device
            )));
        }
        match channel_counts.get_mut(device) {
            Some(count @ None) => *count = Some(payload / scan_bytes),
            _ => {
                return Err(BufferError::InvalidArgument(format!(
                    "device index {} is out of range or repeated",
                    device
                )))
            }
        }
    }

    let counts: Vec<usize> = channel_counts.into_iter().flatten().collect();
    let mut reassembler = ScanReassembler::new(ScanLayout::new(&counts, scans_per_transfer, header_size));
    for &(device, raw) in buffers {
        reassembler.place(device, raw)?;
    }
    Ok(reassembler.block)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: usize = 38;

    fn transfer(values: &[f32]) -> Vec<u8> {
        let mut raw = vec![0xAA; HEADER];
        for v in values {
            raw.extend_from_slice(&v.to_ne_bytes());
        }
        raw
    }

    #[test]
    fn test_layout_offsets_reverse_call_order() {
        let layout = ScanLayout::new(&[2, 3, 4], 8, HEADER);
        assert_eq!(layout.total_channels(), 9);
        assert_eq!(layout.scan_offset(2), 0);
        assert_eq!(layout.scan_offset(1), 4);
        assert_eq!(layout.scan_offset(0), 7);
        assert_eq!(layout.interleave_order(), vec![2, 1, 0]);
        assert_eq!(layout.block_len(), 72);
        assert_eq!(layout.transfer_bytes(1), HEADER + 8 * 3 * 4);
    }

    #[test]
    fn test_master_channels_lead_each_scan() {
        // slave (call index 0) has 2 channels, master (call index 1) has 3
        let slave = transfer(&[10.0, 11.0, 20.0, 21.0]);
        let master = transfer(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let block = reassemble(&[(0, slave.as_slice()), (1, master.as_slice())], 2, HEADER).expect("Failed to reassemble");

        assert_eq!(block.len(), 2 * (3 + 2));
        assert_eq!(block, vec![1.0, 2.0, 3.0, 10.0, 11.0, 4.0, 5.0, 6.0, 20.0, 21.0]);
    }

    #[test]
    fn test_equal_channel_counts() {
        let a = transfer(&[0.0, 1.0, 2.0, 3.0]);
        let b = transfer(&[100.0, 101.0, 102.0, 103.0]);
        let c = transfer(&[200.0, 201.0, 202.0, 203.0]);

        let block = reassemble(&[(0, a.as_slice()), (1, b.as_slice()), (2, c.as_slice())], 2, HEADER).expect("Failed to reassemble");
        assert_eq!(
            block,
            vec![200.0, 201.0, 100.0, 101.0, 0.0, 1.0, 202.0, 203.0, 102.0, 103.0, 2.0, 3.0]
        );
    }

    #[test]
    fn test_place_rejects_short_transfer() {
        let mut reassembler = ScanReassembler::new(ScanLayout::new(&[2], 4, HEADER));
        let short = transfer(&[1.0; 6]);
        assert!(matches!(reassembler.place(0, &short), Err(BufferError::InvalidArgument(_))));
        assert!(reassembler.place(1, &transfer(&[1.0; 8])).is_err());
    }

    #[test]
    fn test_reassemble_rejects_repeated_index() {
        let a = transfer(&[1.0, 2.0]);
        assert!(reassemble(&[(0, a.as_slice()), (0, a.as_slice())], 1, HEADER).is_err());
    }

    #[test]
    fn test_bytes_reinterpreted_unchanged() {
        let odd = [f32::MIN_POSITIVE, -0.0, 1.0e-40, f32::MAX];
        let raw = transfer(&odd);
        let block = reassemble(&[(0, raw.as_slice())], 1, HEADER).expect("Failed to reassemble");
        let bits: Vec<u32> = block.iter().map(|v| v.to_bits()).collect();
        let expected: Vec<u32> = odd.iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits, expected);
    }
}
