//! Block-oriented audio streaming types
//!
//! The engine is driven by a block clock: once per block the streaming thread
//! calls every renderer's `process` with a `StreamInfo` describing the block.
//! Renderers produce their output into a `BlockOutput` with identical block
//! parameters. No call on this path may block or allocate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::{Sample, SampleBuffer, SampleFrame};

/// Static properties of an audio stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamProperties {
    /// Sample rate in Hz
    pub sample_rate: f64,
    /// Samples per block and channel
    pub block_length: usize,
}

impl StreamProperties {
    pub fn new(sample_rate: f64, block_length: usize) -> Self {
        Self {
            sample_rate,
            block_length,
        }
    }

    /// Duration of one block in seconds
    #[inline]
    pub fn block_period(&self) -> f64 {
        self.block_length as f64 / self.sample_rate
    }
}

/// Per-block stream state handed to `process`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamInfo {
    /// Index of this block since stream start
    pub block_index: u64,
    /// Absolute sample position of the first sample in this block
    pub sample_position: u64,
    /// System time in seconds that this block represents
    pub sys_time: f64,
}

impl StreamInfo {
    /// Advance to the next block
    pub fn advanced(&self, props: &StreamProperties) -> Self {
        Self {
            block_index: self.block_index + 1,
            sample_position: self.sample_position + props.block_length as u64,
            sys_time: self.sys_time + props.block_period(),
        }
    }
}

/// Renderer-owned output stream realization
///
/// Holds one block worth of output samples. The renderer writes all channels,
/// then advances the write pointer; a downstream consumer with the same block
/// clock reads the frame between the two.
#[derive(Debug)]
pub struct BlockOutput {
    frame: SampleFrame,
    blocks_written: u64,
}

impl BlockOutput {
    pub fn new(num_channels: usize, block_length: usize) -> Self {
        Self {
            frame: SampleFrame::new(num_channels, block_length),
            blocks_written: 0,
        }
    }

    #[inline]
    pub fn frame(&self) -> &SampleFrame {
        &self.frame
    }

    #[inline]
    pub fn frame_mut(&mut self) -> &mut SampleFrame {
        &mut self.frame
    }

    /// Write pointer for one channel
    #[inline]
    pub fn channel_mut(&mut self, index: usize) -> &mut [Sample] {
        self.frame.channel_mut(index).data_mut()
    }

    /// Mark the current block complete
    pub fn increment_write_pointer(&mut self) {
        self.blocks_written += 1;
    }

    pub fn blocks_written(&self) -> u64 {
        self.blocks_written
    }
}

/// Per-source input signal buffer
///
/// The signal-source stage fills the frame at the start of every block; the
/// renderers read channel 0 during the same block. Both happen on the
/// streaming thread, so the mutex is uncontended by protocol; it only guards
/// the control thread resizing the frame while the stream is stopped.
#[derive(Debug)]
pub struct SourceSignalBuffer {
    frame: Mutex<SampleFrame>,
    muted: AtomicBool,
}

impl SourceSignalBuffer {
    pub fn new(num_channels: usize, block_length: usize) -> Arc<Self> {
        Arc::new(Self {
            frame: Mutex::new(SampleFrame::new(num_channels.max(1), block_length)),
            muted: AtomicBool::new(false),
        })
    }

    /// Fill channel 0 with a block of samples
    pub fn write_block(&self, samples: &[Sample]) {
        let mut frame = self.frame.lock();
        frame.channel_mut(0).copy_from(samples);
    }

    /// Copy one channel into a destination buffer
    pub fn copy_channel(&self, channel: usize, dest: &mut SampleBuffer) {
        let frame = self.frame.lock();
        match frame.get_channel(channel) {
            Some(src) => dest.copy_from(src.data()),
            None => dest.zero(),
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_info_advance() {
        let props = StreamProperties::new(44100.0, 1024);
        let info = StreamInfo::default();
        let next = info.advanced(&props);
        assert_eq!(next.block_index, 1);
        assert_eq!(next.sample_position, 1024);
        assert!((next.sys_time - 1024.0 / 44100.0).abs() < 1e-12);
    }

    #[test]
    fn test_signal_buffer_round_trip() {
        let buf = SourceSignalBuffer::new(1, 4);
        buf.write_block(&[0.1, 0.2, 0.3, 0.4]);

        let mut dest = SampleBuffer::new(4);
        buf.copy_channel(0, &mut dest);
        assert_eq!(dest.data(), &[0.1, 0.2, 0.3, 0.4]);

        // Missing channel reads as silence
        buf.copy_channel(3, &mut dest);
        assert_eq!(dest.data(), &[0.0; 4]);
    }
}
