//! Receiver output recording
//!
//! Writes per-receiver output blocks to WAV files. The audio thread never
//! touches the encoder: blocks are copied into preallocated buffers and
//! handed to a writer thread over lock-free channels; exhausted buffers drop
//! blocks rather than stall the stream.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};

use aur_core::{AurError, AurResult, Sample, SampleFrame};

enum DumpCommand {
    Open {
        receiver_id: i32,
        path: PathBuf,
    },
    Block {
        receiver_id: i32,
        buffer: Vec<Sample>,
        used: usize,
    },
    CloseAll,
    Shutdown,
}

/// Number of in-flight block buffers before recording drops blocks
const DUMP_BUFFER_COUNT: usize = 64;

/// Off-thread WAV recorder for receiver mix buses
pub struct ReceiverDumper {
    sample_rate: u32,
    channels: u16,
    block_capacity: usize,
    active: AtomicBool,
    gain_bits: AtomicU32,
    dropped_blocks: AtomicU64,
    commands: Sender<DumpCommand>,
    free_rx: Receiver<Vec<Sample>>,
    worker: Option<JoinHandle<()>>,
}

impl ReceiverDumper {
    pub fn new(sample_rate: f64, channels: usize, block_length: usize) -> Self {
        let channels = channels.max(1) as u16;
        let block_capacity = block_length * channels as usize;

        let (free_tx, free_rx) = unbounded();
        for _ in 0..DUMP_BUFFER_COUNT {
            let _ = free_tx.send(vec![0.0; block_capacity]);
        }

        let (commands, command_rx) = unbounded::<DumpCommand>();
        let writer_free_tx = free_tx.clone();
        let spec = hound::WavSpec {
            channels,
            sample_rate: sample_rate as u32,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };

        let worker = std::thread::Builder::new()
            .name("receiver-dump".into())
            .spawn(move || {
                let mut writers: HashMap<i32, hound::WavWriter<_>> = HashMap::new();
                while let Ok(command) = command_rx.recv() {
                    match command {
                        DumpCommand::Open { receiver_id, path } => {
                            match hound::WavWriter::create(&path, spec) {
                                Ok(writer) => {
                                    writers.insert(receiver_id, writer);
                                }
                                Err(e) => {
                                    log::error!("cannot open dump file {}: {e}", path.display())
                                }
                            }
                        }
                        DumpCommand::Block {
                            receiver_id,
                            buffer,
                            used,
                        } => {
                            if let Some(writer) = writers.get_mut(&receiver_id) {
                                for &sample in &buffer[..used] {
                                    let _ = writer.write_sample(sample);
                                }
                            }
                            let _ = writer_free_tx.send(buffer);
                        }
                        DumpCommand::CloseAll => {
                            for (_, writer) in writers.drain() {
                                if let Err(e) = writer.finalize() {
                                    log::error!("cannot finalize dump file: {e}");
                                }
                            }
                        }
                        DumpCommand::Shutdown => break,
                    }
                }
                for (_, writer) in writers.drain() {
                    let _ = writer.finalize();
                }
            })
            .expect("spawning the receiver-dump thread");

        Self {
            sample_rate: sample_rate as u32,
            channels,
            block_capacity,
            active: AtomicBool::new(false),
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
            dropped_blocks: AtomicU64::new(0),
            commands,
            free_rx,
            worker: Some(worker),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_gain(&self, gain: f64) {
        self.gain_bits.store((gain as f32).to_bits(), Ordering::Relaxed);
    }

    /// Start recording the given receivers (control thread)
    pub fn start(&self, receiver_ids: &[i32], file_prefix: &str) -> AurResult<()> {
        if self.active.swap(true, Ordering::AcqRel) {
            return Err(AurError::Modal("receiver dumping already started".into()));
        }
        for &id in receiver_ids {
            let path = PathBuf::from(format!("{file_prefix}_Receiver{id}.wav"));
            let _ = self.commands.send(DumpCommand::Open {
                receiver_id: id,
                path,
            });
        }
        Ok(())
    }

    /// Stop recording and finalize the files (control thread)
    pub fn stop(&self) -> AurResult<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Err(AurError::Modal("receiver dumping not running".into()));
        }
        let _ = self.commands.send(DumpCommand::CloseAll);
        let dropped = self.dropped_blocks.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            log::warn!("receiver dump dropped {dropped} blocks");
        }
        Ok(())
    }

    /// Hand one receiver block to the writer (audio thread, wait-free)
    pub fn write_block(&self, receiver_id: i32, frame: &SampleFrame) {
        if !self.is_active() {
            return;
        }
        let Ok(mut buffer) = self.free_rx.try_recv() else {
            self.dropped_blocks.fetch_add(1, Ordering::Relaxed);
            return;
        };
        buffer.resize(self.block_capacity, 0.0);

        let gain = f32::from_bits(self.gain_bits.load(Ordering::Relaxed));
        let frames = frame.len();
        let channels = self.channels as usize;
        let mut used = 0;
        for i in 0..frames {
            for ch in 0..channels {
                if used >= buffer.len() {
                    break;
                }
                let sample = frame.get_channel(ch).map_or(0.0, |c| c.data()[i]);
                buffer[used] = sample * gain;
                used += 1;
            }
        }
        let _ = self.commands.send(DumpCommand::Block {
            receiver_id,
            buffer,
            used,
        });
    }

    #[allow(dead_code)]
    fn spec_summary(&self) -> (u32, u16) {
        (self.sample_rate, self.channels)
    }
}

impl Drop for ReceiverDumper {
    fn drop(&mut self) {
        let _ = self.commands.send(DumpCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_start_is_modal_error() {
        let dumper = ReceiverDumper::new(44100.0, 2, 64);
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("out").to_string_lossy().to_string();

        dumper.start(&[1], &prefix).unwrap();
        let err = dumper.start(&[1], &prefix).unwrap_err();
        assert!(matches!(err, AurError::Modal(_)));
        dumper.stop().unwrap();
        assert!(matches!(dumper.stop(), Err(AurError::Modal(_))));
    }

    #[test]
    fn test_blocks_reach_file() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("dump").to_string_lossy().to_string();

        let dumper = ReceiverDumper::new(44100.0, 2, 32);
        dumper.start(&[5], &prefix).unwrap();

        let mut frame = SampleFrame::new(2, 32);
        frame.channel_mut(0).data_mut().fill(0.25);
        frame.channel_mut(1).data_mut().fill(-0.25);
        for _ in 0..4 {
            dumper.write_block(5, &frame);
        }
        dumper.stop().unwrap();
        drop(dumper); // joins the writer

        let path = format!("{prefix}_Receiver5.wav");
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.len(), 4 * 32 * 2);
    }
}
