//! Live monitoring sink: post-effect PCM out to a playback device.
//!
//! Feeding is non-blocking by construction: chunks go into a bounded ring
//! and whatever does not fit is dropped, so the capture thread never stalls
//! on the output device. A dedicated worker owns the output stream (it is
//! not `Send`) and drains the ring through a playback source that yields
//! equilibrium when the ring runs dry — underflow sounds like silence
//! without tearing the stream down.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rodio::{OutputStream, Sink, Source};
use thiserror::Error;

use fieldrec_core::AudioFormat;

/// Ring capacity in milliseconds of audio. Bounds monitor latency while
/// absorbing scheduling jitter between capture and playback.
pub const MONITOR_BUFFER_MS: u64 = 200;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("output stream: {0}")]
    Stream(#[from] rodio::StreamError),
    #[error("output sink: {0}")]
    Sink(#[from] rodio::PlayError),
    #[error("monitor worker exited during startup")]
    WorkerStart,
}

/// Bounded sample queue between the capture thread and the playback source.
pub struct MonitorRing {
    buf: VecDeque<i16>,
    capacity: usize,
    dropped: u64,
}

impl MonitorRing {
    pub fn new(capacity: usize) -> MonitorRing {
        MonitorRing {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append as much of `samples` as fits; the excess is dropped. Returns
    /// the number of samples accepted.
    pub fn push(&mut self, samples: &[i16]) -> usize {
        let free = self.capacity - self.buf.len();
        let take = free.min(samples.len());
        self.buf.extend(&samples[..take]);
        self.dropped += (samples.len() - take) as u64;
        take
    }

    pub fn pop(&mut self) -> Option<i16> {
        self.buf.pop_front()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples discarded so far because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Playback source draining the ring; equilibrium when empty.
struct RingSource {
    ring: Arc<Mutex<MonitorRing>>,
    channels: u16,
    sample_rate: u32,
}

impl Iterator for RingSource {
    type Item = i16;

    fn next(&mut self) -> Option<i16> {
        Some(self.ring.lock().pop().unwrap_or(0))
    }
}

impl Source for RingSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

enum MonitorCmd {
    Pause,
    Resume,
    SetVolume(f32),
    Shutdown,
}

/// Owns one output device at the session format.
pub struct MonitorSink {
    ring: Arc<Mutex<MonitorRing>>,
    cmd_tx: Mutex<mpsc::Sender<MonitorCmd>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    format: AudioFormat,
}

impl MonitorSink {
    /// Open the given output device (or the system default) and start the
    /// playback worker.
    pub fn open(device: Option<cpal::Device>, format: AudioFormat) -> Result<MonitorSink, MonitorError> {
        let capacity =
            format.ms_to_frames(MONITOR_BUFFER_MS) as usize * format.channels as usize;
        let ring = Arc::new(Mutex::new(MonitorRing::new(capacity)));
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let worker_ring = ring.clone();
        let worker = thread::Builder::new()
            .name("monitor-sink".into())
            .spawn(move || monitor_worker(device, format, worker_ring, cmd_rx, ready_tx))
            .map_err(|_| MonitorError::WorkerStart)?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(MonitorSink {
                ring,
                cmd_tx: Mutex::new(cmd_tx),
                worker: Mutex::new(Some(worker)),
                format,
            }),
            Ok(Err(err)) => {
                let _ = worker.join();
                Err(err)
            }
            Err(_) => {
                let _ = worker.join();
                Err(MonitorError::WorkerStart)
            }
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Hand a chunk of post-effect samples to the playback side. Never
    /// blocks; returns how many samples were accepted.
    pub fn feed(&self, samples: &[i16]) -> usize {
        self.ring.lock().push(samples)
    }

    /// Samples dropped so far due to back-pressure.
    pub fn dropped(&self) -> u64 {
        self.ring.lock().dropped()
    }

    /// Silence the sink without tearing it down.
    pub fn pause(&self) {
        let _ = self.cmd_tx.lock().send(MonitorCmd::Pause);
    }

    pub fn resume(&self) {
        let _ = self.cmd_tx.lock().send(MonitorCmd::Resume);
    }

    /// Set playback volume; values outside [0, 1] are clamped.
    pub fn set_volume(&self, volume: f32) {
        let _ = self
            .cmd_tx
            .lock()
            .send(MonitorCmd::SetVolume(volume.clamp(0.0, 1.0)));
    }

    /// Stop playback and release the output device.
    pub fn close(&self) {
        let _ = self.cmd_tx.lock().send(MonitorCmd::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MonitorSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn monitor_worker(
    device: Option<cpal::Device>,
    format: AudioFormat,
    ring: Arc<Mutex<MonitorRing>>,
    cmd_rx: mpsc::Receiver<MonitorCmd>,
    ready_tx: mpsc::Sender<Result<(), MonitorError>>,
) {
    let opened = (|| -> Result<(OutputStream, Sink), MonitorError> {
        let (stream, handle) = match &device {
            Some(device) => OutputStream::try_from_device(device)?,
            None => OutputStream::try_default()?,
        };
        let sink = Sink::try_new(&handle)?;
        sink.append(RingSource {
            ring,
            channels: format.channels,
            sample_rate: format.sample_rate,
        });
        Ok((stream, sink))
    })();

    let (_stream, sink) = match opened {
        Ok(pair) => {
            let _ = ready_tx.send(Ok(()));
            pair
        }
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    // The stream stays alive for as long as this loop runs.
    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            MonitorCmd::Pause => sink.pause(),
            MonitorCmd::Resume => sink.play(),
            MonitorCmd::SetVolume(v) => sink.set_volume(v),
            MonitorCmd::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_accepts_until_full() {
        let mut ring = MonitorRing::new(8);
        assert_eq!(ring.push(&[1, 2, 3, 4, 5]), 5);
        assert_eq!(ring.push(&[6, 7, 8, 9, 10]), 3);
        assert_eq!(ring.len(), 8);
        assert_eq!(ring.dropped(), 2);
    }

    #[test]
    fn test_ring_drains_in_order() {
        let mut ring = MonitorRing::new(4);
        ring.push(&[10, 20, 30]);
        assert_eq!(ring.pop(), Some(10));
        assert_eq!(ring.pop(), Some(20));
        ring.push(&[40, 50]);
        assert_eq!(ring.pop(), Some(30));
        assert_eq!(ring.pop(), Some(40));
        assert_eq!(ring.pop(), Some(50));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_ring_recovers_after_drop() {
        let mut ring = MonitorRing::new(2);
        ring.push(&[1, 2, 3]);
        assert_eq!(ring.dropped(), 1);
        ring.pop();
        assert_eq!(ring.push(&[4]), 1);
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(4));
    }

    #[test]
    fn test_source_yields_equilibrium_when_empty() {
        let ring = Arc::new(Mutex::new(MonitorRing::new(4)));
        ring.lock().push(&[7, 8]);
        let mut source = RingSource {
            ring: ring.clone(),
            channels: 1,
            sample_rate: 44100,
        };
        assert_eq!(source.next(), Some(7));
        assert_eq!(source.next(), Some(8));
        // Ring is dry: the source keeps running and plays silence.
        assert_eq!(source.next(), Some(0));
        assert_eq!(source.next(), Some(0));
        ring.lock().push(&[9]);
        assert_eq!(source.next(), Some(9));
    }

    #[test]
    fn test_source_reports_format() {
        let ring = Arc::new(Mutex::new(MonitorRing::new(4)));
        let source = RingSource {
            ring,
            channels: 2,
            sample_rate: 48000,
        };
        assert_eq!(source.channels(), 2);
        assert_eq!(source.sample_rate(), 48000);
        assert_eq!(source.current_frame_len(), None);
        assert_eq!(source.total_duration(), None);
    }
}
