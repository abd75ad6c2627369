//! Standalone monitoring: input device → effect chain → monitor sink,
//! with no file writer.
//!
//! The input device is exclusive, so this loop only runs while no capture
//! worker holds it: the engine stops this loop before starting or resuming
//! capture, and restarts it on pause or stop when monitoring is enabled.
//! [`StandaloneMonitor::stop`] is synchronous — when it returns, the device
//! has been released and the capture side may acquire it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use fieldrec_core::effects::{EffectChain, EffectSettings};
use fieldrec_core::gate::GateConfig;
use fieldrec_core::AudioFormat;

use crate::engine::{build_input_stream, CaptureError, WorkerMsg, CHUNK_WAIT};
use crate::monitor::MonitorSink;

/// Loopback worker owning an input device while no capture is active.
pub struct StandaloneMonitor {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl StandaloneMonitor {
    /// Acquire `device` at `format` and start feeding the sink through the
    /// same effect chain capture uses. Returns once the stream is live.
    pub fn start(
        device: cpal::Device,
        format: AudioFormat,
        settings: Arc<EffectSettings>,
        gate: GateConfig,
        sink: Arc<MonitorSink>,
    ) -> Result<StandaloneMonitor, CaptureError> {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let (ready_tx, ready_rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("standalone-monitor".into())
            .spawn(move || {
                let (msg_tx, msg_rx) = mpsc::channel();
                let stream = match build_input_stream(&device, format, msg_tx) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                let mut chain = EffectChain::new(format, gate, &settings);
                let channels = format.channels as usize;
                while !worker_stop.load(Ordering::SeqCst) {
                    match msg_rx.recv_timeout(CHUNK_WAIT) {
                        Ok(WorkerMsg::Chunk(mut chunk)) => {
                            chunk.truncate(chunk.len() - chunk.len() % channels);
                            if chunk.is_empty() {
                                continue;
                            }
                            chain.process_chunk(&settings, &mut chunk);
                            sink.feed(&chunk);
                        }
                        Ok(WorkerMsg::StreamError(err)) => {
                            tracing::warn!(%err, "monitor input stream failed");
                            break;
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }

                // Releases the input device.
                drop(stream);
            })
            .map_err(|e| CaptureError::RecorderInit(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(StandaloneMonitor { stop, worker: Some(worker) }),
            Ok(Err(err)) => {
                let _ = worker.join();
                Err(err)
            }
            Err(_) => {
                let _ = worker.join();
                Err(CaptureError::RecorderInit(
                    "monitor worker exited during startup".into(),
                ))
            }
        }
    }

    /// Stop the loop and wait for the input device to be released.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for StandaloneMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
