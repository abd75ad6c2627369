//! Capture engine: owns the input device, drives the effect chain, writes
//! the WAV file, and feeds the monitor sink.
//!
//! ## Session lifecycle
//!
//! ```text
//! Idle → Running ⇄ Paused
//! Running/Paused → Stopping → Finalizing → Idle
//! ```
//!
//! One worker thread runs per Running span. The input stream is built on
//! the worker (streams are not `Send`) and delivers chunks over a channel;
//! the worker applies the effect chain, feeds the monitor, and appends to
//! the writer. Pause and stop are cooperative flags observed at chunk
//! boundaries, never mid-chunk. Pausing drops the stream entirely so the
//! standalone monitor loop can take the input device over; resuming hands
//! it back the other way.
//!
//! Stop trims the 200 ms stop transient, finalizes the header, optionally
//! runs the offline noise reduction pass, and reports the finished path
//! exactly once — whether the session ended by request or by a mid-session
//! failure.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, StreamTrait};
use parking_lot::Mutex;
use thiserror::Error;

use fieldrec_core::denoise::{reduce_file, ReductionConfig};
use fieldrec_core::effects::{EffectChain, EffectSettings, GainLevel, HpfMode, LpfMode};
use fieldrec_core::gate::GateConfig;
use fieldrec_core::wav::{WavError, WavWriter};
use fieldrec_core::AudioFormat;

use crate::device::DeviceRegistry;
use crate::monitor::MonitorSink;
use crate::observer::{Dispatcher, RecordObserver};
use crate::standalone::StandaloneMonitor;

/// Cadence of `on_progress` reports.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(80);
/// Bound on waiting for the worker to acknowledge pause/stop.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll interval while waiting for chunks, so control flags stay live even
/// when the device goes quiet.
pub(crate) const CHUNK_WAIT: Duration = Duration::from_millis(100);

/// Error category reported through [`RecordObserver::on_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The output file could not be opened at start.
    InvalidOutputFile,
    /// The input device could not be acquired at the requested format.
    RecorderInit,
    /// The session failed mid-capture; the file was finalized best-effort.
    RecordingError,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot open output file: {0}")]
    InvalidOutputFile(io::Error),
    #[error("recorder init failed: {0}")]
    RecorderInit(String),
    #[error("recording failed: {0}")]
    Recording(String),
    #[error("unsupported session format {0:?}")]
    UnsupportedFormat(AudioFormat),
    #[error("a capture session is already active")]
    SessionActive,
}

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::InvalidOutputFile(_) => ErrorKind::InvalidOutputFile,
            CaptureError::Recording(_) => ErrorKind::RecordingError,
            CaptureError::RecorderInit(_)
            | CaptureError::UnsupportedFormat(_)
            | CaptureError::SessionActive => ErrorKind::RecorderInit,
        }
    }
}

/// Capture session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecorderState {
    Idle = 0,
    Running = 1,
    Paused = 2,
    Stopping = 3,
    Finalizing = 4,
}

impl RecorderState {
    fn from_u8(v: u8) -> RecorderState {
        match v {
            1 => RecorderState::Running,
            2 => RecorderState::Paused,
            3 => RecorderState::Stopping,
            4 => RecorderState::Finalizing,
            _ => RecorderState::Idle,
        }
    }
}

/// Everything `start` needs to open a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub format: AudioFormat,
    /// Specific input device, or `None` for the system default.
    pub input_device_id: Option<String>,
    pub output_path: PathBuf,
    pub gain: GainLevel,
    pub gate: GateConfig,
    pub monitor_enabled: bool,
    /// Parameters for the post-capture noise reduction pass; the pass runs
    /// only while noise reduction is enabled at stop time.
    pub noise_reduction: Option<ReductionConfig>,
}

impl SessionConfig {
    pub fn new<P: Into<PathBuf>>(output_path: P, format: AudioFormat) -> SessionConfig {
        SessionConfig {
            format,
            input_device_id: None,
            output_path: output_path.into(),
            gain: GainLevel::Off,
            gate: GateConfig::default(),
            monitor_enabled: false,
            noise_reduction: None,
        }
    }
}

/// Session format and device choices remembered for standalone monitoring.
#[derive(Debug, Clone)]
struct SessionPrefs {
    format: AudioFormat,
    gate: GateConfig,
    input_device_id: Option<String>,
}

impl Default for SessionPrefs {
    fn default() -> Self {
        SessionPrefs {
            format: AudioFormat::mono(44100),
            gate: GateConfig::default(),
            input_device_id: None,
        }
    }
}

/// Mutable per-session state shared between the engine and its worker.
struct SessionState {
    config: SessionConfig,
    /// Taken exactly once by finalization.
    writer: Option<WavWriter>,
    chain: EffectChain,
    frames_written: u64,
    finalized: bool,
}

impl SessionState {
    fn duration_ms(&self) -> u64 {
        self.config.format.frames_to_ms(self.frames_written)
    }
}

/// Finalize the capture file: tail trim, then header rewrite.
///
/// Returns the finished path when this call performed the finalization,
/// `None` when it had already happened.
fn finalize_session(session: &mut SessionState) -> Option<PathBuf> {
    if session.finalized {
        return None;
    }
    session.finalized = true;
    let mut writer = session.writer.take()?;
    if let Err(err) = writer.trim_tail() {
        tracing::warn!(%err, "tail trim failed");
    }
    match writer.finalize() {
        Ok(path) => Some(path),
        Err(err) => {
            tracing::error!(%err, "header finalize failed");
            Some(session.config.output_path.clone())
        }
    }
}

/// State shared with the capture worker.
struct Shared {
    state: AtomicU8,
    session: Mutex<Option<SessionState>>,
    monitor: Mutex<Option<Arc<MonitorSink>>>,
    prefs: Mutex<SessionPrefs>,
    settings: Arc<EffectSettings>,
    observer: Arc<dyn RecordObserver>,
    dispatcher: Dispatcher,
}

impl Shared {
    fn state(&self) -> RecorderState {
        RecorderState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: RecorderState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Route a notification through the injected dispatcher.
    fn emit<F>(&self, notify: F)
    where
        F: FnOnce(&dyn RecordObserver) + Send + 'static,
    {
        let observer = self.observer.clone();
        (self.dispatcher)(Box::new(move || notify(observer.as_ref())));
    }
}

/// Worker thread handle plus its control flags.
struct WorkerHandle {
    stop: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
    done_rx: mpsc::Receiver<()>,
    join: JoinHandle<()>,
}

/// Resources serialized under the lifecycle lock.
#[derive(Default)]
struct Lifecycle {
    worker: Option<WorkerHandle>,
    standalone: Option<StandaloneMonitor>,
}

/// The recording engine. One per process; owns at most one session.
pub struct CaptureEngine {
    registry: Arc<DeviceRegistry>,
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl CaptureEngine {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        observer: Arc<dyn RecordObserver>,
        dispatcher: Dispatcher,
    ) -> CaptureEngine {
        CaptureEngine {
            registry,
            shared: Arc::new(Shared {
                state: AtomicU8::new(RecorderState::Idle as u8),
                session: Mutex::new(None),
                monitor: Mutex::new(None),
                prefs: Mutex::new(SessionPrefs::default()),
                settings: Arc::new(EffectSettings::new()),
                observer,
                dispatcher,
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn state(&self) -> RecorderState {
        self.shared.state()
    }

    pub fn is_recording(&self) -> bool {
        self.state() == RecorderState::Running
    }

    pub fn is_paused(&self) -> bool {
        self.state() == RecorderState::Paused
    }

    /// The live control block. Changes apply at the next chunk boundary.
    pub fn settings(&self) -> &Arc<EffectSettings> {
        &self.shared.settings
    }

    pub fn set_hpf_mode(&self, mode: HpfMode) {
        self.shared.settings.set_hpf(mode);
    }

    pub fn set_lpf_mode(&self, mode: LpfMode) {
        self.shared.settings.set_lpf(mode);
    }

    pub fn set_gain_boost_level(&self, level: GainLevel) {
        self.shared.settings.set_gain(level);
    }

    pub fn set_noise_gate_enabled(&self, enabled: bool) {
        self.shared.settings.set_gate_enabled(enabled);
    }

    /// Applies at stop time, when the finished file is rewritten.
    pub fn set_noise_reduction_enabled(&self, enabled: bool) {
        self.shared.settings.set_noise_reduction_enabled(enabled);
    }

    pub fn set_monitor_volume(&self, volume: f32) {
        if let Some(sink) = self.shared.monitor.lock().as_ref() {
            sink.set_volume(volume);
        }
    }

    /// Toggle live monitoring in any state. During capture the worker picks
    /// the flag up at the next chunk; outside capture this starts or stops
    /// the standalone input→output loop.
    pub fn set_monitoring_enabled(&self, enabled: bool) {
        self.shared.settings.set_monitor_enabled(enabled);
        let mut lifecycle = self.lifecycle.lock();
        if enabled {
            match self.state() {
                RecorderState::Running => {
                    let prefs = self.shared.prefs.lock().clone();
                    self.ensure_monitor(&prefs);
                }
                RecorderState::Idle | RecorderState::Paused => {
                    self.start_standalone(&mut lifecycle);
                }
                _ => {}
            }
        } else {
            if let Some(standalone) = lifecycle.standalone.take() {
                standalone.stop();
            }
            if let Some(sink) = self.shared.monitor.lock().take() {
                sink.close();
            }
        }
    }

    /// Open a session and begin capturing.
    ///
    /// The standalone monitor is stopped first so the input device is free;
    /// the worker acquires it at the requested format and reports readiness
    /// before this returns.
    pub fn start(&self, config: SessionConfig) -> Result<(), CaptureError> {
        let mut lifecycle = self.lifecycle.lock();
        if self.state() != RecorderState::Idle {
            return Err(CaptureError::SessionActive);
        }
        if !config.format.is_supported() {
            return Err(CaptureError::UnsupportedFormat(config.format));
        }

        // The input device is exclusive: release it before acquiring.
        if let Some(standalone) = lifecycle.standalone.take() {
            standalone.stop();
        }

        self.shared.settings.set_gain(config.gain);
        self.shared
            .settings
            .set_monitor_enabled(config.monitor_enabled);
        *self.shared.prefs.lock() = SessionPrefs {
            format: config.format,
            gate: config.gate,
            input_device_id: config.input_device_id.clone(),
        };

        let writer = WavWriter::create(&config.output_path, config.format).map_err(|e| match e {
            WavError::Io(io_err) => CaptureError::InvalidOutputFile(io_err),
            other => CaptureError::InvalidOutputFile(io::Error::new(
                io::ErrorKind::Other,
                other.to_string(),
            )),
        })?;
        let device = self.resolve_input(config.input_device_id.as_deref())?;

        let chain = EffectChain::new(config.format, config.gate, &self.shared.settings);
        let format = config.format;
        let path = config.output_path.clone();
        *self.shared.session.lock() = Some(SessionState {
            config,
            writer: Some(writer),
            chain,
            frames_written: 0,
            finalized: false,
        });

        if self.shared.settings.monitor_enabled() {
            let prefs = self.shared.prefs.lock().clone();
            self.ensure_monitor(&prefs);
        }

        match spawn_worker(self.shared.clone(), device, format) {
            Ok(handle) => lifecycle.worker = Some(handle),
            Err(err) => {
                *self.shared.session.lock() = None;
                return Err(err);
            }
        }

        self.shared.set_state(RecorderState::Running);
        drop(lifecycle);
        self.shared.emit(move |o| o.on_start_record(&path));
        Ok(())
    }

    /// Suspend capture, keeping the file and effect state. The input device
    /// is released; when monitoring is on, the standalone loop takes over
    /// so the user keeps hearing audio.
    pub fn pause(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if self.state() != RecorderState::Running {
            return;
        }
        if let Some(handle) = lifecycle.worker.take() {
            handle.pause.store(true, Ordering::SeqCst);
            wait_worker(handle);
        }
        self.shared.set_state(RecorderState::Paused);
        if self.shared.settings.monitor_enabled() {
            self.start_standalone(&mut lifecycle);
        }
        drop(lifecycle);
        self.shared.emit(|o| o.on_pause_record());
    }

    /// Re-acquire the input device and continue the paused session.
    pub fn resume(&self) -> Result<(), CaptureError> {
        let mut lifecycle = self.lifecycle.lock();
        if self.state() != RecorderState::Paused {
            return Ok(());
        }
        // Hand the device back: standalone first, then re-acquire.
        if let Some(standalone) = lifecycle.standalone.take() {
            standalone.stop();
        }
        let (device_id, format) = match self.shared.session.lock().as_ref() {
            Some(session) => (
                session.config.input_device_id.clone(),
                session.config.format,
            ),
            None => return Ok(()),
        };
        let device = self.resolve_input(device_id.as_deref())?;
        let handle = spawn_worker(self.shared.clone(), device, format)?;
        lifecycle.worker = Some(handle);
        self.shared.set_state(RecorderState::Running);
        drop(lifecycle);
        self.shared.emit(|o| o.on_resume_record());
        Ok(())
    }

    /// End the session: join the worker (bounded), trim + finalize the
    /// file, run noise reduction when enabled, and report the final path.
    /// Idempotent once the session has ended.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        let state = self.state();
        if state != RecorderState::Running && state != RecorderState::Paused {
            return;
        }
        self.shared.set_state(RecorderState::Stopping);
        if let Some(handle) = lifecycle.worker.take() {
            handle.stop.store(true, Ordering::SeqCst);
            wait_worker(handle);
        }

        self.shared.set_state(RecorderState::Finalizing);
        let (final_path, reduction) = {
            let mut guard = self.shared.session.lock();
            let result = match guard.as_mut() {
                Some(session) => {
                    let reduction = session.config.noise_reduction.unwrap_or_default();
                    (finalize_session(session), reduction)
                }
                None => (None, ReductionConfig::default()),
            };
            *guard = None;
            result
        };

        if let Some(path) = &final_path {
            if self.shared.settings.noise_reduction_enabled() {
                if let Err(err) = reduce_file(path, reduction, None) {
                    tracing::warn!(%err, "noise reduction failed; capture preserved");
                }
            }
        }

        if self.shared.settings.monitor_enabled() {
            self.start_standalone(&mut lifecycle);
        }
        self.shared.set_state(RecorderState::Idle);
        drop(lifecycle);
        if let Some(path) = final_path {
            self.shared.emit(move |o| o.on_stop_record(&path));
        }
    }

    fn resolve_input(&self, device_id: Option<&str>) -> Result<cpal::Device, CaptureError> {
        match device_id {
            Some(id) => self
                .registry
                .input_by_id(id)
                .ok_or_else(|| CaptureError::RecorderInit(format!("input device {id:?} not found"))),
            None => self
                .registry
                .default_input()
                .ok_or_else(|| CaptureError::RecorderInit("no input device available".into())),
        }
    }

    /// Open the monitor sink on the preferred output route if it is not
    /// already open. The selected input device is never used as the route.
    fn ensure_monitor(&self, prefs: &SessionPrefs) -> Option<Arc<MonitorSink>> {
        let mut guard = self.shared.monitor.lock();
        if let Some(sink) = guard.as_ref() {
            return Some(sink.clone());
        }
        let outputs = self.registry.list_outputs();
        let route = crate::device::pick_monitor_route(&outputs, prefs.input_device_id.as_deref());
        let device = route.and_then(|info| self.registry.output_by_id(&info.id));
        match MonitorSink::open(device, prefs.format) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                *guard = Some(sink.clone());
                Some(sink)
            }
            Err(err) => {
                tracing::warn!(%err, "monitor output unavailable");
                None
            }
        }
    }

    fn start_standalone(&self, lifecycle: &mut Lifecycle) {
        if lifecycle.standalone.is_some() {
            return;
        }
        let prefs = self.shared.prefs.lock().clone();
        let sink = match self.ensure_monitor(&prefs) {
            Some(sink) => sink,
            None => return,
        };
        let device = prefs
            .input_device_id
            .as_deref()
            .and_then(|id| self.registry.input_by_id(id))
            .or_else(|| self.registry.default_input());
        let device = match device {
            Some(device) => device,
            None => {
                tracing::warn!("no input device for standalone monitoring");
                return;
            }
        };
        match StandaloneMonitor::start(
            device,
            prefs.format,
            self.shared.settings.clone(),
            prefs.gate,
            sink,
        ) {
            Ok(standalone) => lifecycle.standalone = Some(standalone),
            Err(err) => tracing::warn!(%err, "standalone monitoring failed to start"),
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
        let mut lifecycle = self.lifecycle.lock();
        if let Some(standalone) = lifecycle.standalone.take() {
            standalone.stop();
        }
    }
}

/// Capability surface of a recorder, so callers stay agnostic of the
/// output encoding and further encoder variants can slot in.
pub trait Recorder: Send + Sync {
    fn start(&self, config: SessionConfig) -> Result<(), CaptureError>;
    fn pause(&self);
    fn resume(&self) -> Result<(), CaptureError>;
    fn stop(&self);
    fn is_recording(&self) -> bool;
    fn is_paused(&self) -> bool;
    fn set_monitoring_enabled(&self, enabled: bool);
    fn set_hpf_mode(&self, mode: HpfMode);
    fn set_lpf_mode(&self, mode: LpfMode);
    fn set_gain_boost_level(&self, level: GainLevel);
    fn set_noise_gate_enabled(&self, enabled: bool);
    fn set_noise_reduction_enabled(&self, enabled: bool);
}

impl Recorder for CaptureEngine {
    fn start(&self, config: SessionConfig) -> Result<(), CaptureError> {
        CaptureEngine::start(self, config)
    }

    fn pause(&self) {
        CaptureEngine::pause(self)
    }

    fn resume(&self) -> Result<(), CaptureError> {
        CaptureEngine::resume(self)
    }

    fn stop(&self) {
        CaptureEngine::stop(self)
    }

    fn is_recording(&self) -> bool {
        CaptureEngine::is_recording(self)
    }

    fn is_paused(&self) -> bool {
        CaptureEngine::is_paused(self)
    }

    fn set_monitoring_enabled(&self, enabled: bool) {
        CaptureEngine::set_monitoring_enabled(self, enabled)
    }

    fn set_hpf_mode(&self, mode: HpfMode) {
        CaptureEngine::set_hpf_mode(self, mode)
    }

    fn set_lpf_mode(&self, mode: LpfMode) {
        CaptureEngine::set_lpf_mode(self, mode)
    }

    fn set_gain_boost_level(&self, level: GainLevel) {
        CaptureEngine::set_gain_boost_level(self, level)
    }

    fn set_noise_gate_enabled(&self, enabled: bool) {
        CaptureEngine::set_noise_gate_enabled(self, enabled)
    }

    fn set_noise_reduction_enabled(&self, enabled: bool) {
        CaptureEngine::set_noise_reduction_enabled(self, enabled)
    }
}

/// Messages from the input stream callbacks to the worker loop.
pub(crate) enum WorkerMsg {
    Chunk(Vec<i16>),
    StreamError(String),
}

/// Build and start an input stream at the session format. Chunks and stream
/// errors both funnel into the same channel, so a hot-unplug surfaces at the
/// next chunk boundary.
pub(crate) fn build_input_stream(
    device: &cpal::Device,
    format: AudioFormat,
    tx: mpsc::Sender<WorkerMsg>,
) -> Result<cpal::Stream, CaptureError> {
    let name = device.name().unwrap_or_else(|_| "unknown".into());
    let config = cpal::StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let err_tx = tx.clone();
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let _ = tx.send(WorkerMsg::Chunk(data.to_vec()));
            },
            move |err| {
                let _ = err_tx.send(WorkerMsg::StreamError(err.to_string()));
            },
            None,
        )
        .map_err(|e| CaptureError::RecorderInit(e.to_string()))?;
    stream
        .play()
        .map_err(|e| CaptureError::RecorderInit(e.to_string()))?;
    tracing::info!(
        device = %name,
        sample_rate = format.sample_rate,
        channels = format.channels,
        "input stream started"
    );
    Ok(stream)
}

fn spawn_worker(
    shared: Arc<Shared>,
    device: cpal::Device,
    format: AudioFormat,
) -> Result<WorkerHandle, CaptureError> {
    let stop = Arc::new(AtomicBool::new(false));
    let pause = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let (ready_tx, ready_rx) = mpsc::channel();

    let worker_stop = stop.clone();
    let worker_pause = pause.clone();
    let join = thread::Builder::new()
        .name("capture-worker".into())
        .spawn(move || {
            capture_worker(shared, device, format, worker_stop, worker_pause, ready_tx);
            // done_tx disconnects here, signalling exit to the waiter.
            drop(done_tx);
        })
        .map_err(|e| CaptureError::RecorderInit(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(WorkerHandle { stop, pause, done_rx, join }),
        Ok(Err(err)) => {
            let _ = join.join();
            Err(err)
        }
        Err(_) => {
            let _ = join.join();
            Err(CaptureError::RecorderInit(
                "capture worker exited during startup".into(),
            ))
        }
    }
}

/// Wait for the worker to exit, bounded. On timeout the worker is left to
/// die on its own and finalization proceeds anyway.
fn wait_worker(handle: WorkerHandle) {
    match handle.done_rx.recv_timeout(WORKER_JOIN_TIMEOUT) {
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracing::warn!("capture worker did not stop within the join timeout");
        }
        _ => {
            let _ = handle.join.join();
        }
    }
}

fn capture_worker(
    shared: Arc<Shared>,
    device: cpal::Device,
    format: AudioFormat,
    stop: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
    ready_tx: mpsc::Sender<Result<(), CaptureError>>,
) {
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

    let channels = format.channels as usize;
    let mut last_progress = Instant::now();
    let mut peak_since_progress = 0i32;

    while !stop.load(Ordering::SeqCst) && !pause.load(Ordering::SeqCst) {
        let msg = match msg_rx.recv_timeout(CHUNK_WAIT) {
            Ok(msg) => msg,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        match msg {
            WorkerMsg::Chunk(mut chunk) => {
                // Whole frames only.
                chunk.truncate(chunk.len() - chunk.len() % channels);
                if chunk.is_empty() {
                    continue;
                }

                let mut progress = None;
                let mut failure = None;
                {
                    let mut guard = shared.session.lock();
                    let session = match guard.as_mut() {
                        Some(session) if session.writer.is_some() => session,
                        _ => break,
                    };

                    let peak = session.chain.process_chunk(&shared.settings, &mut chunk);
                    peak_since_progress = peak_since_progress.max(peak);

                    if shared.settings.monitor_enabled() {
                        if let Some(sink) = shared.monitor.lock().as_ref() {
                            sink.feed(&chunk);
                        }
                    }

                    let write_result = match session.writer.as_mut() {
                        Some(writer) => writer.write_samples(&chunk),
                        None => break,
                    };
                    match write_result {
                        Ok(()) => {
                            session.frames_written += (chunk.len() / channels) as u64;
                            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                                last_progress = Instant::now();
                                progress = Some(session.duration_ms());
                            }
                        }
                        Err(err) => {
                            tracing::error!(%err, "write failed, ending session");
                            failure = Some(finalize_session(session));
                            *guard = None;
                        }
                    }
                }

                if let Some(finalized) = failure {
                    shared.set_state(RecorderState::Idle);
                    shared.emit(|o| o.on_error(ErrorKind::RecordingError));
                    if let Some(path) = finalized {
                        shared.emit(move |o| o.on_stop_record(&path));
                    }
                    break;
                }
                if let Some(duration_ms) = progress {
                    let amplitude = peak_since_progress;
                    peak_since_progress = 0;
                    shared.emit(move |o| o.on_progress(duration_ms, amplitude));
                }
            }
            WorkerMsg::StreamError(err) => {
                // Device lost (hot-unplug) or backend failure: end cleanly.
                tracing::error!(%err, "input stream failed, ending session");
                let finalized = {
                    let mut guard = shared.session.lock();
                    let finalized = guard.as_mut().and_then(finalize_session);
                    *guard = None;
                    finalized
                };
                shared.set_state(RecorderState::Idle);
                shared.emit(|o| o.on_error(ErrorKind::RecordingError));
                if let Some(path) = finalized {
                    shared.emit(move |o| o.on_stop_record(&path));
                }
                break;
            }
        }
    }

    // Releases the input device.
    drop(stream);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err =
            CaptureError::InvalidOutputFile(io::Error::new(io::ErrorKind::Other, "x"));
        assert_eq!(err.kind(), ErrorKind::InvalidOutputFile);
        assert_eq!(
            CaptureError::RecorderInit("x".into()).kind(),
            ErrorKind::RecorderInit
        );
        assert_eq!(
            CaptureError::Recording("x".into()).kind(),
            ErrorKind::RecordingError
        );
        assert_eq!(
            CaptureError::SessionActive.kind(),
            ErrorKind::RecorderInit
        );
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            RecorderState::Idle,
            RecorderState::Running,
            RecorderState::Paused,
            RecorderState::Stopping,
            RecorderState::Finalizing,
        ] {
            assert_eq!(RecorderState::from_u8(state as u8), state);
        }
        assert_eq!(RecorderState::from_u8(200), RecorderState::Idle);
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::new("/tmp/take.wav", AudioFormat::stereo(48000));
        assert_eq!(config.gain, GainLevel::Off);
        assert!(!config.monitor_enabled);
        assert!(config.noise_reduction.is_none());
        assert!(config.input_device_id.is_none());
    }

    #[test]
    fn test_duration_tracks_frames_only() {
        let settings = EffectSettings::new();
        let config = SessionConfig::new("/tmp/take.wav", AudioFormat::mono(44100));
        let mut session = SessionState {
            chain: EffectChain::new(config.format, config.gate, &settings),
            config,
            writer: None,
            frames_written: 0,
            finalized: false,
        };
        assert_eq!(session.duration_ms(), 0);
        session.frames_written = 44100;
        assert_eq!(session.duration_ms(), 1000);
        // A pause/resume cycle adds nothing by itself.
        session.frames_written += 22050;
        assert_eq!(session.duration_ms(), 1500);
    }
}
