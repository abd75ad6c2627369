//! # fieldrec-capture
//!
//! Device-facing half of the fieldrec field-recording engine (v0.4.0):
//! acquires audio hardware, runs the real-time capture pipeline from
//! [`fieldrec_core`], and manages live monitoring.
//!
//! ## Architecture
//!
//! - [`DeviceRegistry`] — enumerates and classifies inputs/outputs, notifies
//!   weak observers on hot-plug, picks the monitor output route
//! - [`CaptureEngine`] — session lifecycle (Idle → Running ⇄ Paused →
//!   Stopping → Finalizing → Idle), one worker thread per running span
//! - [`MonitorSink`] — playback of post-effect PCM with a bounded,
//!   drop-on-overflow ring so capture never blocks on the output device
//! - [`StandaloneMonitor`] — input→output loopback while no capture holds
//!   the input device
//! - [`RecordObserver`] / [`Dispatcher`] — host callback surface; every
//!   notification is posted through the injected dispatcher
//!
//! ## Device hand-off
//!
//! The input device is exclusive. At most one of the capture worker and the
//! standalone monitor owns it, and every transition goes through the engine:
//! start and resume stop the standalone loop before acquiring; pause and
//! stop hand the device back to it when monitoring is enabled.

pub mod device;
pub mod engine;
pub mod monitor;
pub mod observer;
pub mod standalone;

pub use device::{
    classify, feedback_risk, pick_monitor_route, DeviceInfo, DeviceKind, DeviceObserver,
    DeviceRegistry,
};
pub use engine::{
    CaptureEngine, CaptureError, ErrorKind, Recorder, RecorderState, SessionConfig,
    PROGRESS_INTERVAL,
};
pub use monitor::{MonitorError, MonitorRing, MonitorSink, MONITOR_BUFFER_MS};
pub use observer::{inline_dispatcher, Dispatcher, NullObserver, RecordObserver};
pub use standalone::StandaloneMonitor;
