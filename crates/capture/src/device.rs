//! Input/output device registry.
//!
//! Wraps the host audio backend: enumerates devices, classifies each from
//! its reported name, and notifies subscribed observers when the device set
//! changes. The backend has no portable change callback, so change detection
//! is a snapshot diff — call [`DeviceRegistry::refresh`] directly or run the
//! polling watcher.
//!
//! Observers are held weakly: the registry never keeps a session (or
//! anything else) alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// What a device is, as far as routing decisions care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    BuiltinMic,
    BuiltinSpeaker,
    UsbDevice,
    UsbHeadset,
    UsbAccessory,
    WiredHeadset,
    WiredHeadphones,
    BluetoothA2dp,
    BluetoothSco,
    /// Nothing usable to classify from (e.g. an empty device name).
    Unknown,
}

impl DeviceKind {
    /// External capture sources; anything else implies the built-in mic.
    pub fn is_external_input(self) -> bool {
        matches!(
            self,
            DeviceKind::UsbDevice
                | DeviceKind::UsbHeadset
                | DeviceKind::UsbAccessory
                | DeviceKind::WiredHeadset
        )
    }

    /// Monitor routing preference: lower is better. `None` means the kind
    /// is never used for monitoring output.
    pub fn monitor_priority(self) -> Option<u8> {
        match self {
            DeviceKind::BluetoothA2dp => Some(0),
            DeviceKind::BluetoothSco => Some(1),
            DeviceKind::WiredHeadset | DeviceKind::WiredHeadphones | DeviceKind::UsbHeadset => {
                Some(2)
            }
            DeviceKind::BuiltinSpeaker => Some(3),
            _ => None,
        }
    }
}

/// One enumerated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stable identifier within a snapshot. The backend exposes no platform
    /// id, so this is the device name.
    pub id: String,
    pub kind: DeviceKind,
    pub display_name: String,
}

/// Classify a device from its reported name. An unnameable device is
/// [`DeviceKind::Unknown`]; any other unrecognized name implies the
/// built-in mic or speaker.
pub fn classify(name: &str, is_input: bool) -> DeviceKind {
    let n = name.to_ascii_lowercase();
    if n.trim().is_empty() {
        return DeviceKind::Unknown;
    }
    if n.contains("a2dp") {
        return DeviceKind::BluetoothA2dp;
    }
    if n.contains("sco") || n.contains("hfp") || n.contains("hands-free") || n.contains("handsfree")
    {
        return DeviceKind::BluetoothSco;
    }
    if n.contains("bluetooth") {
        return DeviceKind::BluetoothA2dp;
    }
    if n.contains("usb") {
        if n.contains("headset") {
            return DeviceKind::UsbHeadset;
        }
        if n.contains("accessory") {
            return DeviceKind::UsbAccessory;
        }
        return DeviceKind::UsbDevice;
    }
    if n.contains("headset") {
        return DeviceKind::WiredHeadset;
    }
    if n.contains("headphone") {
        return DeviceKind::WiredHeadphones;
    }
    if is_input {
        DeviceKind::BuiltinMic
    } else {
        DeviceKind::BuiltinSpeaker
    }
}

/// Highest-priority monitoring output, never the selected input device
/// (routing the mic back into itself echoes the take).
pub fn pick_monitor_route<'a>(
    outputs: &'a [DeviceInfo],
    exclude_input_id: Option<&str>,
) -> Option<&'a DeviceInfo> {
    outputs
        .iter()
        .filter(|d| Some(d.id.as_str()) != exclude_input_id)
        .filter(|d| d.kind.monitor_priority().is_some())
        .min_by_key(|d| d.kind.monitor_priority())
}

/// Feedback is possible iff capturing from the built-in mic with nothing but
/// the built-in speaker to monitor through.
pub fn feedback_risk(input: DeviceKind, outputs: &[DeviceInfo]) -> bool {
    input == DeviceKind::BuiltinMic
        && !outputs
            .iter()
            .any(|d| matches!(d.kind.monitor_priority(), Some(p) if p < 3))
}

/// Device hot-plug notifications.
pub trait DeviceObserver: Send + Sync {
    fn on_device_added(&self, _device: &DeviceInfo) {}
    fn on_device_removed(&self, _device: &DeviceInfo) {}
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    inputs: Vec<DeviceInfo>,
    outputs: Vec<DeviceInfo>,
}

/// Process-wide device registry.
pub struct DeviceRegistry {
    observers: Mutex<Vec<Weak<dyn DeviceObserver>>>,
    snapshot: Mutex<Snapshot>,
    watcher_stop: Arc<AtomicBool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        let registry = DeviceRegistry {
            observers: Mutex::new(Vec::new()),
            snapshot: Mutex::new(Snapshot::default()),
            watcher_stop: Arc::new(AtomicBool::new(false)),
            watcher: Mutex::new(None),
        };
        *registry.snapshot.lock() = registry.enumerate();
        registry
    }

    fn enumerate(&self) -> Snapshot {
        let host = cpal::default_host();
        let mut snapshot = Snapshot::default();
        match host.input_devices() {
            Ok(devices) => {
                for device in devices {
                    if let Ok(name) = device.name() {
                        snapshot.inputs.push(DeviceInfo {
                            id: name.clone(),
                            kind: classify(&name, true),
                            display_name: name,
                        });
                    }
                }
            }
            Err(err) => tracing::warn!(%err, "input enumeration failed"),
        }
        match host.output_devices() {
            Ok(devices) => {
                for device in devices {
                    if let Ok(name) = device.name() {
                        snapshot.outputs.push(DeviceInfo {
                            id: name.clone(),
                            kind: classify(&name, false),
                            display_name: name,
                        });
                    }
                }
            }
            Err(err) => tracing::warn!(%err, "output enumeration failed"),
        }
        snapshot
    }

    pub fn list_inputs(&self) -> Vec<DeviceInfo> {
        self.snapshot.lock().inputs.clone()
    }

    pub fn list_outputs(&self) -> Vec<DeviceInfo> {
        self.snapshot.lock().outputs.clone()
    }

    /// Open the input device with the given id, if it is still present.
    pub fn input_by_id(&self, id: &str) -> Option<cpal::Device> {
        let host = cpal::default_host();
        host.input_devices()
            .ok()?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
    }

    /// Open the output device with the given id, if it is still present.
    pub fn output_by_id(&self, id: &str) -> Option<cpal::Device> {
        let host = cpal::default_host();
        host.output_devices()
            .ok()?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
    }

    pub fn default_input(&self) -> Option<cpal::Device> {
        cpal::default_host().default_input_device()
    }

    pub fn subscribe(&self, observer: &Arc<dyn DeviceObserver>) {
        self.observers.lock().push(Arc::downgrade(observer));
    }

    pub fn unsubscribe(&self, observer: &Arc<dyn DeviceObserver>) {
        let target = Arc::downgrade(observer);
        self.observers.lock().retain(|w| !Weak::ptr_eq(w, &target));
    }

    /// Re-enumerate and notify observers about devices that appeared or
    /// disappeared since the last snapshot.
    pub fn refresh(&self) {
        let new = self.enumerate();
        let old = {
            let mut guard = self.snapshot.lock();
            std::mem::replace(&mut *guard, new.clone())
        };

        let added: Vec<DeviceInfo> = all_devices(&new)
            .filter(|d| !all_devices(&old).any(|o| o.id == d.id))
            .cloned()
            .collect();
        let removed: Vec<DeviceInfo> = all_devices(&old)
            .filter(|d| !all_devices(&new).any(|n| n.id == d.id))
            .cloned()
            .collect();
        if added.is_empty() && removed.is_empty() {
            return;
        }

        // Upgrade once, prune the dead, notify outside the lock.
        let live: Vec<Arc<dyn DeviceObserver>> = {
            let mut guard = self.observers.lock();
            guard.retain(|w| w.strong_count() > 0);
            guard.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in &live {
            for device in &added {
                observer.on_device_added(device);
            }
            for device in &removed {
                observer.on_device_removed(device);
            }
        }
    }

    /// Poll [`DeviceRegistry::refresh`] on a background thread.
    pub fn start_watcher(self: &Arc<Self>, interval: Duration) {
        let mut guard = self.watcher.lock();
        if guard.is_some() {
            return;
        }
        self.watcher_stop.store(false, Ordering::SeqCst);
        let stop = self.watcher_stop.clone();
        let registry = self.clone();
        let handle = thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                thread::sleep(interval);
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                registry.refresh();
            }
        });
        *guard = Some(handle);
    }

    pub fn stop_watcher(&self) {
        self.watcher_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.watcher.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

fn all_devices(snapshot: &Snapshot) -> impl Iterator<Item = &DeviceInfo> {
    snapshot.inputs.iter().chain(snapshot.outputs.iter())
}
