//! Per-chunk effect chain and its cross-thread control flags.
//!
//! The chain applies, in fixed order: gain boost → high-pass → low-pass →
//! noise gate. Each stage saturates back into the 16-bit range, so what goes
//! to the writer and the monitor is always valid PCM.
//!
//! Control lives in [`EffectSettings`]: word-size atomics written by the host
//! thread and read by whichever thread is driving audio. The chain picks up
//! changes at chunk boundaries only — never mid-chunk.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::biquad::Biquad;
use crate::gate::{GateConfig, NoiseGate};
use crate::AudioFormat;

/// Input gain boost applied before the filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum GainLevel {
    Off = 0,
    Plus6Db = 1,
    Plus12Db = 2,
}

impl GainLevel {
    /// Linear multiplier: OFF → 1, +6 dB → 2, +12 dB → 4.
    pub fn multiplier(self) -> i32 {
        match self {
            GainLevel::Off => 1,
            GainLevel::Plus6Db => 2,
            GainLevel::Plus12Db => 4,
        }
    }

    fn from_u8(v: u8) -> GainLevel {
        match v {
            1 => GainLevel::Plus6Db,
            2 => GainLevel::Plus12Db,
            _ => GainLevel::Off,
        }
    }
}

/// High-pass (rumble cut) setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HpfMode {
    Off = 0,
    Hz80 = 1,
    Hz120 = 2,
}

impl HpfMode {
    pub fn cutoff_hz(self) -> Option<f64> {
        match self {
            HpfMode::Off => None,
            HpfMode::Hz80 => Some(80.0),
            HpfMode::Hz120 => Some(120.0),
        }
    }

    fn from_u8(v: u8) -> HpfMode {
        match v {
            1 => HpfMode::Hz80,
            2 => HpfMode::Hz120,
            _ => HpfMode::Off,
        }
    }
}

/// Low-pass (hiss cut) setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LpfMode {
    Off = 0,
    Hz9500 = 1,
    Hz15000 = 2,
}

impl LpfMode {
    pub fn cutoff_hz(self) -> Option<f64> {
        match self {
            LpfMode::Off => None,
            LpfMode::Hz9500 => Some(9500.0),
            LpfMode::Hz15000 => Some(15000.0),
        }
    }

    fn from_u8(v: u8) -> LpfMode {
        match v {
            1 => LpfMode::Hz9500,
            2 => LpfMode::Hz15000,
            _ => LpfMode::Off,
        }
    }
}

/// Shared control block: host threads store, the audio thread loads at chunk
/// boundaries. All fields are single words, so a store is atomic on its own
/// and takes effect at the next chunk.
#[derive(Debug, Default)]
pub struct EffectSettings {
    gain: AtomicU8,
    hpf: AtomicU8,
    lpf: AtomicU8,
    gate_enabled: AtomicBool,
    monitor_enabled: AtomicBool,
    noise_reduction_enabled: AtomicBool,
}

impl EffectSettings {
    pub fn new() -> EffectSettings {
        EffectSettings::default()
    }

    pub fn gain(&self) -> GainLevel {
        GainLevel::from_u8(self.gain.load(Ordering::SeqCst))
    }

    pub fn set_gain(&self, level: GainLevel) {
        self.gain.store(level as u8, Ordering::SeqCst);
    }

    pub fn hpf(&self) -> HpfMode {
        HpfMode::from_u8(self.hpf.load(Ordering::SeqCst))
    }

    pub fn set_hpf(&self, mode: HpfMode) {
        self.hpf.store(mode as u8, Ordering::SeqCst);
    }

    pub fn lpf(&self) -> LpfMode {
        LpfMode::from_u8(self.lpf.load(Ordering::SeqCst))
    }

    pub fn set_lpf(&self, mode: LpfMode) {
        self.lpf.store(mode as u8, Ordering::SeqCst);
    }

    pub fn gate_enabled(&self) -> bool {
        self.gate_enabled.load(Ordering::SeqCst)
    }

    pub fn set_gate_enabled(&self, enabled: bool) {
        self.gate_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn monitor_enabled(&self) -> bool {
        self.monitor_enabled.load(Ordering::SeqCst)
    }

    pub fn set_monitor_enabled(&self, enabled: bool) {
        self.monitor_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn noise_reduction_enabled(&self) -> bool {
        self.noise_reduction_enabled.load(Ordering::SeqCst)
    }

    pub fn set_noise_reduction_enabled(&self, enabled: bool) {
        self.noise_reduction_enabled.store(enabled, Ordering::SeqCst);
    }
}

/// The per-session effect state: one filter pair, one gate, and the control
/// values the chain was last built with.
///
/// Stereo runs through the same filter state as mono — one interleaved
/// sequence, shared delay elements.
pub struct EffectChain {
    sample_rate: u32,
    gain: GainLevel,
    hpf_mode: HpfMode,
    lpf_mode: LpfMode,
    hpf: Option<Biquad>,
    lpf: Option<Biquad>,
    gate: NoiseGate,
    gate_enabled: bool,
}

impl EffectChain {
    /// Build the chain from the current settings. Filter and gate state
    /// start cleared.
    pub fn new(format: AudioFormat, gate_config: GateConfig, settings: &EffectSettings) -> Self {
        let sample_rate = format.sample_rate;
        let hpf_mode = settings.hpf();
        let lpf_mode = settings.lpf();
        let gate_enabled = settings.gate_enabled();
        let mut gate = NoiseGate::new(gate_config, sample_rate);
        if !gate_enabled {
            gate.force_open();
        }
        EffectChain {
            sample_rate,
            gain: settings.gain(),
            hpf_mode,
            lpf_mode,
            hpf: hpf_mode.cutoff_hz().map(|c| Biquad::high_pass(c, sample_rate)),
            lpf: lpf_mode.cutoff_hz().map(|c| Biquad::low_pass(c, sample_rate)),
            gate,
            gate_enabled,
        }
    }

    /// Pick up control changes. Called once per chunk; a filter mode change
    /// redesigns that filter with cleared state.
    fn sync(&mut self, settings: &EffectSettings) {
        self.gain = settings.gain();

        let hpf_mode = settings.hpf();
        if hpf_mode != self.hpf_mode {
            self.hpf_mode = hpf_mode;
            self.hpf = hpf_mode
                .cutoff_hz()
                .map(|c| Biquad::high_pass(c, self.sample_rate));
        }

        let lpf_mode = settings.lpf();
        if lpf_mode != self.lpf_mode {
            self.lpf_mode = lpf_mode;
            self.lpf = lpf_mode
                .cutoff_hz()
                .map(|c| Biquad::low_pass(c, self.sample_rate));
        }

        let gate_enabled = settings.gate_enabled();
        if gate_enabled != self.gate_enabled {
            self.gate_enabled = gate_enabled;
            if gate_enabled {
                self.gate.reset();
            } else {
                self.gate.force_open();
            }
        }
    }

    /// Run one chunk through the chain in place.
    ///
    /// Returns the post-filter peak amplitude of the chunk (taken before the
    /// gate, so the level meter still moves while the gate is closed).
    pub fn process_chunk(&mut self, settings: &EffectSettings, samples: &mut [i16]) -> i32 {
        self.sync(settings);

        let g = self.gain.multiplier();
        let mut peak = 0i32;
        for s in samples.iter_mut() {
            let mut v = *s;
            if g != 1 {
                v = (v as i32 * g).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            }
            if let Some(hpf) = &mut self.hpf {
                v = hpf.process_i16(v);
            }
            if let Some(lpf) = &mut self.lpf {
                v = lpf.process_i16(v);
            }
            *s = v;
            peak = peak.max((v as i32).abs());
        }

        if self.gate_enabled {
            self.gate.process_chunk(samples);
        }
        peak
    }

    /// Clear filter and gate state without touching the modes.
    pub fn reset(&mut self) {
        if let Some(hpf) = &mut self.hpf {
            hpf.reset();
        }
        if let Some(lpf) = &mut self.lpf {
            lpf.reset();
        }
        if self.gate_enabled {
            self.gate.reset();
        } else {
            self.gate.force_open();
        }
    }

    pub fn gate(&self) -> &NoiseGate {
        &self.gate
    }
}
