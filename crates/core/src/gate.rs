//! Chunk-rate RMS noise gate.
//!
//! The gate is driven once per capture chunk: the chunk RMS moves a
//! five-state machine, the machine moves an envelope in [0, 1], and the
//! envelope scales the chunk when it is below 1. Hysteresis (half the open
//! threshold) keeps the machine from chattering near the boundary, and a
//! hold period keeps the gate open across short gaps.
//!
//! ```text
//!            rms > thr            env ≥ 1
//!  CLOSED ────────────▶ ATTACK ────────────▶ OPEN
//!     ▲                    ▲                  │ rms < hyst
//!     │ env ≤ 0            │ rms > thr        ▼
//!  RELEASE ◀──────────── HOLD (counter, re-opens on rms > thr)
//! ```

use serde::{Deserialize, Serialize};

/// Open threshold and envelope timing for the gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// RMS level (raw 16-bit units) that opens the gate.
    pub threshold_rms: f64,
    /// Time for the envelope to ramp 0 → 1 once triggered.
    pub attack_ms: f64,
    /// Time for the envelope to ramp 1 → 0 after the hold expires.
    pub release_ms: f64,
    /// Time the gate stays fully open after the signal drops away.
    pub hold_ms: f64,
}

impl GateConfig {
    /// Close threshold: half the open threshold.
    pub fn hysteresis_rms(&self) -> f64 {
        0.5 * self.threshold_rms
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        GateConfig {
            threshold_rms: 400.0,
            attack_ms: 10.0,
            release_ms: 500.0,
            hold_ms: 300.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Closed,
    Attack,
    Open,
    Hold,
    Release,
}

/// RMS of a chunk of samples.
pub fn chunk_rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

pub struct NoiseGate {
    config: GateConfig,
    /// Envelope increment per sample while attacking.
    attack_step: f64,
    /// Envelope decrement per sample while releasing.
    release_step: f64,
    /// Hold duration in samples.
    hold_samples: f64,
    state: GateState,
    envelope: f64,
    hold_counter: f64,
}

impl NoiseGate {
    pub fn new(config: GateConfig, sample_rate: u32) -> NoiseGate {
        let sr = sample_rate as f64;
        NoiseGate {
            config,
            attack_step: 1000.0 / (sr * config.attack_ms),
            release_step: 1000.0 / (sr * config.release_ms),
            hold_samples: sr * config.hold_ms / 1000.0,
            state: GateState::Closed,
            envelope: 0.0,
            hold_counter: 0.0,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn envelope(&self) -> f64 {
        self.envelope
    }

    pub fn config(&self) -> GateConfig {
        self.config
    }

    /// Back to the initial closed state (session start).
    pub fn reset(&mut self) {
        self.state = GateState::Closed;
        self.envelope = 0.0;
        self.hold_counter = 0.0;
    }

    /// Snap fully open. Used when the gate is switched off so audio passes
    /// unchanged immediately.
    pub fn force_open(&mut self) {
        self.state = GateState::Open;
        self.envelope = 1.0;
        self.hold_counter = 0.0;
    }

    /// Run one chunk through the gate: advance the state machine from the
    /// chunk RMS, then scale the samples when the envelope is below 1.
    pub fn process_chunk(&mut self, samples: &mut [i16]) {
        if samples.is_empty() {
            return;
        }
        let rms = chunk_rms(samples);
        self.advance(rms, samples.len());
        if self.envelope < 1.0 {
            for s in samples.iter_mut() {
                *s = ((*s as f64) * self.envelope).round() as i16;
            }
        }
    }

    fn advance(&mut self, rms: f64, n: usize) {
        let n = n as f64;
        let threshold = self.config.threshold_rms;
        let hysteresis = self.config.hysteresis_rms();
        match self.state {
            GateState::Closed => {
                if rms > threshold {
                    self.state = GateState::Attack;
                }
            }
            GateState::Attack => {
                self.envelope += self.attack_step * n;
                if self.envelope >= 1.0 {
                    self.envelope = 1.0;
                    self.state = GateState::Open;
                }
            }
            GateState::Open => {
                if rms < hysteresis {
                    self.state = GateState::Hold;
                    self.hold_counter = self.hold_samples;
                }
            }
            GateState::Hold => {
                self.hold_counter -= n;
                if rms > threshold {
                    self.state = GateState::Open;
                } else if self.hold_counter <= 0.0 {
                    self.state = GateState::Release;
                }
            }
            GateState::Release => {
                self.envelope -= self.release_step * n;
                if self.envelope <= 0.0 {
                    self.envelope = 0.0;
                    self.state = GateState::Closed;
                }
                if rms > threshold {
                    self.state = GateState::Attack;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: u32 = 44100;
    const CHUNK: usize = 1024;

    fn loud_chunk() -> Vec<i16> {
        // 10 kHz square-ish tone, amplitude 10000 → RMS 10000
        (0..CHUNK)
            .map(|i| if (i / 2) % 2 == 0 { 10000 } else { -10000 })
            .collect()
    }

    fn quiet_chunk() -> Vec<i16> {
        vec![0i16; CHUNK]
    }

    #[test]
    fn test_chunk_rms() {
        assert_eq!(chunk_rms(&[]), 0.0);
        assert_eq!(chunk_rms(&[3, -3, 3, -3]), 3.0);
        assert!((chunk_rms(&loud_chunk()) - 10000.0).abs() < 1e-9);
    }

    #[test]
    fn test_silence_stays_closed_and_muted() {
        let mut gate = NoiseGate::new(GateConfig::default(), SAMPLE_RATE);
        let mut chunk = vec![50i16; CHUNK];
        gate.process_chunk(&mut chunk);
        assert_eq!(gate.state(), GateState::Closed);
        assert!(chunk.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_tone_opens_within_attack_time() {
        let mut gate = NoiseGate::new(GateConfig::default(), SAMPLE_RATE);
        // First loud chunk: Closed → Attack (still muted this chunk).
        let mut chunk = loud_chunk();
        gate.process_chunk(&mut chunk);
        assert_eq!(gate.state(), GateState::Attack);
        // 10 ms attack at 44.1 kHz is 441 samples, so one more 1024-sample
        // chunk saturates the envelope.
        let mut chunk = loud_chunk();
        gate.process_chunk(&mut chunk);
        assert_eq!(gate.state(), GateState::Open);
        assert_eq!(gate.envelope(), 1.0);
        assert_eq!(chunk, loud_chunk());
    }

    #[test]
    fn test_hold_then_release_then_closed() {
        let mut gate = NoiseGate::new(GateConfig::default(), SAMPLE_RATE);
        for _ in 0..4 {
            gate.process_chunk(&mut loud_chunk());
        }
        assert_eq!(gate.state(), GateState::Open);

        // Silence: gate holds at envelope 1 for 300 ms (~13230 samples).
        let mut silent_chunks = 0;
        while gate.state() == GateState::Open || gate.state() == GateState::Hold {
            gate.process_chunk(&mut quiet_chunk());
            silent_chunks += 1;
            if gate.state() == GateState::Hold || gate.state() == GateState::Open {
                assert_eq!(gate.envelope(), 1.0);
            }
            assert!(silent_chunks < 100, "gate never left hold");
        }
        let held_samples = (silent_chunks - 1) * CHUNK;
        assert!(held_samples as f64 >= 0.3 * SAMPLE_RATE as f64 - CHUNK as f64);

        // Release ramps down to closed over ~500 ms.
        let mut prev = gate.envelope();
        let mut release_chunks = 0;
        while gate.state() == GateState::Release {
            gate.process_chunk(&mut quiet_chunk());
            assert!(gate.envelope() <= prev);
            prev = gate.envelope();
            release_chunks += 1;
            assert!(release_chunks < 100, "gate never closed");
        }
        assert_eq!(gate.state(), GateState::Closed);
        assert_eq!(gate.envelope(), 0.0);
        let release_samples = release_chunks * CHUNK;
        assert!((release_samples as f64 - 0.5 * SAMPLE_RATE as f64).abs() < 2.0 * CHUNK as f64);
    }

    #[test]
    fn test_envelope_monotonic_and_bounded() {
        let mut gate = NoiseGate::new(
            GateConfig { attack_ms: 100.0, ..GateConfig::default() },
            SAMPLE_RATE,
        );
        let mut prev = 0.0;
        for _ in 0..20 {
            gate.process_chunk(&mut loud_chunk());
            let env = gate.envelope();
            assert!(env >= prev);
            assert!((0.0..=1.0).contains(&env));
            prev = env;
        }
        assert_eq!(gate.envelope(), 1.0);
    }

    #[test]
    fn test_hold_reopens_on_retrigger() {
        let mut gate = NoiseGate::new(GateConfig::default(), SAMPLE_RATE);
        for _ in 0..4 {
            gate.process_chunk(&mut loud_chunk());
        }
        gate.process_chunk(&mut quiet_chunk());
        assert_eq!(gate.state(), GateState::Hold);
        gate.process_chunk(&mut loud_chunk());
        assert_eq!(gate.state(), GateState::Open);
        assert_eq!(gate.envelope(), 1.0);
    }

    #[test]
    fn test_release_retriggers_to_attack() {
        let mut gate = NoiseGate::new(
            GateConfig { hold_ms: 10.0, ..GateConfig::default() },
            SAMPLE_RATE,
        );
        for _ in 0..4 {
            gate.process_chunk(&mut loud_chunk());
        }
        // Burn through the short hold into release.
        gate.process_chunk(&mut quiet_chunk());
        gate.process_chunk(&mut quiet_chunk());
        assert_eq!(gate.state(), GateState::Release);
        gate.process_chunk(&mut loud_chunk());
        assert_eq!(gate.state(), GateState::Attack);
    }

    #[test]
    fn test_force_open_passes_audio() {
        let mut gate = NoiseGate::new(GateConfig::default(), SAMPLE_RATE);
        gate.force_open();
        let mut chunk = vec![123i16; CHUNK];
        gate.process_chunk(&mut chunk);
        assert!(chunk.iter().all(|&s| s == 123));
        assert_eq!(gate.state(), GateState::Open);
    }
}
