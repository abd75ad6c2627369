//! Second-order Butterworth filters with persistent state.
//!
//! Direct Form I in double precision. The capture chain runs these on 16-bit
//! samples, converting back with a rounded clamp after each filter stage.
//!
//! A stereo stream is filtered as one interleaved sequence through a single
//! state — the channels share the filter memory. That matches the shipping
//! behavior and is pinned by a test in [`crate::effects`].

use std::f64::consts::{FRAC_1_SQRT_2, PI};

/// Q for a maximally flat (no resonant peak) Butterworth response.
const BUTTERWORTH_Q: f64 = FRAC_1_SQRT_2;

/// Filter coefficients, normalized by `a0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    /// Butterworth high-pass at `cutoff_hz`.
    pub fn high_pass(cutoff_hz: f64, sample_rate: u32) -> BiquadCoeffs {
        let w0 = 2.0 * PI * cutoff_hz / sample_rate as f64;
        let (sin_w0, cos_w0) = (w0.sin(), w0.cos());
        let alpha = sin_w0 / (2.0 * BUTTERWORTH_Q);
        let a0 = 1.0 + alpha;
        BiquadCoeffs {
            b0: ((1.0 + cos_w0) / 2.0) / a0,
            b1: (-(1.0 + cos_w0)) / a0,
            b2: ((1.0 + cos_w0) / 2.0) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// Butterworth low-pass at `cutoff_hz`.
    pub fn low_pass(cutoff_hz: f64, sample_rate: u32) -> BiquadCoeffs {
        let w0 = 2.0 * PI * cutoff_hz / sample_rate as f64;
        let (sin_w0, cos_w0) = (w0.sin(), w0.cos());
        let alpha = sin_w0 / (2.0 * BUTTERWORTH_Q);
        let a0 = 1.0 + alpha;
        BiquadCoeffs {
            b0: ((1.0 - cos_w0) / 2.0) / a0,
            b1: (1.0 - cos_w0) / a0,
            b2: ((1.0 - cos_w0) / 2.0) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }
}

/// One biquad section: coefficients plus the four delay elements.
#[derive(Debug, Clone)]
pub struct Biquad {
    coeffs: BiquadCoeffs,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl Biquad {
    pub fn new(coeffs: BiquadCoeffs) -> Biquad {
        Biquad { coeffs, x1: 0.0, x2: 0.0, y1: 0.0, y2: 0.0 }
    }

    pub fn high_pass(cutoff_hz: f64, sample_rate: u32) -> Biquad {
        Biquad::new(BiquadCoeffs::high_pass(cutoff_hz, sample_rate))
    }

    pub fn low_pass(cutoff_hz: f64, sample_rate: u32) -> Biquad {
        Biquad::new(BiquadCoeffs::low_pass(cutoff_hz, sample_rate))
    }

    pub fn coeffs(&self) -> BiquadCoeffs {
        self.coeffs
    }

    /// Clear the delay elements (session start).
    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }

    /// Process one sample:
    /// `y[n] = b0·x[n] + b1·x[n-1] + b2·x[n-2] − a1·y[n-1] − a2·y[n-2]`.
    #[inline]
    pub fn process(&mut self, x: f64) -> f64 {
        let c = &self.coeffs;
        let y = c.b0 * x + c.b1 * self.x1 + c.b2 * self.x2 - c.a1 * self.y1 - c.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }

    /// Process one 16-bit sample with a rounded clamp on the way out.
    #[inline]
    pub fn process_i16(&mut self, sample: i16) -> i16 {
        clamp_i16(self.process(sample as f64))
    }
}

/// Round and saturate a double back into the 16-bit sample range.
#[inline]
pub fn clamp_i16(value: f64) -> i16 {
    value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_i16() {
        assert_eq!(clamp_i16(0.4), 0);
        assert_eq!(clamp_i16(0.5), 1);
        assert_eq!(clamp_i16(-1.5), -2);
        assert_eq!(clamp_i16(40000.0), 32767);
        assert_eq!(clamp_i16(-40000.0), -32768);
    }

    #[test]
    fn test_high_pass_kills_dc() {
        // 10000 samples of DC through a 120 Hz HPF at 44.1 kHz: magnitude
        // must fall below 100 within the first 1000 samples and keep falling.
        let mut hpf = Biquad::high_pass(120.0, 44100);
        let mut below_at = None;
        let mut last = 0.0f64;
        for n in 0..10000 {
            last = hpf.process(1000.0);
            if below_at.is_none() && last.abs() < 100.0 {
                below_at = Some(n);
            }
        }
        assert!(below_at.expect("never dropped below 100") < 1000);
        assert!(last.abs() < 1.0);
    }

    #[test]
    fn test_high_pass_step_decay() {
        // Unit step: output decays below −40 dB of the input peak within
        // 2048 samples at 44.1 kHz.
        let mut hpf = Biquad::high_pass(80.0, 44100);
        let mut peak = 0.0f64;
        let mut tail = f64::MAX;
        for n in 0..2048 {
            let y = hpf.process(1.0).abs();
            peak = peak.max(y);
            if n >= 2000 {
                tail = tail.min(y);
            }
        }
        let floor_db = 20.0 * (tail / peak).log10();
        assert!(floor_db < -40.0, "step residue {floor_db} dB");
    }

    #[test]
    fn test_low_pass_unity_dc_gain() {
        // A step settles to the input level: DC gain 1 within 2048 samples.
        let mut lpf = Biquad::low_pass(9500.0, 44100);
        let mut y = 0.0;
        for _ in 0..2048 {
            y = lpf.process(1000.0);
        }
        assert!((y - 1000.0).abs() < 1.0, "settled at {y}");
    }

    #[test]
    fn test_low_pass_attenuates_above_cutoff() {
        // 20 kHz tone through a 9.5 kHz LPF at 44.1 kHz loses most energy.
        let sample_rate = 44100u32;
        let mut lpf = Biquad::low_pass(9500.0, sample_rate);
        let mut peak = 0.0f64;
        for n in 0..8192 {
            let x = (2.0 * PI * 20000.0 * n as f64 / sample_rate as f64).sin() * 1000.0;
            let y = lpf.process(x);
            if n > 4096 {
                peak = peak.max(y.abs());
            }
        }
        assert!(peak < 250.0, "peak after filter {peak}");
    }

    #[test]
    fn test_reset_clears_state() {
        let mut hpf = Biquad::high_pass(120.0, 44100);
        for _ in 0..100 {
            hpf.process(5000.0);
        }
        hpf.reset();
        let mut fresh = Biquad::high_pass(120.0, 44100);
        assert_eq!(hpf.process(123.0), fresh.process(123.0));
    }
}
