//! Offline spectral-subtraction noise reduction over a finished WAV file.
//!
//! Single pass, fixed 2048-point frames at 50% overlap:
//!
//! 1. Read the whole file, mix to mono doubles in [−1, 1].
//! 2. Learn a per-bin noise profile (magnitude mean + std-dev) from the
//!    leading quiet region.
//! 3. For every hop-strided frame: forward FFT, subtract the scaled
//!    threshold from each bin magnitude to get a gain mask, smooth the mask
//!    across frequency and time, apply, inverse FFT, overlap-add.
//! 4. Normalize by the accumulated window energy and write the processed
//!    mono signal back to every original channel, in place. The header and
//!    frame count never change.
//!
//! The whole result is buffered and written in one pass at the end, so any
//! failure before the write-back leaves the capture untouched.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fft::{fft, hann_window, ifft, FftError};
use crate::wav::{WavError, WavReader};

/// Analysis/synthesis frame length.
pub const FFT_SIZE: usize = 2048;
/// Stride between frames: 50% overlap.
pub const HOP: usize = FFT_SIZE / 2;
/// Gain-mask attack time constant (gain falling).
const GAIN_ATTACK_SECONDS: f64 = 0.020;
/// Gain-mask release time constant (gain recovering).
const GAIN_RELEASE_SECONDS: f64 = 0.100;
/// Progress callback cadence, in frames.
const PROGRESS_FRAME_INTERVAL: usize = 50;
/// Below this window-energy sum a sample is considered uncovered.
const NORM_EPSILON: f64 = 1e-8;
/// Bin magnitudes below this are treated as zero when forming gains.
const MAGNITUDE_EPSILON: f64 = 1e-12;

/// Reduction parameters. Out-of-range values are clamped on use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReductionConfig {
    /// Maximum attenuation applied to noise-classified bins, 0–24 dB.
    pub reduction_db: f64,
    /// 0 (conservative, 3σ over the profile mean) to 24 (aggressive, 0σ).
    pub sensitivity: f64,
    /// Half-width of the frequency gain smoothing, 0–6 bins.
    pub freq_smoothing_bands: usize,
    /// Length of the leading noise-only region, 0.5–5.0 s.
    pub profile_seconds: f64,
}

impl ReductionConfig {
    pub fn clamped(self) -> ReductionConfig {
        ReductionConfig {
            reduction_db: self.reduction_db.clamp(0.0, 24.0),
            sensitivity: self.sensitivity.clamp(0.0, 24.0),
            freq_smoothing_bands: self.freq_smoothing_bands.min(6),
            profile_seconds: self.profile_seconds.clamp(0.5, 5.0),
        }
    }
}

impl Default for ReductionConfig {
    fn default() -> Self {
        ReductionConfig {
            reduction_db: 12.0,
            sensitivity: 6.0,
            freq_smoothing_bands: 2,
            profile_seconds: 1.0,
        }
    }
}

#[derive(Debug, Error)]
pub enum DenoiseError {
    #[error(transparent)]
    Wav(#[from] WavError),
    #[error(transparent)]
    Fft(#[from] FftError),
    /// The profile window holds fewer samples than one FFT frame.
    #[error("noise profile of {have} samples is shorter than one frame ({need})")]
    InsufficientProfile { have: usize, need: usize },
}

/// Per-bin magnitude statistics of the noise floor, bins `0..=FFT_SIZE/2`.
pub struct NoiseProfile {
    pub mean: Vec<f64>,
    pub std_dev: Vec<f64>,
}

impl NoiseProfile {
    /// Accumulate magnitude mean and std-dev over the hop-strided windowed
    /// frames of `samples`.
    pub fn estimate(samples: &[f64], window: &[f64]) -> Result<NoiseProfile, DenoiseError> {
        if samples.len() < FFT_SIZE {
            return Err(DenoiseError::InsufficientProfile {
                have: samples.len(),
                need: FFT_SIZE,
            });
        }
        let bins = FFT_SIZE / 2 + 1;
        let mut sum = vec![0.0f64; bins];
        let mut sum_sq = vec![0.0f64; bins];
        let mut frames = 0usize;
        let mut re = vec![0.0f64; FFT_SIZE];
        let mut im = vec![0.0f64; FFT_SIZE];

        let mut pos = 0;
        while pos + FFT_SIZE <= samples.len() {
            for i in 0..FFT_SIZE {
                re[i] = samples[pos + i] * window[i];
                im[i] = 0.0;
            }
            fft(&mut re, &mut im)?;
            for k in 0..bins {
                let mag = (re[k] * re[k] + im[k] * im[k]).sqrt();
                sum[k] += mag;
                sum_sq[k] += mag * mag;
            }
            frames += 1;
            pos += HOP;
        }

        let n = frames as f64;
        let mean: Vec<f64> = sum.iter().map(|s| s / n).collect();
        let std_dev: Vec<f64> = sum_sq
            .iter()
            .zip(mean.iter())
            .map(|(sq, m)| (sq / n - m * m).max(0.0).sqrt())
            .collect();
        Ok(NoiseProfile { mean, std_dev })
    }

    /// Per-bin subtraction threshold: `mean + scale·std`, where sensitivity
    /// 0 gives 3σ and sensitivity 24 gives 0σ.
    pub fn threshold(&self, sensitivity: f64) -> Vec<f64> {
        let scale = (24.0 - sensitivity) / 24.0 * 3.0;
        self.mean
            .iter()
            .zip(self.std_dev.iter())
            .map(|(m, s)| m + scale * s)
            .collect()
    }
}

/// Progress callback: fraction complete in [0, 1].
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

/// Mean-filter the gain mask across `±bands` neighboring bins.
fn smooth_bands(gain: &[f64], bands: usize, out: &mut [f64]) {
    if bands == 0 {
        out.copy_from_slice(gain);
        return;
    }
    let last = gain.len() - 1;
    for k in 0..gain.len() {
        let lo = k.saturating_sub(bands);
        let hi = (k + bands).min(last);
        let sum: f64 = gain[lo..=hi].iter().sum();
        out[k] = sum / (hi - lo + 1) as f64;
    }
}

/// Spectral subtraction over a mono signal in [−1, 1].
///
/// Returns the processed signal, same length as the input. Samples past the
/// last complete frame keep their original values.
pub fn reduce_samples(
    samples: &[f64],
    sample_rate: u32,
    config: ReductionConfig,
    progress: Option<&ProgressFn>,
) -> Result<Vec<f64>, DenoiseError> {
    let config = config.clamped();
    let total = samples.len();
    let window = hann_window(FFT_SIZE);

    let profile_samples =
        ((config.profile_seconds * sample_rate as f64) as usize).min(total);
    let profile = NoiseProfile::estimate(&samples[..profile_samples], &window)?;
    let threshold = profile.threshold(config.sensitivity);
    let strength = config.reduction_db / 12.0;

    let hop_seconds = HOP as f64 / sample_rate as f64;
    let alpha_attack = (-hop_seconds / GAIN_ATTACK_SECONDS).exp();
    let alpha_release = (-hop_seconds / GAIN_RELEASE_SECONDS).exp();

    let bins = FFT_SIZE / 2;
    let mut prev_gain = vec![1.0f64; bins + 1];
    let mut raw_gain = vec![0.0f64; bins + 1];
    let mut gain = vec![0.0f64; bins + 1];
    let mut re = vec![0.0f64; FFT_SIZE];
    let mut im = vec![0.0f64; FFT_SIZE];
    let mut output = vec![0.0f64; total];
    let mut norm = vec![0.0f64; total];

    let frame_count = if total >= FFT_SIZE {
        (total - FFT_SIZE) / HOP + 1
    } else {
        0
    };

    let mut frame_idx = 0usize;
    let mut pos = 0usize;
    while pos + FFT_SIZE <= total {
        for i in 0..FFT_SIZE {
            re[i] = samples[pos + i] * window[i];
            im[i] = 0.0;
        }
        fft(&mut re, &mut im)?;

        // Raw per-bin gain from magnitude subtraction.
        for k in 0..=bins {
            let mag = (re[k] * re[k] + im[k] * im[k]).sqrt();
            raw_gain[k] = if mag > MAGNITUDE_EPSILON {
                (mag - threshold[k] * strength).max(0.0) / mag
            } else {
                0.0
            };
        }

        smooth_bands(&raw_gain, config.freq_smoothing_bands, &mut gain);

        // Temporal smoothing: fast when the gain drops, slow on recovery.
        for k in 0..=bins {
            let g = if gain[k] < prev_gain[k] {
                alpha_attack * prev_gain[k] + (1.0 - alpha_attack) * gain[k]
            } else {
                alpha_release * prev_gain[k] + (1.0 - alpha_release) * gain[k]
            };
            gain[k] = g;
            prev_gain[k] = g;
        }

        // Apply the mask and rebuild the conjugate-symmetric upper half.
        for k in 0..=bins {
            re[k] *= gain[k];
            im[k] *= gain[k];
        }
        for k in 1..bins {
            re[FFT_SIZE - k] = re[k];
            im[FFT_SIZE - k] = -im[k];
        }
        ifft(&mut re, &mut im)?;

        for i in 0..FFT_SIZE {
            output[pos + i] += re[i] * window[i];
            norm[pos + i] += window[i] * window[i];
        }

        frame_idx += 1;
        if frame_idx % PROGRESS_FRAME_INTERVAL == 0 {
            if let Some(p) = progress {
                p(frame_idx as f32 / frame_count.max(1) as f32);
            }
        }
        pos += HOP;
    }

    for i in 0..total {
        if norm[i] > NORM_EPSILON {
            output[i] /= norm[i];
        } else {
            output[i] = samples[i];
        }
    }

    if let Some(p) = progress {
        p(1.0);
    }
    Ok(output)
}

/// Run noise reduction over a finished 16-bit PCM WAV file, in place.
///
/// Channels are averaged into one mono signal for analysis; the processed
/// result is written back to every channel at the original frame positions.
pub fn reduce_file<P: AsRef<Path>>(
    path: P,
    config: ReductionConfig,
    progress: Option<ProgressFn>,
) -> Result<(), DenoiseError> {
    let mut reader = WavReader::open_editable(path)?;
    let header = *reader.header();
    let channels = header.format.channels as usize;
    let mut interleaved = reader.read_all()?;

    let frames = interleaved.len() / channels;
    let mut mono = Vec::with_capacity(frames);
    for f in 0..frames {
        let mut acc = 0.0f64;
        for c in 0..channels {
            acc += interleaved[f * channels + c] as f64;
        }
        mono.push(acc / channels as f64 / 32768.0);
    }

    let processed = reduce_samples(&mono, header.format.sample_rate, config, progress.as_ref())?;

    for f in 0..frames {
        let v = (processed[f].clamp(-1.0, 1.0) * 32767.0).round() as i16;
        for c in 0..channels {
            interleaved[f * channels + c] = v;
        }
    }
    reader.overwrite_samples(&interleaved)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wav::WavWriter;
    use crate::AudioFormat;
    use std::f64::consts::PI;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic white noise in [−1, 1] · amplitude.
    struct Xorshift(u32);

    impl Xorshift {
        fn next(&mut self) -> f64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 17;
            self.0 ^= self.0 << 5;
            (self.0 as f64 / u32::MAX as f64) * 2.0 - 1.0
        }
    }

    #[test]
    fn test_config_clamps() {
        let c = ReductionConfig {
            reduction_db: 99.0,
            sensitivity: -5.0,
            freq_smoothing_bands: 40,
            profile_seconds: 0.01,
        }
        .clamped();
        assert_eq!(c.reduction_db, 24.0);
        assert_eq!(c.sensitivity, 0.0);
        assert_eq!(c.freq_smoothing_bands, 6);
        assert_eq!(c.profile_seconds, 0.5);
    }

    #[test]
    fn test_insufficient_profile() {
        let samples = vec![0.0; FFT_SIZE - 1];
        let window = hann_window(FFT_SIZE);
        assert!(matches!(
            NoiseProfile::estimate(&samples, &window),
            Err(DenoiseError::InsufficientProfile { .. })
        ));
    }

    #[test]
    fn test_threshold_scale_endpoints() {
        let profile = NoiseProfile {
            mean: vec![1.0; 3],
            std_dev: vec![0.5; 3],
        };
        // Sensitivity 0 → mean + 3σ; sensitivity 24 → mean alone.
        assert!((profile.threshold(0.0)[0] - 2.5).abs() < 1e-12);
        assert!((profile.threshold(24.0)[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_smooth_bands() {
        let gain = vec![0.0, 1.0, 0.0, 0.0, 1.0];
        let mut out = vec![0.0; 5];
        smooth_bands(&gain, 1, &mut out);
        assert!((out[0] - 0.5).abs() < 1e-12);
        assert!((out[1] - 1.0 / 3.0).abs() < 1e-12);
        assert!((out[2] - 1.0 / 3.0).abs() < 1e-12);
        assert!((out[4] - 0.5).abs() < 1e-12);

        smooth_bands(&gain, 0, &mut out);
        assert_eq!(out, gain);
    }

    #[test]
    fn test_silence_is_untouched() {
        let samples = vec![0.0f64; 44100];
        let out = reduce_samples(&samples, 44100, ReductionConfig::default(), None).unwrap();
        assert_eq!(out, samples);
    }

    #[test]
    fn test_silent_file_round_trips_exactly() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let format = AudioFormat::stereo(44100);
        let mut writer = WavWriter::create(tmp.path(), format).unwrap();
        writer.write_samples(&vec![0i16; 2 * 44100]).unwrap();
        writer.finalize().unwrap();
        let before = std::fs::read(tmp.path()).unwrap();

        reduce_file(tmp.path(), ReductionConfig::default(), None).unwrap();

        let after = std::fs::read(tmp.path()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_rejects_malformed_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"not a wav").unwrap();
        assert!(matches!(
            reduce_file(tmp.path(), ReductionConfig::default(), None),
            Err(DenoiseError::Wav(WavError::MalformedHeader(_)))
        ));
    }

    /// Band-limited amplitude around `hz` measured over one frame.
    fn band_magnitude(samples: &[f64], sample_rate: u32, lo_hz: f64, hi_hz: f64) -> f64 {
        let mut re = samples[..FFT_SIZE].to_vec();
        let mut im = vec![0.0; FFT_SIZE];
        let window = hann_window(FFT_SIZE);
        for i in 0..FFT_SIZE {
            re[i] *= window[i];
        }
        fft(&mut re, &mut im).unwrap();
        let bin_hz = sample_rate as f64 / FFT_SIZE as f64;
        let lo = (lo_hz / bin_hz).round() as usize;
        let hi = (hi_hz / bin_hz).round() as usize;
        let mut acc = 0.0;
        for k in lo..=hi {
            acc += (re[k] * re[k] + im[k] * im[k]).sqrt();
        }
        acc
    }

    #[test]
    fn test_sine_survives_noise_floor_drops() {
        // 0.5 s of pure noise, then 2 s of noise + 1 kHz tone. The tone must
        // come through nearly intact while the out-of-band floor collapses.
        let sample_rate = 44100u32;
        let sine_amp = 8000.0 / 32768.0;
        let noise_amp = 500.0 / 32768.0;
        let mut rng = Xorshift(0xDEAD_BEEF);

        let lead = (0.5 * sample_rate as f64) as usize;
        let body = 2 * sample_rate as usize;
        let mut samples = Vec::with_capacity(lead + body);
        for _ in 0..lead {
            samples.push(rng.next() * noise_amp);
        }
        for i in 0..body {
            let tone = (2.0 * PI * 1000.0 * i as f64 / sample_rate as f64).sin() * sine_amp;
            samples.push(tone + rng.next() * noise_amp);
        }

        let config = ReductionConfig {
            reduction_db: 24.0,
            sensitivity: 6.0,
            freq_smoothing_bands: 0,
            profile_seconds: 0.5,
        };
        let out = reduce_samples(&samples, sample_rate, config, None).unwrap();

        // Measure mid-body, away from edges.
        let at = lead + body / 2;
        let before_tone = band_magnitude(&samples[at..], sample_rate, 950.0, 1050.0);
        let after_tone = band_magnitude(&out[at..], sample_rate, 950.0, 1050.0);
        assert!(
            after_tone > before_tone * 0.9,
            "tone dropped: {before_tone} -> {after_tone}"
        );

        let before_noise = band_magnitude(&samples[at..], sample_rate, 4000.0, 8000.0);
        let after_noise = band_magnitude(&out[at..], sample_rate, 4000.0, 8000.0);
        // ≥ 12 dB is a factor of ~3.98 in amplitude.
        assert!(
            after_noise < before_noise / 3.98,
            "floor only {before_noise} -> {after_noise}"
        );
    }

    #[test]
    fn test_progress_reports_and_completes() {
        let samples = vec![0.0f64; 44100 * 3];
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let progress: ProgressFn = Arc::new(move |fraction| {
            assert!((0.0..=1.0).contains(&fraction));
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        reduce_samples(&samples, 44100, ReductionConfig::default(), Some(&progress)).unwrap();
        // 3 s at 44.1 kHz is ~128 frames: two interval reports plus the
        // completion report.
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_stereo_channels_equal_after_reduction() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let format = AudioFormat::stereo(8000);
        let mut writer = WavWriter::create(tmp.path(), format).unwrap();
        let mut rng = Xorshift(42);
        let frames = 8000 * 2;
        let mut interleaved = Vec::with_capacity(frames * 2);
        for _ in 0..frames {
            interleaved.push((rng.next() * 300.0) as i16);
            interleaved.push((rng.next() * 300.0) as i16);
        }
        writer.write_samples(&interleaved).unwrap();
        writer.finalize().unwrap();

        reduce_file(tmp.path(), ReductionConfig::default(), None).unwrap();

        let mut reader = WavReader::open(tmp.path()).unwrap();
        let header = *reader.header();
        assert_eq!(header.data_bytes as usize, frames * 4);
        let out = reader.read_all().unwrap();
        for f in 0..frames {
            assert_eq!(out[f * 2], out[f * 2 + 1], "frame {f}");
        }
    }
}
