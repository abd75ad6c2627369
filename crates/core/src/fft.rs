//! In-place iterative radix-2 Cooley–Tukey FFT and Hann window.
//!
//! Operates on two parallel `f64` slices (real, imaginary) whose length must
//! be a power of two. The inverse transform scales by `1/N`, so
//! `ifft(fft(x)) == x` up to rounding.

use std::f64::consts::PI;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FftError {
    /// Transform length is zero or not a power of two.
    #[error("FFT length {0} is not a power of two")]
    InvalidLength(usize),
    /// Real and imaginary slices differ in length.
    #[error("real/imaginary length mismatch: {re} vs {im}")]
    LengthMismatch { re: usize, im: usize },
}

/// Forward transform, in place.
pub fn fft(re: &mut [f64], im: &mut [f64]) -> Result<(), FftError> {
    transform(re, im, false)
}

/// Inverse transform, in place. Outputs are divided by `N`.
pub fn ifft(re: &mut [f64], im: &mut [f64]) -> Result<(), FftError> {
    transform(re, im, true)
}

fn transform(re: &mut [f64], im: &mut [f64], inverse: bool) -> Result<(), FftError> {
    let n = re.len();
    if im.len() != n {
        return Err(FftError::LengthMismatch { re: n, im: im.len() });
    }
    if n == 0 || !n.is_power_of_two() {
        return Err(FftError::InvalidLength(n));
    }

    // Bit-reversal permutation.
    let mut j = 0usize;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            re.swap(i, j);
            im.swap(i, j);
        }
    }

    // log2(N) butterfly passes. The twiddle factor advances by the
    // recurrence w ← w · (cos θ + j sin θ) within each group.
    let mut size = 2;
    while size <= n {
        let theta = if inverse {
            2.0 * PI / size as f64
        } else {
            -2.0 * PI / size as f64
        };
        let (step_re, step_im) = (theta.cos(), theta.sin());
        let half = size / 2;
        for start in (0..n).step_by(size) {
            let mut w_re = 1.0f64;
            let mut w_im = 0.0f64;
            for k in 0..half {
                let even = start + k;
                let odd = even + half;
                let t_re = w_re * re[odd] - w_im * im[odd];
                let t_im = w_re * im[odd] + w_im * re[odd];
                re[odd] = re[even] - t_re;
                im[odd] = im[even] - t_im;
                re[even] += t_re;
                im[even] += t_im;
                let next_re = w_re * step_re - w_im * step_im;
                w_im = w_re * step_im + w_im * step_re;
                w_re = next_re;
            }
        }
        size <<= 1;
    }

    if inverse {
        let scale = 1.0 / n as f64;
        for v in re.iter_mut() {
            *v *= scale;
        }
        for v in im.iter_mut() {
            *v *= scale;
        }
    }
    Ok(())
}

/// Hann window of length `n`: `w[i] = 0.5 · (1 − cos(2π·i/(n−1)))`.
pub fn hann_window(n: usize) -> Vec<f64> {
    if n < 2 {
        return vec![0.0; n];
    }
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / (n - 1) as f64).cos()))
        .collect()
}
