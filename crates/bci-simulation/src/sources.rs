//! Seeded synthetic signal sources

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;

/// Gaussian noise generator, zero noise when `std` is not positive
struct Gaussian {
    rng: StdRng,
    normal: Option<Normal<f64>>,
}

impl Gaussian {
    fn new(std: f64, seed: u64) -> Self {
        Gaussian {
            rng: StdRng::seed_from_u64(seed),
            normal: Normal::new(0.0, std).ok().filter(|_| std > 0.0),
        }
    }

    fn sample(&mut self) -> f64 {
        match &self.normal {
            Some(normal) => normal.sample(&mut self.rng),
            None => 0.0,
        }
    }
}

/// One sinusoid per channel plus white Gaussian noise
pub struct SineSource {
    sampling_rate: f64,
    frequencies: Vec<f64>,
    amplitude: f64,
    noise: Gaussian,
    sample_index: u64,
}

impl SineSource {
    /// One output channel per entry of `frequencies`
    pub fn new(sampling_rate: f64, frequencies: Vec<f64>, amplitude: f64, noise_std: f64, seed: u64) -> Self {
        SineSource {
            sampling_rate,
            frequencies,
            amplitude,
            noise: Gaussian::new(noise_std, seed),
            sample_index: 0,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.frequencies.len()
    }

    pub fn set_amplitude(&mut self, amplitude: f64) {
        self.amplitude = amplitude;
    }

    /// Next `n` samples as `(channels, samples)` rows, continuing in time
    pub fn generate(&mut self, n: usize) -> Vec<Vec<f64>> {
        let mut rows = vec![Vec::with_capacity(n); self.frequencies.len()];
        for i in 0..n {
            let t = (self.sample_index + i as u64) as f64 / self.sampling_rate;
            for (row, f) in rows.iter_mut().zip(&self.frequencies) {
                row.push(self.amplitude * (2.0 * PI * f * t).sin() + self.noise.sample());
            }
        }
        self.sample_index += n as u64;
        rows
    }
}

/// White Gaussian noise on every channel
pub struct NoiseSource {
    channels: usize,
    noise: Gaussian,
}

impl NoiseSource {
    pub fn new(channels: usize, std: f64, seed: u64) -> Self {
        NoiseSource {
            channels,
            noise: Gaussian::new(std, seed),
        }
    }

    pub fn generate(&mut self, n: usize) -> Vec<Vec<f64>> {
        (0..self.channels)
            .map(|_| (0..n).map(|_| self.noise.sample()).collect())
            .collect()
    }
}

/// Samples discarded so the AR recursion forgets its zero start
const AR_BURN_IN: usize = 500;

/// Stationary AR(p) process `x[n] = sum(coeffs[i] * x[n-1-i]) + e[n]`, unit-variance `e`
pub fn ar_process(coeffs: &[f64], n: usize, seed: u64) -> Vec<f64> {
    let mut noise = Gaussian::new(1.0, seed);
    let total = n + AR_BURN_IN;
    let mut x = Vec::with_capacity(total);
    for t in 0..total {
        let past: f64 = coeffs
            .iter()
            .enumerate()
            .filter(|(i, _)| *i < t)
            .map(|(i, c)| c * x[t - 1 - i])
            .sum();
        x.push(past + noise.sample());
    }
    x.split_off(AR_BURN_IN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sine_continues_in_time() {
        let mut whole = SineSource::new(100.0, vec![5.0, 10.0], 1.0, 0.0, 1);
        let mut parts = SineSource::new(100.0, vec![5.0, 10.0], 1.0, 0.0, 1);
        let reference = whole.generate(30);
        let first = parts.generate(10);
        let second = parts.generate(20);
        assert_eq!(reference.len(), 2);
        for ch in 0..2 {
            let joined: Vec<f64> = first[ch].iter().chain(&second[ch]).copied().collect();
            for (a, b) in joined.iter().zip(&reference[ch]) {
                assert!((a - b).abs() < 1e-12);
            }
        }
        // quarter period of 5 Hz at 100 Hz
        assert!((reference[0][5] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let a = NoiseSource::new(3, 2.0, 42).generate(1000);
        let b = NoiseSource::new(3, 2.0, 42).generate(1000);
        assert_eq!(a, b);
        let var = a[0].iter().map(|v| v * v).sum::<f64>() / 1000.0;
        assert!((var - 4.0).abs() < 0.6);
    }

    #[test]
    fn test_ar_process_follows_recursion_statistics() {
        let x = ar_process(&[0.9], 20_000, 3);
        assert_eq!(x.len(), 20_000);
        let var = x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64;
        // AR(1) variance 1 / (1 - a^2)
        assert!((var - 1.0 / (1.0 - 0.81)).abs() < 0.6);
        let lag1 = x.windows(2).map(|w| w[0] * w[1]).sum::<f64>() / (x.len() - 1) as f64;
        assert!((lag1 / var - 0.9).abs() < 0.03);
    }
}
