//! Motor-imagery EEG simulator with event-related desynchronisation

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Temporal shape of the amplitude drop during an ERD event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErdShape {
    /// Smooth dip, deepest at the middle of the event
    SquaredSineHalfwave,
    /// Full drop for the whole event
    Rectangular,
}

impl ErdShape {
    /// Fraction of the rhythm suppressed at `phase` in [0, 1] of the event
    pub fn depth_at(&self, phase: f64) -> f64 {
        if !(0.0..=1.0).contains(&phase) {
            return 0.0;
        }
        match self {
            ErdShape::SquaredSineHalfwave => (PI * phase).sin().powi(2),
            ErdShape::Rectangular => 1.0,
        }
    }
}

/// Configuration of the simulated recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErdConfig {
    pub channels: Vec<String>,
    pub sampling_rate: f64,
    /// Sensorimotor rhythm frequency in Hz
    pub f_smr: f64,
    pub amplitude_smr: f64,
    pub amplitude_noise: f64,
    /// Duration of one ERD event in seconds
    pub erd_length: f64,
    pub erd_shape: ErdShape,
    pub seed: u64,
}

impl Default for ErdConfig {
    fn default() -> Self {
        Self {
            channels: ["C3", "CZ", "C4"].map(String::from).to_vec(),
            sampling_rate: 512.0,
            f_smr: 11.0,
            amplitude_smr: 2.0,
            amplitude_noise: 1.0,
            erd_length: 4.0,
            erd_shape: ErdShape::SquaredSineHalfwave,
            seed: 0,
        }
    }
}

/// Rhythm on every channel, suppressed on a channel while an event runs on it
pub struct ErdSimulator {
    config: ErdConfig,
    rng: StdRng,
    noise: Option<Normal<f64>>,
    sample_index: u64,
    /// Start sample of the running event, per channel
    events: Vec<Option<u64>>,
}

impl ErdSimulator {
    pub fn new(config: ErdConfig) -> Self {
        let noise = Normal::new(0.0, config.amplitude_noise)
            .ok()
            .filter(|_| config.amplitude_noise > 0.0);
        ErdSimulator {
            rng: StdRng::seed_from_u64(config.seed),
            events: vec![None; config.channels.len()],
            noise,
            sample_index: 0,
            config,
        }
    }

    pub fn config(&self) -> &ErdConfig {
        &self.config
    }

    /// Seconds generated so far
    pub fn elapsed(&self) -> f64 {
        self.sample_index as f64 / self.config.sampling_rate
    }

    /// Start an ERD on `channel` at the next generated sample
    pub fn trigger(&mut self, channel: &str) -> bool {
        match self.config.channels.iter().position(|c| c == channel) {
            Some(index) => {
                self.events[index] = Some(self.sample_index);
                true
            }
            None => false,
        }
    }

    /// Next `n` samples as `(channels, samples)` rows
    pub fn generate(&mut self, n: usize) -> Vec<Vec<f64>> {
        let fs = self.config.sampling_rate;
        let event_samples = (self.config.erd_length * fs).max(1.0);
        let mut rows = vec![Vec::with_capacity(n); self.config.channels.len()];
        for i in 0..n {
            let index = self.sample_index + i as u64;
            let rhythm = (2.0 * PI * self.config.f_smr * index as f64 / fs).sin();
            for (row, event) in rows.iter_mut().zip(self.events.iter_mut()) {
                let depth = match *event {
                    Some(start) => {
                        let phase = (index - start) as f64 / event_samples;
                        if phase > 1.0 {
                            *event = None;
                        }
                        self.config.erd_shape.depth_at(phase)
                    }
                    None => 0.0,
                };
                let noise = match &self.noise {
                    Some(normal) => normal.sample(&mut self.rng),
                    None => 0.0,
                };
                row.push(self.config.amplitude_smr * (1.0 - depth) * rhythm + noise);
            }
        }
        self.sample_index += n as u64;
        rows
    }
}
