//! Burg autoregressive spectral estimation
//!
//! An AR model is fitted to each window from scratch with Burg's recursion,
//! converted to a one-sided PSD, and integrated over frequency bins centred
//! on a frequency of interest. Nothing is carried across calls.

use bci_core::{BspError, BspResult};
use num_complex::Complex64;
use realfft::{RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

/// Fitted autoregressive model
#[derive(Debug, Clone, PartialEq)]
pub struct ArModel {
    /// `a1..ap` of `A(z) = 1 + a1 z^-1 + ... + ap z^-p` (leading 1 omitted)
    pub coefficients: Vec<f64>,
    /// Driving-noise power after the last order
    pub error_power: f64,
    /// One reflection coefficient per order
    pub reflection: Vec<f64>,
}

impl ArModel {
    fn silent(order: usize) -> Self {
        ArModel {
            coefficients: vec![0.0; order],
            error_power: 0.0,
            reflection: vec![0.0; order],
        }
    }
}

fn check_order(n: usize, order: usize) -> BspResult<()> {
    if order == 0 || order >= n {
        return Err(BspError::config(format!(
            "AR model order must satisfy 0 < order < window length, got order {} for {} samples",
            order, n
        )));
    }
    Ok(())
}

fn instability(reason: String) -> BspError {
    BspError::AlgorithmicInstability { stage: "burg", reason }
}

/// Burg recursion on whole error vectors.
///
/// An all-zero window yields an all-zero model. A non-positive or
/// non-finite error power is reported as `AlgorithmicInstability`.
pub fn arburg_fast(x: &[f64], order: usize) -> BspResult<ArModel> {
    check_order(x.len(), order)?;
    let rho = x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64;
    if rho == 0.0 {
        return Ok(ArModel::silent(order));
    }

    let mut ef = x.to_vec();
    let mut eb = x.to_vec();
    let mut a = vec![1.0];
    let mut reflection = Vec::with_capacity(order);
    let mut error_power = rho;

    for m in 0..order {
        // forward errors drop their oldest sample, backward errors their newest
        let efp = &ef[1..];
        let ebp = &eb[..eb.len() - 1];
        let num: f64 = ebp.iter().zip(efp).map(|(b, f)| b * f).sum();
        let den: f64 = efp.iter().map(|f| f * f).sum::<f64>() + ebp.iter().map(|b| b * b).sum::<f64>();
        if !(den > 0.0 && den.is_finite()) {
            return Err(instability(format!("prediction errors vanished at order {}", m + 1)));
        }
        let k = -2.0 * num / den;

        let next_ef: Vec<f64> = efp.iter().zip(ebp).map(|(f, b)| f + k * b).collect();
        let next_eb: Vec<f64> = ebp.iter().zip(efp).map(|(b, f)| b + k * f).collect();
        ef = next_ef;
        eb = next_eb;

        a.push(0.0);
        let reversed: Vec<f64> = a.iter().rev().copied().collect();
        for (ai, ri) in a.iter_mut().zip(reversed) {
            *ai += k * ri;
        }

        error_power *= 1.0 - k * k;
        reflection.push(k);
    }

    if !(error_power > 0.0 && error_power.is_finite()) {
        return Err(instability(format!("error power {} is not positive", error_power)));
    }

    Ok(ArModel {
        coefficients: a[1..].to_vec(),
        error_power,
        reflection,
    })
}

/// Reference Burg recursion with Marple's recursive denominator, updating in place.
///
/// Slower than [`arburg_fast`]; fails as soon as the error power drops to zero
/// or below.
pub fn arburg(x: &[f64], order: usize) -> BspResult<ArModel> {
    check_order(x.len(), order)?;
    let n = x.len();
    let mut rho = x.iter().map(|v| v * v).sum::<f64>() / n as f64;
    if rho == 0.0 {
        return Ok(ArModel::silent(order));
    }
    let mut den = rho * 2.0 * n as f64;

    let mut a: Vec<f64> = Vec::with_capacity(order);
    let mut reflection = Vec::with_capacity(order);
    let mut ef = x.to_vec();
    let mut eb = x.to_vec();
    let mut temp = 1.0;

    for k in 0..order {
        let num: f64 = (k + 1..n).map(|j| ef[j] * eb[j - 1]).sum();
        den = temp * den - ef[k] * ef[k] - eb[n - 1] * eb[n - 1];
        let kp = -2.0 * num / den;

        temp = 1.0 - kp * kp;
        rho *= temp;
        if !(rho > 0.0) {
            return Err(instability(format!(
                "error power {} is not positive at order {}; decrease the order",
                rho,
                k + 1
            )));
        }

        a.push(kp);
        for j in 0..k.div_ceil(2) {
            let ap = a[j];
            a[j] = ap + kp * a[k - j - 1];
            if j != k - j - 1 {
                a[k - j - 1] += kp * ap;
            }
        }

        for j in (k + 1..n).rev() {
            let saved = ef[j];
            ef[j] = saved + kp * eb[j - 1];
            eb[j] = eb[j - 1] + kp * saved;
        }
        reflection.push(kp);
    }

    Ok(ArModel {
        coefficients: a,
        error_power: rho,
        reflection,
    })
}

/// Composite Simpson integration of equally spaced samples.
///
/// With an even number of samples the result averages the two ways of
/// closing the last interval with a trapezoid.
pub fn simpson(y: &[f64], dx: f64) -> f64 {
    let n = y.len();
    // triples (i, i+1, i+2) for i in start..stop step 2
    let basic = |start: usize, stop: usize| -> f64 {
        (start..stop)
            .step_by(2)
            .map(|i| y[i] + 4.0 * y[i + 1] + y[i + 2])
            .sum::<f64>()
            * dx
            / 3.0
    };
    match n {
        0 | 1 => 0.0,
        2 => 0.5 * dx * (y[0] + y[1]),
        n if n % 2 == 1 => basic(0, n - 2),
        n => {
            let trapezoids = 0.5 * dx * (y[n - 1] + y[n - 2]) + 0.5 * dx * (y[1] + y[0]);
            let simpsons = basic(0, n - 3) + basic(1, n - 2);
            (trapezoids + simpsons) / 2.0
        }
    }
}

/// Whether binned power is reported as is or square-rooted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    #[default]
    Amplitude,
    Power,
}

/// Binned-spectrum parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurgSpectrumSettings {
    pub sampling_rate: f64,
    /// Centre frequency of interest (Hz)
    #[serde(default = "default_foi")]
    pub foi: f64,
    #[serde(default = "default_nbins")]
    pub nbins: usize,
    /// Bin width (Hz)
    #[serde(default = "default_bin_width")]
    pub bin_width: f64,
    /// PSD evaluations per bin, sets the FFT length
    #[serde(default = "default_evals_per_bin")]
    pub evals_per_bin: usize,
    #[serde(default)]
    pub output_type: OutputType,
    /// Defaults to `round(sampling_rate / 10)`
    #[serde(default)]
    pub model_order: Option<usize>,
}

fn default_foi() -> f64 {
    11.0
}

fn default_nbins() -> usize {
    1
}

fn default_bin_width() -> f64 {
    3.0
}

fn default_evals_per_bin() -> usize {
    15
}

impl BurgSpectrumSettings {
    pub fn new(sampling_rate: f64, foi: f64) -> Self {
        BurgSpectrumSettings {
            sampling_rate,
            foi,
            nbins: default_nbins(),
            bin_width: default_bin_width(),
            evals_per_bin: default_evals_per_bin(),
            output_type: OutputType::default(),
            model_order: None,
        }
    }

    pub fn model_order(&self) -> usize {
        self.model_order
            .unwrap_or_else(|| (self.sampling_rate / 10.0).round() as usize)
    }
}

/// Binned Burg spectrum with a pre-planned FFT
pub struct SpectrumEstimator {
    settings: BurgSpectrumSettings,
    nfft: usize,
    fres: f64,
    start_freq: f64,
    fft: Arc<dyn RealToComplex<f64>>,
}

impl fmt::Debug for SpectrumEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumEstimator")
            .field("settings", &self.settings)
            .field("nfft", &self.nfft)
            .field("fres", &self.fres)
            .finish()
    }
}

impl SpectrumEstimator {
    pub fn new(settings: BurgSpectrumSettings) -> BspResult<Self> {
        let fs = settings.sampling_rate;
        if !(fs > 0.0 && settings.bin_width > 0.0) || settings.nbins == 0 || settings.evals_per_bin == 0 {
            return Err(BspError::config(format!(
                "spectrum needs positive sampling_rate, bin_width, nbins and evals_per_bin: {:?}",
                settings
            )));
        }
        let order = settings.model_order();
        if order == 0 {
            return Err(BspError::config("AR model order must be > 0"));
        }

        let nfft = (fs / (settings.bin_width / settings.evals_per_bin as f64)) as usize;
        if nfft < order + 1 {
            return Err(BspError::config(format!(
                "FFT length {} cannot hold an AR polynomial of order {}",
                nfft, order
            )));
        }

        let start_freq = settings.foi - (settings.nbins / 2) as f64 * settings.bin_width - settings.bin_width / 2.0;
        let fft = RealFftPlanner::<f64>::new().plan_fft_forward(nfft);
        Ok(SpectrumEstimator {
            fres: fs / nfft as f64,
            nfft,
            start_freq,
            fft,
            settings,
        })
    }

    pub fn settings(&self) -> &BurgSpectrumSettings {
        &self.settings
    }

    pub fn nfft(&self) -> usize {
        self.nfft
    }

    /// Centre frequency of every bin
    pub fn center_frequencies(&self) -> Vec<f64> {
        let first = self.start_freq + self.settings.bin_width / 2.0;
        (0..self.settings.nbins)
            .map(|n| first + n as f64 * self.settings.bin_width)
            .collect()
    }

    /// Calibrated one-sided PSD of an AR model on the `k * fres` grid
    pub fn ar_to_psd(&self, model: &ArModel) -> BspResult<Vec<f64>> {
        if model.coefficients.len() >= self.nfft {
            return Err(BspError::config(format!(
                "FFT length {} cannot hold an AR polynomial of order {}",
                self.nfft,
                model.coefficients.len()
            )));
        }
        let mut denominator = self.fft.make_input_vec();
        denominator[0] = 1.0;
        denominator[1..=model.coefficients.len()].copy_from_slice(&model.coefficients);
        let mut spectrum: Vec<Complex64> = self.fft.make_output_vec();
        self.fft
            .process(&mut denominator, &mut spectrum)
            .map_err(|e| instability(e.to_string()))?;

        let fs = self.settings.sampling_rate;
        let calibration = 2.0 * (2.0 * PI).powi(2) / self.fres;
        Ok(spectrum
            .iter()
            .map(|d| model.error_power / fs / d.norm_sqr() * calibration)
            .collect())
    }

    /// Spectrum of one window, one value per bin
    pub fn estimate(&self, signal: &[f64]) -> BspResult<Vec<f64>> {
        let model = arburg_fast(signal, self.settings.model_order())?;
        let psd = self.ar_to_psd(&model)?;
        let freqs: Vec<f64> = (0..psd.len()).map(|k| k as f64 * self.fres).collect();

        let integrate = |keep: &dyn Fn(f64) -> bool| -> f64 {
            let values: Vec<f64> = psd
                .iter()
                .zip(&freqs)
                .filter(|(_, f)| keep(**f))
                .map(|(p, _)| *p)
                .collect();
            simpson(&values, self.fres)
        };

        let width = self.settings.bin_width;
        let mut output: Vec<f64> = (0..self.settings.nbins)
            .map(|n| {
                let low = self.start_freq + n as f64 * width;
                let high = low + width;
                integrate(&|f| f >= low && f <= high)
            })
            .collect();

        // mirror of the negative frequencies covered by the lowest bin
        if self.start_freq < 0.0 {
            let mirrored = self.start_freq.abs();
            output[0] += integrate(&|f| f <= mirrored);
        }

        if self.settings.output_type == OutputType::Amplitude {
            for value in output.iter_mut() {
                *value = value.sqrt();
            }
        }
        Ok(output)
    }
}
