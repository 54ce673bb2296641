//! IIR filter design: order selection, prototype, band transform, SOS cascade
//!
//! Design happens once at construction. The result is a cascade of
//! second-order sections plus the steady-state initial-condition template
//! used to suppress start-up transients.

use bci_core::{BspError, BspResult};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Band type of the designed filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BandType {
    Lowpass,
    Highpass,
    Bandpass,
    Bandstop,
}

/// Analog prototype family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prototype {
    /// Maximally flat passband
    Butter,
    /// Equiripple passband (Chebyshev type I)
    Cheby1,
}

/// A band edge: one frequency for low/highpass, two for band filters (Hz)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Edge {
    Single(f64),
    Band([f64; 2]),
}

impl Edge {
    fn values(&self) -> Vec<f64> {
        match self {
            Edge::Single(f) => vec![*f],
            Edge::Band(b) => b.to_vec(),
        }
    }
}

/// Design-time filter parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub sampling_rate: f64,
    pub order: usize,
    pub band: BandType,
    pub prototype: Prototype,
    pub fpass: Edge,
    pub fstop: Edge,
    /// Maximum passband loss (dB), also the Chebyshev ripple
    pub gpass: f64,
    /// Minimum stopband attenuation (dB)
    pub gstop: f64,
}

/// One biquad: `b0 + b1 z^-1 + b2 z^-2` over `1 + a1 z^-1 + a2 z^-2`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sos {
    pub b: [f64; 3],
    pub a: [f64; 3],
}

impl Sos {
    fn from_roots(zeros: &[Complex64], poles: &[Complex64]) -> Self {
        Sos {
            b: poly2(zeros),
            a: poly2(poles),
        }
    }

    /// Steady-state delay line for a unit step input (transposed direct form II)
    fn step_state(&self) -> [f64; 2] {
        let [b0, b1, b2] = self.b;
        let [_, a1, a2] = self.a;
        let r0 = b1 - a1 * b0;
        let r1 = b2 - a2 * b0;
        let z0 = (r0 + r1) / (1.0 + a1 + a2);
        [z0, r1 - a2 * z0]
    }

    fn dc_gain(&self) -> f64 {
        self.b.iter().sum::<f64>() / self.a.iter().sum::<f64>()
    }

    fn response(&self, w: f64) -> Complex64 {
        let e1 = Complex64::from_polar(1.0, -w);
        let e2 = e1 * e1;
        (self.b[0] + e1 * self.b[1] + e2 * self.b[2]) / (self.a[0] + e1 * self.a[1] + e2 * self.a[2])
    }
}

/// Realised filter: SOS cascade plus its initial-condition template
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDesign {
    pub sections: Vec<Sos>,
    /// Per-section state reached by a unit DC input
    pub zi: Vec<[f64; 2]>,
    /// Minimum order meeting the pass/stop specification
    pub min_order: usize,
    /// Corner frequencies actually used (Hz)
    pub corners: Vec<f64>,
    sampling_rate: f64,
}

impl FilterDesign {
    /// Magnitude response at `n` evenly spaced frequencies from 0 to Nyquist
    pub fn frequency_response(&self, n: usize) -> Vec<(f64, f64)> {
        let n = n.max(2);
        (0..n)
            .map(|i| {
                let freq = self.sampling_rate / 2.0 * i as f64 / (n - 1) as f64;
                (freq, self.magnitude_at(freq))
            })
            .collect()
    }

    /// Magnitude response at `freq` Hz
    pub fn magnitude_at(&self, freq: f64) -> f64 {
        let w = 2.0 * PI * freq / self.sampling_rate;
        self.sections
            .iter()
            .fold(Complex64::new(1.0, 0.0), |h, s| h * s.response(w))
            .norm()
    }
}

/// Design the filter described by `spec`
pub fn design(spec: &FilterSpec) -> BspResult<FilterDesign> {
    validate(spec)?;
    let fs = spec.sampling_rate;
    // pre-warped edges, tan(pi * f / fs)
    let mut passb: Vec<f64> = spec.fpass.values().iter().map(|f| (PI * f / fs).tan()).collect();
    let stopb: Vec<f64> = spec.fstop.values().iter().map(|f| (PI * f / fs).tan()).collect();

    if spec.band == BandType::Bandstop {
        optimize_bandstop_edges(&mut passb, &stopb, spec)?;
    }

    let nat = natural_ratio(spec.band, &passb, &stopb);
    if !(nat.is_finite() && nat > 1.0) {
        return Err(BspError::config(format!(
            "pass/stop edges {:?}/{:?} cannot be satisfied",
            spec.fpass, spec.fstop
        )));
    }
    let min_order = order_estimate(spec.prototype, nat, spec.gpass, spec.gstop).ceil().max(1.0) as usize;

    // corners in the pre-warped domain
    let warped_corners = match spec.prototype {
        Prototype::Cheby1 => passb.clone(),
        Prototype::Butter => butter_natural(spec.band, &passb, min_order, spec.gpass),
    };
    let corners: Vec<f64> = warped_corners.iter().map(|w| w.atan() * fs / PI).collect();
    if corners.iter().any(|c| !(c.is_finite() && *c > 0.0 && *c < fs / 2.0)) {
        return Err(BspError::config(format!("corner frequencies {:?} out of range", corners)));
    }

    let (z, p, k) = match spec.prototype {
        Prototype::Butter => butter_prototype(spec.order),
        Prototype::Cheby1 => cheby1_prototype(spec.order, spec.gpass),
    };

    // bilinear transform is done with an internal rate of 2, so warped = 4 tan(pi f / fs)
    let warped: Vec<f64> = warped_corners.iter().map(|w| 4.0 * w).collect();
    let (z, p, k) = match spec.band {
        BandType::Lowpass => lp_to_lp(&z, &p, k, warped[0]),
        BandType::Highpass => lp_to_hp(&z, &p, k, warped[0]),
        BandType::Bandpass => {
            let (wo, bw) = ((warped[0] * warped[1]).sqrt(), warped[1] - warped[0]);
            lp_to_bp(&z, &p, k, wo, bw)
        }
        BandType::Bandstop => {
            let (wo, bw) = ((warped[0] * warped[1]).sqrt(), warped[1] - warped[0]);
            lp_to_bs(&z, &p, k, wo, bw)
        }
    };
    let (z, p, k) = bilinear(&z, &p, k, 2.0);

    let sections = zpk_to_sos(&z, &p, k);
    let mut zi = Vec::with_capacity(sections.len());
    let mut scale = 1.0;
    for section in &sections {
        let state = section.step_state();
        zi.push([scale * state[0], scale * state[1]]);
        scale *= section.dc_gain();
    }

    Ok(FilterDesign {
        sections,
        zi,
        min_order,
        corners,
        sampling_rate: fs,
    })
}

fn validate(spec: &FilterSpec) -> BspResult<()> {
    let fs = spec.sampling_rate;
    if !(fs.is_finite() && fs > 0.0) {
        return Err(BspError::config("sampling rate must be positive"));
    }
    if spec.order == 0 {
        return Err(BspError::config("filter order must be > 0"));
    }
    if !(spec.gpass > 0.0 && spec.gstop > spec.gpass) {
        return Err(BspError::config(format!(
            "require 0 < gpass < gstop, got gpass={} gstop={}",
            spec.gpass, spec.gstop
        )));
    }

    let (wp, ws) = (spec.fpass.values(), spec.fstop.values());
    let nyquist = fs / 2.0;
    if wp.iter().chain(ws.iter()).any(|f| !(*f > 0.0 && *f < nyquist)) {
        return Err(BspError::config(format!(
            "edge frequencies must lie in (0, {}) Hz",
            nyquist
        )));
    }

    let ordered = match (spec.band, spec.fpass, spec.fstop) {
        (BandType::Lowpass, Edge::Single(p), Edge::Single(s)) => p < s,
        (BandType::Highpass, Edge::Single(p), Edge::Single(s)) => s < p,
        (BandType::Bandpass, Edge::Band(p), Edge::Band(s)) => s[0] < p[0] && p[0] < p[1] && p[1] < s[1],
        (BandType::Bandstop, Edge::Band(p), Edge::Band(s)) => p[0] < s[0] && s[0] < s[1] && s[1] < p[1],
        _ => {
            return Err(BspError::config(format!(
                "{:?} needs {} pass and stop edges",
                spec.band,
                if matches!(spec.band, BandType::Lowpass | BandType::Highpass) { "single" } else { "two-element" }
            )))
        }
    };
    if !ordered {
        return Err(BspError::config(format!(
            "pass edges {:?} and stop edges {:?} are inconsistent with {:?}",
            spec.fpass, spec.fstop, spec.band
        )));
    }
    Ok(())
}

fn natural_ratio(band: BandType, passb: &[f64], stopb: &[f64]) -> f64 {
    match band {
        BandType::Lowpass => stopb[0] / passb[0],
        BandType::Highpass => passb[0] / stopb[0],
        BandType::Bandstop => stopb
            .iter()
            .map(|s| (s * (passb[0] - passb[1]) / (s * s - passb[0] * passb[1])).abs())
            .fold(f64::INFINITY, f64::min),
        BandType::Bandpass => stopb
            .iter()
            .map(|s| ((s * s - passb[0] * passb[1]) / (s * (passb[0] - passb[1]))).abs())
            .fold(f64::INFINITY, f64::min),
    }
}

fn order_estimate(prototype: Prototype, nat: f64, gpass: f64, gstop: f64) -> f64 {
    let gs = 10f64.powf(0.1 * gstop);
    let gp = 10f64.powf(0.1 * gpass);
    match prototype {
        Prototype::Butter => ((gs - 1.0) / (gp - 1.0)).log10() / (2.0 * nat.log10()),
        Prototype::Cheby1 => ((gs - 1.0) / (gp - 1.0)).sqrt().acosh() / nat.acosh(),
    }
}

/// Move the band-stop passband edges towards the stopband as far as the order allows
fn optimize_bandstop_edges(passb: &mut [f64], stopb: &[f64], spec: &FilterSpec) -> BspResult<()> {
    let objective = |wp: f64, ind: usize, passb: &[f64]| {
        let mut candidate = passb.to_vec();
        candidate[ind] = wp;
        let nat = natural_ratio(BandType::Bandstop, &candidate, stopb);
        order_estimate(spec.prototype, nat, spec.gpass, spec.gstop)
    };

    let snapshot = passb.to_vec();
    passb[0] = fminbound(|wp| objective(wp, 0, &snapshot), snapshot[0], stopb[0] - 1e-12);
    let snapshot = passb.to_vec();
    passb[1] = fminbound(|wp| objective(wp, 1, &snapshot), stopb[1] + 1e-12, snapshot[1]);

    if passb.iter().any(|p| !p.is_finite()) {
        return Err(BspError::config("band-stop edge optimisation diverged"));
    }
    Ok(())
}

/// Bounded scalar minimisation by golden-section search
fn fminbound<F: Fn(f64) -> f64>(f: F, lower: f64, upper: f64) -> f64 {
    const XTOL: f64 = 1e-5;
    let ratio = (5f64.sqrt() - 1.0) / 2.0;
    let (mut a, mut b) = (lower, upper);
    let mut c = b - ratio * (b - a);
    let mut d = a + ratio * (b - a);
    let (mut fc, mut fd) = (f(c), f(d));
    for _ in 0..500 {
        if (b - a).abs() < XTOL {
            break;
        }
        // NaN objective values count as worse than any finite one
        if fc < fd || fd.is_nan() {
            b = d;
            d = c;
            fd = fc;
            c = b - ratio * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + ratio * (b - a);
            fd = f(d);
        }
    }
    (a + b) / 2.0
}

/// Butterworth natural frequency for the minimum order (pre-warped domain)
fn butter_natural(band: BandType, passb: &[f64], order: usize, gpass: f64) -> Vec<f64> {
    let gp = 10f64.powf(0.1 * gpass);
    let w0 = (gp - 1.0).powf(-1.0 / (2.0 * order as f64));
    let mut wn = match band {
        BandType::Lowpass => vec![w0 * passb[0]],
        BandType::Highpass => vec![passb[0] / w0],
        BandType::Bandstop => {
            let diff = passb[1] - passb[0];
            let discr = (diff * diff + 4.0 * w0 * w0 * passb[0] * passb[1]).sqrt();
            vec![
                ((diff + discr) / (2.0 * w0)).abs(),
                ((diff - discr) / (2.0 * w0)).abs(),
            ]
        }
        BandType::Bandpass => {
            let diff = passb[1] - passb[0];
            [-w0, w0]
                .iter()
                .map(|w| (-w * diff / 2.0 + (w * w / 4.0 * diff * diff + passb[0] * passb[1]).sqrt()).abs())
                .collect()
        }
    };
    wn.sort_by(f64::total_cmp);
    wn
}

type Zpk = (Vec<Complex64>, Vec<Complex64>, f64);

fn butter_prototype(order: usize) -> Zpk {
    let n = order as f64;
    let poles = (0..order)
        .map(|i| {
            let m = -(n - 1.0) + 2.0 * i as f64;
            -Complex64::from_polar(1.0, PI * m / (2.0 * n))
        })
        .collect();
    (Vec::new(), poles, 1.0)
}

fn cheby1_prototype(order: usize, ripple_db: f64) -> Zpk {
    let n = order as f64;
    let eps = (10f64.powf(0.1 * ripple_db) - 1.0).sqrt();
    let mu = (1.0 / eps).asinh() / n;
    let poles: Vec<Complex64> = (0..order)
        .map(|i| {
            let m = -(n - 1.0) + 2.0 * i as f64;
            let theta = PI * m / (2.0 * n);
            -Complex64::new(mu, theta).sinh()
        })
        .collect();
    let mut k = poles.iter().fold(Complex64::new(1.0, 0.0), |acc, p| acc * -p).re;
    if order % 2 == 0 {
        k /= (1.0 + eps * eps).sqrt();
    }
    (Vec::new(), poles, k)
}

fn prod_neg(roots: &[Complex64]) -> Complex64 {
    roots.iter().fold(Complex64::new(1.0, 0.0), |acc, r| acc * -r)
}

fn lp_to_lp(z: &[Complex64], p: &[Complex64], k: f64, wo: f64) -> Zpk {
    let degree = p.len() - z.len();
    (
        z.iter().map(|r| r * wo).collect(),
        p.iter().map(|r| r * wo).collect(),
        k * wo.powi(degree as i32),
    )
}

fn lp_to_hp(z: &[Complex64], p: &[Complex64], k: f64, wo: f64) -> Zpk {
    let degree = p.len() - z.len();
    let mut zeros: Vec<Complex64> = z.iter().map(|r| wo / r).collect();
    zeros.extend(std::iter::repeat(Complex64::new(0.0, 0.0)).take(degree));
    let poles = p.iter().map(|r| wo / r).collect();
    (zeros, poles, k * (prod_neg(z) / prod_neg(p)).re)
}

fn split_band(roots: &[Complex64], wo: f64) -> Vec<Complex64> {
    let upper = roots.iter().map(|r| r + (r * r - wo * wo).sqrt());
    let lower = roots.iter().map(|r| r - (r * r - wo * wo).sqrt());
    upper.chain(lower).collect()
}

fn lp_to_bp(z: &[Complex64], p: &[Complex64], k: f64, wo: f64, bw: f64) -> Zpk {
    let degree = p.len() - z.len();
    let z_lp: Vec<Complex64> = z.iter().map(|r| r * bw / 2.0).collect();
    let p_lp: Vec<Complex64> = p.iter().map(|r| r * bw / 2.0).collect();
    let mut zeros = split_band(&z_lp, wo);
    zeros.extend(std::iter::repeat(Complex64::new(0.0, 0.0)).take(degree));
    (zeros, split_band(&p_lp, wo), k * bw.powi(degree as i32))
}

fn lp_to_bs(z: &[Complex64], p: &[Complex64], k: f64, wo: f64, bw: f64) -> Zpk {
    let degree = p.len() - z.len();
    let z_hp: Vec<Complex64> = z.iter().map(|r| (bw / 2.0) / r).collect();
    let p_hp: Vec<Complex64> = p.iter().map(|r| (bw / 2.0) / r).collect();
    let mut zeros = split_band(&z_hp, wo);
    zeros.extend(std::iter::repeat(Complex64::new(0.0, wo)).take(degree));
    zeros.extend(std::iter::repeat(Complex64::new(0.0, -wo)).take(degree));
    (zeros, split_band(&p_hp, wo), k * (prod_neg(z) / prod_neg(p)).re)
}

fn bilinear(z: &[Complex64], p: &[Complex64], k: f64, fs: f64) -> Zpk {
    let degree = p.len() - z.len();
    let fs2 = 2.0 * fs;
    let mut zeros: Vec<Complex64> = z.iter().map(|r| (fs2 + r) / (fs2 - r)).collect();
    zeros.extend(std::iter::repeat(Complex64::new(-1.0, 0.0)).take(degree));
    let poles = p.iter().map(|r| (fs2 + r) / (fs2 - r)).collect();
    let num = z.iter().fold(Complex64::new(1.0, 0.0), |acc, r| acc * (fs2 - r));
    let den = p.iter().fold(Complex64::new(1.0, 0.0), |acc, r| acc * (fs2 - r));
    (zeros, poles, k * (num / den).re)
}

/// Monic real polynomial (length 3) with the given roots and their conjugates
fn poly2(roots: &[Complex64]) -> [f64; 3] {
    match roots {
        [] => [1.0, 0.0, 0.0],
        [r] => [1.0, -r.re, 0.0],
        [r1, r2] => [1.0, -(r1 + r2).re, (r1 * r2).re],
        _ => unreachable!("sections hold at most two roots"),
    }
}

/// Groups of at most two roots whose product polynomial is real
fn real_groups(roots: &[Complex64]) -> Vec<Vec<Complex64>> {
    let is_real = |r: &Complex64| r.im.abs() <= 1e-10 * r.norm().max(1.0);
    let mut groups: Vec<Vec<Complex64>> = roots
        .iter()
        .filter(|r| !is_real(r) && r.im > 0.0)
        .map(|r| vec![*r, r.conj()])
        .collect();

    let mut reals: Vec<Complex64> = roots.iter().filter(|r| is_real(r)).map(|r| Complex64::new(r.re, 0.0)).collect();
    reals.sort_by(|a, b| b.norm().total_cmp(&a.norm()));
    groups.extend(reals.chunks(2).map(|c| c.to_vec()));
    groups
}

fn distance_to_unit_circle(group: &[Complex64]) -> f64 {
    group.iter().map(|r| (1.0 - r.norm()).abs()).fold(f64::INFINITY, f64::min)
}

/// Pair poles with their nearest zeros; poles closest to the unit circle end up last
fn zpk_to_sos(z: &[Complex64], p: &[Complex64], k: f64) -> Vec<Sos> {
    let mut pole_groups = real_groups(p);
    let mut zero_groups = real_groups(z);
    pole_groups.sort_by(|a, b| distance_to_unit_circle(a).total_cmp(&distance_to_unit_circle(b)));

    let mut sections = Vec::with_capacity(pole_groups.len());
    for poles in &pole_groups {
        // same-sized groups first, then by distance
        let nearest = zero_groups
            .iter()
            .enumerate()
            .map(|(i, zeros)| (i, zeros.len() != poles.len(), (zeros[0] - poles[0]).norm()))
            .min_by(|a, b| a.1.cmp(&b.1).then(a.2.total_cmp(&b.2)))
            .map(|(i, _, _)| i);
        let zeros = nearest.map(|i| zero_groups.remove(i)).unwrap_or_default();
        sections.push(Sos::from_roots(&zeros, poles));
    }
    sections.reverse();

    if let Some(first) = sections.first_mut() {
        for b in first.b.iter_mut() {
            *b *= k;
        }
    }
    sections
}
