use super::FilterInstance;
use crate::error::ConditionerError;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BandPassFilterConfig {
    pub id: String,
    pub order: usize,
    pub f_low: f64,
    pub f_high: f64,
}

impl Default for BandPassFilterConfig {
    fn default() -> Self {
        Self {
            id: "emg".to_string(),
            order: 2,
            f_low: 100.0,
            f_high: 1000.0,
        }
    }
}

// SECOND ORDER SECTION --------------------------------------------------------

/// One biquad in transposed direct form II, normalised so `a[0] == 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct SecondOrderFilter {
    pub b: [f64; 3],
    pub a: [f64; 3],
    z: [f64; 2],
}

impl SecondOrderFilter {
    pub fn new(b: [f64; 3], a: [f64; 3]) -> Self {
        Self { b, a, z: [0.0; 2] }
    }

    fn calculate_output(&mut self, input: f64) -> f64 {
        let output = self.b[0] * input + self.z[0];
        self.z[0] = self.b[1] * input - self.a[1] * output + self.z[1];
        self.z[1] = self.b[2] * input - self.a[2] * output;
        output
    }

    /// State reached after an infinitely long unit step.
    fn step_response_state(&self) -> [f64; 2] {
        let [b0, b1, b2] = self.b;
        let [_, a1, a2] = self.a;
        let rhs0 = b1 - a1 * b0;
        let rhs1 = b2 - a2 * b0;
        let det = 1.0 + a1 + a2;
        [(rhs0 + rhs1) / det, ((1.0 + a1) * rhs1 - a2 * rhs0) / det]
    }

    fn dc_gain(&self) -> f64 {
        self.b.iter().sum::<f64>() / self.a.iter().sum::<f64>()
    }
}

// BAND PASS FILTER ------------------------------------------------------------

/// Digital Butterworth band-pass as a cascade of second-order sections.
///
/// Section state persists across calls to `process_chunk`, so feeding a
/// signal in pieces gives the same output as feeding it whole.
pub struct BandPassFilter {
    config: BandPassFilterConfig,
    sections: Vec<SecondOrderFilter>,
}

impl BandPassFilter {
    pub fn new(config: BandPassFilterConfig, fs: f64) -> Result<Self, ConditionerError> {
        let sections = butterworth_bandpass(config.order, config.f_low, config.f_high, fs)?;
        let mut filter = BandPassFilter { config, sections };
        filter.reset();
        Ok(filter)
    }

    pub fn sections(&self) -> &[SecondOrderFilter] {
        &self.sections
    }

    /// Complex response at `freq` Hz for sample rate `fs`.
    pub fn frequency_response(&self, freq: f64, fs: f64) -> Complex64 {
        let z_inv = Complex64::from_polar(1.0, -2.0 * PI * freq / fs);
        self.sections.iter().fold(Complex64::new(1.0, 0.0), |acc, s| {
            let num = s.b[0] + z_inv * (s.b[1] + z_inv * s.b[2]);
            let den = s.a[0] + z_inv * (s.a[1] + z_inv * s.a[2]);
            acc * num / den
        })
    }
}

impl FilterInstance for BandPassFilter {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn process_chunk(&mut self, input: &[f64]) -> Vec<f64> {
        input
            .iter()
            .map(|&x| {
                self.sections
                    .iter_mut()
                    .fold(x, |sample, section| section.calculate_output(sample))
            })
            .collect()
    }

    /// Steady-state step response initial conditions, each section scaled by
    /// the DC gain of the sections before it.
    fn reset(&mut self) {
        let mut scale = 1.0;
        for section in &mut self.sections {
            let zi = section.step_response_state();
            section.z = [scale * zi[0], scale * zi[1]];
            scale *= section.dc_gain();
        }
    }
}

// DESIGN ----------------------------------------------------------------------

/// Butterworth band-pass sections: analog prototype, band-pass transform,
/// pre-warped bilinear transform, then conjugate pole pairing.
pub fn butterworth_bandpass(
    order: usize,
    f_low: f64,
    f_high: f64,
    fs: f64,
) -> Result<Vec<SecondOrderFilter>, ConditionerError> {
    if order == 0 {
        return Err(ConditionerError::InvalidDesign("order must be at least 1".into()));
    }
    if !(fs > 0.0 && f_low > 0.0 && f_low < f_high && f_high < fs / 2.0) {
        return Err(ConditionerError::InvalidDesign(format!(
            "need 0 < f_low < f_high < fs/2, got {} / {} at fs {}",
            f_low, f_high, fs
        )));
    }

    // Bilinear transform with a normalised sample rate of 2 (fs2 = 4).
    let fs2 = 4.0;
    let warp = |f: f64| fs2 * (PI * f / fs).tan();
    let (w1, w2) = (warp(f_low), warp(f_high));
    let bw = w2 - w1;
    let wo = (w1 * w2).sqrt();

    let n = order as i32;
    let mut analog_poles = Vec::with_capacity(2 * order);
    for m in (-n + 1..n).step_by(2) {
        let prototype = -Complex64::from_polar(1.0, PI * m as f64 / (2.0 * n as f64));
        let scaled = prototype * (bw / 2.0);
        let offset = (scaled * scaled - wo * wo).sqrt();
        analog_poles.push(scaled + offset);
        analog_poles.push(scaled - offset);
    }

    // Analog zeros: `order` at the origin. They map to z = 1 and the extra
    // `order` zeros land at z = -1.
    let analog_gain = bw.powi(n);
    let four = Complex64::new(fs2, 0.0);
    let denom: Complex64 = analog_poles.iter().map(|p| four - p).product();
    let gain = analog_gain * (four.powi(n) / denom).re;

    let digital_poles: Vec<Complex64> = analog_poles
        .iter()
        .map(|p| (four + p) / (four - p))
        .collect();

    // Poles nearest the unit circle go last.
    let mut denominators = pair_poles(&digital_poles);
    denominators.sort_by(|x, y| x[2].partial_cmp(&y[2]).unwrap_or(std::cmp::Ordering::Equal));

    let mut sections: Vec<SecondOrderFilter> = denominators
        .into_iter()
        .map(|a| SecondOrderFilter::new([1.0, 0.0, -1.0], a))
        .collect();

    if sections.len() != order {
        return Err(ConditionerError::InvalidDesign(format!(
            "expected {} sections, paired {}",
            order,
            sections.len()
        )));
    }

    if let Some(first) = sections.first_mut() {
        for coefficient in first.b.iter_mut() {
            *coefficient *= gain;
        }
    }

    Ok(sections)
}

/// Groups poles into quadratic denominators `[1, -(p1 + p2), p1 * p2]`.
fn pair_poles(poles: &[Complex64]) -> Vec<[f64; 3]> {
    const REAL_TOLERANCE: f64 = 1e-12;
    let mut quadratics = Vec::new();
    let mut reals = Vec::new();

    for p in poles {
        if p.im.abs() <= REAL_TOLERANCE * p.norm().max(1.0) {
            reals.push(p.re);
        } else if p.im > 0.0 {
            quadratics.push([1.0, -2.0 * p.re, p.norm_sqr()]);
        }
    }

    reals.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
    for pair in reals.chunks(2) {
        match pair {
            [p1, p2] => quadratics.push([1.0, -(p1 + p2), p1 * p2]),
            [p] => quadratics.push([1.0, -p, 0.0]),
            _ => {}
        }
    }

    quadratics
}

#[cfg(test)]
mod tests {
    use super::*;

    fn design(order: usize) -> BandPassFilter {
        let config = BandPassFilterConfig {
            order,
            ..BandPassFilterConfig::default()
        };
        BandPassFilter::new(config, 5000.0).unwrap()
    }

    #[test]
    fn band_edges_sit_at_half_power() {
        for order in [1, 2, 3, 4] {
            let filter = design(order);
            assert_eq!(filter.sections().len(), order);

            let low = filter.frequency_response(100.0, 5000.0).norm();
            let high = filter.frequency_response(1000.0, 5000.0).norm();
            assert!((low - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-9, "order {} low {}", order, low);
            assert!((high - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-9, "order {} high {}", order, high);
        }
    }

    #[test]
    fn rejects_dc_and_nyquist() {
        let filter = design(2);
        assert!(filter.frequency_response(0.0, 5000.0).norm() < 1e-12);
        assert!(filter.frequency_response(2500.0, 5000.0).norm() < 1e-12);
        let centre = (100.0f64 * 1000.0).sqrt();
        assert!(filter.frequency_response(centre, 5000.0).norm() > 0.95);
    }

    #[test]
    fn sections_are_stable() {
        for section in design(4).sections() {
            // Poles inside the unit circle: |p|^2 = a2 < 1 for complex pairs.
            assert!(section.a[2].abs() < 1.0);
        }
    }

    #[test]
    fn chunked_filtering_matches_single_pass() {
        let signal: Vec<f64> = (0..3000)
            .map(|i| {
                let t = i as f64 / 5000.0;
                (2.0 * PI * 60.0 * t).sin() * 40.0 + (2.0 * PI * 400.0 * t).sin() * 15.0 + (i % 7) as f64
            })
            .collect();

        let mut whole = design(2);
        let expected = whole.process_chunk(&signal);

        let mut chunked = design(2);
        let mut actual = Vec::with_capacity(signal.len());
        for chunk in signal.chunks(97) {
            actual.extend(chunked.process_chunk(chunk));
        }

        assert_eq!(expected.len(), actual.len());
        for (e, a) in expected.iter().zip(&actual) {
            assert!((e - a).abs() < 1e-9);
        }
    }

    #[test]
    fn reset_starts_in_steady_state_for_a_unit_step() {
        let mut filter = design(2);
        let out = filter.process_chunk(&vec![1.0; 200]);
        // A band-pass settles to zero on a constant input; steady-state
        // initial conditions mean there is no start-up transient.
        assert!(out.iter().all(|y| y.abs() < 1e-9));
    }

    #[test]
    fn invalid_cutoffs_are_rejected() {
        let config = BandPassFilterConfig {
            f_low: 1000.0,
            f_high: 100.0,
            ..BandPassFilterConfig::default()
        };
        assert!(matches!(
            BandPassFilter::new(config, 5000.0),
            Err(ConditionerError::InvalidDesign(_))
        ));
    }
}
