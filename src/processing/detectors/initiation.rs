use crate::config::InitiationConfig;

use rand::Rng;

/// Draws a monitoring-phase length in ms, uniform over the configured range
/// and rounded to the nearest granularity step (ties to even).
pub fn choose_phase_duration<R: Rng + ?Sized>(rng: &mut R, config: &InitiationConfig) -> u32 {
    let (lo, hi) = if config.phase_min_ms <= config.phase_max_ms {
        (config.phase_min_ms, config.phase_max_ms)
    } else {
        (config.phase_max_ms, config.phase_min_ms)
    };
    let drawn = rng.gen_range(lo..=hi);

    let step = config.phase_granularity_ms.max(1);
    let steps = (drawn as f64 / step as f64).round_ties_even();
    steps as u32 * step
}

// INITIATION MONITOR ----------------------------------------------------------

/// Rolling window watched for trial initiation.
///
/// Both buffers start zero-filled at the target length and are trimmed from
/// the front, so they always hold the most recent `target_sample_count`
/// samples. Bins are recomputed in full on every chunk.
#[derive(Debug, Clone)]
pub struct InitiationMonitor {
    duration_ms: u32,
    bin_sample_count: usize,
    target_sample_count: usize,
    signed: Vec<f64>,
    rectified: Vec<f64>,
    bins: Vec<f64>,
    grand_mean: f64,
    samples_seen: usize,
}

impl InitiationMonitor {
    pub fn new(config: &InitiationConfig, duration_ms: u32) -> Self {
        let target_sample_count = config.samples_for_ms(duration_ms);
        let bin_count = (duration_ms / config.bin_duration_ms.max(1)) as usize;
        Self {
            duration_ms,
            bin_sample_count: config.bin_sample_count(),
            target_sample_count,
            signed: vec![0.0; target_sample_count],
            rectified: vec![0.0; target_sample_count],
            bins: vec![0.0; bin_count],
            grand_mean: 0.0,
            samples_seen: 0,
        }
    }

    pub fn push(&mut self, chunk: &[f64]) {
        self.samples_seen += chunk.len();
        self.signed.extend_from_slice(chunk);
        self.rectified.extend(chunk.iter().map(|x| x.abs()));

        let excess = self.signed.len().saturating_sub(self.target_sample_count);
        if excess > 0 {
            self.signed.drain(..excess);
            self.rectified.drain(..excess);
        }

        self.rebin();
    }

    fn rebin(&mut self) {
        let len = self.rectified.len();
        for (i, bin) in self.bins.iter_mut().enumerate() {
            let start = (self.bin_sample_count * i).min(len);
            let end = (self.bin_sample_count * (i + 1)).min(len);
            let slice = &self.rectified[start..end];
            *bin = if slice.is_empty() {
                0.0
            } else {
                slice.iter().sum::<f64>() / slice.len() as f64
            };
        }

        self.grand_mean = if self.bins.is_empty() {
            0.0
        } else {
            self.bins.iter().sum::<f64>() / self.bins.len() as f64
        };
    }

    /// At least a full window of real samples has been seen.
    pub fn is_primed(&self) -> bool {
        self.samples_seen >= self.target_sample_count
    }

    pub fn should_initiate(&self, min_threshold: f64, max_threshold: f64) -> bool {
        self.is_primed() && self.grand_mean >= min_threshold && self.grand_mean <= max_threshold
    }

    /// The most recent bin's worth of signed samples.
    pub fn pre_trial_tail(&self) -> Vec<f64> {
        let start = self.signed.len().saturating_sub(self.bin_sample_count);
        self.signed[start..].to_vec()
    }

    pub fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    pub fn target_sample_count(&self) -> usize {
        self.target_sample_count
    }

    pub fn samples_seen(&self) -> usize {
        self.samples_seen
    }

    pub fn grand_mean(&self) -> f64 {
        self.grand_mean
    }

    pub fn bins(&self) -> &[f64] {
        &self.bins
    }

    pub fn rectified(&self) -> &[f64] {
        &self.rectified
    }

    pub fn signed(&self) -> &[f64] {
        &self.signed
    }
}
