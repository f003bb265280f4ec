/// Number of histogram bins shown to the operator.
pub const HISTOGRAM_BIN_COUNT: usize = 10;

/// Summary of a characterization session's trial grand means. Seeds and
/// bounds the recruitment thresholds; read-only once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDistribution {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    pub n: usize,
    /// 25th, 50th and 75th percentiles.
    pub quartiles: [f64; 3],
    /// Width of the first percentile: `p01 - min`.
    pub step_size_one_percent: f64,
    pub histogram_values: Vec<u64>,
    pub histogram_edges: Vec<f64>,
}

impl ReferenceDistribution {
    /// `None` for an empty or non-finite sample.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len();
        let min = sorted[0];
        let max = sorted[n - 1];
        let mean = sorted.iter().sum::<f64>() / n as f64;
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;

        let (histogram_values, histogram_edges) = histogram(&sorted, min, max, HISTOGRAM_BIN_COUNT);

        Some(Self {
            min,
            max,
            mean,
            std_dev: variance.sqrt(),
            n,
            quartiles: [
                quantile(&sorted, 0.25),
                quantile(&sorted, 0.50),
                quantile(&sorted, 0.75),
            ],
            step_size_one_percent: quantile(&sorted, 0.01) - min,
            histogram_values,
            histogram_edges,
        })
    }
}

/// Linear interpolation between closest ranks. `sorted` must be non-empty.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Equal-width bins over `[min, max]`, the last bin closed on the right.
/// A degenerate range is widened by half a unit each side.
fn histogram(values: &[f64], min: f64, max: f64, bins: usize) -> (Vec<u64>, Vec<f64>) {
    let (lo, hi) = if min == max {
        (min - 0.5, max + 0.5)
    } else {
        (min, max)
    };
    let width = hi - lo;

    let edges: Vec<f64> = (0..=bins)
        .map(|i| lo + width * i as f64 / bins as f64)
        .collect();

    let mut counts = vec![0u64; bins];
    for &v in values {
        let mut index = (((v - lo) * bins as f64 / width).floor() as usize).min(bins - 1);
        if index > 0 && v < edges[index] {
            index -= 1;
        } else if index + 1 < bins && v >= edges[index + 1] {
            index += 1;
        }
        counts[index] += 1;
    }
    (counts, edges)
}
