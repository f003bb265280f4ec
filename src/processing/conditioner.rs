use super::filters::bandpass::BandPassFilter;
use super::filters::FilterInstance;
use crate::config::ConditionerConfig;
use crate::error::ConditionerError;
use crate::stream::frame::Frame;

// SIGNAL CONDITIONER ----------------------------------------------------------

/// Differential subtraction followed by a stateful band-pass.
pub struct SignalConditioner {
    config: ConditionerConfig,
    filter: Box<dyn FilterInstance>,
}

impl SignalConditioner {
    pub fn new(config: ConditionerConfig) -> Result<Self, ConditionerError> {
        let filter = BandPassFilter::new(config.bandpass.clone(), config.fs)?;
        log::info!(
            "Conditioner: channel {} - channel {}, filter '{}' {}-{} Hz order {} at {} Hz",
            config.channel_b,
            config.channel_a,
            config.bandpass.id,
            config.bandpass.f_low,
            config.bandpass.f_high,
            config.bandpass.order,
            config.fs
        );
        Ok(Self {
            config,
            filter: Box::new(filter),
        })
    }

    /// Uses an already-built filter in place of the configured band-pass.
    pub fn with_filter(config: ConditionerConfig, filter: Box<dyn FilterInstance>) -> Self {
        Self { config, filter }
    }

    pub fn config(&self) -> &ConditionerConfig {
        &self.config
    }

    /// Filters `channel_b - channel_a`. Unequal lengths are rejected before
    /// any state is touched.
    pub fn condition(
        &mut self,
        channel_a: &[f64],
        channel_b: &[f64],
    ) -> Result<Vec<f64>, ConditionerError> {
        if channel_a.len() != channel_b.len() {
            return Err(ConditionerError::ChannelMismatch {
                a: channel_a.len(),
                b: channel_b.len(),
            });
        }

        let differential: Vec<f64> = channel_a
            .iter()
            .zip(channel_b)
            .map(|(a, b)| b - a)
            .collect();
        Ok(self.filter.process_chunk(&differential))
    }

    /// Conditions the configured channel pair of a frame. `None` when the
    /// frame lacks either channel.
    pub fn condition_frame(&mut self, frame: &Frame) -> Option<Result<Vec<f64>, ConditionerError>> {
        let a = frame.channel(self.config.channel_a)?;
        let b = frame.channel(self.config.channel_b)?;

        let a: Vec<f64> = a.samples.iter().map(|&s| s as f64).collect();
        let b: Vec<f64> = b.samples.iter().map(|&s| s as f64).collect();
        Some(self.condition(&a, &b))
    }

    /// Back to the filter's steady-state initial condition.
    pub fn reset(&mut self) {
        self.filter.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::frame::ChannelBlock;

    struct Passthrough;

    impl FilterInstance for Passthrough {
        fn id(&self) -> &str {
            "passthrough"
        }

        fn process_chunk(&mut self, input: &[f64]) -> Vec<f64> {
            input.to_vec()
        }

        fn reset(&mut self) {}
    }

    fn block(channel_index: usize, samples: Vec<f32>) -> ChannelBlock {
        ChannelBlock {
            channel_index,
            sample_count: samples.len(),
            sample_rate: 5000.0,
            stream_name: "example_data".to_string(),
            samples,
        }
    }

    #[test]
    fn differential_is_b_minus_a() {
        let mut conditioner =
            SignalConditioner::with_filter(ConditionerConfig::default(), Box::new(Passthrough));

        let out = conditioner
            .condition(&[1.0, 2.0, 3.0], &[4.0, 2.0, -1.0])
            .unwrap();

        assert_eq!(out, vec![3.0, 0.0, -4.0]);
    }

    #[test]
    fn unequal_channels_are_rejected() {
        let mut conditioner = SignalConditioner::new(ConditionerConfig::default()).unwrap();

        assert_eq!(
            conditioner.condition(&[0.0; 4], &[0.0; 3]),
            Err(ConditionerError::ChannelMismatch { a: 4, b: 3 })
        );
    }

    #[test]
    fn chunked_conditioning_matches_single_call() {
        let signal_a: Vec<f64> = (0..1000).map(|i| (i as f64 * 0.11).sin()).collect();
        let signal_b: Vec<f64> = (0..1000)
            .map(|i| (i as f64 * 0.37).cos() * 20.0 + (i as f64 * 0.11).sin())
            .collect();

        let mut whole = SignalConditioner::new(ConditionerConfig::default()).unwrap();
        let expected = whole.condition(&signal_a, &signal_b).unwrap();

        let mut chunked = SignalConditioner::new(ConditionerConfig::default()).unwrap();
        let mut actual = Vec::new();
        for (a, b) in signal_a.chunks(73).zip(signal_b.chunks(73)) {
            actual.extend(chunked.condition(a, b).unwrap());
        }

        assert_eq!(actual.len(), expected.len());
        for (x, y) in actual.iter().zip(&expected) {
            assert!((x - y).abs() < 1e-9);
        }
    }

    #[test]
    fn frame_without_both_channels_is_skipped() {
        let mut conditioner =
            SignalConditioner::with_filter(ConditionerConfig::default(), Box::new(Passthrough));
        let frame = Frame {
            timestamp: 0,
            sample_id: 0,
            receipt_time_ms: 0,
            channel_blocks: vec![block(0, vec![1.0, 1.0])],
        };
        assert!(conditioner.condition_frame(&frame).is_none());

        let frame = Frame {
            channel_blocks: vec![block(0, vec![1.0, 1.0]), block(1, vec![3.5, 0.5])],
            ..frame
        };
        assert_eq!(
            conditioner.condition_frame(&frame),
            Some(Ok(vec![2.5, -0.5]))
        );
    }
}
