use super::{Stage, StageContext, StageInfo, TrialState};
use crate::config::ConditioningConfig;
use crate::error::{CommandError, PreconditionFailed, SessionLogError};
use crate::session::log::SessionWriter;
use crate::session::records::{ConditioningTrial, StageType, TrialRecord};
use crate::session::storage::CONDITIONING_EXTENSION;
use crate::stream::TtlEvent;

use std::thread;
use std::time::{Duration, Instant};

const NO_STIMULATORS: &str = "No stimulators are configured for this stage. This stage cannot proceed.";
const BAD_INTERVAL: &str = "The stimulation interval must be greater than zero. This stage cannot proceed.";

/// Paired stimulation on a fixed schedule. Each pairing fires every configured
/// stimulator in order and is logged as one trial. The stage completes on its
/// own once the session duration or trial limit is reached.
pub struct ConditioningStage {
    config: ConditioningConfig,
    context: StageContext,
    writer: Option<SessionWriter>,
    started: Option<Instant>,
    next_pairing: Option<Instant>,
    trials: Vec<ConditioningTrial>,
    complete: bool,
    state: TrialState,
}

impl ConditioningStage {
    pub fn new(config: ConditioningConfig, context: StageContext) -> Self {
        Self {
            config,
            context,
            writer: None,
            started: None,
            next_pairing: None,
            trials: Vec::new(),
            complete: false,
            state: TrialState::Idle,
        }
    }

    pub fn trials(&self) -> &[ConditioningTrial] {
        &self.trials
    }

    fn session_length(&self) -> Duration {
        Duration::from_secs_f64((self.config.duration_min * 60.0).max(0.0))
    }

    fn limit_reached(&self, elapsed: Duration) -> bool {
        elapsed >= self.session_length()
            || self
                .config
                .max_trials
                .map_or(false, |max| self.trials.len() >= max)
    }

    fn finish(&mut self) {
        self.complete = true;
        self.state = TrialState::Idle;
        self.context
            .notify(format!("{} complete.", self.config.stage_name));
    }

    fn fire_pairing(&mut self, trial_number: u32) {
        let gap = Duration::from_millis(self.config.pairing_gap_ms);
        let indices = self.config.stim_indices.clone();
        for (n, index) in indices.into_iter().enumerate() {
            if n > 0 && !gap.is_zero() {
                thread::sleep(gap);
            }
            if self.context.with_stimulator("trigger", |s| s.trigger(index)) {
                self.context.mark_stimulus(TtlEvent {
                    event_id: trial_number,
                    event_channel: index as u32 + 1,
                });
            }
        }
    }
}

impl Stage for ConditioningStage {
    fn info(&self) -> StageInfo {
        StageInfo {
            name: self.config.stage_name.clone(),
            description: self.config.stage_description.clone(),
            stage_type: StageType::Conditioning,
        }
    }

    fn initialize(&mut self, subject_id: &str) -> Result<(), PreconditionFailed> {
        self.state = TrialState::Idle;
        self.trials.clear();
        self.complete = false;
        self.started = None;
        self.next_pairing = None;

        if self.config.stim_indices.is_empty() {
            return Err(PreconditionFailed(NO_STIMULATORS.to_string()));
        }
        if self.config.interval_sec.is_nan() || self.config.interval_sec <= 0.0 {
            return Err(PreconditionFailed(BAD_INTERVAL.to_string()));
        }

        let info = self.info();
        let writer = self
            .context
            .open_session(subject_id, CONDITIONING_EXTENSION, &info, None)?;
        self.writer = Some(writer);

        let amplitude = self.config.amplitude_ma;
        for index in self.config.stim_indices.clone() {
            self.context
                .with_stimulator("configure", |s| s.configure_pulse(index, amplitude));
        }

        let now = self.context.clock.now();
        self.started = Some(now);
        self.next_pairing = Some(now);
        self.state = TrialState::AwaitingInitiation;
        self.context
            .notify(format!("Beginning: {}", self.config.stage_name));
        Ok(())
    }

    fn process(&mut self, chunk: &[f64]) {
        if self.writer.is_none() || self.complete {
            return;
        }
        let (Some(started), Some(next_pairing)) = (self.started, self.next_pairing) else {
            return;
        };

        let now = self.context.clock.now();
        let elapsed = now.saturating_duration_since(started);
        if self.limit_reached(elapsed) {
            self.finish();
            return;
        }
        if now < next_pairing {
            return;
        }

        let trial_number = self.trials.len() as u32 + 1;
        self.fire_pairing(trial_number);

        let trial = ConditioningTrial {
            trial_datetime: self.context.clock.wall(),
            trial_index: trial_number as i32,
            elapsed_s: elapsed.as_secs_f64(),
            samples: if self.config.record_chunk {
                chunk.to_vec()
            } else {
                Vec::new()
            },
        };
        self.context
            .persist(self.writer.as_mut(), &TrialRecord::Conditioning(trial.clone()));
        self.context.notify(format!(
            "Trial {}: Stim indices {:?} triggered at {:.2} sec",
            trial_number, self.config.stim_indices, trial.elapsed_s
        ));
        self.trials.push(trial);

        self.next_pairing = Some(next_pairing + Duration::from_secs_f64(self.config.interval_sec));
    }

    fn input(&mut self, command: &str) -> Result<(), CommandError> {
        log::debug!("{} ignores command '{}'", self.config.stage_name, command);
        Err(CommandError::Unsupported)
    }

    fn finalize(&mut self) -> Result<(), SessionLogError> {
        if let Some(mut writer) = self.writer.take() {
            writer.close()?;
            log::info!(
                "{} finished with {} pairings",
                self.config.stage_name,
                self.trials.len()
            );
        }
        self.state = TrialState::Idle;
        Ok(())
    }

    fn trial_state(&self) -> TrialState {
        self.state
    }

    fn trial_count(&self) -> usize {
        self.trials.len()
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::stages::testing::{self, feed_until};
    use crate::processing::triggers::StimulatorCall;
    use crate::session::log::SessionData;

    fn quick(config: ConditioningConfig) -> ConditioningConfig {
        ConditioningConfig {
            pairing_gap_ms: 0,
            ..config
        }
    }

    #[test]
    fn pairings_follow_the_interval_until_the_session_ends() {
        let dir = tempfile::tempdir().unwrap();
        let (context, harness) = testing::context(dir.path());
        let config = quick(ConditioningConfig {
            interval_sec: 1.0,
            duration_min: 0.05,
            ..ConditioningConfig::default()
        });
        let mut stage = ConditioningStage::new(config, context);
        stage.initialize("rat9").unwrap();

        // 3 s of 50 ms chunks; pairings at 0, 1 and 2 s.
        let chunks = feed_until(&mut stage, &harness, 1.0, 200, |s| s.is_complete()).unwrap();
        assert_eq!(chunks, 61);
        assert_eq!(stage.trial_count(), 3);
        let elapsed: Vec<f64> = stage.trials().iter().map(|t| t.elapsed_s).collect();
        assert_eq!(elapsed, vec![0.0, 1.0, 2.0]);

        let triggers: Vec<StimulatorCall> = harness
            .stimulator
            .calls()
            .into_iter()
            .filter(|c| matches!(c, StimulatorCall::Trigger(_)))
            .collect();
        assert_eq!(triggers.len(), 6);
        assert_eq!(&triggers[..2], &[StimulatorCall::Trigger(0), StimulatorCall::Trigger(1)]);

        let texts = harness.messages.texts();
        assert_eq!(texts[0], "Beginning: S3");
        assert_eq!(texts[1], "Trial 1: Stim indices [0, 1] triggered at 0.00 sec");
        assert_eq!(texts.last().unwrap(), "S3 complete.");

        // No more pairings once complete.
        stage.process(&[1.0; 250]);
        assert_eq!(stage.trial_count(), 3);
    }

    #[test]
    fn initialize_configures_every_listed_stimulator() {
        let dir = tempfile::tempdir().unwrap();
        let (context, harness) = testing::context(dir.path());
        let mut stage = ConditioningStage::new(quick(ConditioningConfig::default()), context);
        stage.initialize("rat9").unwrap();

        assert_eq!(
            harness.stimulator.calls(),
            vec![
                StimulatorCall::ConfigurePulse(0, 0.8),
                StimulatorCall::ConfigurePulse(1, 0.8)
            ]
        );
        assert_eq!(stage.trial_state(), TrialState::AwaitingInitiation);
    }

    #[test]
    fn latency_preset_stops_at_the_trial_limit_and_keeps_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (context, harness) = testing::context(dir.path());
        let config = quick(ConditioningConfig {
            interval_sec: 0.1,
            ..ConditioningConfig::f_wave_latency()
        });
        let mut stage = ConditioningStage::new(config, context);
        stage.initialize("rat9").unwrap();

        feed_until(&mut stage, &harness, 4.0, 100, |s| s.is_complete()).unwrap();
        assert_eq!(stage.trial_count(), 10);
        assert!(harness
            .stimulator
            .calls()
            .iter()
            .all(|c| matches!(c, StimulatorCall::Trigger(1) | StimulatorCall::ConfigurePulse(1, _))));
        stage.finalize().unwrap();

        let path = &stage
            .context
            .storage
            .find_sessions("rat9", CONDITIONING_EXTENSION)
            .unwrap()[0];
        let data = SessionData::read(path).unwrap();
        assert_eq!(data.header.stage_type, StageType::Conditioning);
        assert_eq!(data.header.stage_name, "S0a");
        assert!(data.header.calibration.is_none());
        assert_eq!(data.trials.len(), 10);
        match &data.trials[9] {
            TrialRecord::Conditioning(t) => {
                assert_eq!(t.trial_index, 10);
                assert_eq!(t.samples, vec![4.0; 250]);
            }
            other => panic!("unexpected trial {:?}", other),
        }
    }

    #[test]
    fn missing_stimulators_or_interval_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (context, _) = testing::context(dir.path());
        let mut stage = ConditioningStage::new(
            ConditioningConfig {
                stim_indices: Vec::new(),
                ..ConditioningConfig::default()
            },
            context,
        );
        assert_eq!(stage.initialize("rat9").unwrap_err().0, NO_STIMULATORS);

        let (context, _) = testing::context(dir.path());
        let mut stage = ConditioningStage::new(
            ConditioningConfig {
                interval_sec: 0.0,
                ..ConditioningConfig::default()
            },
            context,
        );
        assert_eq!(stage.initialize("rat9").unwrap_err().0, BAD_INTERVAL);
        assert!(stage
            .context
            .storage
            .find_sessions("rat9", CONDITIONING_EXTENSION)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn each_trigger_is_marked() {
        let dir = tempfile::tempdir().unwrap();
        let (mut context, _harness) = testing::context(dir.path());
        let (markers, marker_rx) = crossbeam_channel::unbounded();
        context.markers = Some(markers);
        let mut stage = ConditioningStage::new(quick(ConditioningConfig::default()), context);
        stage.initialize("rat9").unwrap();

        stage.process(&[0.0; 250]);
        assert_eq!(
            marker_rx.try_iter().collect::<Vec<_>>(),
            vec![
                TtlEvent {
                    event_id: 1,
                    event_channel: 1
                },
                TtlEvent {
                    event_id: 1,
                    event_channel: 2
                }
            ]
        );
    }
}
