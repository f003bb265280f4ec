use super::{subject_sessions, Stage, StageContext, StageInfo, TrialState};
use crate::config::CharacterizationConfig;
use crate::error::{CommandError, PreconditionFailed, SessionLogError};
use crate::processing::detectors::{choose_phase_duration, InitiationMonitor};
use crate::session::log::SessionWriter;
use crate::session::records::{Calibration, CharacterizationTrial, StageType, TrialRecord};
use crate::session::storage::CHARACTERIZATION_EXTENSION;

use rand::rngs::StdRng;

const ALREADY_CHARACTERIZED: &str = "This subject has already completed this stage. EMG Characterization data exists for this subject. This stage cannot proceed. If this is an issue, please talk to your PI.";

/// S1: records the resting EMG level of every trial that meets fixed
/// thresholds. Runs at most once per subject.
pub struct CharacterizationStage {
    config: CharacterizationConfig,
    context: StageContext,
    rng: StdRng,
    writer: Option<SessionWriter>,
    monitor: Option<InitiationMonitor>,
    state: TrialState,
    grand_means: Vec<f64>,
}

impl CharacterizationStage {
    pub fn new(config: CharacterizationConfig, context: StageContext) -> Self {
        let rng = context.rng();
        Self {
            config,
            context,
            rng,
            writer: None,
            monitor: None,
            state: TrialState::Idle,
            grand_means: Vec::new(),
        }
    }

    pub fn grand_means(&self) -> &[f64] {
        &self.grand_means
    }

    pub fn monitor(&self) -> Option<&InitiationMonitor> {
        self.monitor.as_ref()
    }

    fn calibration(&self) -> Calibration {
        let initiation = &self.config.initiation;
        Calibration {
            initiation_min_uv: self.config.initiation_min_uv,
            initiation_max_uv: self.config.initiation_max_uv,
            phase_min_ms: initiation.phase_min_ms as i32,
            phase_max_ms: initiation.phase_max_ms as i32,
            bin_duration_ms: initiation.bin_duration_ms as i32,
        }
    }

    fn setup_trial(&mut self) {
        let duration_ms = choose_phase_duration(&mut self.rng, &self.config.initiation);
        log::debug!("{}: monitoring phase {} ms", self.config.stage_name, duration_ms);
        self.monitor = Some(InitiationMonitor::new(&self.config.initiation, duration_ms));
        self.state = TrialState::AwaitingInitiation;
    }
}

impl Stage for CharacterizationStage {
    fn info(&self) -> StageInfo {
        StageInfo {
            name: self.config.stage_name.clone(),
            description: self.config.stage_description.clone(),
            stage_type: StageType::EmgCharacterization,
        }
    }

    fn initialize(&mut self, subject_id: &str) -> Result<(), PreconditionFailed> {
        self.state = TrialState::Idle;
        self.monitor = None;
        self.grand_means.clear();

        let existing = subject_sessions(&self.context.storage, subject_id, CHARACTERIZATION_EXTENSION)?;
        if !existing.is_empty() {
            log::info!(
                "Subject {} already has characterization data: {}",
                subject_id,
                existing[0].display()
            );
            return Err(PreconditionFailed(ALREADY_CHARACTERIZED.to_string()));
        }

        let info = self.info();
        let calibration = self.calibration();
        let writer =
            self.context
                .open_session(subject_id, CHARACTERIZATION_EXTENSION, &info, Some(calibration))?;
        self.writer = Some(writer);
        Ok(())
    }

    fn process(&mut self, chunk: &[f64]) {
        if self.writer.is_none() {
            return;
        }
        if self.state == TrialState::Idle {
            self.setup_trial();
        }

        let Some(monitor) = self.monitor.as_mut() else {
            return;
        };
        monitor.push(chunk);
        if !monitor.should_initiate(self.config.initiation_min_uv, self.config.initiation_max_uv) {
            return;
        }

        let trial = CharacterizationTrial {
            trial_datetime: self.context.clock.wall(),
            grand_mean: monitor.grand_mean(),
            bins: monitor.bins().to_vec(),
            monitored_signal: monitor.rectified().to_vec(),
        };
        self.state = TrialState::Finalizing;

        self.grand_means.push(trial.grand_mean);
        self.context
            .persist(self.writer.as_mut(), &TrialRecord::Characterization(trial));
        self.context
            .notify(format!("Trial {} initiated", self.grand_means.len()));

        self.state = TrialState::Idle;
    }

    fn input(&mut self, command: &str) -> Result<(), CommandError> {
        log::debug!("{} ignores command '{}'", self.config.stage_name, command);
        Err(CommandError::Unsupported)
    }

    fn finalize(&mut self) -> Result<(), SessionLogError> {
        if let Some(mut writer) = self.writer.take() {
            writer.close()?;
            log::info!(
                "{} finished with {} trials",
                self.config.stage_name,
                self.grand_means.len()
            );
        }
        self.monitor = None;
        self.state = TrialState::Idle;
        Ok(())
    }

    fn trial_state(&self) -> TrialState {
        self.state
    }

    fn trial_count(&self) -> usize {
        self.grand_means.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::stages::testing::{self, feed_until};
    use crate::session::log::SessionData;

    #[test]
    fn trial_fires_once_window_is_full_and_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let (context, harness) = testing::context(dir.path());
        let mut stage = CharacterizationStage::new(CharacterizationConfig::default(), context);
        stage.initialize("rat7").unwrap();

        let chunks = feed_until(&mut stage, &harness, -20.0, 100, |s| s.trial_count() == 1).unwrap();
        // 2200..2700 ms of 50 ms chunks
        assert!((44..=54).contains(&chunks), "{}", chunks);
        assert_eq!(stage.trial_state(), TrialState::Idle);
        assert_eq!(stage.grand_means(), &[20.0]);
        assert_eq!(harness.messages.texts(), vec!["Trial 1 initiated".to_string()]);

        stage.finalize().unwrap();

        let path = &stage.context.storage.find_sessions("rat7", "hrs1").unwrap()[0];
        let data = SessionData::read(path).unwrap();
        assert_eq!(data.header.stage_name, "S1");
        assert_eq!(data.header.calibration.unwrap().initiation_max_uv, 300.0);
        assert_eq!(data.trials.len(), 1);
        match &data.trials[0] {
            TrialRecord::Characterization(t) => {
                assert_eq!(t.grand_mean, 20.0);
                assert_eq!(t.monitored_signal.len(), chunks * 250);
                assert!(t.monitored_signal.iter().all(|&v| v == 20.0));
            }
            other => panic!("unexpected trial {:?}", other),
        }
    }

    #[test]
    fn quiet_signal_never_initiates() {
        let dir = tempfile::tempdir().unwrap();
        let (context, harness) = testing::context(dir.path());
        let mut stage = CharacterizationStage::new(CharacterizationConfig::default(), context);
        stage.initialize("rat7").unwrap();

        assert!(feed_until(&mut stage, &harness, 3.0, 200, |s| s.trial_count() > 0).is_none());
        assert_eq!(stage.trial_state(), TrialState::AwaitingInitiation);
    }

    #[test]
    fn second_session_for_a_subject_is_refused() {
        let dir = tempfile::tempdir().unwrap();

        let (context, _) = testing::context(dir.path());
        let mut first = CharacterizationStage::new(CharacterizationConfig::default(), context);
        first.initialize("rat7").unwrap();
        first.finalize().unwrap();

        let (context, _) = testing::context(dir.path());
        let mut second = CharacterizationStage::new(CharacterizationConfig::default(), context);
        let err = second.initialize("rat7").unwrap_err();
        assert_eq!(err.0, ALREADY_CHARACTERIZED);

        let (context, _) = testing::context(dir.path());
        let mut other = CharacterizationStage::new(CharacterizationConfig::default(), context);
        assert!(other.initialize("rat8").is_ok());
    }

    #[test]
    fn commands_are_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let (context, _) = testing::context(dir.path());
        let mut stage = CharacterizationStage::new(CharacterizationConfig::default(), context);
        assert_eq!(stage.input("lb = 3"), Err(CommandError::Unsupported));
    }
}
