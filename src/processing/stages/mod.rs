pub mod characterization;
pub mod conditioning;
pub mod recruitment;

pub use characterization::CharacterizationStage;
pub use conditioning::ConditioningStage;
pub use recruitment::RecruitmentCurveStage;

use crate::config::{ConditioningConfig, Config};
use crate::error::{CommandError, PreconditionFailed, SessionLogError, TriggerError};
use crate::processing::triggers::Stimulator;
use crate::session::log::SessionWriter;
use crate::session::message::{NotificationSink, SessionMessage};
use crate::session::records::{Calibration, SessionHeader, StageType, TrialRecord, FILE_VERSION};
use crate::session::storage::SessionStorage;
use crate::stream::TtlEvent;
use crate::utils::clock::Clock;

use crossbeam_channel::Sender;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialState {
    Idle,
    AwaitingInitiation,
    Recording,
    Finalizing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageInfo {
    pub name: String,
    pub description: String,
    pub stage_type: StageType,
}

// STAGE -----------------------------------------------------------------------

/// One session's trial state machine, fed conditioned chunks in order.
pub trait Stage {
    fn info(&self) -> StageInfo;

    /// Checks preconditions and opens the session file. On failure nothing is
    /// written and the stage may be initialized again.
    fn initialize(&mut self, subject_id: &str) -> Result<(), PreconditionFailed>;

    fn process(&mut self, chunk: &[f64]);

    fn input(&mut self, command: &str) -> Result<(), CommandError>;

    /// Flushes and closes the session file.
    fn finalize(&mut self) -> Result<(), SessionLogError>;

    fn trial_state(&self) -> TrialState;

    fn trial_count(&self) -> usize;

    /// Whether the stage has finished on its own and the session can stop.
    fn is_complete(&self) -> bool {
        false
    }
}

// CONTEXT ---------------------------------------------------------------------

/// Everything a stage needs from the outside world, handed over at
/// construction.
pub struct StageContext {
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn NotificationSink>,
    pub stimulator: Option<Box<dyn Stimulator>>,
    pub storage: SessionStorage,
    /// Fixed seed for reproducible phase durations and amplitude order.
    pub seed: Option<u64>,
    /// Where stimulation markers go to be stamped into the acquisition record.
    pub markers: Option<Sender<TtlEvent>>,
}

impl StageContext {
    pub fn notify<S: Into<String>>(&self, text: S) {
        self.notifier.notify(SessionMessage::new(self.clock.wall(), text));
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Creates the next session file for `subject_id` and writes its header.
    fn open_session(
        &self,
        subject_id: &str,
        extension: &str,
        info: &StageInfo,
        calibration: Option<Calibration>,
    ) -> Result<SessionWriter, PreconditionFailed> {
        let started = self.clock.wall();
        let path = self
            .storage
            .new_session_path(subject_id, extension, started)
            .map_err(|e| {
                PreconditionFailed(format!(
                    "The data folder for this subject could not be created: {}",
                    e
                ))
            })?;

        let header = SessionHeader {
            file_version: FILE_VERSION,
            subject_id: subject_id.to_string(),
            session_datetime: started,
            stage_name: info.name.clone(),
            stage_description: info.description.clone(),
            stage_type: info.stage_type,
            calibration,
        };

        let opened = SessionWriter::open(&path).and_then(|mut writer| {
            writer.write_header(&header)?;
            Ok(writer)
        });
        match opened {
            Ok(writer) => {
                log::info!("{} session file: {}", info.name, path.display());
                Ok(writer)
            }
            Err(e) => {
                log::error!("Could not start session file {}: {}", path.display(), e);
                Err(PreconditionFailed(format!(
                    "The session file could not be created: {}",
                    e
                )))
            }
        }
    }

    fn persist(&self, writer: Option<&mut SessionWriter>, trial: &TrialRecord) {
        let Some(writer) = writer else {
            log::warn!("Trial completed without an open session file");
            return;
        };
        if let Err(e) = writer.append_trial(trial) {
            log::error!("Failed to save trial to {}: {}", writer.path().display(), e);
            self.notify(format!("Failed to save trial: {}", e));
        }
    }

    /// Runs `f` against the stimulator. Returns whether it ran and succeeded.
    fn with_stimulator<F>(&mut self, action: &str, f: F) -> bool
    where
        F: FnOnce(&mut dyn Stimulator) -> Result<(), TriggerError>,
    {
        let Some(stimulator) = self.stimulator.as_mut() else {
            return false;
        };
        match f(stimulator.as_mut()) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Stimulator {} failed: {}", action, e);
                self.notify(format!("Stimulator {} failed: {}", action, e));
                false
            }
        }
    }

    fn mark_stimulus(&self, event: TtlEvent) {
        let Some(markers) = self.markers.as_ref() else {
            return;
        };
        if markers.send(event).is_err() {
            log::debug!("Stimulation marker {:?} dropped, ingest has stopped", event);
        }
    }
}

fn subject_sessions(
    storage: &SessionStorage,
    subject_id: &str,
    extension: &str,
) -> Result<Vec<std::path::PathBuf>, PreconditionFailed> {
    storage.find_sessions(subject_id, extension).map_err(|e| {
        PreconditionFailed(format!("The data folder for this subject could not be read: {}", e))
    })
}

// SELECTION -------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSelector {
    Characterization,
    RecruitmentCurve,
    Conditioning,
    FWaveLatency,
    MepLatency,
}

impl FromStr for StageSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "s1" | "characterization" => Ok(StageSelector::Characterization),
            "s2" | "recruitment" => Ok(StageSelector::RecruitmentCurve),
            "s3" | "pcms" | "conditioning" => Ok(StageSelector::Conditioning),
            "s0a" | "fwave" => Ok(StageSelector::FWaveLatency),
            "s0b" | "mep" => Ok(StageSelector::MepLatency),
            other => Err(format!(
                "Unknown stage '{}' (expected s0a, s0b, s1, s2 or s3)",
                other
            )),
        }
    }
}

impl fmt::Display for StageSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageSelector::Characterization => write!(f, "S1"),
            StageSelector::RecruitmentCurve => write!(f, "S2"),
            StageSelector::Conditioning => write!(f, "S3"),
            StageSelector::FWaveLatency => write!(f, "S0a"),
            StageSelector::MepLatency => write!(f, "S0b"),
        }
    }
}

/// The closed set of runnable stages.
pub enum StageKind {
    Characterization(CharacterizationStage),
    RecruitmentCurve(RecruitmentCurveStage),
    Conditioning(ConditioningStage),
}

impl StageKind {
    pub fn new(selector: StageSelector, config: &Config, context: StageContext) -> Self {
        match selector {
            StageSelector::Characterization => StageKind::Characterization(
                CharacterizationStage::new(config.characterization.clone(), context),
            ),
            StageSelector::RecruitmentCurve => StageKind::RecruitmentCurve(
                RecruitmentCurveStage::new(config.recruitment.clone(), context),
            ),
            StageSelector::Conditioning => StageKind::Conditioning(ConditioningStage::new(
                config.conditioning.clone(),
                context,
            )),
            StageSelector::FWaveLatency => StageKind::Conditioning(ConditioningStage::new(
                ConditioningConfig::f_wave_latency(),
                context,
            )),
            StageSelector::MepLatency => StageKind::Conditioning(ConditioningStage::new(
                ConditioningConfig::mep_latency(),
                context,
            )),
        }
    }

    fn stage(&self) -> &dyn Stage {
        match self {
            StageKind::Characterization(s) => s,
            StageKind::RecruitmentCurve(s) => s,
            StageKind::Conditioning(s) => s,
        }
    }

    fn stage_mut(&mut self) -> &mut dyn Stage {
        match self {
            StageKind::Characterization(s) => s,
            StageKind::RecruitmentCurve(s) => s,
            StageKind::Conditioning(s) => s,
        }
    }
}

impl Stage for StageKind {
    fn info(&self) -> StageInfo {
        self.stage().info()
    }

    fn initialize(&mut self, subject_id: &str) -> Result<(), PreconditionFailed> {
        self.stage_mut().initialize(subject_id)
    }

    fn process(&mut self, chunk: &[f64]) {
        self.stage_mut().process(chunk)
    }

    fn input(&mut self, command: &str) -> Result<(), CommandError> {
        self.stage_mut().input(command)
    }

    fn finalize(&mut self) -> Result<(), SessionLogError> {
        self.stage_mut().finalize()
    }

    fn trial_state(&self) -> TrialState {
        self.stage().trial_state()
    }

    fn trial_count(&self) -> usize {
        self.stage().trial_count()
    }

    fn is_complete(&self) -> bool {
        self.stage().is_complete()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::processing::triggers::RecordingStimulator;
    use crate::session::message::MemorySink;
    use crate::utils::clock::ManualClock;
    use chrono::NaiveDate;
    use std::path::Path;

    pub struct Harness {
        pub clock: Arc<ManualClock>,
        pub messages: MemorySink,
        pub stimulator: RecordingStimulator,
    }

    pub fn context(root: &Path) -> (StageContext, Harness) {
        let start = NaiveDate::from_ymd_opt(2024, 6, 3)
            .unwrap()
            .and_hms_opt(14, 30, 0)
            .unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let messages = MemorySink::new();
        let stimulator = RecordingStimulator::new();

        let context = StageContext {
            clock: clock.clone(),
            notifier: Arc::new(messages.clone()),
            stimulator: Some(Box::new(stimulator.clone())),
            storage: SessionStorage::new(root),
            seed: Some(11),
            markers: None,
        };
        (
            context,
            Harness {
                clock,
                messages,
                stimulator,
            },
        )
    }

    /// Feeds 50 ms chunks of a constant level until `done` holds, advancing
    /// the clock with each chunk. Returns the number of chunks fed.
    pub fn feed_until<S: Stage>(
        stage: &mut S,
        harness: &Harness,
        level: f64,
        max_chunks: usize,
        mut done: impl FnMut(&S) -> bool,
    ) -> Option<usize> {
        let chunk = vec![level; 250];
        for n in 1..=max_chunks {
            stage.process(&chunk);
            harness.clock.advance_ms(50);
            if done(stage) {
                return Some(n);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_accepts_short_and_long_names() {
        assert_eq!("S1".parse(), Ok(StageSelector::Characterization));
        assert_eq!(" s2 ".parse(), Ok(StageSelector::RecruitmentCurve));
        assert_eq!("recruitment".parse(), Ok(StageSelector::RecruitmentCurve));
        assert_eq!("pcms".parse(), Ok(StageSelector::Conditioning));
        assert_eq!("S0b".parse(), Ok(StageSelector::MepLatency));
        assert!("s4".parse::<StageSelector>().is_err());
        assert_eq!(StageSelector::RecruitmentCurve.to_string(), "S2");
    }

    #[test]
    fn kind_dispatches_to_the_selected_stage() {
        let dir = tempfile::tempdir().unwrap();
        let (context, _harness) = testing::context(dir.path());
        let stage = StageKind::new(StageSelector::Characterization, &Config::default(), context);

        let info = stage.info();
        assert_eq!(info.name, "S1");
        assert_eq!(info.stage_type, StageType::EmgCharacterization);
        assert_eq!(stage.trial_state(), TrialState::Idle);
        assert_eq!(stage.trial_count(), 0);
        assert!(!stage.is_complete());
    }

    #[test]
    fn latency_selectors_use_their_presets() {
        let dir = tempfile::tempdir().unwrap();
        let (context, _harness) = testing::context(dir.path());
        let stage = StageKind::new(StageSelector::FWaveLatency, &Config::default(), context);

        let info = stage.info();
        assert_eq!(info.name, "S0a");
        assert_eq!(info.stage_type, StageType::Conditioning);
    }
}
