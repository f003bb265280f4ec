use super::{subject_sessions, Stage, StageContext, StageInfo, TrialState};
use crate::config::RecruitmentConfig;
use crate::error::{CommandError, PreconditionFailed, SessionLogError};
use crate::processing::detectors::{
    choose_phase_duration, Bound, InitiationMonitor, OperatorCommand, ReferenceDistribution,
    ThresholdBand,
};
use crate::session::log::{SessionData, SessionWriter};
use crate::session::records::{RecruitmentTrial, StageType, TrialRecord};
use crate::session::storage::{CHARACTERIZATION_EXTENSION, RECRUITMENT_EXTENSION};
use crate::stream::TtlEvent;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::time::{Duration, Instant};

const MS_PER_HOUR: f64 = 3_600_000.0;

const NO_CHARACTERIZATION: &str = "No EMG characterization data was found for this subject. Please run stage S1 before running this stage.";
const ALREADY_RECRUITED: &str = "This subject has already completed this stage. EMG sweep data exists for this animal. This stage cannot proceed. If this is an issue, please talk to your PI.";
const EMPTY_CHARACTERIZATION: &str = "The EMG characterization data for this subject contains no trials. This stage cannot proceed. If this is an issue, please talk to your PI.";

const COMMAND_HELP: [&str; 4] = [
    "This stage supports the following commands: ",
    "lb = x, lb += x, lb -= x (Set the init threshold lower bound)",
    "ub = x, ub += x, ub -= x (Set the init threshold upper bound)",
    "auto on, auto off (Turn on/off the automated algorithm for determining the lower and upper bounds of the initiation threshold)",
];

/// Every amplitude from min to max inclusive, in `step` increments.
pub fn amplitude_sweep(config: &RecruitmentConfig) -> Vec<f64> {
    if config.amplitude_step_ma <= 0.0 || config.amplitude_max_ma < config.amplitude_min_ma {
        return vec![config.amplitude_min_ma];
    }
    let steps =
        ((config.amplitude_max_ma - config.amplitude_min_ma) / config.amplitude_step_ma).round() as usize;
    (0..=steps)
        .map(|i| {
            let amplitude = config.amplitude_min_ma + i as f64 * config.amplitude_step_ma;
            (amplitude * 1e6).round() / 1e6
        })
        .collect()
}

struct PendingTrial {
    started: Instant,
    record: RecruitmentTrial,
}

// STAGE -----------------------------------------------------------------------

/// S2: stimulates at shuffled amplitudes on each initiation and records the
/// evoked response. Thresholds start from the subject's S1 distribution and
/// optionally adapt to hold the target trial rate.
pub struct RecruitmentCurveStage {
    config: RecruitmentConfig,
    context: StageContext,
    rng: StdRng,
    writer: Option<SessionWriter>,
    reference: Option<ReferenceDistribution>,
    band: ThresholdBand,
    auto_threshold: bool,
    amplitudes: Vec<f64>,
    current_amplitude: f64,
    monitor: Option<InitiationMonitor>,
    pending: Option<PendingTrial>,
    trials: Vec<RecruitmentTrial>,
    trial_starts: Vec<Instant>,
    average_ms_between_trials: f64,
    state: TrialState,
}

impl RecruitmentCurveStage {
    pub fn new(config: RecruitmentConfig, context: StageContext) -> Self {
        let rng = context.rng();
        let auto_threshold = config.auto_threshold;
        Self {
            config,
            context,
            rng,
            writer: None,
            reference: None,
            band: ThresholdBand::new(0.0, 0.0),
            auto_threshold,
            amplitudes: Vec::new(),
            current_amplitude: 0.0,
            monitor: None,
            pending: None,
            trials: Vec::new(),
            trial_starts: Vec::new(),
            average_ms_between_trials: 0.0,
            state: TrialState::Idle,
        }
    }

    pub fn band(&self) -> ThresholdBand {
        self.band
    }

    pub fn reference(&self) -> Option<&ReferenceDistribution> {
        self.reference.as_ref()
    }

    pub fn auto_threshold(&self) -> bool {
        self.auto_threshold
    }

    pub fn current_amplitude(&self) -> f64 {
        self.current_amplitude
    }

    pub fn trials(&self) -> &[RecruitmentTrial] {
        &self.trials
    }

    pub fn average_ms_between_trials(&self) -> f64 {
        self.average_ms_between_trials
    }

    fn desired_ms_between_trials(&self) -> f64 {
        MS_PER_HOUR / self.config.target_trials_per_hour
    }

    fn trial_sample_count(&self) -> usize {
        let initiation = &self.config.initiation;
        initiation.bin_sample_count() + initiation.samples_for_ms(self.config.post_trial_ms)
    }

    fn load_reference(&self, subject_id: &str) -> Result<ReferenceDistribution, PreconditionFailed> {
        let characterizations =
            subject_sessions(&self.context.storage, subject_id, CHARACTERIZATION_EXTENSION)?;
        let Some(source) = characterizations.first() else {
            return Err(PreconditionFailed(NO_CHARACTERIZATION.to_string()));
        };

        if !subject_sessions(&self.context.storage, subject_id, RECRUITMENT_EXTENSION)?.is_empty() {
            return Err(PreconditionFailed(ALREADY_RECRUITED.to_string()));
        }

        let data = SessionData::read(source).map_err(|e| {
            log::error!("Could not read {}: {}", source.display(), e);
            PreconditionFailed(format!(
                "The EMG characterization data for this subject could not be read: {}",
                e
            ))
        })?;

        let reference = ReferenceDistribution::from_values(&data.grand_means())
            .ok_or_else(|| PreconditionFailed(EMPTY_CHARACTERIZATION.to_string()))?;
        log::info!(
            "Reference from {}: n={} min={:.2} max={:.2} quartiles={:?} step={:.4}",
            source.display(),
            reference.n,
            reference.min,
            reference.max,
            reference.quartiles,
            reference.step_size_one_percent
        );
        Ok(reference)
    }

    fn setup_trial(&mut self) {
        let duration_ms = choose_phase_duration(&mut self.rng, &self.config.initiation);
        self.monitor = Some(InitiationMonitor::new(&self.config.initiation, duration_ms));

        let desired_ms = self.desired_ms_between_trials();
        if self.auto_threshold {
            if let Some(reference) = self.reference.as_ref() {
                let adjustment = self.band.adapt(
                    reference,
                    self.trials.len(),
                    self.average_ms_between_trials,
                    desired_ms,
                    self.config.threshold_step_multiplier,
                );
                log::debug!(
                    "Thresholds {:?} to [{:.2}, {:.2}]",
                    adjustment,
                    self.band.min(),
                    self.band.max()
                );
            }
        }

        if self.amplitudes.is_empty() {
            self.amplitudes = amplitude_sweep(&self.config);
            self.amplitudes.shuffle(&mut self.rng);
        }
        self.current_amplitude = self.amplitudes.pop().unwrap_or(self.config.amplitude_min_ma);

        let index = self.config.stimulator_index;
        let amplitude = self.current_amplitude;
        self.context
            .with_stimulator("configure", |s| s.configure_pulse(index, amplitude));

        log::debug!(
            "{}: monitoring phase {} ms, next amplitude {:.2} mA",
            self.config.stage_name,
            duration_ms,
            amplitude
        );
        self.state = TrialState::AwaitingInitiation;
    }

    fn await_initiation(&mut self, chunk: &[f64]) {
        let now = self.context.clock.now();
        let cooldown = Duration::from_millis(self.config.min_intertrial_ms);
        if let Some(last) = self.trial_starts.last() {
            if now.saturating_duration_since(*last) < cooldown {
                return;
            }
        }

        let Some(monitor) = self.monitor.as_mut() else {
            return;
        };
        monitor.push(chunk);
        if !monitor.should_initiate(self.band.min(), self.band.max()) {
            return;
        }

        self.pending = Some(PendingTrial {
            started: now,
            record: RecruitmentTrial {
                trial_datetime: self.context.clock.wall(),
                min_threshold: self.band.min(),
                max_threshold: self.band.max(),
                stimulation_amplitude_ma: self.current_amplitude,
                samples: monitor.pre_trial_tail(),
            },
        });
        self.state = TrialState::Recording;

        let index = self.config.stimulator_index;
        if self.context.with_stimulator("trigger", |s| s.trigger(index)) {
            self.context.mark_stimulus(TtlEvent {
                event_id: self.trials.len() as u32 + 1,
                event_channel: index as u32 + 1,
            });
        }
    }

    fn record(&mut self, chunk: &[f64]) {
        let target = self.trial_sample_count();
        let Some(pending) = self.pending.as_mut() else {
            self.state = TrialState::Idle;
            return;
        };

        // Whole chunks only; the last one may run past the window.
        pending.record.samples.extend_from_slice(chunk);
        if pending.record.samples.len() >= target {
            self.state = TrialState::Finalizing;
        }
    }

    fn finalize_trial(&mut self) {
        self.state = TrialState::Idle;
        self.monitor = None;
        let Some(PendingTrial { started, record }) = self.pending.take() else {
            return;
        };

        self.trial_starts.push(started);
        self.context
            .persist(self.writer.as_mut(), &TrialRecord::RecruitmentCurve(record.clone()));
        self.context.notify(format!(
            "Trial {} initiated. Stimulation amplitude: {:.2} mA, threshold = [{:.2}, {:.2}]",
            self.trials.len() + 1,
            record.stimulation_amplitude_ma,
            record.min_threshold,
            record.max_threshold
        ));
        self.trials.push(record);

        let intervals: Vec<f64> = self
            .trial_starts
            .windows(2)
            .map(|w| w[1].saturating_duration_since(w[0]).as_secs_f64() * 1000.0)
            .collect();
        if !intervals.is_empty() {
            self.average_ms_between_trials = intervals.iter().sum::<f64>() / intervals.len() as f64;
        }
        log::debug!(
            "Average inter-trial interval {:.0} ms (target {:.0} ms)",
            self.average_ms_between_trials,
            self.desired_ms_between_trials()
        );
    }

    fn run_command(&mut self, command: OperatorCommand) -> Result<String, CommandError> {
        match command {
            OperatorCommand::Report(Bound::Lower) => {
                Ok(format!("Current lower bound: {:.2}", self.band.min()))
            }
            OperatorCommand::Report(Bound::Upper) => {
                Ok(format!("Current upper bound: {:.2}", self.band.max()))
            }
            OperatorCommand::Edit { bound, op, value } => {
                let reference = self.reference.as_ref().ok_or(CommandError::Unsupported)?;
                let set = self.band.apply_edit(bound, op, value, reference)?;
                Ok(match bound {
                    Bound::Lower => format!("Min threshold set: {:.2}", set),
                    Bound::Upper => format!("Max threshold set: {:.2}", set),
                })
            }
            OperatorCommand::Auto(enabled) => {
                self.auto_threshold = enabled;
                Ok(format!(
                    "Auto thresholding: {}",
                    if enabled { "ENABLED" } else { "DISABLED" }
                ))
            }
        }
    }
}

impl Stage for RecruitmentCurveStage {
    fn info(&self) -> StageInfo {
        StageInfo {
            name: self.config.stage_name.clone(),
            description: self.config.stage_description.clone(),
            stage_type: StageType::RecruitmentCurve,
        }
    }

    fn initialize(&mut self, subject_id: &str) -> Result<(), PreconditionFailed> {
        self.state = TrialState::Idle;
        self.auto_threshold = self.config.auto_threshold;
        self.monitor = None;
        self.pending = None;
        self.trials.clear();
        self.trial_starts.clear();
        self.average_ms_between_trials = 0.0;
        self.current_amplitude = 0.0;

        let reference = self.load_reference(subject_id)?;
        let info = self.info();
        let writer = self
            .context
            .open_session(subject_id, RECRUITMENT_EXTENSION, &info, None)?;

        self.band = ThresholdBand::spanning(&reference);
        self.reference = Some(reference);
        self.writer = Some(writer);

        for line in COMMAND_HELP {
            self.context.notify(line);
        }
        Ok(())
    }

    fn process(&mut self, chunk: &[f64]) {
        if self.writer.is_none() {
            return;
        }
        // The chunk that sets up a trial is not monitored.
        if self.state == TrialState::Idle {
            self.setup_trial();
            return;
        }

        match self.state {
            TrialState::AwaitingInitiation => self.await_initiation(chunk),
            TrialState::Recording => self.record(chunk),
            TrialState::Idle | TrialState::Finalizing => {}
        }

        if self.state == TrialState::Finalizing {
            self.finalize_trial();
        }
    }

    fn input(&mut self, command: &str) -> Result<(), CommandError> {
        self.context.notify(format!("Command received: {}", command));

        let outcome = command
            .parse::<OperatorCommand>()
            .and_then(|parsed| self.run_command(parsed));
        match outcome {
            Ok(reply) => {
                self.context.notify(reply);
                Ok(())
            }
            Err(e) => {
                self.context.notify(e.to_string());
                Err(e)
            }
        }
    }

    fn finalize(&mut self) -> Result<(), SessionLogError> {
        if self.pending.take().is_some() {
            log::info!("{}: discarding trial still recording", self.config.stage_name);
        }
        if let Some(mut writer) = self.writer.take() {
            writer.close()?;
            log::info!(
                "{} finished with {} trials",
                self.config.stage_name,
                self.trials.len()
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
        self.trials.len()
    }
}
