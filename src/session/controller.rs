use crate::error::{CommandError, PreconditionFailed, SessionLogError};
use crate::ingest::ConditionedFrame;
use crate::processing::stages::{Stage, StageKind};
use crate::session::message::StageEvent;

use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Consumer side of a session: owns the active stage, feeds it conditioned
/// chunks and routes operator commands to it.
pub struct SessionController<S: Stage = StageKind> {
    stage: Option<S>,
    subject_id: String,
    paused: bool,
    cancel: Arc<AtomicBool>,
    events: Sender<StageEvent>,
}

impl<S: Stage> SessionController<S> {
    pub fn new(events: Sender<StageEvent>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            stage: None,
            subject_id: String::new(),
            paused: false,
            cancel,
            events,
        }
    }

    /// Initializes `stage` for `subject_id` and makes it active. On failure
    /// the controller stays idle.
    pub fn start(&mut self, mut stage: S, subject_id: &str) -> Result<(), PreconditionFailed> {
        if self.stage.is_some() {
            return Err(PreconditionFailed(
                "A session is already running. Stop it before starting another.".to_string(),
            ));
        }

        let info = stage.info();
        if let Err(e) = stage.initialize(subject_id) {
            log::warn!("{} could not start for {}: {}", info.name, subject_id, e);
            return Err(e);
        }

        log::info!("{} ({}) started for {}", info.name, info.description, subject_id);
        self.subject_id = subject_id.to_string();
        self.paused = false;
        self.stage = Some(stage);
        Ok(())
    }

    /// Feeds one frame to the active stage. Returns whether it was consumed.
    /// A stage that reports completion is stopped here.
    pub fn on_frame(&mut self, frame: &ConditionedFrame) -> bool {
        if self.paused || self.cancel.load(Ordering::SeqCst) {
            return false;
        }
        let Some(stage) = self.stage.as_mut() else {
            return false;
        };
        stage.process(&frame.samples);

        if stage.is_complete() {
            if let Err(e) = self.stop() {
                log::error!("Completed session could not be closed: {}", e);
            }
        }
        true
    }

    pub fn command(&mut self, command: &str) -> Result<(), CommandError> {
        match self.stage.as_mut() {
            Some(stage) => stage.input(command.trim()),
            None => Err(CommandError::Unsupported),
        }
    }

    pub fn pause(&mut self) {
        if self.stage.is_some() && !self.paused {
            log::info!("Session paused");
            self.paused = true;
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            log::info!("Session resumed");
            self.paused = false;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_running(&self) -> bool {
        self.stage.is_some()
    }

    pub fn stage(&self) -> Option<&S> {
        self.stage.as_ref()
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// Finalizes the active stage and reports `SessionComplete` once its
    /// session file is closed. Returns the number of trials run.
    pub fn stop(&mut self) -> Result<usize, SessionLogError> {
        let Some(mut stage) = self.stage.take() else {
            return Ok(0);
        };
        self.paused = false;

        let info = stage.info();
        let trial_count = stage.trial_count();
        stage.finalize()?;

        log::info!("{} complete for {}: {} trials", info.name, self.subject_id, trial_count);
        let complete = StageEvent::SessionComplete {
            stage_name: info.name,
            trial_count,
        };
        if self.events.send(complete).is_err() {
            log::debug!("Session completion not delivered, receiver gone");
        }
        Ok(trial_count)
    }
}
