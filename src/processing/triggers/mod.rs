use crate::error::TriggerError;

#[cfg(any(test, feature = "test-support"))]
use std::sync::{Arc, Mutex};

/// Stimulation hardware as seen by the stages. Both calls are side-effecting
/// and return promptly; failures are reported, never retried here.
pub trait Stimulator: Send {
    fn trigger(&mut self, index: usize) -> Result<(), TriggerError>;

    fn configure_pulse(&mut self, index: usize, amplitude_ma: f64) -> Result<(), TriggerError>;
}

// NULL STIMULATOR -------------------------------------------------------------

/// Stands in when no hardware is attached. Only logs.
#[derive(Debug, Default)]
pub struct NullStimulator;

impl Stimulator for NullStimulator {
    fn trigger(&mut self, index: usize) -> Result<(), TriggerError> {
        log::info!("Stimulator {}: trigger (no hardware attached)", index);
        Ok(())
    }

    fn configure_pulse(&mut self, index: usize, amplitude_ma: f64) -> Result<(), TriggerError> {
        log::info!(
            "Stimulator {}: monophasic pulse {:.2} mA (no hardware attached)",
            index,
            amplitude_ma
        );
        Ok(())
    }
}

// RECORDING STIMULATOR --------------------------------------------------------

#[cfg(any(test, feature = "test-support"))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StimulatorCall {
    Trigger(usize),
    ConfigurePulse(usize, f64),
}

/// Keeps every call so a caller holding a clone can inspect them.
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug, Clone, Default)]
pub struct RecordingStimulator {
    calls: Arc<Mutex<Vec<StimulatorCall>>>,
    fail_triggers: bool,
}

#[cfg(any(test, feature = "test-support"))]
impl RecordingStimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later `trigger` is rejected (still recorded).
    pub fn failing() -> Self {
        Self {
            fail_triggers: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<StimulatorCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, call: StimulatorCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Stimulator for RecordingStimulator {
    fn trigger(&mut self, index: usize) -> Result<(), TriggerError> {
        self.record(StimulatorCall::Trigger(index));
        if self.fail_triggers {
            return Err(TriggerError::Rejected(format!("trigger {} refused", index)));
        }
        Ok(())
    }

    fn configure_pulse(&mut self, index: usize, amplitude_ma: f64) -> Result<(), TriggerError> {
        self.record(StimulatorCall::ConfigurePulse(index, amplitude_ma));
        Ok(())
    }
}
