use super::reference::ReferenceDistribution;
use crate::error::CommandError;

use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Reset,
    Tightened,
    Loosened,
}

// THRESHOLD BAND --------------------------------------------------------------

/// Initiation band `[min, max]` applied to the grand mean. Every mutation
/// keeps `min <= max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdBand {
    min: f64,
    max: f64,
}

impl ThresholdBand {
    pub fn new(min: f64, max: f64) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn spanning(reference: &ReferenceDistribution) -> Self {
        Self::new(reference.min, reference.max)
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// One step of the trial-rate control law. Trials arriving faster than
    /// desired narrow the band, slower widen it. The result is clamped to the
    /// reference range and swapped if the bounds crossed.
    pub fn adapt(
        &mut self,
        reference: &ReferenceDistribution,
        trial_count: usize,
        average_ms_between_trials: f64,
        desired_ms_between_trials: f64,
        step_multiplier: f64,
    ) -> Adjustment {
        if trial_count == 0 {
            *self = Self::spanning(reference);
            return Adjustment::Reset;
        }

        let step = reference.step_size_one_percent * step_multiplier;
        let adjustment = if average_ms_between_trials < desired_ms_between_trials {
            self.min += step;
            self.max -= step;
            Adjustment::Tightened
        } else {
            self.min -= step;
            self.max += step;
            Adjustment::Loosened
        };

        // Both bounds are clamped on both sides so a swap stays in range.
        self.min = self.min.clamp(reference.min, reference.max);
        self.max = self.max.clamp(reference.min, reference.max);
        if self.min > self.max {
            std::mem::swap(&mut self.min, &mut self.max);
        }
        adjustment
    }

    /// Applies a manual edit. On error the band is unchanged.
    pub fn apply_edit(
        &mut self,
        bound: Bound,
        op: EditOp,
        value: f64,
        reference: &ReferenceDistribution,
    ) -> Result<f64, CommandError> {
        match bound {
            Bound::Lower => {
                let lb = op.apply(self.min, value);
                if lb >= self.max {
                    return Err(CommandError::LowerAboveUpper);
                }
                self.min = lb.max(reference.min);
                Ok(self.min)
            }
            Bound::Upper => {
                let ub = op.apply(self.max, value);
                if ub <= self.min {
                    return Err(CommandError::UpperBelowLower);
                }
                self.max = ub.min(reference.max);
                Ok(self.max)
            }
        }
    }
}

// OPERATOR COMMANDS -----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Lower,
    Upper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOp {
    Set,
    Increase,
    Decrease,
}

impl EditOp {
    fn apply(self, current: f64, value: f64) -> f64 {
        match self {
            EditOp::Set => value,
            EditOp::Increase => current + value,
            EditOp::Decrease => current - value,
        }
    }
}

/// `lb`, `ub`, `lb = x`, `lb += x`, `lb -= x` (same for `ub`), `auto on`,
/// `auto off`. Case and whitespace are ignored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatorCommand {
    Report(Bound),
    Edit { bound: Bound, op: EditOp, value: f64 },
    Auto(bool),
}

impl FromStr for OperatorCommand {
    type Err = CommandError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let command: String = input
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();

        match command.as_str() {
            "lb" => return Ok(OperatorCommand::Report(Bound::Lower)),
            "ub" => return Ok(OperatorCommand::Report(Bound::Upper)),
            _ => {}
        }

        if let Some(toggle) = command.strip_prefix("auto") {
            return match toggle {
                "on" => Ok(OperatorCommand::Auto(true)),
                "off" => Ok(OperatorCommand::Auto(false)),
                _ => Err(CommandError::InvalidToggle),
            };
        }

        let (bound, rest) = if let Some(rest) = command.strip_prefix("lb") {
            (Bound::Lower, rest)
        } else if let Some(rest) = command.strip_prefix("ub") {
            (Bound::Upper, rest)
        } else {
            return Err(CommandError::NotRecognized);
        };

        let (op, value) = [("-=", EditOp::Decrease), ("=", EditOp::Set), ("+=", EditOp::Increase)]
            .iter()
            .find_map(|(token, op)| rest.strip_prefix(token).map(|v| (*op, v)))
            .ok_or(CommandError::InvalidOperation)?;

        let value: f64 = value.parse().map_err(|_| CommandError::InvalidValue)?;
        Ok(OperatorCommand::Edit { bound, op, value })
    }
}
