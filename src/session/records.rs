use crate::codec;
use crate::error::{CodecError, SessionLogError};

use chrono::NaiveDateTime;
use std::io::{Read, Write};

pub const FILE_VERSION: i32 = 0;
pub const TRIAL_BLOCK_TAG: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageType {
    EmgCharacterization,
    RecruitmentCurve,
    Conditioning,
}

impl StageType {
    pub fn code(self) -> i32 {
        match self {
            StageType::EmgCharacterization => 1,
            StageType::RecruitmentCurve => 2,
            StageType::Conditioning => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(StageType::EmgCharacterization),
            2 => Some(StageType::RecruitmentCurve),
            4 => Some(StageType::Conditioning),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StageType::EmgCharacterization => "EMG characterization",
            StageType::RecruitmentCurve => "recruitment curve",
            StageType::Conditioning => "conditioning",
        }
    }

    /// Whether calibration scalars follow the header for this stage.
    pub fn has_calibration(self) -> bool {
        self == StageType::EmgCharacterization
    }
}

/// Initiation parameters a characterization session ran with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub initiation_min_uv: f64,
    pub initiation_max_uv: f64,
    pub phase_min_ms: i32,
    pub phase_max_ms: i32,
    pub bin_duration_ms: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionHeader {
    pub file_version: i32,
    pub subject_id: String,
    pub session_datetime: NaiveDateTime,
    pub stage_name: String,
    pub stage_description: String,
    pub stage_type: StageType,
    pub calibration: Option<Calibration>,
}

impl SessionHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), SessionLogError> {
        if self.stage_type.has_calibration() != self.calibration.is_some() {
            return Err(SessionLogError::CalibrationMismatch(self.stage_type.label()));
        }

        codec::write_i32(w, self.file_version)?;
        codec::write_string(w, &self.subject_id)?;
        codec::write_datetime(w, &self.session_datetime)?;
        codec::write_string(w, &self.stage_name)?;
        codec::write_string(w, &self.stage_description)?;
        codec::write_i32(w, self.stage_type.code())?;

        if let Some(c) = &self.calibration {
            codec::write_f64(w, c.initiation_min_uv)?;
            codec::write_f64(w, c.initiation_max_uv)?;
            codec::write_i32(w, c.phase_min_ms)?;
            codec::write_i32(w, c.phase_max_ms)?;
            codec::write_i32(w, c.bin_duration_ms)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, SessionLogError> {
        let file_version = codec::read_i32(r)?;
        let subject_id = codec::read_string(r)?;
        let session_datetime = codec::read_datetime(r)?;
        let stage_name = codec::read_string(r)?;
        let stage_description = codec::read_string(r)?;
        let code = codec::read_i32(r)?;
        let stage_type =
            StageType::from_code(code).ok_or(SessionLogError::UnsupportedStageType(code))?;

        let calibration = if stage_type.has_calibration() {
            Some(Calibration {
                initiation_min_uv: codec::read_f64(r)?,
                initiation_max_uv: codec::read_f64(r)?,
                phase_min_ms: codec::read_i32(r)?,
                phase_max_ms: codec::read_i32(r)?,
                bin_duration_ms: codec::read_i32(r)?,
            })
        } else {
            None
        };

        Ok(Self {
            file_version,
            subject_id,
            session_datetime,
            stage_name,
            stage_description,
            stage_type,
            calibration,
        })
    }
}

// TRIALS ----------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CharacterizationTrial {
    pub trial_datetime: NaiveDateTime,
    pub grand_mean: f64,
    pub bins: Vec<f64>,
    pub monitored_signal: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecruitmentTrial {
    pub trial_datetime: NaiveDateTime,
    pub min_threshold: f64,
    pub max_threshold: f64,
    pub stimulation_amplitude_ma: f64,
    /// Pre-trial tail followed by the post-trigger recording window.
    pub samples: Vec<f64>,
}

/// One stimulation pairing of a conditioning session.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditioningTrial {
    pub trial_datetime: NaiveDateTime,
    pub trial_index: i32,
    /// Seconds since the session started.
    pub elapsed_s: f64,
    /// The chunk that arrived with the pairing, when the stage keeps it.
    pub samples: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrialRecord {
    Characterization(CharacterizationTrial),
    RecruitmentCurve(RecruitmentTrial),
    Conditioning(ConditioningTrial),
}

impl TrialRecord {
    pub fn stage_type(&self) -> StageType {
        match self {
            TrialRecord::Characterization(_) => StageType::EmgCharacterization,
            TrialRecord::RecruitmentCurve(_) => StageType::RecruitmentCurve,
            TrialRecord::Conditioning(_) => StageType::Conditioning,
        }
    }

    pub fn trial_datetime(&self) -> NaiveDateTime {
        match self {
            TrialRecord::Characterization(t) => t.trial_datetime,
            TrialRecord::RecruitmentCurve(t) => t.trial_datetime,
            TrialRecord::Conditioning(t) => t.trial_datetime,
        }
    }

    /// Writes the block tag followed by the trial fields.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        codec::write_i32(w, TRIAL_BLOCK_TAG)?;
        match self {
            TrialRecord::Characterization(t) => {
                codec::write_datetime(w, &t.trial_datetime)?;
                codec::write_f64(w, t.grand_mean)?;
                codec::write_f64_array(w, &t.bins)?;
                codec::write_f64_array(w, &t.monitored_signal)?;
            }
            TrialRecord::RecruitmentCurve(t) => {
                codec::write_datetime(w, &t.trial_datetime)?;
                codec::write_f64(w, t.min_threshold)?;
                codec::write_f64(w, t.max_threshold)?;
                codec::write_f64(w, t.stimulation_amplitude_ma)?;
                codec::write_f64_array(w, &t.samples)?;
            }
            TrialRecord::Conditioning(t) => {
                codec::write_datetime(w, &t.trial_datetime)?;
                codec::write_i32(w, t.trial_index)?;
                codec::write_f64(w, t.elapsed_s)?;
                codec::write_f64_array(w, &t.samples)?;
            }
        }
        Ok(())
    }

    /// Reads the fields that follow a trial block tag.
    pub fn read_body<R: Read>(stage_type: StageType, r: &mut R) -> Result<Self, SessionLogError> {
        match stage_type {
            StageType::EmgCharacterization => {
                Ok(TrialRecord::Characterization(CharacterizationTrial {
                    trial_datetime: codec::read_datetime(r)?,
                    grand_mean: codec::read_f64(r)?,
                    bins: codec::read_f64_array(r)?,
                    monitored_signal: codec::read_f64_array(r)?,
                }))
            }
            StageType::RecruitmentCurve => Ok(TrialRecord::RecruitmentCurve(RecruitmentTrial {
                trial_datetime: codec::read_datetime(r)?,
                min_threshold: codec::read_f64(r)?,
                max_threshold: codec::read_f64(r)?,
                stimulation_amplitude_ma: codec::read_f64(r)?,
                samples: codec::read_f64_array(r)?,
            })),
            StageType::Conditioning => Ok(TrialRecord::Conditioning(ConditioningTrial {
                trial_datetime: codec::read_datetime(r)?,
                trial_index: codec::read_i32(r)?,
                elapsed_s: codec::read_f64(r)?,
                samples: codec::read_f64_array(r)?,
            })),
        }
    }
}
