use super::records::{SessionHeader, StageType, TrialRecord, TRIAL_BLOCK_TAG};
use crate::codec;
use crate::error::{Result, SessionLogError};

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

// WRITER ----------------------------------------------------------------------

enum WriterState {
    AwaitingHeader(BufWriter<File>),
    Writing {
        file: BufWriter<File>,
        stage_type: StageType,
    },
    Closed,
}

/// Append-only session file: one header, then trial blocks.
pub struct SessionWriter {
    path: PathBuf,
    state: WriterState,
}

impl SessionWriter {
    /// Creates or truncates the file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        log::debug!("Opened session file {}", path.display());

        Ok(Self {
            path,
            state: WriterState::AwaitingHeader(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_header(&mut self, header: &SessionHeader) -> Result<()> {
        let state = std::mem::replace(&mut self.state, WriterState::Closed);
        match state {
            WriterState::AwaitingHeader(mut file) => {
                let written = header.write_to(&mut file).and_then(|_| Ok(file.flush()?));
                self.state = WriterState::Writing {
                    file,
                    stage_type: header.stage_type,
                };
                written
            }
            other => {
                self.state = other;
                Err(sequencing_error(&self.path, "header already written or writer closed"))
            }
        }
    }

    pub fn append_trial(&mut self, trial: &TrialRecord) -> Result<()> {
        let (file, stage_type) = match &mut self.state {
            WriterState::Writing { file, stage_type } => (file, *stage_type),
            WriterState::AwaitingHeader(_) => {
                return Err(sequencing_error(&self.path, "trial appended before header"))
            }
            WriterState::Closed => {
                return Err(sequencing_error(&self.path, "trial appended after close"))
            }
        };

        if trial.stage_type() != stage_type {
            return Err(SessionLogError::MismatchedTrial(stage_type.label()));
        }

        trial.write_to(file)?;
        // Trials are rare; flushing each one keeps the file usable after a crash.
        file.flush()?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, WriterState::Closed) {
            WriterState::AwaitingHeader(mut file) | WriterState::Writing { mut file, .. } => {
                file.flush()?;
                log::debug!("Closed session file {}", self.path.display());
                Ok(())
            }
            WriterState::Closed => Err(sequencing_error(&self.path, "writer already closed")),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, WriterState::Closed)
    }
}

fn sequencing_error(path: &Path, what: &'static str) -> SessionLogError {
    log::error!("Session log misuse on {}: {}", path.display(), what);
    SessionLogError::InvalidSequencing(what)
}

// READER ----------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SessionData {
    pub header: SessionHeader,
    pub trials: Vec<TrialRecord>,
}

impl SessionData {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::read_from(&mut BufReader::new(file))
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let header = SessionHeader::read_from(r)?;
        let mut trials = Vec::new();

        // Anything other than a trial tag ends the stream.
        while let Some(tag) = codec::read_block_tag(r)? {
            if tag != TRIAL_BLOCK_TAG {
                log::debug!("Stopping at unrecognised block tag {}", tag);
                break;
            }
            trials.push(TrialRecord::read_body(header.stage_type, r)?);
        }

        Ok(Self { header, trials })
    }

    /// Grand means of every characterization trial in the session.
    pub fn grand_means(&self) -> Vec<f64> {
        self.trials
            .iter()
            .filter_map(|t| match t {
                TrialRecord::Characterization(c) => Some(c.grand_mean),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;
    use crate::session::records::{Calibration, CharacterizationTrial, RecruitmentTrial};
    use chrono::NaiveDate;
    use std::io::Cursor;

    fn at(h: u32, m: u32, s: u32, milli: u32) -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 14)
            .unwrap()
            .and_hms_milli_opt(h, m, s, milli)
            .unwrap()
    }

    fn recruitment_header() -> SessionHeader {
        SessionHeader {
            file_version: 0,
            subject_id: "R101".to_string(),
            session_datetime: at(10, 0, 0, 0),
            stage_name: "S2".to_string(),
            stage_description: "Mh Recruitment Curve".to_string(),
            stage_type: StageType::RecruitmentCurve,
            calibration: None,
        }
    }

    fn characterization_header() -> SessionHeader {
        SessionHeader {
            stage_name: "S1".to_string(),
            stage_description: "EMG Characterization".to_string(),
            stage_type: StageType::EmgCharacterization,
            calibration: Some(Calibration {
                initiation_min_uv: 15.0,
                initiation_max_uv: 300.0,
                phase_min_ms: 2200,
                phase_max_ms: 2700,
                bin_duration_ms: 50,
            }),
            ..recruitment_header()
        }
    }

    fn assert_close_in_time(a: chrono::NaiveDateTime, b: chrono::NaiveDateTime) {
        let diff = (a - b).num_microseconds().unwrap().abs();
        assert!(diff <= 1_000, "timestamps differ by {} us", diff);
    }

    #[test]
    fn recruitment_session_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("R101_20240514T100000.hrs2");

        let samples: Vec<f64> = (0..500).map(|i| (i as f64 * 0.37).sin() * 1e-3 + 1.0 / 3.0).collect();
        let trial = TrialRecord::RecruitmentCurve(RecruitmentTrial {
            trial_datetime: at(10, 4, 12, 250),
            min_threshold: 21.5,
            max_threshold: 180.25,
            stimulation_amplitude_ma: 1.3,
            samples: samples.clone(),
        });

        let mut writer = SessionWriter::open(&path).unwrap();
        writer.write_header(&recruitment_header()).unwrap();
        writer.append_trial(&trial).unwrap();
        writer.close().unwrap();

        let data = SessionData::read(&path).unwrap();
        let header = &data.header;
        assert_eq!(header.subject_id, "R101");
        assert_eq!(header.stage_type, StageType::RecruitmentCurve);
        assert_eq!(header.calibration, None);
        assert_close_in_time(header.session_datetime, at(10, 0, 0, 0));

        assert_eq!(data.trials.len(), 1);
        match &data.trials[0] {
            TrialRecord::RecruitmentCurve(t) => {
                assert_close_in_time(t.trial_datetime, at(10, 4, 12, 250));
                assert_eq!(t.min_threshold, 21.5);
                assert_eq!(t.max_threshold, 180.25);
                assert_eq!(t.stimulation_amplitude_ma, 1.3);
                assert_eq!(t.samples.len(), 500);
                for (read, written) in t.samples.iter().zip(&samples) {
                    assert_eq!(read.to_bits(), written.to_bits());
                }
            }
            other => panic!("unexpected trial {:?}", other),
        }
    }

    #[test]
    fn characterization_header_carries_calibration() {
        let mut buf = Vec::new();
        characterization_header().write_to(&mut buf).unwrap();
        TrialRecord::Characterization(CharacterizationTrial {
            trial_datetime: at(10, 1, 0, 0),
            grand_mean: 42.0,
            bins: vec![40.0, 44.0],
            monitored_signal: vec![1.0, 2.0, 3.0],
        })
        .write_to(&mut buf)
        .unwrap();

        let data = SessionData::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(data.header.calibration.unwrap().bin_duration_ms, 50);
        assert_eq!(data.grand_means(), vec![42.0]);
    }

    #[test]
    fn empty_session_reads_back_with_no_trials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.hrs1");

        let mut writer = SessionWriter::open(&path).unwrap();
        writer.write_header(&characterization_header()).unwrap();
        writer.close().unwrap();

        let first = SessionData::read(&path).unwrap();
        let second = SessionData::read(&path).unwrap();
        assert!(first.trials.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_tag_ends_the_stream() {
        let mut buf = Vec::new();
        recruitment_header().write_to(&mut buf).unwrap();
        codec::write_i32(&mut buf, 7).unwrap();
        buf.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let data = SessionData::read_from(&mut Cursor::new(buf)).unwrap();
        assert!(data.trials.is_empty());
    }

    #[test]
    fn truncated_trial_is_reported() {
        let mut buf = Vec::new();
        recruitment_header().write_to(&mut buf).unwrap();
        codec::write_i32(&mut buf, TRIAL_BLOCK_TAG).unwrap();
        codec::write_f64(&mut buf, 739_386.5).unwrap();
        codec::write_f64(&mut buf, 1.0).unwrap();

        let err = SessionData::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(
            err,
            SessionLogError::Codec(CodecError::TruncatedRecord(_))
        ));
    }

    #[test]
    fn misuse_is_invalid_sequencing() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SessionWriter::open(dir.path().join("misuse.hrs2")).unwrap();
        let trial = TrialRecord::RecruitmentCurve(RecruitmentTrial {
            trial_datetime: at(11, 0, 0, 0),
            min_threshold: 1.0,
            max_threshold: 2.0,
            stimulation_amplitude_ma: 0.5,
            samples: vec![],
        });

        assert!(matches!(
            writer.append_trial(&trial),
            Err(SessionLogError::InvalidSequencing(_))
        ));

        writer.write_header(&recruitment_header()).unwrap();
        assert!(matches!(
            writer.write_header(&recruitment_header()),
            Err(SessionLogError::InvalidSequencing(_))
        ));

        writer.close().unwrap();
        assert!(matches!(
            writer.append_trial(&trial),
            Err(SessionLogError::InvalidSequencing(_))
        ));
    }

    #[test]
    fn trial_layout_must_match_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SessionWriter::open(dir.path().join("layout.hrs2")).unwrap();
        writer.write_header(&recruitment_header()).unwrap();

        let wrong = TrialRecord::Characterization(CharacterizationTrial {
            trial_datetime: at(11, 0, 0, 0),
            grand_mean: 1.0,
            bins: vec![],
            monitored_signal: vec![],
        });
        assert!(matches!(
            writer.append_trial(&wrong),
            Err(SessionLogError::MismatchedTrial(_))
        ));
    }
}
