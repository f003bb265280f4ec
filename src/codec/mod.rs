// Little-endian primitives shared by every persisted session record.
//
// Timestamps are stored as a MATLAB-style day count: days since year 0
// (proleptic Gregorian ordinal + 366) plus the fraction of the day elapsed.
use crate::error::CodecError;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use std::io::{self, Read, Write};

const DAY_COUNT_EPOCH_OFFSET: i64 = 366;
const MICROS_PER_DAY: f64 = 86_400_000_000.0;

fn truncated(what: &'static str) -> impl Fn(io::Error) -> CodecError {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CodecError::TruncatedRecord(what)
        } else {
            CodecError::Io(e)
        }
    }
}

// READ ------------------------------------------------------------------------

pub fn read_i8<R: Read>(r: &mut R) -> Result<i8, CodecError> {
    r.read_i8().map_err(truncated("int8"))
}

pub fn read_u8<R: Read>(r: &mut R) -> Result<u8, CodecError> {
    r.read_u8().map_err(truncated("uint8"))
}

pub fn read_i32<R: Read>(r: &mut R) -> Result<i32, CodecError> {
    r.read_i32::<LittleEndian>().map_err(truncated("int32"))
}

pub fn read_u32<R: Read>(r: &mut R) -> Result<u32, CodecError> {
    r.read_u32::<LittleEndian>().map_err(truncated("uint32"))
}

pub fn read_f64<R: Read>(r: &mut R) -> Result<f64, CodecError> {
    r.read_f64::<LittleEndian>().map_err(truncated("float64"))
}

/// Reads an `int32` byte length followed by that many UTF-8 bytes.
pub fn read_string<R: Read>(r: &mut R) -> Result<String, CodecError> {
    let len = read_i32(r)?;
    if len < 0 {
        return Err(CodecError::InvalidLength(len));
    }

    // Bounded read so a corrupt length cannot force a huge allocation.
    let mut bytes = Vec::new();
    r.by_ref().take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len as usize {
        return Err(CodecError::TruncatedRecord("string"));
    }

    Ok(String::from_utf8(bytes)?)
}

/// Reads an `int32` element count followed by that many `float64` values.
pub fn read_f64_array<R: Read>(r: &mut R) -> Result<Vec<f64>, CodecError> {
    let count = read_i32(r)?;
    if count < 0 {
        return Err(CodecError::InvalidLength(count));
    }

    let mut values = Vec::with_capacity((count as usize).min(1 << 16));
    for _ in 0..count {
        values.push(r.read_f64::<LittleEndian>().map_err(truncated("float64 array"))?);
    }
    Ok(values)
}

pub fn read_datetime<R: Read>(r: &mut R) -> Result<NaiveDateTime, CodecError> {
    let day_count = r.read_f64::<LittleEndian>().map_err(truncated("timestamp"))?;
    day_count_to_datetime(day_count)
}

/// Reads a 4-byte block tag. Returns `None` at end of stream, including a
/// partial tag left by an interrupted write.
pub fn read_block_tag<R: Read>(r: &mut R) -> Result<Option<i32>, CodecError> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => return Ok(None),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CodecError::Io(e)),
        }
    }
    Ok(Some(i32::from_le_bytes(buf)))
}

// WRITE -----------------------------------------------------------------------

pub fn write_i8<W: Write>(w: &mut W, value: i8) -> Result<(), CodecError> {
    Ok(w.write_i8(value)?)
}

pub fn write_u8<W: Write>(w: &mut W, value: u8) -> Result<(), CodecError> {
    Ok(w.write_u8(value)?)
}

pub fn write_i32<W: Write>(w: &mut W, value: i32) -> Result<(), CodecError> {
    Ok(w.write_i32::<LittleEndian>(value)?)
}

pub fn write_u32<W: Write>(w: &mut W, value: u32) -> Result<(), CodecError> {
    Ok(w.write_u32::<LittleEndian>(value)?)
}

pub fn write_f64<W: Write>(w: &mut W, value: f64) -> Result<(), CodecError> {
    Ok(w.write_f64::<LittleEndian>(value)?)
}

pub fn write_string<W: Write>(w: &mut W, value: &str) -> Result<(), CodecError> {
    let len = i32::try_from(value.len()).map_err(|_| CodecError::InvalidLength(i32::MAX))?;
    write_i32(w, len)?;
    w.write_all(value.as_bytes())?;
    Ok(())
}

pub fn write_f64_array<W: Write>(w: &mut W, values: &[f64]) -> Result<(), CodecError> {
    let count = i32::try_from(values.len()).map_err(|_| CodecError::InvalidLength(i32::MAX))?;
    write_i32(w, count)?;
    for &v in values {
        write_f64(w, v)?;
    }
    Ok(())
}

pub fn write_datetime<W: Write>(w: &mut W, value: &NaiveDateTime) -> Result<(), CodecError> {
    write_f64(w, datetime_to_day_count(value))
}

// TIMESTAMPS ------------------------------------------------------------------

pub fn datetime_to_day_count(value: &NaiveDateTime) -> f64 {
    let days = value.date().num_days_from_ce() as i64 + DAY_COUNT_EPOCH_OFFSET;
    let time = value.time();
    let micros = time.num_seconds_from_midnight() as f64 * 1_000_000.0
        + (time.nanosecond() / 1_000) as f64;
    days as f64 + micros / MICROS_PER_DAY
}

pub fn day_count_to_datetime(day_count: f64) -> Result<NaiveDateTime, CodecError> {
    if !day_count.is_finite() {
        return Err(CodecError::InvalidTimestamp(day_count));
    }

    let whole_days = day_count.floor();
    let ordinal = whole_days as i64 - DAY_COUNT_EPOCH_OFFSET;
    let date = i32::try_from(ordinal)
        .ok()
        .and_then(NaiveDate::from_num_days_from_ce_opt)
        .ok_or(CodecError::InvalidTimestamp(day_count))?;

    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or(CodecError::InvalidTimestamp(day_count))?;
    let micros = ((day_count - whole_days) * MICROS_PER_DAY).round() as i64;
    Ok(midnight + chrono::Duration::microseconds(micros))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn dt(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32, micro: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_micro_opt(h, min, s, micro)
            .unwrap()
    }

    #[test]
    fn day_count_matches_matlab_datenum() {
        assert_eq!(datetime_to_day_count(&dt(2000, 1, 1, 0, 0, 0, 0)), 730486.0);
        assert_eq!(datetime_to_day_count(&dt(2000, 1, 1, 12, 0, 0, 0)), 730486.5);
    }

    #[test]
    fn day_count_round_trip_is_sub_millisecond() {
        let original = dt(2024, 7, 19, 14, 33, 12, 345_678);
        let decoded = day_count_to_datetime(datetime_to_day_count(&original)).unwrap();
        let error = (decoded - original).num_microseconds().unwrap().abs();
        assert!(error < 1_000, "error was {} us", error);
    }

    #[test]
    fn primitives_are_little_endian() {
        let mut buf = Vec::new();
        write_i32(&mut buf, 1).unwrap();
        write_u32(&mut buf, 0xA1B2_C3D4).unwrap();
        write_i8(&mut buf, -2).unwrap();
        write_u8(&mut buf, 200).unwrap();
        assert_eq!(buf, vec![1, 0, 0, 0, 0xD4, 0xC3, 0xB2, 0xA1, 0xFE, 200]);

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_i32(&mut cursor).unwrap(), 1);
        assert_eq!(read_u32(&mut cursor).unwrap(), 0xA1B2_C3D4);
        assert_eq!(read_i8(&mut cursor).unwrap(), -2);
        assert_eq!(read_u8(&mut cursor).unwrap(), 200);
    }

    #[test]
    fn strings_are_prefixed_with_byte_length() {
        let mut buf = Vec::new();
        write_string(&mut buf, "rat-ü").unwrap();
        assert_eq!(&buf[..4], &6i32.to_le_bytes());

        let decoded = read_string(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, "rat-ü");
    }

    #[test]
    fn short_string_is_truncated_record() {
        let mut buf = Vec::new();
        write_i32(&mut buf, 10).unwrap();
        buf.extend_from_slice(b"abc");

        let err = read_string(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, CodecError::TruncatedRecord("string")));
    }

    #[test]
    fn empty_stream_is_truncated_record() {
        let err = read_f64(&mut Cursor::new(Vec::<u8>::new())).unwrap_err();
        assert!(matches!(err, CodecError::TruncatedRecord("float64")));
    }

    #[test]
    fn block_tag_distinguishes_end_of_stream() {
        assert_eq!(read_block_tag(&mut Cursor::new(vec![])).unwrap(), None);
        assert_eq!(read_block_tag(&mut Cursor::new(vec![1, 0])).unwrap(), None);
        assert_eq!(read_block_tag(&mut Cursor::new(vec![1, 0, 0, 0])).unwrap(), Some(1));
    }
}
