//! Raw big-endian readers and writers for primitive payloads.
//!
//! Readers check the remaining length before every access so a short buffer
//! surfaces as [`ProtocolError::Truncated`] rather than a panic inside `bytes`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};

use crate::core::variant::{QDateTime, TimeSpec};
use crate::error::{ProtocolError, Result};

/// Julian day of 0001-01-01 minus one, the offset between chrono's day count and Qt's.
const JULIAN_DAY_OFFSET: i64 = 1_721_425;
const MILLIS_PER_DAY: i32 = 86_400_000;

#[inline]
pub fn ensure(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(ProtocolError::truncated(needed, buf.remaining()));
    }
    Ok(())
}

macro_rules! reader {
    ($($name:ident => $ty:ty, $get:ident);* $(;)?) => {
        $(
            #[inline]
            pub fn $name(buf: &mut Bytes) -> Result<$ty> {
                ensure(buf, std::mem::size_of::<$ty>())?;
                Ok(buf.$get())
            }
        )*
    };
}

reader! {
    read_u8 => u8, get_u8;
    read_i8 => i8, get_i8;
    read_u16 => u16, get_u16;
    read_i16 => i16, get_i16;
    read_u32 => u32, get_u32;
    read_i32 => i32, get_i32;
    read_u64 => u64, get_u64;
    read_i64 => i64, get_i64;
    read_f32 => f32, get_f32;
    read_f64 => f64, get_f64;
}

pub fn read_bool(buf: &mut Bytes) -> Result<bool> {
    Ok(read_u8(buf)? != 0)
}

pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Read an i32 length. `Ok(None)` means the -1 null marker.
fn read_length(buf: &mut Bytes) -> Result<Option<usize>> {
    match read_i32(buf)? {
        -1 => Ok(None),
        len if len < 0 => Err(ProtocolError::MalformedValue(format!(
            "negative length {len}"
        ))),
        len => {
            let len = len as usize;
            ensure(buf, len)?;
            Ok(Some(len))
        }
    }
}

fn write_length(buf: &mut BytesMut, len: usize) -> Result<()> {
    let len = i32::try_from(len)
        .map_err(|_| ProtocolError::MalformedValue(format!("length {len} exceeds i32")))?;
    buf.put_i32(len);
    Ok(())
}

/// Element count of a list or map.
pub fn read_count(buf: &mut Bytes) -> Result<usize> {
    let count = read_i32(buf)?;
    usize::try_from(count)
        .map_err(|_| ProtocolError::MalformedValue(format!("negative element count {count}")))
}

pub fn write_count(buf: &mut BytesMut, count: usize) -> Result<()> {
    write_length(buf, count)
}

/// `QString`: byte length then UTF-16BE code units.
pub fn write_utf16(buf: &mut BytesMut, value: Option<&str>) -> Result<()> {
    match value {
        None => buf.put_i32(-1),
        Some(s) => {
            let units: Vec<u16> = s.encode_utf16().collect();
            write_length(buf, units.len() * 2)?;
            for unit in units {
                buf.put_u16(unit);
            }
        }
    }
    Ok(())
}

pub fn read_utf16(buf: &mut Bytes) -> Result<Option<String>> {
    let Some(len) = read_length(buf)? else {
        return Ok(None);
    };
    if len % 2 != 0 {
        return Err(ProtocolError::MalformedValue(format!(
            "odd UTF-16 byte length {len}"
        )));
    }
    let units: Vec<u16> = (0..len / 2).map(|_| buf.get_u16()).collect();
    Ok(Some(String::from_utf16_lossy(&units)))
}

/// UTF-8 string with a byte length prefix, no terminator.
pub fn write_utf8(buf: &mut BytesMut, value: Option<&str>) -> Result<()> {
    write_bytes(buf, value.map(str::as_bytes))
}

pub fn read_utf8(buf: &mut Bytes) -> Result<Option<String>> {
    Ok(read_bytes(buf)?.map(|raw| String::from_utf8_lossy(&raw).into_owned()))
}

/// NUL terminated ASCII, the length counts the terminator.
pub fn write_ascii(buf: &mut BytesMut, value: &str) -> Result<()> {
    if !value.is_ascii() {
        return Err(ProtocolError::MalformedValue(format!(
            "non-ASCII type name '{value}'"
        )));
    }
    write_length(buf, value.len() + 1)?;
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
    Ok(())
}

pub fn read_ascii(buf: &mut Bytes) -> Result<Option<String>> {
    let Some(len) = read_length(buf)? else {
        return Ok(None);
    };
    let raw = buf.split_to(len);
    let raw = raw.strip_suffix(&[0u8]).unwrap_or(&raw[..]);
    Ok(Some(String::from_utf8_lossy(raw).into_owned()))
}

/// `QByteArray`: length then raw bytes, -1 for null.
pub fn write_bytes(buf: &mut BytesMut, value: Option<&[u8]>) -> Result<()> {
    match value {
        None => buf.put_i32(-1),
        Some(raw) => {
            write_length(buf, raw.len())?;
            buf.put_slice(raw);
        }
    }
    Ok(())
}

pub fn read_bytes(buf: &mut Bytes) -> Result<Option<Bytes>> {
    let Some(len) = read_length(buf)? else {
        return Ok(None);
    };
    Ok(Some(buf.split_to(len)))
}

pub fn write_date(buf: &mut BytesMut, date: NaiveDate) -> Result<()> {
    let julian = i64::from(date.num_days_from_ce()) + JULIAN_DAY_OFFSET;
    let julian = i32::try_from(julian)
        .map_err(|_| ProtocolError::MalformedValue(format!("date {date} out of range")))?;
    buf.put_i32(julian);
    Ok(())
}

pub fn read_date(buf: &mut Bytes) -> Result<NaiveDate> {
    let julian = read_i32(buf)?;
    i32::try_from(i64::from(julian) - JULIAN_DAY_OFFSET)
        .ok()
        .and_then(NaiveDate::from_num_days_from_ce_opt)
        .ok_or_else(|| ProtocolError::MalformedValue(format!("julian day {julian} out of range")))
}

pub fn write_time(buf: &mut BytesMut, time: NaiveTime) {
    // Leap seconds fold into the last millisecond of the minute.
    let millis = (time.nanosecond() / 1_000_000).min(999);
    buf.put_i32((time.num_seconds_from_midnight() * 1000 + millis) as i32);
}

pub fn read_time(buf: &mut Bytes) -> Result<NaiveTime> {
    let millis = read_i32(buf)?;
    if !(0..MILLIS_PER_DAY).contains(&millis) {
        return Err(ProtocolError::MalformedValue(format!(
            "time of day {millis}ms out of range"
        )));
    }
    let millis = millis as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(millis / 1000, (millis % 1000) * 1_000_000)
        .ok_or_else(|| ProtocolError::MalformedValue(format!("time of day {millis}ms")))
}

pub fn write_datetime(buf: &mut BytesMut, value: &QDateTime) -> Result<()> {
    let local = value.naive_local();
    write_date(buf, local.date())?;
    write_time(buf, local.time());
    buf.put_i8(value.time_spec() as i8);
    if let QDateTime::Offset(dt) = value {
        buf.put_i32(dt.offset().local_minus_utc());
    }
    Ok(())
}

pub fn read_datetime(buf: &mut Bytes) -> Result<QDateTime> {
    let date = read_date(buf)?;
    let time = read_time(buf)?;
    let local = NaiveDateTime::new(date, time);
    let spec = TimeSpec::from_byte(read_i8(buf)?);
    match spec {
        TimeSpec::Utc => Ok(QDateTime::Utc(Utc.from_utc_datetime(&local))),
        TimeSpec::OffsetFromUtc => {
            let seconds = read_i32(buf)?;
            let offset = FixedOffset::east_opt(seconds).ok_or_else(|| {
                ProtocolError::MalformedValue(format!("utc offset {seconds}s out of range"))
            })?;
            offset
                .from_local_datetime(&local)
                .single()
                .map(QDateTime::Offset)
                .ok_or_else(|| ProtocolError::MalformedValue("ambiguous offset date-time".into()))
        }
        spec => Ok(QDateTime::Local {
            datetime: local,
            spec,
        }),
    }
}
