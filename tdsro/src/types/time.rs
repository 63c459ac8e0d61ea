use time::{Date, Duration, PrimitiveDateTime, Time};

use crate::{
    Decode, DecodeError,
    row::Column,
    value::{DateTime, TICKS_PER_SECOND, Value},
};

/// Day zero of the server datetime types.
const EPOCH: PrimitiveDateTime = {
    // 1900-01-01
    let date = match Date::from_julian_day(2_415_021) {
        Ok(ok) => ok,
        Err(_) => panic!("julian day of 1900-01-01 is in range"),
    };
    PrimitiveDateTime::new(date, Time::MIDNIGHT)
};

fn to_primitive(value: DateTime) -> PrimitiveDateTime {
    let millis = (i64::from(value.ticks) * 10 + 1) / 3;
    EPOCH
        .saturating_add(Duration::days(value.days.into()))
        .saturating_add(Duration::milliseconds(millis))
}

fn from_primitive(value: PrimitiveDateTime) -> DateTime {
    let days = value.date().to_julian_day() - EPOCH.date().to_julian_day();
    let seconds = u32::from(value.hour()) * 3600 + u32::from(value.minute()) * 60 + u32::from(value.second());
    let ticks = seconds * TICKS_PER_SECOND + (u32::from(value.millisecond()) * 3 + 5) / 10;
    DateTime::new(days, ticks)
}

impl Decode for PrimitiveDateTime {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        DateTime::decode(column).map(to_primitive)
    }
}

impl Decode for Date {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        DateTime::decode(column).map(|v| to_primitive(v).date())
    }
}

impl From<PrimitiveDateTime> for Value {
    fn from(value: PrimitiveDateTime) -> Self {
        Value::DateTime(from_primitive(value))
    }
}

impl From<Date> for Value {
    fn from(value: Date) -> Self {
        Value::DateTime(from_primitive(PrimitiveDateTime::new(value, Time::MIDNIGHT)))
    }
}

#[cfg(test)]
mod test {
    use time::Month;

    use super::*;

    fn at(year: i32, month: Month, day: u8, h: u8, m: u8, s: u8, ms: u16) -> PrimitiveDateTime {
        let date = Date::from_calendar_date(year, month, day).unwrap();
        PrimitiveDateTime::new(date, Time::from_hms_milli(h, m, s, ms).unwrap())
    }

    #[test]
    fn epoch_is_day_zero() {
        assert_eq!(from_primitive(EPOCH), DateTime::new(0, 0));
        assert_eq!(to_primitive(DateTime::new(-1, 0)), at(1899, Month::December, 31, 0, 0, 0, 0));
    }

    #[test]
    fn matches_calendar_fields() {
        let value = at(2024, Month::February, 29, 13, 45, 30, 500);
        let datetime = from_primitive(value);
        assert_eq!(datetime, DateTime::from_parts(2024, 2, 29, 13, 45, 30, 500));
        assert_eq!(to_primitive(datetime), value);
    }
}
