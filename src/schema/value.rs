//! Field values stored on documents.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};

use crate::error::{Result, SolrError};

/// Whole-second date format of update markup.
pub const SOLR_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Date format of replication handler timestamps (`Fri Jun 12 10:00:00 UTC 2015`).
pub const REPLICATION_DATETIME_FORMAT: &str = "%a %b %d %H:%M:%S %Z %Y";

/// A single value of a document field.
///
/// `Null` is the explicit-null marker: a field holding exactly one `Null`
/// entry is serialized with `null="true"`. `NaN` floats equal each other.
#[derive(Clone, Debug)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Text(String),
    Date(DateTime<Utc>),
    Int(i64),
    Float(f64),
}

impl FieldValue {
    pub fn text(s: impl Into<String>) -> Self {
        FieldValue::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(f) => Some(*f),
            FieldValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<&DateTime<Utc>> {
        match self {
            FieldValue::Date(d) => Some(d),
            _ => None,
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => true,
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a == b,
            (FieldValue::Text(a), FieldValue::Text(b)) => a == b,
            (FieldValue::Date(a), FieldValue::Date(b)) => a == b,
            (FieldValue::Int(a), FieldValue::Int(b)) => a == b,
            (FieldValue::Float(a), FieldValue::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            _ => false,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => Ok(()),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Date(d) => f.write_str(&datetime_to_solr(d)),
            FieldValue::Int(n) => write!(f, "{}", n),
            FieldValue::Float(x) => write!(f, "{}", x),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<i32> for FieldValue {
    fn from(n: i32) -> Self {
        FieldValue::Int(n as i64)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Int(n)
    }
}

impl From<f64> for FieldValue {
    fn from(x: f64) -> Self {
        FieldValue::Float(x)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(d: DateTime<Utc>) -> Self {
        FieldValue::Date(d)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Parse a server date, with or without fractional seconds.
pub fn solr_to_datetime(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, SOLR_DATETIME_FORMAT) {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| SolrError::document(format!("Invalid date {:?}: {}", s, e)))
}

/// `SOLR_DATETIME_FORMAT`, plus sub-second digits when the value has them.
pub fn datetime_to_solr(d: &DateTime<Utc>) -> String {
    d.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse a replication timestamp. The zone name is ignored: slave
/// timestamps are only ever compared with each other.
pub fn replication_to_datetime(s: &str) -> Result<NaiveDateTime> {
    let parts: Vec<&str> = s.split_whitespace().collect();
    if parts.len() != 6 {
        return Err(SolrError::ResponseFormat(format!("Invalid replication date {:?}", s)));
    }
    let without_zone = format!(
        "{} {} {} {} {}",
        parts[0], parts[1], parts[2], parts[3], parts[5]
    );
    NaiveDateTime::parse_from_str(&without_zone, "%a %b %d %H:%M:%S %Y")
        .map_err(|e| SolrError::ResponseFormat(format!("Invalid replication date {:?}: {}", s, e)))
}

pub fn datetime_to_replication(d: &DateTime<Utc>) -> String {
    d.format(REPLICATION_DATETIME_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_round_trip() {
        let d = Utc.with_ymd_and_hms(1975, 3, 4, 3, 15, 23).unwrap();
        assert_eq!(datetime_to_solr(&d), "1975-03-04T03:15:23Z");
        assert_eq!(solr_to_datetime("1975-03-04T03:15:23Z").unwrap(), d);

        let old = Utc.with_ymd_and_hms(1850, 1, 1, 14, 35, 0).unwrap();
        assert_eq!(datetime_to_solr(&old), "1850-01-01T14:35:00Z");
    }

    #[test]
    fn test_fractional_seconds() {
        let d = solr_to_datetime("2014-06-01T10:00:00.250Z").unwrap();
        assert_eq!(d.timestamp_subsec_millis(), 250);
        assert_eq!(datetime_to_solr(&d), "2014-06-01T10:00:00.250Z");
        assert_eq!(solr_to_datetime(&datetime_to_solr(&d)).unwrap(), d);
        assert!(solr_to_datetime("yesterday").is_err());
    }

    #[test]
    fn test_replication_dates() {
        let d = Utc.with_ymd_and_hms(2015, 6, 12, 10, 0, 5).unwrap();
        let text = datetime_to_replication(&d);
        assert_eq!(text, "Fri Jun 12 10:00:05 UTC 2015");
        assert_eq!(replication_to_datetime(&text).unwrap(), d.naive_utc());
        assert_eq!(
            replication_to_datetime("Fri Jan 01 00:00:00 CEST 1960").unwrap(),
            NaiveDateTime::parse_from_str("1960-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap()
        );
        assert!(replication_to_datetime("not a date").is_err());
    }

    #[test]
    fn test_nan_equals_itself() {
        assert_eq!(FieldValue::Float(f64::NAN), FieldValue::Float(f64::NAN));
        assert_eq!(FieldValue::Float(0.0), FieldValue::Float(-0.0));
        assert_ne!(FieldValue::Float(f64::NAN), FieldValue::Float(1.0));
        assert_ne!(FieldValue::Int(1), FieldValue::Float(1.0));
    }

    #[test]
    fn test_option_into_null() {
        let none: Option<&str> = None;
        assert!(FieldValue::from(none).is_null());
        assert_eq!(FieldValue::from(Some("a")), FieldValue::text("a"));
    }
}
