use std::collections::BTreeMap;

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
    Serializer,
};

/// Coarse type of a record field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Int | FieldType::Float)
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed field value
///
/// Variant order matters for untagged deserialization: `1` reads as `Int`,
/// `1.5` as `Float`. NaN and infinities are written as the strings `"NaN"`,
/// `"inf"` and `"-inf"`, so they read back as `String` rather than `Null`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Null => serializer.serialize_unit(),
            FieldValue::Bool(v) => serializer.serialize_bool(*v),
            FieldValue::Int(v) => serializer.serialize_i64(*v),
            FieldValue::Float(v) if v.is_finite() => serializer.serialize_f64(*v),
            FieldValue::Float(v) => serializer.collect_str(v),
            FieldValue::String(v) => serializer.serialize_str(v),
        }
    }
}

impl FieldValue {
    /// Type of the value, `None` for null
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            FieldValue::Null => None,
            FieldValue::Bool(_) => Some(FieldType::Bool),
            FieldValue::Int(_) => Some(FieldType::Int),
            FieldValue::Float(_) => Some(FieldType::Float),
            FieldValue::String(_) => Some(FieldType::String),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Numeric view of the value (ints widen to floats)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Converts the value to `target`, returning `None` when no lossless
    /// conversion exists. Nulls stay null.
    ///
    /// NaN and infinite floats convert to nothing: JSON has no encoding for
    /// them and they would come back as null.
    pub fn coerce_to(&self, target: FieldType) -> Option<FieldValue> {
        if let FieldValue::Float(v) = self {
            if !v.is_finite() {
                return None;
            }
        }
        if self.field_type() == Some(target) {
            return Some(self.clone());
        }

        match (self, target) {
            (FieldValue::Null, _) => Some(FieldValue::Null),
            (FieldValue::Int(v), FieldType::Float) => Some(FieldValue::Float(*v as f64)),
            (FieldValue::Float(v), FieldType::Int) => {
                if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
                    Some(FieldValue::Int(*v as i64))
                } else {
                    None
                }
            }
            (FieldValue::Int(v), FieldType::Bool) => match v {
                0 => Some(FieldValue::Bool(false)),
                1 => Some(FieldValue::Bool(true)),
                _ => None,
            },
            (FieldValue::Int(v), FieldType::String) => Some(FieldValue::String(v.to_string())),
            (FieldValue::Float(v), FieldType::String) => Some(FieldValue::String(v.to_string())),
            (FieldValue::Bool(v), FieldType::String) => Some(FieldValue::String(v.to_string())),
            (FieldValue::String(s), FieldType::Int) => s.trim().parse::<i64>().ok().map(FieldValue::Int),
            (FieldValue::String(s), FieldType::Float) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(FieldValue::Float),
            (FieldValue::String(s), FieldType::Bool) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Some(FieldValue::Bool(true)),
                "false" | "0" | "no" => Some(FieldValue::Bool(false)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Whether the value is null or convertible to `target`
    pub fn conforms_to(&self, target: FieldType) -> bool {
        self.coerce_to(target).is_some()
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// A changed row pulled from a source
///
/// `fields` is an ordered map so that serialized records are stable
/// byte-for-byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier of the row in the source
    pub id: String,
    /// Modification/event timestamp used for change capture
    pub event_time: DateTime<Utc>,
    /// Logical extraction point, stamped by the extractor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_at: Option<DateTime<Utc>>,
    /// Named field values
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new(id: impl Into<String>, event_time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            event_time,
            extracted_at: None,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Missing fields and explicit nulls are both treated as null
    pub fn is_null(&self, name: &str) -> bool {
        self.fields.get(name).map(FieldValue::is_null).unwrap_or(true)
    }

    /// Extraction time, falling back to the event time for unstamped records
    pub fn extraction_time(&self) -> DateTime<Utc> {
        self.extracted_at.unwrap_or(self.event_time)
    }

    pub fn cursor(&self) -> Cursor {
        Cursor {
            event_time: self.event_time,
            id: self.id.clone(),
        }
    }
}

/// Keyset position: records are ordered by `(event_time, id)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor {
    pub event_time: DateTime<Utc>,
    pub id: String,
}

/// A bounded page request for changed rows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeQuery {
    /// Exclusive lower bound
    pub since: DateTime<Utc>,
    /// Inclusive upper bound
    pub until: DateTime<Utc>,
    /// Resume strictly after this position
    pub after: Option<Cursor>,
    /// Maximum number of rows to return
    pub limit: usize,
}

impl ChangeQuery {
    pub fn new(since: DateTime<Utc>, until: DateTime<Utc>, limit: usize) -> Self {
        Self {
            since,
            until,
            after: None,
            limit,
        }
    }

    /// Whether a record falls inside the query's bounds and after its cursor
    pub fn matches(&self, record: &Record) -> bool {
        if record.event_time <= self.since || record.event_time > self.until {
            return false;
        }
        match &self.after {
            Some(after) => record.cursor() > *after,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_field_value_untagged_serialization() {
        let record = Record::new("r-1", ts(1))
            .with_field("count", 3i64)
            .with_field("latency", 1.5f64)
            .with_field("ok", true)
            .with_field("label", "api")
            .with_field("missing", FieldValue::Null);

        let json = serde_json::to_string(&record).unwrap();
        let parsed: Record = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, record);
        assert_eq!(parsed.get("count"), Some(&FieldValue::Int(3)));
        assert_eq!(parsed.get("latency"), Some(&FieldValue::Float(1.5)));
        assert!(parsed.is_null("missing"));
        assert!(parsed.is_null("absent"));
    }

    #[test]
    fn test_non_finite_floats_do_not_conform() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let value = FieldValue::Float(value);
            assert_eq!(value.coerce_to(FieldType::Float), None);
            assert_eq!(value.coerce_to(FieldType::String), None);
            assert!(!value.conforms_to(FieldType::Float));
        }
        assert!(FieldValue::Float(1.5).conforms_to(FieldType::Float));
    }

    #[test]
    fn test_non_finite_floats_survive_serialization() {
        let record = Record::new("r-1", ts(1))
            .with_field("nan", f64::NAN)
            .with_field("neg", f64::NEG_INFINITY);

        let json = serde_json::to_string(&record).unwrap();
        let parsed: Record = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.get("nan"), Some(&FieldValue::String("NaN".to_string())));
        assert_eq!(parsed.get("neg"), Some(&FieldValue::String("-inf".to_string())));
        assert!(!parsed.get("nan").unwrap().conforms_to(FieldType::Float));
    }

    #[test]
    fn test_coerce_numeric_strings() {
        assert_eq!(
            FieldValue::from("42").coerce_to(FieldType::Int),
            Some(FieldValue::Int(42))
        );
        assert_eq!(
            FieldValue::from("2.5").coerce_to(FieldType::Float),
            Some(FieldValue::Float(2.5))
        );
        assert_eq!(FieldValue::from("abc").coerce_to(FieldType::Int), None);
        assert_eq!(
            FieldValue::Int(7).coerce_to(FieldType::Float),
            Some(FieldValue::Float(7.0))
        );
        assert_eq!(FieldValue::Float(7.5).coerce_to(FieldType::Int), None);
        assert_eq!(
            FieldValue::Null.coerce_to(FieldType::Bool),
            Some(FieldValue::Null)
        );
    }

    #[test]
    fn test_change_query_bounds() {
        let query = ChangeQuery::new(ts(1), ts(3), 100);

        assert!(!query.matches(&Record::new("a", ts(1))));
        assert!(query.matches(&Record::new("b", ts(2))));
        assert!(query.matches(&Record::new("c", ts(3))));
        assert!(!query.matches(&Record::new("d", ts(4))));
    }

    #[test]
    fn test_change_query_cursor() {
        let mut query = ChangeQuery::new(ts(0), ts(5), 100);
        query.after = Some(Cursor {
            event_time: ts(2),
            id: "b".to_string(),
        });

        assert!(!query.matches(&Record::new("a", ts(2))));
        assert!(query.matches(&Record::new("c", ts(2))));
        assert!(query.matches(&Record::new("a", ts(3))));
    }
}
