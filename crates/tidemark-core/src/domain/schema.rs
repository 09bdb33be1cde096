use serde::{
    Deserialize,
    Serialize,
};
use tidemark_source_api::{
    FieldType,
    FieldValue,
    Record,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Allowed values for categorical string fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            min: None,
            max: None,
            allowed: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn allowed<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn has_range(&self) -> bool {
        self.min.is_some() || self.max.is_some()
    }

    pub fn in_range(&self, value: f64) -> bool {
        self.min.map(|min| value >= min).unwrap_or(true)
            && self.max.map(|max| value <= max).unwrap_or(true)
    }

    pub fn is_categorical(&self) -> bool {
        self.allowed.is_some()
    }

    pub fn allows(&self, value: &str) -> bool {
        self.allowed
            .as_ref()
            .map(|allowed| allowed.iter().any(|v| v == value))
            .unwrap_or(true)
    }
}

/// Declared schema for a source's records
///
/// Unknown fields are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordSchema {
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    /// Categorical field the aggregated tier groups by
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<String>,
    /// Boolean field marking a record as an error, used for error rates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_flag: Option<String>,
}

impl RecordSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self {
            fields,
            dimension: None,
            error_flag: None,
        }
    }

    pub fn with_dimension(mut self, field: impl Into<String>) -> Self {
        self.dimension = Some(field.into());
        self
    }

    pub fn with_error_flag(mut self, field: impl Into<String>) -> Self {
        self.error_flag = Some(field.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }

    pub fn ranged_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields
            .iter()
            .filter(|f| f.field_type.is_numeric() && f.has_range())
    }

    pub fn categorical_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.is_categorical())
    }

    /// Numeric fields summarized by the aggregated tier
    pub fn metric_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.field_type.is_numeric())
    }

    /// Normalizes declared fields to their declared types.
    ///
    /// Values that cannot be converted are left as-is so the cleaned-tier
    /// schema check can report them; the returned count is the number of
    /// such values.
    pub fn normalize(&self, record: &mut Record) -> usize {
        let mut unconvertible = 0;
        for spec in &self.fields {
            if let Some(value) = record.fields.get_mut(&spec.name) {
                match value.coerce_to(spec.field_type) {
                    Some(converted) => *value = converted,
                    None => unconvertible += 1,
                }
            } else if !spec.required {
                record.fields.insert(spec.name.clone(), FieldValue::Null);
            }
        }
        unconvertible
    }
}
