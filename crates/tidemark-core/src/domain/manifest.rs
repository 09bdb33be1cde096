use chrono::{
    DateTime,
    NaiveDate,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

use super::validation::Tier;
use super::{
    DomainError,
    DomainResult,
};

const MAX_SOURCE_ID_LENGTH: usize = 128;

pub fn validate_source_id(source_id: &str) -> DomainResult<()> {
    if source_id.is_empty() {
        return Err(DomainError::InvalidConfig(
            "Source ID cannot be empty".to_string(),
        ));
    }

    if source_id.len() > MAX_SOURCE_ID_LENGTH {
        return Err(DomainError::InvalidConfig(format!(
            "Source ID exceeds maximum length of {} characters",
            MAX_SOURCE_ID_LENGTH
        )));
    }

    if !source_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(DomainError::InvalidConfig(format!(
            "Source ID '{}' contains invalid characters (only alphanumeric, underscore, hyphen, dot allowed)",
            source_id
        )));
    }

    if source_id.starts_with('.') {
        return Err(DomainError::InvalidConfig(format!(
            "Source ID '{}' cannot start with a dot",
            source_id
        )));
    }

    Ok(())
}

/// Logical partition of a tier
///
/// Raw partitions are keyed by window start, cleaned and aggregated ones by
/// calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub tier: Tier,
    pub source_id: String,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start: Option<DateTime<Utc>>,
}

impl PartitionKey {
    pub fn raw(source_id: &str, date: NaiveDate, window_start: DateTime<Utc>) -> Self {
        Self {
            tier: Tier::Raw,
            source_id: source_id.to_string(),
            date,
            window_start: Some(window_start),
        }
    }

    pub fn cleaned(source_id: &str, date: NaiveDate) -> Self {
        Self {
            tier: Tier::Cleaned,
            source_id: source_id.to_string(),
            date,
            window_start: None,
        }
    }

    pub fn aggregated(source_id: &str, date: NaiveDate) -> Self {
        Self {
            tier: Tier::Aggregated,
            source_id: source_id.to_string(),
            date,
            window_start: None,
        }
    }

    /// Prefix under which every partition of a tier and source lives
    pub fn tier_prefix(tier: Tier, source_id: &str) -> String {
        format!("{}/{}/", tier.as_str(), source_id)
    }

    /// Prefix of all raw windows of a given date
    pub fn raw_date_prefix(source_id: &str, date: NaiveDate) -> String {
        format!(
            "{}{}/",
            Self::tier_prefix(Tier::Raw, source_id),
            date.format("%Y-%m-%d")
        )
    }

    pub fn object_key(&self) -> String {
        match (self.tier, self.window_start) {
            (Tier::Raw, Some(start)) => format!(
                "{}{}.jsonl",
                Self::raw_date_prefix(&self.source_id, self.date),
                start.format("%Y%m%dT%H%M%SZ")
            ),
            (Tier::Raw, None) | (Tier::Cleaned, _) => format!(
                "{}{}.jsonl",
                Self::tier_prefix(self.tier, &self.source_id),
                self.date.format("%Y-%m-%d")
            ),
            (Tier::Aggregated, _) => format!(
                "{}{}.json",
                Self::tier_prefix(self.tier, &self.source_id),
                self.date.format("%Y-%m-%d")
            ),
        }
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.object_key())
    }
}

/// Manifest emitted alongside every tier write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub tier: Tier,
    pub partition_key: String,
    pub source_id: String,
    pub row_count: u64,
    pub byte_size: u64,
    /// SHA-256 hex digest of the payload
    pub checksum: String,
    /// Row count the source reported for the same bounds (raw tier only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_end: Option<DateTime<Utc>>,
    pub written_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_object_keys() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 5, 0, 0).unwrap();

        assert_eq!(
            PartitionKey::raw("orders", date, start).object_key(),
            "raw/orders/2024-03-01/20240301T050000Z.jsonl"
        );
        assert_eq!(
            PartitionKey::cleaned("orders", date).object_key(),
            "cleaned/orders/2024-03-01.jsonl"
        );
        assert_eq!(
            PartitionKey::aggregated("orders", date).object_key(),
            "aggregated/orders/2024-03-01.json"
        );
    }

    #[test]
    fn test_validate_source_id() {
        assert!(validate_source_id("orders").is_ok());
        assert!(validate_source_id("web-events_v2").is_ok());
        assert!(validate_source_id("").is_err());
        assert!(validate_source_id("../etc").is_err());
        assert!(validate_source_id("a/b").is_err());
        assert!(validate_source_id(&"a".repeat(200)).is_err());
    }
}
