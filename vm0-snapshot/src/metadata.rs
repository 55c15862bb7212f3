use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted alongside a snapshot. Advisory only — restore never re-reads
/// this for correctness, only for observability (`vm0 clean`, logging).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub dh_port: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_size_mib: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balloon_mib: Option<u32>,
}

impl SnapshotMetadata {
    pub fn new(version: impl Into<String>, dh_port: u32) -> Self {
        Self {
            version: version.into(),
            created_at: Utc::now(),
            dh_port,
            mem_size_mib: None,
            balloon_mib: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let mut meta = SnapshotMetadata::new("1.2.3", 10000);
        meta.mem_size_mib = Some(1024);
        meta.balloon_mib = Some(512);

        let raw = serde_json::to_string(&meta).unwrap_or_else(|e| panic!("{e}"));
        let parsed: SnapshotMetadata = serde_json::from_str(&raw).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(parsed.version, "1.2.3");
        assert_eq!(parsed.dh_port, 10000);
        assert_eq!(parsed.mem_size_mib, Some(1024));
    }

    #[test]
    fn omits_optional_fields_when_absent() {
        let meta = SnapshotMetadata::new("1.2.3", 10000);
        let raw = serde_json::to_string(&meta).unwrap_or_else(|e| panic!("{e}"));
        assert!(!raw.contains("mem_size_mib"));
        assert!(!raw.contains("balloon_mib"));
    }
}
