//! Wire types for `GET /system/feeds`.

use serde::{Deserialize, Deserializer};

/// The full response body: one record per feed.
pub type StatusDocument = Vec<SyncRecord>;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SyncRecord {
    #[serde(default, deserialize_with = "null_as_default")]
    pub groups: Vec<Group>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Group {
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    /// Empty strings are normalised to `None`.
    #[serde(default, deserialize_with = "non_empty")]
    pub last_sync: Option<String>,
}

impl Group {
    pub fn new(name: impl Into<String>, last_sync: Option<&str>) -> Self {
        Self {
            name: name.into(),
            last_sync: last_sync.map(str::to_string),
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_engine_payload() {
        let json = r#"[
            {
                "name": "vulnerabilities",
                "created_at": "2024-01-01T00:00:00Z",
                "groups": [
                    {"name": "nvd", "last_sync": "2024-01-01T00:00:00Z", "record_count": 10},
                    {"name": "alpine:3.18", "last_sync": null}
                ]
            },
            {"name": "packages"}
        ]"#;
        let doc: StatusDocument = serde_json::from_str(json).unwrap();
        assert_eq!(doc.len(), 2);
        assert_eq!(doc[0].groups.len(), 2);
        assert_eq!(
            doc[0].groups[0].last_sync.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(doc[0].groups[1].last_sync, None);
        assert!(doc[1].groups.is_empty());
    }

    #[test]
    fn null_groups_and_missing_name() {
        let json = r#"[{"groups": null}, {"groups": [{"last_sync": ""}]}]"#;
        let doc: StatusDocument = serde_json::from_str(json).unwrap();
        assert!(doc[0].groups.is_empty());
        assert_eq!(doc[1].groups[0], Group::new("", None));
    }
}
