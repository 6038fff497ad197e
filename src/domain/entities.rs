//! Server-owned records as seen by the client cache.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use super::error::DomainError;

/// Resource name used for board posts.
pub const POSTS_RESOURCE: &str = "posts";

/// The partition a set of entities belongs to.
///
/// Written on the wire as `<resource>-<partition>` (for example `posts-notice`)
/// or as a bare `<resource>` for unpartitioned collections such as `review`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Collection {
    resource: String,
    partition: Option<String>,
}

impl Collection {
    pub fn new(resource: impl Into<String>, partition: Option<String>) -> Self {
        Self {
            resource: resource.into(),
            partition,
        }
    }

    /// Posts of a single board.
    pub fn posts(board_key: impl Into<String>) -> Self {
        Self::new(POSTS_RESOURCE, Some(board_key.into()))
    }

    /// Parse a collection marker, splitting on the first `-`.
    pub fn parse(marker: &str) -> Result<Self, DomainError> {
        let marker = marker.trim();
        if marker.is_empty() {
            return Err(DomainError::validation("collection marker is empty"));
        }

        let (resource, partition) = match marker.split_once('-') {
            Some((resource, partition)) => {
                if partition.is_empty() {
                    return Err(DomainError::validation(format!(
                        "collection marker `{marker}` has an empty partition"
                    )));
                }
                (resource, Some(partition.to_string()))
            }
            None => (marker, None),
        };

        if resource.is_empty()
            || !resource
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(DomainError::validation(format!(
                "collection marker `{marker}` has an invalid resource name"
            )));
        }

        Ok(Self::new(resource, partition))
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn partition(&self) -> Option<&str> {
        self.partition.as_deref()
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.partition {
            Some(partition) => write!(f, "{}-{}", self.resource, partition),
            None => f.write_str(&self.resource),
        }
    }
}

impl FromStr for Collection {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Stable identifier of a server-owned record.
///
/// The data service sends numeric or string ids; both are kept as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum WireId {
            Text(String),
            Number(serde_json::Number),
        }

        match WireId::deserialize(deserializer)? {
            WireId::Text(text) if text.trim().is_empty() => {
                Err(D::Error::custom("entity id must not be empty"))
            }
            WireId::Text(text) => Ok(Self(text)),
            WireId::Number(number) => Ok(Self(number.to_string())),
        }
    }
}

/// A post-like record owned by the data service.
///
/// Fields beyond the ones the cache needs are preserved verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    pub title: String,
    pub author: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        author: impl Into<String>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: EntityId::new(id),
            title: title.into(),
            author: author.into(),
            created_at,
            extra: Map::new(),
        }
    }
}

/// Position of a cached page inside its paginated query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn collection_parses_partitioned_marker() {
        let collection = Collection::parse("posts-notice").expect("valid marker");
        assert_eq!(collection.resource(), "posts");
        assert_eq!(collection.partition(), Some("notice"));
        assert_eq!(collection.to_string(), "posts-notice");
    }

    #[test]
    fn collection_keeps_dashes_inside_partition() {
        let collection = Collection::parse("posts-free-board").expect("valid marker");
        assert_eq!(collection.partition(), Some("free-board"));
        assert_eq!(collection, Collection::posts("free-board"));
    }

    #[test]
    fn collection_without_partition() {
        let collection: Collection = "review".parse().expect("valid marker");
        assert_eq!(collection.resource(), "review");
        assert!(collection.partition().is_none());
        assert_eq!(collection.to_string(), "review");
    }

    #[test]
    fn collection_rejects_malformed_markers() {
        assert!(Collection::parse("").is_err());
        assert!(Collection::parse("   ").is_err());
        assert!(Collection::parse("posts-").is_err());
        assert!(Collection::parse("-notice").is_err());
        assert!(Collection::parse("po sts").is_err());
    }

    #[test]
    fn entity_accepts_numeric_ids_and_keeps_extra_fields() {
        let json = r#"{
            "id": 42,
            "title": "Opening hours",
            "author": "admin",
            "createdAt": "2026-10-01T09:30:00Z",
            "viewCount": 7
        }"#;

        let entity: Entity = serde_json::from_str(json).expect("entity should decode");
        assert_eq!(entity.id, EntityId::new("42"));
        assert_eq!(entity.created_at, datetime!(2026-10-01 9:30 UTC));
        assert_eq!(entity.extra.get("viewCount"), Some(&Value::from(7)));
    }

    #[test]
    fn entity_rejects_blank_id() {
        let json =
            r#"{"id": " ", "title": "t", "author": "a", "createdAt": "2026-10-01T09:30:00Z"}"#;
        assert!(serde_json::from_str::<Entity>(json).is_err());
    }
}
