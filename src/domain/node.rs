//! Content nodes as they live inside a published snapshot.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Source-assigned node identity.
pub type NodeId = i64;

/// Parent id the source uses for top-level content.
pub const ROOT_ID: NodeId = -1;

/// Opaque content carried by a node.
///
/// `attributes` keeps the order the source produced them in; `data` holds the
/// nested element data verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub content_type: String,
    #[serde(default)]
    pub attributes: Vec<(String, String)>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload is missing a content type")]
    MissingContentType,
}

impl Payload {
    /// Parse the raw payload text produced by the source.
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        let payload: Payload = serde_json::from_str(raw)?;
        if payload.content_type.trim().is_empty() {
            return Err(PayloadError::MissingContentType);
        }
        Ok(payload)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// One row as read from the relational source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    pub id: NodeId,
    pub parent_id: NodeId,
    pub sort_order: i32,
    pub level: i32,
    pub raw_payload: String,
}

/// A node inside a snapshot. Children are referenced by id and always sorted
/// ascending by `sort_order`.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub parent_id: NodeId,
    pub sort_order: i32,
    pub level: i32,
    pub payload: Payload,
    pub(crate) children: Vec<NodeId>,
}

impl Node {
    pub fn new(id: NodeId, parent_id: NodeId, sort_order: i32, level: i32, payload: Payload) -> Self {
        Self {
            id,
            parent_id,
            sort_order,
            level,
            payload,
            children: Vec::new(),
        }
    }

    /// Build a detached node from a source row.
    pub fn from_row(row: &SourceRow) -> Result<Self, PayloadError> {
        let payload = Payload::parse(&row.raw_payload)?;
        Ok(Self::new(
            row.id,
            row.parent_id,
            row.sort_order,
            row.level,
            payload,
        ))
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn content_type(&self) -> &str {
        &self.payload.content_type
    }

    pub fn is_top_level(&self) -> bool {
        self.parent_id == ROOT_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keeps_attribute_order() {
        let payload = Payload::parse(
            r#"{"content_type":"article","attributes":[["b","2"],["a","1"]],"data":{"body":"x"}}"#,
        )
        .expect("valid payload");

        assert_eq!(payload.content_type, "article");
        assert_eq!(payload.attributes[0].0, "b");
        assert_eq!(payload.attribute("a"), Some("1"));
        assert_eq!(payload.data["body"], "x");
    }

    #[test]
    fn parse_rejects_blank_content_type() {
        let err = Payload::parse(r#"{"content_type":"  "}"#).unwrap_err();
        assert!(matches!(err, PayloadError::MissingContentType));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            Payload::parse("<node id=\"1\"/>"),
            Err(PayloadError::Malformed(_))
        ));
    }
}
