//! Upstream data sources
//!
//! The cache only needs two operations from whatever holds the authoritative
//! mentor records, so any store (a hosted table API, a database) plugs in by
//! implementing [`DataSource`].

mod http;

pub use http::HttpDataSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;

/// One upstream record, kept opaque apart from its id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Upstream record id
    pub id: String,
    /// Record fields as returned by the upstream
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// Creation timestamp, when the upstream provides one
    #[serde(
        default,
        rename = "createdTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_time: Option<String>,
}

impl Record {
    /// Create a record with the given id and fields
    #[must_use]
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
            created_time: None,
        }
    }

    /// A string field, if present
    #[must_use]
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// Authoritative store of mentor records
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch every record
    async fn fetch_all(&self) -> Result<Vec<Record>>;

    /// Fetch one record by id; [`crate::Error::NotFound`] when it does not exist
    async fn fetch_one(&self, id: &str) -> Result<Record>;
}
