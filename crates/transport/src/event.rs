use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One unit of server-pushed data for a conversation turn.
///
/// Any number of `Chunk`/`Sources` events precede exactly one terminal event
/// (`Error` or `Done`).
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(String),
    Sources(Vec<SourceDocument>),
    Error(String),
    Done,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Done)
    }
}

/// Identifier linking an inline citation marker to a source document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CitationId(String);

impl CitationId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty id carries no citation.
    pub fn is_truthy(&self) -> bool {
        !self.0.is_empty()
    }

    /// Falsiness follows the JSON type: `null`, `false`, `0` and `""` mean
    /// no citation. Strings such as `"0"` or `" "` are kept as given.
    fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null | serde_json::Value::Bool(false) => None,
            serde_json::Value::Bool(true) => Some(Self::new("true")),
            serde_json::Value::String(raw) => (!raw.is_empty()).then(|| Self::new(raw)),
            serde_json::Value::Number(number) => {
                let is_zero = number.as_f64().is_some_and(|value| value == 0.0);
                (!is_zero).then(|| Self::new(number.to_string()))
            }
            other => Some(Self::new(other.to_string())),
        }
    }
}

impl fmt::Display for CitationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl From<&str> for CitationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<u64> for CitationId {
    fn from(value: u64) -> Self {
        Self::new(value.to_string())
    }
}

/// Where a retrieved document lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceLocation {
    File {
        #[serde(rename = "bucketName")]
        bucket_name: String,
        #[serde(rename = "objectName")]
        object_name: String,
    },
    Link {
        #[serde(rename = "link")]
        url: String,
    },
}

/// A citation/reference item attached to an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDocument {
    #[serde(flatten)]
    pub location: SourceLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reranker_score: Option<f64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_citation_id",
        deserialize_with = "deserialize_citation_id"
    )]
    pub citation_id: Option<CitationId>,
}

impl SourceDocument {
    pub fn file(bucket_name: impl Into<String>, object_name: impl Into<String>) -> Self {
        Self::at(SourceLocation::File {
            bucket_name: bucket_name.into(),
            object_name: object_name.into(),
        })
    }

    pub fn link(url: impl Into<String>) -> Self {
        Self::at(SourceLocation::Link { url: url.into() })
    }

    fn at(location: SourceLocation) -> Self {
        Self {
            location,
            vector_distance: None,
            reranker_score: None,
            citation_id: None,
        }
    }

    pub fn with_citation_id(mut self, citation_id: impl Into<CitationId>) -> Self {
        self.citation_id = Some(citation_id.into());
        self
    }

    pub fn with_scores(mut self, vector_distance: f64, reranker_score: f64) -> Self {
        self.vector_distance = Some(vector_distance);
        self.reranker_score = Some(reranker_score);
        self
    }

    /// Returns the citation id only when it is usable as a dedup key.
    pub fn citation_key(&self) -> Option<&CitationId> {
        self.citation_id.as_ref().filter(|id| id.is_truthy())
    }
}

fn serialize_citation_id<S>(value: &Option<CitationId>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(id) => serializer.serialize_str(id.as_str()),
        None => serializer.serialize_none(),
    }
}

fn deserialize_citation_id<'de, D>(deserializer: D) -> Result<Option<CitationId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(CitationId::from_json))
}
