//! Bus topics

use catalog_core::{ImportId, OperationId, Source};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A notification topic.
///
/// String forms: `operation:<id>`, `import:<id>`, `<source>-status`,
/// `<source>-progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Topic {
    /// Every event of one batch operation
    Operation(OperationId),
    /// Every event of one import job
    Import(ImportId),
    /// Status transitions of operations on a source
    SourceStatus(Source),
    /// Progress of operations on a source
    SourceProgress(Source),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Operation(id) => write!(f, "operation:{}", id),
            Topic::Import(id) => write!(f, "import:{}", id),
            Topic::SourceStatus(source) => write!(f, "{}-status", source),
            Topic::SourceProgress(source) => write!(f, "{}-progress", source),
        }
    }
}

/// Error when parsing a topic string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicParseError(pub String);

impl fmt::Display for TopicParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid topic: {}", self.0)
    }
}

impl std::error::Error for TopicParseError {}

impl FromStr for Topic {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TopicParseError(s.to_string());
        if let Some(id) = s.strip_prefix("operation:") {
            return Uuid::parse_str(id).map(Topic::Operation).map_err(|_| invalid());
        }
        if let Some(id) = s.strip_prefix("import:") {
            return Uuid::parse_str(id).map(Topic::Import).map_err(|_| invalid());
        }
        if let Some(source) = s.strip_suffix("-status") {
            return Source::from_db_str(source)
                .map(Topic::SourceStatus)
                .map_err(|_| invalid());
        }
        if let Some(source) = s.strip_suffix("-progress") {
            return Source::from_db_str(source)
                .map(Topic::SourceProgress)
                .map_err(|_| invalid());
        }
        Err(invalid())
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.to_string()
    }
}
