//! Error types for the notification pipeline
//!
//! Transport errors (`ListenerError`) are surfaced to the owner of the
//! listener. Everything else is scoped to a single notification and ends up
//! in an `ArchiveReport`, a `ControlOutcome` or a log line.

use thiserror::Error;

/// Transport listener failures
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("cannot connect to broker {broker}: {reason}")]
    Connection { broker: String, reason: String },

    #[error("subscription to '{topic}' failed: {reason}")]
    Subscription { topic: String, reason: String },

    #[error("connection to broker lost: {0}")]
    ConnectionLost(String),

    #[error("listener is not connected")]
    NotConnected,
}

/// Payload is not a structured notification document at all
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Syntax(#[from] serde_json::Error),

    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),
}

/// SOMIOD REST client failures
#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    #[error("resource already exists at {0}")]
    Conflict(String),

    #[error("unreadable response from {url}: {reason}")]
    InvalidBody { url: String, reason: String },

    #[error("invalid middleware URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Domain value could not be read from fetched content
#[derive(Debug, Error, PartialEq)]
pub enum ExtractionError {
    #[error("resource has no content")]
    MissingContent,

    #[error("malformed XML content: {0}")]
    Xml(String),

    #[error("malformed JSON content: {0}")]
    Json(String),

    #[error("field '{0}' not found in content")]
    MissingField(String),

    #[error("'{0}' is not a number")]
    NotNumeric(String),
}

/// Per-notification failure of the fetch & control loop
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("fetch failed: {0}")]
    Fetch(#[source] MiddlewareError),

    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("command submission failed: {0}")]
    CommandSubmission(#[source] MiddlewareError),
}

impl ControlError {
    /// Short failure kind used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::Fetch(_) => "fetch",
            ControlError::Extraction(_) => "extraction",
            ControlError::CommandSubmission(_) => "command_submission",
        }
    }
}

/// Configuration rejected at load time
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}
