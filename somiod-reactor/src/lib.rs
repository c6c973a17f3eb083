//! SOMIOD Reactor - notification-driven control for SOMIOD applications
//!
//! This crate provides the reactive side of a SOMIOD dashboard:
//! - MQTT listener delivering subscription notifications in broker order
//! - Lenient notification decoding
//! - Per-application archive of every notification, validated against a schema
//! - Fetch of the created resource, threshold rules and command write-back

pub mod archive;
pub mod config;
pub mod control;
pub mod error;
pub mod listener;
pub mod middleware;
pub mod notification;
pub mod pipeline;
pub mod runtime;

pub use archive::{ArchiveReport, Archiver};
pub use config::Config;
pub use control::{ControlDecision, ControlOutcome, ControlSettings, Controller, SkipReason};
pub use error::{
    ConfigError, ControlError, DecodeError, ExtractionError, ListenerError, MiddlewareError,
};
pub use listener::{Delivery, NotificationListener, RawMessage};
pub use middleware::{MiddlewareClient, ResourceHandle, ResourceRecord, ResourceStore};
pub use notification::{EventType, Notification};
pub use pipeline::{Pipeline, PipelineEvent, PipelineHandle};
