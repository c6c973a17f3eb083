//! Resource fetch & control loop
//!
//! A creation notification names a content-instance; the controller fetches
//! it, reads a numeric value out of its content, applies the configured
//! threshold rules and, when one fires, writes a command content-instance
//! back into the middleware. One attempt per notification, no retries.

use crate::config::{Config, ControlRule};
use crate::error::{ControlError, ExtractionError};
use crate::middleware::{ResourceHandle, ResourceRecord, ResourceStore};
use crate::notification::{EventType, Notification};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Static part of the control loop, derived from `Config`
#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub rules: Vec<ControlRule>,
    pub value_field: Option<String>,
    /// Middleware root, stripped from notification container paths
    pub root: String,
    pub source_app: String,
    pub source_container: String,
    pub command_prefix: String,
    pub command_app: Option<String>,
    pub command_container: Option<String>,
    pub command_content_type: String,
}

impl ControlSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            rules: config.control.rules.clone(),
            value_field: config.control.value_field.clone(),
            root: config.middleware.root.clone(),
            source_app: config.application.source_app.clone(),
            source_container: config.application.source_container.clone(),
            command_prefix: config.control.command_prefix.clone(),
            command_app: config.control.command_app.clone(),
            command_container: config.control.command_container.clone(),
            command_content_type: config.control.command_content_type.clone(),
        }
    }
}

/// Value read from a resource and what, if anything, to do about it
#[derive(Debug, Clone, PartialEq)]
pub struct ControlDecision {
    pub value: f64,
    pub action: Option<String>,
}

impl ControlDecision {
    pub fn action_required(&self) -> bool {
        self.action.is_some()
    }

    /// Command content-instance body
    pub fn command_payload(&self) -> Option<String> {
        self.action.as_deref().map(command_payload)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NoResourceName,
    NotCreation(EventType),
    /// The notification is about one of our own commands
    OwnCommand,
    NoContainer,
}

#[derive(Debug)]
pub enum ControlOutcome {
    Skipped(SkipReason),
    /// Value read, no rule fired
    Idle(ControlDecision),
    Triggered {
        decision: ControlDecision,
        command: ResourceHandle,
    },
    Failed(ControlError),
}

impl ControlOutcome {
    pub fn is_triggered(&self) -> bool {
        matches!(self, ControlOutcome::Triggered { .. })
    }
}

/// Fires the highest threshold strictly below `value`
pub fn decide(value: f64, rules: &[ControlRule]) -> ControlDecision {
    let action = rules
        .iter()
        .filter(|rule| value > rule.threshold)
        .max_by(|a, b| a.threshold.total_cmp(&b.threshold))
        .map(|rule| rule.action.clone());
    ControlDecision { value, action }
}

/// `<cmd>ACTION</cmd>`
pub fn command_payload(action: &str) -> String {
    format!("<cmd>{}</cmd>", quick_xml::escape::escape(action))
}

/// Read the numeric value of a content-instance according to its content type
pub fn extract_value(record: &ResourceRecord, field: Option<&str>) -> Result<f64, ExtractionError> {
    let content = record
        .content
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or(ExtractionError::MissingContent)?;

    let declared = record.content_type.as_deref().unwrap_or_default().to_ascii_lowercase();
    if declared.contains("xml") || (!declared.contains("json") && content.starts_with('<')) {
        xml_value(content, field)
    } else if declared.contains("json") || content.starts_with('{') || content.starts_with('[') {
        json_value(content, field)
    } else {
        parse_number(content)
    }
}

fn xml_value(content: &str, field: Option<&str>) -> Result<f64, ExtractionError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut depth = 0usize;
    let mut capture: Option<usize> = None;
    let mut text = String::new();
    let mut found = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                if capture.is_none() && element_matches(e.local_name().as_ref(), depth, field) {
                    capture = Some(depth);
                }
            }
            Ok(Event::Empty(e)) => {
                if capture.is_none() && element_matches(e.local_name().as_ref(), depth + 1, field) {
                    found = true;
                    break;
                }
            }
            Ok(Event::Text(t)) if capture.is_some() => {
                let chunk = t.unescape().map_err(|e| ExtractionError::Xml(e.to_string()))?;
                text.push_str(&chunk);
            }
            Ok(Event::CData(c)) if capture.is_some() => {
                text.push_str(&String::from_utf8_lossy(&c.into_inner()));
            }
            Ok(Event::End(_)) => {
                if capture == Some(depth) {
                    found = true;
                    break;
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ExtractionError::Xml(e.to_string())),
        }
    }

    if !found {
        return Err(match field {
            Some(name) => ExtractionError::MissingField(name.to_string()),
            None => ExtractionError::Xml("no complete root element".to_string()),
        });
    }
    parse_number(&text)
}

/// Named element anywhere, or the root element when no name is configured
fn element_matches(name: &[u8], depth: usize, field: Option<&str>) -> bool {
    match field {
        Some(wanted) => name == wanted.as_bytes(),
        None => depth == 1,
    }
}

fn json_value(content: &str, field: Option<&str>) -> Result<f64, ExtractionError> {
    let value: Value =
        serde_json::from_str(content).map_err(|e| ExtractionError::Json(e.to_string()))?;

    let target = match (field, &value) {
        (Some(name), Value::Object(object)) => object
            .get(name)
            .ok_or_else(|| ExtractionError::MissingField(name.to_string()))?,
        (Some(name), _) => return Err(ExtractionError::MissingField(name.to_string())),
        (None, Value::Object(object)) if object.len() == 1 => object.values().next().unwrap_or(&value),
        (None, _) => &value,
    };

    match target {
        Value::Number(n) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ExtractionError::NotNumeric(n.to_string())),
        Value::String(s) => parse_number(s),
        other => Err(ExtractionError::NotNumeric(other.to_string())),
    }
}

/// Invariant-culture decimal; NaN and infinities are rejected
fn parse_number(raw: &str) -> Result<f64, ExtractionError> {
    let trimmed = raw.trim();
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ExtractionError::NotNumeric(trimmed.to_string()))
}

/// Drives the fetch → extract → decide → command sequence
pub struct Controller {
    store: Arc<dyn ResourceStore>,
    settings: ControlSettings,
}

impl Controller {
    pub fn new(store: Arc<dyn ResourceStore>, settings: ControlSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    /// Never fails past this boundary; failures come back as `ControlOutcome::Failed`
    pub async fn handle(&self, notification: &Notification) -> ControlOutcome {
        let label = notification.label();

        if notification.resource_name.is_empty() {
            debug!("Notification {} has no resource name, nothing to fetch", label);
            return ControlOutcome::Skipped(SkipReason::NoResourceName);
        }
        let event = notification.event();
        if !event.is_creation() {
            debug!("Notification {} is a '{}' event, ignored", label, notification.event_type);
            return ControlOutcome::Skipped(SkipReason::NotCreation(event));
        }
        if self.is_own_command(&notification.resource_name) {
            debug!("Notification {} is one of our commands, ignored", label);
            return ControlOutcome::Skipped(SkipReason::OwnCommand);
        }
        let Some(source) = self.resolve_source(notification) else {
            warn!("Notification {}: no container to fetch from", label);
            return ControlOutcome::Skipped(SkipReason::NoContainer);
        };

        let record = match self.store.fetch_content_instance(&source).await {
            Ok(record) => record,
            Err(e) => {
                error!("Notification {} [fetch]: {}", label, e);
                return ControlOutcome::Failed(ControlError::Fetch(e));
            }
        };

        let value = match extract_value(&record, self.settings.value_field.as_deref()) {
            Ok(value) => value,
            Err(e) => {
                error!("Notification {} [extraction]: {}", label, e);
                return ControlOutcome::Failed(ControlError::Extraction(e));
            }
        };

        let decision = decide(value, &self.settings.rules);
        let Some(action) = decision.action.clone() else {
            info!("Reading {} = {:.1}, no action", source, value);
            return ControlOutcome::Idle(decision);
        };

        warn!("ALERT: {} = {:.1} is above threshold, sending {}", source, value, action);
        match self.submit(&action, Some(&source)).await {
            Ok(command) => ControlOutcome::Triggered { decision, command },
            Err(e) => {
                error!("Notification {} [command_submission]: {}", label, e);
                ControlOutcome::Failed(e)
            }
        }
    }

    /// Manual command outside the decision rules
    pub async fn send_command(&self, action: &str) -> Result<ResourceHandle, ControlError> {
        self.submit(action, None).await
    }

    async fn submit(
        &self,
        action: &str,
        source: Option<&ResourceHandle>,
    ) -> Result<ResourceHandle, ControlError> {
        let target = self.command_target(source);
        let payload = command_payload(action);

        self.store
            .create_content_instance(&target, &self.settings.command_content_type, &payload)
            .await
            .map_err(ControlError::CommandSubmission)?;

        info!("Command sent: {} -> {}", action, target);
        Ok(target)
    }

    fn command_target(&self, source: Option<&ResourceHandle>) -> ResourceHandle {
        let s = &self.settings;
        let app = s
            .command_app
            .clone()
            .or_else(|| source.map(|h| h.application.clone()))
            .unwrap_or_else(|| s.source_app.clone());
        let container = s
            .command_container
            .clone()
            .or_else(|| source.map(|h| h.container.clone()))
            .unwrap_or_else(|| s.source_container.clone());
        ResourceHandle::new(app, container, self.command_name())
    }

    /// `{prefix}-{unix millis}-{8 hex}`
    fn command_name(&self) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{}-{}-{}",
            self.settings.command_prefix,
            chrono::Utc::now().timestamp_millis(),
            &id[..8]
        )
    }

    fn is_own_command(&self, resource_name: &str) -> bool {
        resource_name
            .strip_prefix(&self.settings.command_prefix)
            .is_some_and(|rest| rest.starts_with('-'))
    }

    /// Container from the notification path when present, configured one otherwise
    fn resolve_source(&self, notification: &Notification) -> Option<ResourceHandle> {
        let segments = container_segments(&notification.container_path, &self.settings.root);
        let (app, container) = match segments.as_slice() {
            [] => (self.settings.source_app.as_str(), self.settings.source_container.as_str()),
            [container] => (self.settings.source_app.as_str(), *container),
            [.., app, container] => (*app, *container),
        };
        if app.is_empty() || container.is_empty() {
            return None;
        }
        Some(ResourceHandle::new(app, container, notification.resource_name.clone()))
    }
}

/// `/api/somiod/app/container` → `[app, container]`; `readings` → `[readings]`
fn container_segments<'a>(path: &'a str, root: &str) -> Vec<&'a str> {
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.first() == Some(&"api") {
        segments.remove(0);
    }
    if segments.len() > 1 && segments.first() == Some(&root) {
        segments.remove(0);
    }
    segments
}
