//! SOMIOD middleware client
//!
//! Handles:
//! - Resource creation (application, container, subscription, content-instance)
//! - Conflict fallback: HTTP 409 on create fetches the existing resource
//! - Discovery listings via the `somiod-discovery` header
//! - Defensive, field-by-field decoding of responses into `ResourceRecord`

use crate::config::MiddlewareConfig;
use crate::error::MiddlewareError;
use crate::notification::optional_text_field;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DISCOVERY_HEADER: &str = "somiod-discovery";

/// SOMIOD `evt` code for creation events
pub const EVT_CREATION: i64 = 1;

/// Addressing triple of a content-instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub application: String,
    pub container: String,
    pub resource_name: String,
}

impl ResourceHandle {
    pub fn new(
        application: impl Into<String>,
        container: impl Into<String>,
        resource_name: impl Into<String>,
    ) -> Self {
        Self {
            application: application.into(),
            container: container.into(),
            resource_name: resource_name.into(),
        }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.application, self.container, self.resource_name)
    }
}

/// Middleware resource as returned by the API; every field is optional
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceRecord {
    pub resource_name: Option<String>,
    pub creation_datetime: Option<String>,
    pub content_type: Option<String>,
    pub content: Option<String>,
    pub evt: Option<i64>,
    pub endpoint: Option<String>,
}

impl ResourceRecord {
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        Some(Self {
            resource_name: optional_text_field(object, "resource_name"),
            creation_datetime: optional_text_field(object, "creation_datetime"),
            content_type: optional_text_field(object, "content_type"),
            content: optional_text_field(object, "content"),
            evt: object.get("evt").and_then(|evt| match evt {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }),
            endpoint: optional_text_field(object, "endpoint"),
        })
    }

    pub fn name(&self) -> &str {
        self.resource_name.as_deref().unwrap_or_default()
    }
}

/// The two middleware operations the control loop depends on
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn fetch_content_instance(
        &self,
        handle: &ResourceHandle,
    ) -> Result<ResourceRecord, MiddlewareError>;

    /// `handle.resource_name` is the name of the instance to create
    async fn create_content_instance(
        &self,
        handle: &ResourceHandle,
        content_type: &str,
        content: &str,
    ) -> Result<ResourceRecord, MiddlewareError>;
}

/// HTTP client bound to one middleware base URL
#[derive(Clone)]
pub struct MiddlewareClient {
    http: Client,
    base_url: Url,
    root: String,
}

impl MiddlewareClient {
    pub fn new(config: &MiddlewareConfig) -> Result<Self, MiddlewareError> {
        let invalid = |reason: String| MiddlewareError::InvalidUrl {
            url: config.base_url.clone(),
            reason,
        };
        let base_url = Url::parse(&config.base_url).map_err(|e| invalid(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid("not a base URL".to_string()));
        }

        let http = Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|source| MiddlewareError::Transport { url: config.base_url.clone(), source })?;

        Ok(Self { http, base_url, root: config.root.clone() })
    }

    /// `{base}/api/{root}/{segments...}`, each segment percent-encoded
    pub fn url(&self, segments: &[&str]) -> Result<String, MiddlewareError> {
        if let Some(bad) = segments
            .iter()
            .find(|s| s.is_empty() || **s == "." || **s == "..")
        {
            return Err(MiddlewareError::InvalidUrl {
                url: self.base_url.to_string(),
                reason: format!("'{bad}' is not a resource name"),
            });
        }

        let mut url = self.base_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        {
            let mut path = url.path_segments_mut().map_err(|_| MiddlewareError::InvalidUrl {
                url: self.base_url.to_string(),
                reason: "not a base URL".to_string(),
            })?;
            path.pop_if_empty().push("api").push(&self.root).extend(segments);
        }
        Ok(url.into())
    }

    pub async fn create_application(&self, name: &str) -> Result<ResourceRecord, MiddlewareError> {
        let url = self.url(&[])?;
        match self.post_record(&url, &json!({ "resource_name": name })).await {
            Err(MiddlewareError::Conflict(_)) => {
                warn!("Application '{}' already exists, retrieving...", name);
                self.get_application(name).await
            }
            other => other,
        }
    }

    pub async fn get_application(&self, name: &str) -> Result<ResourceRecord, MiddlewareError> {
        self.get_record(&self.url(&[name])?).await
    }

    pub async fn create_container(
        &self,
        app: &str,
        container: &str,
    ) -> Result<ResourceRecord, MiddlewareError> {
        let url = self.url(&[app])?;
        match self.post_record(&url, &json!({ "resource_name": container })).await {
            Err(MiddlewareError::Conflict(_)) => {
                warn!("Container '{}' already exists", container);
                self.get_container(app, container).await
            }
            other => other,
        }
    }

    pub async fn get_container(
        &self,
        app: &str,
        container: &str,
    ) -> Result<ResourceRecord, MiddlewareError> {
        self.get_record(&self.url(&[app, container])?).await
    }

    pub async fn create_subscription(
        &self,
        app: &str,
        container: &str,
        name: &str,
        evt: i64,
        endpoint: &str,
    ) -> Result<ResourceRecord, MiddlewareError> {
        let url = self.url(&[app, container, "subs"])?;
        let body = json!({ "resource_name": name, "evt": evt, "endpoint": endpoint });
        match self.post_record(&url, &body).await {
            Err(MiddlewareError::Conflict(_)) => {
                warn!("Subscription '{}' already exists", name);
                self.get_subscription(app, container, name).await
            }
            other => other,
        }
    }

    pub async fn get_subscription(
        &self,
        app: &str,
        container: &str,
        name: &str,
    ) -> Result<ResourceRecord, MiddlewareError> {
        self.get_record(&self.url(&[app, container, "subs", name])?).await
    }

    pub async fn get_content_instance(
        &self,
        handle: &ResourceHandle,
    ) -> Result<ResourceRecord, MiddlewareError> {
        self.get_record(&self.url(&[
            handle.application.as_str(),
            handle.container.as_str(),
            handle.resource_name.as_str(),
        ])?)
        .await
    }

    pub async fn post_content_instance(
        &self,
        handle: &ResourceHandle,
        content_type: &str,
        content: &str,
    ) -> Result<ResourceRecord, MiddlewareError> {
        let url = self.url(&[handle.application.as_str(), handle.container.as_str()])?;
        let body = json!({
            "resource_name": handle.resource_name,
            "content_type": content_type,
            "content": content,
        });
        self.post_record(&url, &body).await
    }

    pub async fn discover_applications(&self) -> Result<Vec<String>, MiddlewareError> {
        let url = self.url(&[])?;
        let value = self
            .send(self.http.get(&url).header(DISCOVERY_HEADER, "application"), "GET", &url)
            .await?;
        Ok(discovered_names(&value))
    }

    pub async fn discover_content_instances(
        &self,
        app: &str,
        container: &str,
    ) -> Result<Vec<String>, MiddlewareError> {
        let url = self.url(&[app, container])?;
        let value = self
            .send(self.http.get(&url).header(DISCOVERY_HEADER, "content-instance"), "GET", &url)
            .await?;
        Ok(discovered_names(&value))
    }

    /// Deletes the application and all its children
    pub async fn delete_application(&self, name: &str) -> Result<(), MiddlewareError> {
        let url = self.url(&[name])?;
        self.send(self.http.delete(&url), "DELETE", &url).await?;
        info!("Application '{}' deleted", name);
        Ok(())
    }

    async fn get_record(&self, url: &str) -> Result<ResourceRecord, MiddlewareError> {
        let value = self.send(self.http.get(url), "GET", url).await?;
        to_record(url, &value)
    }

    async fn post_record(&self, url: &str, body: &Value) -> Result<ResourceRecord, MiddlewareError> {
        let value = self.send(self.http.post(url).json(body), "POST", url).await?;
        to_record(url, &value)
    }

    /// Send and read the body as JSON; an empty body reads as `null`
    async fn send(
        &self,
        request: RequestBuilder,
        method: &'static str,
        url: &str,
    ) -> Result<Value, MiddlewareError> {
        debug!("{} {}", method, url);
        let response = request
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|source| MiddlewareError::Transport { url: url.to_string(), source })?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Err(MiddlewareError::Conflict(url.to_string()));
        }

        let body = response
            .text()
            .await
            .map_err(|source| MiddlewareError::Transport { url: url.to_string(), source })?;

        if !status.is_success() {
            return Err(MiddlewareError::Status {
                method,
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| MiddlewareError::InvalidBody {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl ResourceStore for MiddlewareClient {
    async fn fetch_content_instance(
        &self,
        handle: &ResourceHandle,
    ) -> Result<ResourceRecord, MiddlewareError> {
        self.get_content_instance(handle).await
    }

    async fn create_content_instance(
        &self,
        handle: &ResourceHandle,
        content_type: &str,
        content: &str,
    ) -> Result<ResourceRecord, MiddlewareError> {
        self.post_content_instance(handle, content_type, content).await
    }
}

fn to_record(url: &str, value: &Value) -> Result<ResourceRecord, MiddlewareError> {
    match value {
        // some servers answer 201 with no body
        Value::Null => Ok(ResourceRecord::default()),
        other => ResourceRecord::from_value(other).ok_or_else(|| MiddlewareError::InvalidBody {
            url: url.to_string(),
            reason: "expected a JSON object".to_string(),
        }),
    }
}

/// Discovery answers are name lists; tolerate records and paths too
fn discovered_names(value: &Value) -> Vec<String> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(_) => ResourceRecord::from_value(item).and_then(|r| r.resource_name),
            _ => None,
        })
        .collect()
}
