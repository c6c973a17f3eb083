/*!
Mock SOMIOD middleware pour développement sans serveur

Implémente `ResourceStore` en mémoire: les content-instances peuvent être
pré-chargées, toutes les lectures et créations sont enregistrées pour les
assertions, et des pannes peuvent être simulées.
*/

use async_trait::async_trait;
use somiod_reactor::{MiddlewareError, ResourceHandle, ResourceRecord, ResourceStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Content-instance créée via le stub
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedInstance {
    pub handle: ResourceHandle,
    pub content_type: String,
    pub content: String,
}

/// Middleware en mémoire, clonable et partagé entre test et pipeline
#[derive(Clone, Default)]
pub struct MockMiddleware {
    instances: Arc<Mutex<HashMap<String, ResourceRecord>>>,
    fetches: Arc<Mutex<Vec<ResourceHandle>>>,
    created: Arc<Mutex<Vec<CreatedInstance>>>,
    fail_fetch: Arc<AtomicBool>,
    fail_create: Arc<AtomicBool>,
}

fn key(handle: &ResourceHandle) -> String {
    handle.to_string()
}

impl MockMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pré-charge une content-instance (ex: `<temp>27.3</temp>`)
    pub fn insert_content_instance(
        &self,
        app: &str,
        container: &str,
        name: &str,
        content_type: &str,
        content: &str,
    ) {
        let handle = ResourceHandle::new(app, container, name);
        let record = ResourceRecord {
            resource_name: Some(name.to_string()),
            content_type: Some(content_type.to_string()),
            content: Some(content.to_string()),
            ..Default::default()
        };
        self.instances.lock().unwrap().insert(key(&handle), record);
    }

    /// Toutes les lectures échouent (500) tant que actif
    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    /// Toutes les créations échouent (500) tant que actif
    pub fn fail_creates(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Lectures reçues, dans l'ordre
    pub fn fetches(&self) -> Vec<ResourceHandle> {
        self.fetches.lock().unwrap().clone()
    }

    /// Créations reçues (commandes), dans l'ordre
    pub fn created(&self) -> Vec<CreatedInstance> {
        self.created.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.instances.lock().unwrap().clear();
        self.fetches.lock().unwrap().clear();
        self.created.lock().unwrap().clear();
    }

    fn failure(method: &'static str, handle: &ResourceHandle, status: u16, body: &str) -> MiddlewareError {
        MiddlewareError::Status {
            method,
            url: format!("mock://api/somiod/{handle}"),
            status,
            body: body.to_string(),
        }
    }
}

#[async_trait]
impl ResourceStore for MockMiddleware {
    async fn fetch_content_instance(
        &self,
        handle: &ResourceHandle,
    ) -> Result<ResourceRecord, MiddlewareError> {
        self.fetches.lock().unwrap().push(handle.clone());

        if self.fail_fetch.load(Ordering::SeqCst) {
            log::warn!("🧪 [MOCK] Simulated fetch failure for {}", handle);
            return Err(Self::failure("GET", handle, 500, "simulated failure"));
        }

        let found = self.instances.lock().unwrap().get(&key(handle)).cloned();
        match found {
            Some(record) => {
                log::info!("📥 [MOCK] Fetched {}", handle);
                Ok(record)
            }
            None => Err(Self::failure("GET", handle, 404, "resource not found")),
        }
    }

    async fn create_content_instance(
        &self,
        handle: &ResourceHandle,
        content_type: &str,
        content: &str,
    ) -> Result<ResourceRecord, MiddlewareError> {
        if self.fail_create.load(Ordering::SeqCst) {
            log::warn!("🧪 [MOCK] Simulated create failure for {}", handle);
            return Err(Self::failure("POST", handle, 500, "simulated failure"));
        }

        let record = ResourceRecord {
            resource_name: Some(handle.resource_name.clone()),
            content_type: Some(content_type.to_string()),
            content: Some(content.to_string()),
            ..Default::default()
        };
        self.instances.lock().unwrap().insert(key(handle), record.clone());
        self.created.lock().unwrap().push(CreatedInstance {
            handle: handle.clone(),
            content_type: content_type.to_string(),
            content: content.to_string(),
        });

        log::info!("📤 [MOCK] Created {} ({} bytes)", handle, content.len());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_and_create() {
        let mock = MockMiddleware::new();
        mock.insert_content_instance("app", "readings", "r1", "application/xml", "<temp>20</temp>");

        let handle = ResourceHandle::new("app", "readings", "r1");
        let record = mock.fetch_content_instance(&handle).await.unwrap();
        assert_eq!(record.content.as_deref(), Some("<temp>20</temp>"));

        let cmd = ResourceHandle::new("app", "readings", "cmd-1");
        mock.create_content_instance(&cmd, "application/xml", "<cmd>FAN_ON</cmd>")
            .await
            .unwrap();
        assert_eq!(mock.created().len(), 1);
        assert_eq!(mock.fetches(), vec![handle]);

        // la commande créée est lisible ensuite
        assert!(mock.fetch_content_instance(&cmd).await.is_ok());
    }

    #[tokio::test]
    async fn test_simulated_failures() {
        let mock = MockMiddleware::new();
        let handle = ResourceHandle::new("app", "readings", "missing");

        match mock.fetch_content_instance(&handle).await {
            Err(MiddlewareError::Status { status, .. }) => assert_eq!(status, 404),
            other => panic!("unexpected: {other:?}"),
        }

        mock.fail_creates(true);
        assert!(mock.create_content_instance(&handle, "text/plain", "x").await.is_err());
        assert!(mock.created().is_empty());
    }
}
