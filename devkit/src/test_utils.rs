/*!
Test Harness pour le pipeline SOMIOD

Monte un pipeline complet (archive + contrôle) sans broker ni middleware:
- Archiver dans un dossier temporaire, schéma embarqué
- `MockMiddleware` comme `ResourceStore`
- Deliveries injectées à la main, événements collectés pour les assertions
*/

use crate::middleware_stub::MockMiddleware;
use crate::payloads::{NotificationBuilder, NOTIFICATION_SCHEMA};
use anyhow::{Context, Result};
use somiod_reactor::config::ControlRule;
use somiod_reactor::{
    Archiver, Config, ControlSettings, Controller, Delivery, ListenerError, Pipeline,
    PipelineEvent, PipelineHandle, RawMessage,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Topic utilisé pour les deliveries simulées
pub const TEST_TOPIC: &str = "api/somiod/temp-sensor-001/readings";

/// Application propriétaire des archives dans le harness
pub const OWNER_APP: &str = "dashboard-b";

/// Configuration du harness avant démarrage
pub struct HarnessBuilder {
    rules: Option<Vec<ControlRule>>,
    with_schema: bool,
    block_archive_root: bool,
    queue_capacity: usize,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            rules: None,
            with_schema: true,
            block_archive_root: false,
            queue_capacity: 16,
        }
    }
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remplace les règles par défaut (25.0 → FAN_ON)
    pub fn rules(mut self, rules: Vec<ControlRule>) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Pas de schéma sur disque: chaque archive sera rapportée invalide
    pub fn without_schema(mut self) -> Self {
        self.with_schema = false;
        self
    }

    /// Un fichier occupe la racine d'archive: toute persistance échoue
    pub fn block_archive_root(mut self) -> Self {
        self.block_archive_root = true;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Démarre le pipeline; doit être appelé dans un runtime tokio
    pub fn build(self) -> Result<TestHarness> {
        env_logger::try_init().ok();

        let dir = tempfile::tempdir().context("Cannot create temp dir")?;
        let schema_path = dir.path().join("notification.schema.json");
        if self.with_schema {
            std::fs::write(&schema_path, NOTIFICATION_SCHEMA).context("Cannot write schema")?;
        }

        let archive_root = dir.path().join("Notifications");
        if self.block_archive_root {
            std::fs::write(&archive_root, b"not a directory").context("Cannot block archive root")?;
        }

        let mut settings = ControlSettings::from_config(&Config::default());
        if let Some(rules) = self.rules {
            settings.rules = rules;
        }

        let mock = MockMiddleware::new();
        let archiver = Arc::new(Archiver::new(&archive_root, &schema_path));
        let controller = Arc::new(Controller::new(Arc::new(mock.clone()), settings));

        let (deliveries_tx, deliveries_rx) = mpsc::channel(self.queue_capacity);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pipeline = Pipeline::new(archiver.clone(), OWNER_APP, controller.clone(), self.queue_capacity)
            .with_events(events_tx)
            .spawn(deliveries_rx);

        log::info!("🧪 Test harness ready in {}", dir.path().display());

        Ok(TestHarness {
            dir,
            archiver,
            mock,
            controller,
            deliveries: Some(deliveries_tx),
            events: events_rx,
            pipeline: Some(pipeline),
        })
    }
}

/// Pipeline en cours d'exécution alimenté par le test
pub struct TestHarness {
    dir: TempDir,
    pub archiver: Arc<Archiver>,
    pub mock: MockMiddleware,
    controller: Arc<Controller>,
    deliveries: Option<mpsc::Sender<Delivery>>,
    events: mpsc::UnboundedReceiver<PipelineEvent>,
    pipeline: Option<PipelineHandle>,
}

impl TestHarness {
    /// Harness avec la configuration par défaut
    pub fn new() -> Result<Self> {
        HarnessBuilder::new().build()
    }

    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::new()
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    async fn deliver(&self, delivery: Delivery) -> Result<()> {
        let sender = self.deliveries.as_ref().context("Harness already shut down")?;
        sender
            .send(delivery)
            .await
            .map_err(|_| anyhow::anyhow!("Pipeline dispatcher is gone"))
    }

    /// Simule un publish brut sur le topic de souscription
    pub async fn send_payload(&self, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.deliver(Delivery::Message(RawMessage {
            topic: TEST_TOPIC.to_string(),
            payload: payload.into(),
        }))
        .await?;
        log::info!("📨 Sent test payload on {}", TEST_TOPIC);
        Ok(())
    }

    pub async fn send_notification(&self, notification: &NotificationBuilder) -> Result<()> {
        self.send_payload(notification.bytes()).await
    }

    /// Simule un listener qui abandonne la connexion
    pub async fn lose_connection(&self, reason: &str) -> Result<()> {
        self.deliver(Delivery::ConnectionLost(ListenerError::ConnectionLost(reason.to_string())))
            .await
    }

    /// Prochain événement du pipeline, None après `timeout_ms`
    pub async fn next_event(&mut self, timeout_ms: u64) -> Option<PipelineEvent> {
        match tokio::time::timeout(Duration::from_millis(timeout_ms), self.events.recv()).await {
            Ok(event) => event,
            Err(_) => {
                log::warn!("⏰ Timeout waiting for pipeline event");
                None
            }
        }
    }

    /// Ferme l'entrée, attend que les deux branches aient tout traité,
    /// et retourne les événements restants
    pub async fn shutdown(&mut self) -> Vec<PipelineEvent> {
        self.deliveries.take();
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.join().await;
        }

        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        log::info!("🧹 Harness shut down, {} event(s) collected", events.len());
        events
    }

    /// Fichiers d'archive de l'application propriétaire, triés par nom
    pub fn archived_files(&self) -> Vec<PathBuf> {
        let dir = self.archiver.namespace_dir(OWNER_APP);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        files.sort();
        files
    }
}
