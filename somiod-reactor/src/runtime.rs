//! Dashboard process lifecycle
//!
//! Registers the dashboard in the middleware, wires listener → pipeline,
//! renders pipeline events on the main task and tears everything down on
//! Ctrl-C or when the broker connection is lost for good.

use crate::archive::Archiver;
use crate::config::Config;
use crate::control::{ControlOutcome, ControlSettings, Controller};
use crate::error::MiddlewareError;
use crate::listener::NotificationListener;
use crate::middleware::{MiddlewareClient, EVT_CREATION};
use crate::pipeline::{Pipeline, PipelineEvent};
use anyhow::{Context, Result};
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Create our application and the subscription on the watched container
pub async fn register(client: &MiddlewareClient, config: &Config) -> Result<(), MiddlewareError> {
    let app = &config.application;

    let record = client.create_application(&app.name).await?;
    info!("Application registered: {}", or_requested(record.name(), &app.name));

    let endpoint = config.subscription_endpoint();
    let record = client
        .create_subscription(
            &app.source_app,
            &app.source_container,
            &app.subscription_name,
            EVT_CREATION,
            &endpoint,
        )
        .await?;
    info!(
        "Subscription '{}' on {}/{} -> {}",
        or_requested(record.name(), &app.subscription_name),
        app.source_app,
        app.source_container,
        endpoint
    );
    Ok(())
}

fn or_requested<'a>(returned: &'a str, requested: &'a str) -> &'a str {
    if returned.is_empty() { requested } else { returned }
}

/// Run until Ctrl-C or a fatal listener error
pub async fn run(config: Config) -> Result<()> {
    let client = MiddlewareClient::new(&config.middleware).context("Failed to build middleware client")?;
    register(&client, &config)
        .await
        .context("Failed to register dashboard in middleware")?;

    let archiver = Arc::new(Archiver::new(&config.archive.root_dir, &config.archive.schema_path));
    let controller = Arc::new(Controller::new(
        Arc::new(client.clone()),
        ControlSettings::from_config(&config),
    ));

    let (mut listener, deliveries) =
        NotificationListener::with_channel(config.mqtt.clone(), config.pipeline.queue_capacity);
    listener.connect().await.context("MQTT connection failed")?;

    let topic = config.topic_filter();
    if let Err(e) = listener.subscribe(&topic).await {
        listener.disconnect().await;
        return Err(e).context("MQTT subscription failed");
    }

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let pipeline = Pipeline::new(
        archiver,
        config.application.name.clone(),
        controller.clone(),
        config.pipeline.queue_capacity,
    )
    .with_events(events_tx)
    .spawn(deliveries);

    let manual = spawn_manual_commands(controller);
    info!("Listening for notifications on {} (type a command + Enter to send it manually)", topic);

    let mut dashboard = Dashboard::default();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break Ok(());
            }
            event = events.recv() => match event {
                Some(PipelineEvent::ListenerLost(e)) => break Err(anyhow::Error::new(e)),
                Some(event) => dashboard.apply(&event),
                None => break Ok(()),
            }
        }
    };

    manual.abort();
    listener.disconnect().await;
    drop(listener);
    pipeline.join().await;
    while let Ok(event) = events.try_recv() {
        dashboard.apply(&event);
    }
    info!("{}", dashboard.summary());

    result.context("Listener stopped")
}

/// Manual commands typed on stdin, one per line
fn spawn_manual_commands(controller: Arc<Controller>) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // detached: a blocking stdin read must not hold up shutdown
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let action = line.trim();
            if action.is_empty() {
                continue;
            }
            match controller.send_command(action).await {
                Ok(target) => info!("Manual command {} sent as {}", action, target),
                Err(e) => error!("Manual command {} failed: {}", action, e),
            }
        }
    })
}

/// Foreground view of the pipeline, updated only from the main task
#[derive(Debug, Default)]
pub struct Dashboard {
    pub last_reading: Option<f64>,
    pub archived: usize,
    pub invalid: usize,
    pub archive_failures: usize,
    pub commands_sent: usize,
    pub control_failures: usize,
    pub dropped: usize,
}

impl Dashboard {
    pub fn apply(&mut self, event: &PipelineEvent) {
        match event {
            PipelineEvent::DecodeFailed { .. } => self.dropped += 1,
            PipelineEvent::Archived { report, .. } => {
                if report.persisted {
                    self.archived += 1;
                } else {
                    self.archive_failures += 1;
                }
                if report.persisted && !report.valid {
                    self.invalid += 1;
                }
            }
            PipelineEvent::Acted { notification, outcome } => match outcome {
                ControlOutcome::Idle(decision) => {
                    self.last_reading = Some(decision.value);
                    info!("Temperature: {:.1} ºC", decision.value);
                }
                ControlOutcome::Triggered { decision, command } => {
                    self.last_reading = Some(decision.value);
                    self.commands_sent += 1;
                    info!("Temperature: {:.1} ºC, command {} issued", decision.value, command.resource_name);
                }
                ControlOutcome::Failed(e) => {
                    self.control_failures += 1;
                    warn!("Processing error for {} [{}]: {}", notification.label(), e.kind(), e);
                }
                ControlOutcome::Skipped(_) => {}
            },
            PipelineEvent::ListenerLost(_) => {}
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "archived={} invalid={} archive_failures={} commands={} control_failures={} dropped={}",
            self.archived,
            self.invalid,
            self.archive_failures,
            self.commands_sent,
            self.control_failures,
            self.dropped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveReport;
    use crate::control::ControlDecision;
    use crate::error::{ControlError, ExtractionError};
    use crate::middleware::ResourceHandle;
    use crate::notification::Notification;

    #[test]
    fn test_dashboard_counts_events() {
        let mut dashboard = Dashboard::default();
        let n = Notification { resource_name: "reading-1".into(), ..Default::default() };

        dashboard.apply(&PipelineEvent::Archived {
            notification: n.clone(),
            report: ArchiveReport { persisted: true, valid: false, ..Default::default() },
        });
        dashboard.apply(&PipelineEvent::Acted {
            notification: n.clone(),
            outcome: ControlOutcome::Triggered {
                decision: ControlDecision { value: 27.3, action: Some("FAN_ON".into()) },
                command: ResourceHandle::new("temp-sensor-001", "readings", "cmd-1"),
            },
        });
        dashboard.apply(&PipelineEvent::Acted {
            notification: n,
            outcome: ControlOutcome::Failed(ControlError::Extraction(ExtractionError::MissingContent)),
        });

        assert_eq!(dashboard.archived, 1);
        assert_eq!(dashboard.invalid, 1);
        assert_eq!(dashboard.commands_sent, 1);
        assert_eq!(dashboard.control_failures, 1);
        assert_eq!(dashboard.last_reading, Some(27.3));
        assert!(dashboard.summary().contains("commands=1"));
    }

    #[test]
    fn test_or_requested() {
        assert_eq!(or_requested("", "dashboard-b"), "dashboard-b");
        assert_eq!(or_requested("dash", "dashboard-b"), "dash");
    }
}
