//! Notification pipeline
//!
//! ```text
//! listener ──Delivery──▶ dispatcher ──▶ archive worker  (blocking thread)
//!                            │
//!                            └────────▶ control worker  (async task)
//! ```
//!
//! The dispatcher decodes one delivery at a time and hands the notification
//! to both bounded branch queues before taking the next one. Each branch
//! processes its queue in order, independently of the other branch.

use crate::archive::{ArchiveReport, Archiver};
use crate::control::{ControlOutcome, Controller};
use crate::error::{DecodeError, ListenerError};
use crate::listener::Delivery;
use crate::notification::Notification;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Per-notification results, for whoever renders state (console, UI)
#[derive(Debug)]
pub enum PipelineEvent {
    DecodeFailed {
        topic: String,
        error: DecodeError,
    },
    Archived {
        notification: Notification,
        report: ArchiveReport,
    },
    Acted {
        notification: Notification,
        outcome: ControlOutcome,
    },
    ListenerLost(ListenerError),
}

type EventSink = Option<mpsc::UnboundedSender<PipelineEvent>>;

fn emit(sink: &EventSink, event: PipelineEvent) {
    if let Some(tx) = sink {
        // receiver gone only means nobody is watching
        let _ = tx.send(event);
    }
}

pub struct Pipeline {
    archiver: Arc<Archiver>,
    owner_app: String,
    controller: Arc<Controller>,
    queue_capacity: usize,
    events: EventSink,
}

impl Pipeline {
    pub fn new(
        archiver: Arc<Archiver>,
        owner_app: impl Into<String>,
        controller: Arc<Controller>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            archiver,
            owner_app: owner_app.into(),
            controller,
            queue_capacity: queue_capacity.max(1),
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Start the dispatcher and both workers; they run until `deliveries` closes
    pub fn spawn(self, deliveries: mpsc::Receiver<Delivery>) -> PipelineHandle {
        let (archive_tx, archive_rx) = mpsc::channel(self.queue_capacity);
        let (control_tx, control_rx) = mpsc::channel(self.queue_capacity);

        let archive_worker = tokio::task::spawn_blocking({
            let archiver = self.archiver;
            let owner_app = self.owner_app;
            let events = self.events.clone();
            move || archive_loop(archive_rx, &archiver, &owner_app, &events)
        });

        let control_worker =
            tokio::spawn(control_loop(control_rx, self.controller, self.events.clone()));

        let dispatcher = tokio::spawn(dispatch(deliveries, archive_tx, control_tx, self.events));

        PipelineHandle { dispatcher, archive_worker, control_worker }
    }
}

pub struct PipelineHandle {
    dispatcher: JoinHandle<()>,
    archive_worker: JoinHandle<()>,
    control_worker: JoinHandle<()>,
}

impl PipelineHandle {
    /// Wait until every queued notification has gone through both branches
    pub async fn join(self) {
        for (name, task) in [
            ("dispatcher", self.dispatcher),
            ("archive worker", self.archive_worker),
            ("control worker", self.control_worker),
        ] {
            if let Err(e) = task.await {
                error!("Pipeline {} ended abnormally: {}", name, e);
            }
        }
    }
}

async fn dispatch(
    mut deliveries: mpsc::Receiver<Delivery>,
    archive_tx: mpsc::Sender<Notification>,
    control_tx: mpsc::Sender<Notification>,
    events: EventSink,
) {
    while let Some(delivery) = deliveries.recv().await {
        match delivery {
            Delivery::Message(message) => match Notification::decode(&message.payload) {
                Ok(notification) => {
                    debug!("Notification {} received on {}", notification.label(), message.topic);
                    if archive_tx.send(notification.clone()).await.is_err() {
                        error!("Archive worker is gone, notification {} not archived", notification.label());
                    }
                    if control_tx.send(notification).await.is_err() {
                        error!("Control worker is gone, notification dropped");
                    }
                }
                Err(e) => {
                    warn!("Dropping undecodable payload on {} [decode]: {}", message.topic, e);
                    emit(&events, PipelineEvent::DecodeFailed { topic: message.topic, error: e });
                }
            },
            Delivery::ConnectionLost(e) => {
                error!("Listener reported: {}", e);
                emit(&events, PipelineEvent::ListenerLost(e));
            }
        }
    }
    debug!("Delivery queue closed, dispatcher stopping");
}

fn archive_loop(
    mut queue: mpsc::Receiver<Notification>,
    archiver: &Archiver,
    owner_app: &str,
    events: &EventSink,
) {
    while let Some(notification) = queue.blocking_recv() {
        let report = archiver.archive(&notification, owner_app);
        if !report.persisted {
            error!(
                "Notification {} [archive]: {}",
                notification.label(),
                report.errors.join("; ")
            );
        } else if !report.valid {
            warn!(
                "Notification {} [validation]: archived but invalid ({} error(s))",
                notification.label(),
                report.errors.len()
            );
        }
        emit(events, PipelineEvent::Archived { notification, report });
    }
}

async fn control_loop(
    mut queue: mpsc::Receiver<Notification>,
    controller: Arc<Controller>,
    events: EventSink,
) {
    while let Some(notification) = queue.recv().await {
        let outcome = controller.handle(&notification).await;
        emit(&events, PipelineEvent::Acted { notification, outcome });
    }
}
