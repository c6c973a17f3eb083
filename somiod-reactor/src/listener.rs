//! MQTT transport listener
//!
//! Owns the broker connection. Incoming publishes are pushed, in broker
//! order, onto a bounded `Delivery` channel by a dedicated event-loop task;
//! a lost connection is pushed onto the same channel so the owner sees it.
//!
//! Each `connect()` uses a fresh client id so several dashboards can share a
//! broker without session takeover.

use crate::config::{MqttConfig, ReconnectPolicy};
use crate::error::ListenerError;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck, SubscribeReasonCode,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Grace period for the event loop to flush DISCONNECT before it is aborted
const STOP_GRACE: Duration = Duration::from_secs(2);

/// One publish as received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// What the listener hands to its owner
#[derive(Debug)]
pub enum Delivery {
    Message(RawMessage),
    ConnectionLost(ListenerError),
}

type SubAckSender = oneshot::Sender<Result<(), String>>;

/// Matches SUBACKs to pending `subscribe()` calls through packet ids
#[derive(Default)]
struct SubscribeTracker {
    /// Requests queued to rumqttc, pkid not assigned yet (FIFO)
    queued: VecDeque<Option<SubAckSender>>,
    in_flight: HashMap<u16, Option<SubAckSender>>,
}

#[derive(Default)]
struct SessionState {
    topics: Mutex<Vec<String>>,
    subscriptions: Mutex<SubscribeTracker>,
    alive: AtomicBool,
    stopping: AtomicBool,
}

impl SessionState {
    fn on_outgoing_subscribe(&self, pkid: u16) {
        let mut tracker = self.subscriptions.lock();
        if let Some(waiter) = tracker.queued.pop_front() {
            tracker.in_flight.insert(pkid, waiter);
        }
    }

    fn on_suback(&self, ack: SubAck) {
        let waiter = self.subscriptions.lock().in_flight.remove(&ack.pkid).flatten();
        let rejected = ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure));
        let result = if rejected { Err("broker rejected the subscription".to_string()) } else { Ok(()) };

        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None if rejected => error!("Broker rejected re-subscription (pkid {})", ack.pkid),
            None => debug!("Re-subscription confirmed (pkid {})", ack.pkid),
        }
    }

    fn fail_pending(&self, reason: &str) {
        let mut guard = self.subscriptions.lock();
        let tracker = &mut *guard;
        let waiters: Vec<_> = tracker
            .queued
            .drain(..)
            .chain(tracker.in_flight.drain().map(|(_, waiter)| waiter))
            .collect();
        drop(guard);
        for tx in waiters.into_iter().flatten() {
            let _ = tx.send(Err(reason.to_string()));
        }
    }

    /// Queue a SUBSCRIBE; the lock keeps queue order equal to request order
    fn request_subscribe(
        &self,
        client: &AsyncClient,
        topic: &str,
        waiter: Option<SubAckSender>,
    ) -> Result<(), String> {
        let mut tracker = self.subscriptions.lock();
        client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| e.to_string())?;
        tracker.queued.push_back(waiter);
        Ok(())
    }
}

struct Session {
    client: AsyncClient,
    client_id: String,
    broker: String,
    state: Arc<SessionState>,
    task: JoinHandle<()>,
}

pub struct NotificationListener {
    config: MqttConfig,
    deliveries: mpsc::Sender<Delivery>,
    session: Option<Session>,
}

impl NotificationListener {
    pub fn new(config: MqttConfig, deliveries: mpsc::Sender<Delivery>) -> Self {
        Self { config, deliveries, session: None }
    }

    /// Listener plus the receiving end of its delivery queue
    pub fn with_channel(config: MqttConfig, capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(config, tx), rx)
    }

    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.config.broker_host, self.config.broker_port)
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.state.alive.load(Ordering::Acquire))
    }

    pub fn client_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.client_id.as_str())
    }

    /// Connect and wait for CONNACK; an existing session is closed first
    pub async fn connect(&mut self) -> Result<(), ListenerError> {
        self.disconnect().await;

        let broker = self.broker_address();
        let client_id = unique_client_id(&self.config.client_id_prefix);

        let mut options =
            MqttOptions::new(&client_id, &self.config.broker_host, self.config.broker_port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, self.config.channel_capacity.max(1));

        let wait_connack = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(e.to_string()),
                }
            }
        };
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs.max(1));
        match timeout(connect_timeout, wait_connack).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(ListenerError::Connection { broker, reason }),
            Err(_) => {
                return Err(ListenerError::Connection {
                    broker,
                    reason: format!("no CONNACK within {}s", connect_timeout.as_secs()),
                })
            }
        }

        info!("Connected to MQTT broker {} as {}", broker, client_id);

        let state = Arc::new(SessionState::default());
        state.alive.store(true, Ordering::Release);
        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            state.clone(),
            self.deliveries.clone(),
            self.config.reconnect.clone(),
        ));

        self.session = Some(Session { client, client_id, broker, state, task });
        Ok(())
    }

    /// Subscribe and wait for the broker's SUBACK
    pub async fn subscribe(&self, topic_filter: &str) -> Result<(), ListenerError> {
        let session = self
            .session
            .as_ref()
            .filter(|s| s.state.alive.load(Ordering::Acquire))
            .ok_or(ListenerError::NotConnected)?;

        let subscription_error = |reason: String| ListenerError::Subscription {
            topic: topic_filter.to_string(),
            reason,
        };

        let (tx, rx) = oneshot::channel();
        session
            .state
            .request_subscribe(&session.client, topic_filter, Some(tx))
            .map_err(subscription_error)?;

        let subscribe_timeout = Duration::from_secs(self.config.subscribe_timeout_secs.max(1));
        match timeout(subscribe_timeout, rx).await {
            Ok(Ok(Ok(()))) => {
                session.state.topics.lock().push(topic_filter.to_string());
                info!("Subscribed to topic: {}", topic_filter);
                Ok(())
            }
            Ok(Ok(Err(reason))) => Err(subscription_error(reason)),
            Ok(Err(_)) => Err(subscription_error("connection closed before SUBACK".to_string())),
            Err(_) => Err(subscription_error(format!(
                "no SUBACK within {}s",
                subscribe_timeout.as_secs()
            ))),
        }
    }

    /// Unsubscribe and close; safe to call repeatedly or before `connect()`
    pub async fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.state.stopping.store(true, Ordering::Release);

        if session.state.alive.load(Ordering::Acquire) && !session.task.is_finished() {
            let topics = session.state.topics.lock().clone();
            for topic in topics {
                if let Err(e) = session.client.try_unsubscribe(topic.as_str()) {
                    debug!("Unsubscribe {} skipped: {}", topic, e);
                }
            }
            if let Err(e) = session.client.try_disconnect() {
                debug!("DISCONNECT not queued: {}", e);
            }
        }

        let mut task = session.task;
        if timeout(STOP_GRACE, &mut task).await.is_err() {
            warn!("MQTT event loop did not stop in time, aborting it");
            task.abort();
        }
        session.state.fail_pending("listener stopped");
        info!("Disconnected from MQTT broker {}", session.broker);
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.state.stopping.store(true, Ordering::Release);
            session.task.abort();
        }
    }
}

/// `{prefix}-{8 hex chars}`
pub fn unique_client_id(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..8])
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    state: Arc<SessionState>,
    deliveries: mpsc::Sender<Delivery>,
    policy: ReconnectPolicy,
) {
    let mut failures: u32 = 0;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("Received MQTT message on topic: {}", publish.topic);
                let message = RawMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if deliveries.send(Delivery::Message(message)).await.is_err() {
                    debug!("Delivery queue closed, stopping event loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                failures = 0;
                state.alive.store(true, Ordering::Release);
                info!("Reconnected to MQTT broker");
                if !ack.session_present {
                    resubscribe(&client, &state);
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => state.on_suback(ack),
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => state.on_outgoing_subscribe(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if state.stopping.load(Ordering::Acquire) {
                    break;
                }
                state.alive.store(false, Ordering::Release);
                failures += 1;

                let Some(delay) = retry_delay(&policy, failures) else {
                    error!("MQTT connection lost: {} (after {} failure(s))", e, failures);
                    state.fail_pending("connection lost");
                    let lost = ListenerError::ConnectionLost(e.to_string());
                    let _ = deliveries.send(Delivery::ConnectionLost(lost)).await;
                    break;
                };

                warn!("MQTT connection error: {}. Reconnecting in {}s...", e, delay.as_secs());
                sleep(delay).await;
            }
        }
    }

    state.alive.store(false, Ordering::Release);
}

/// Wait before reconnect attempt number `failures`; `None` once the policy gives up
fn retry_delay(policy: &ReconnectPolicy, failures: u32) -> Option<Duration> {
    match policy {
        ReconnectPolicy::Never => None,
        ReconnectPolicy::Retry { max_attempts: Some(max), .. } if failures >= *max => None,
        ReconnectPolicy::Retry { delay_secs, .. } => Some(Duration::from_secs(*delay_secs)),
    }
}

fn resubscribe(client: &AsyncClient, state: &SessionState) {
    let topics = state.topics.lock().clone();
    for topic in topics {
        match state.request_subscribe(client, &topic, None) {
            Ok(()) => info!("Re-subscribing to {}", topic),
            Err(e) => error!("Cannot re-subscribe to {}: {}", topic, e),
        }
    }
}
