//! Outil manuel: publie des notifications SOMIOD sur le broker local
//!
//! Usage: `test-integration [resource_name] [count]`
//! Le reactor doit tourner et la content-instance doit exister dans le middleware
//! pour que la lecture et la commande aient lieu.

use anyhow::Result;
use log::{debug, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use serde::Serialize;
use tokio::time::{sleep, Duration};

// ===== Configuration =====
const MQTT_BROKER: &str = "127.0.0.1";
const MQTT_PORT: u16 = 1883;
const CLIENT_ID: &str = "somiod-test-publisher";
const TOPIC: &str = "api/somiod/temp-sensor-001/readings";

#[derive(Debug, Serialize)]
struct Notification<'a> {
    subscription_name: &'a str,
    event_type: &'a str,
    resource_name: String,
    container_path: &'a str,
    timestamp: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let resource = args.next().unwrap_or_else(|| "reading-manual".to_string());
    let count: usize = args.next().map(|c| c.parse::<usize>()).transpose()?.unwrap_or(1);

    info!("🚀 Publishing {} notification(s) on {}", count, TOPIC);

    let mut mqttoptions = MqttOptions::new(CLIENT_ID, MQTT_BROKER, MQTT_PORT);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 10);

    // the request channel is bounded: the event loop must run while we publish
    let driver = tokio::spawn(drive(eventloop));

    for i in 0..count {
        let resource_name = if count == 1 { resource.clone() } else { format!("{resource}-{i}") };
        let notification = Notification {
            subscription_name: "sub-dash",
            event_type: "create",
            resource_name,
            container_path: "readings",
            timestamp: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        };
        let payload = serde_json::to_vec(&notification)?;
        if let Err(e) = client.publish(TOPIC, QoS::AtLeastOnce, false, payload).await {
            warn!("⚠️ Event loop stopped after {} notification(s): {}", i, e);
            break;
        }
        debug!("📤 Queued {}", notification.resource_name);
    }
    let _ = client.disconnect().await;
    drop(client);

    let acked = driver.await?;
    info!("✅ Done, {} publish(es) acknowledged", acked);
    Ok(())
}

/// Poll until the DISCONNECT went out or the connection failed; returns the PUBACK count
async fn drive(mut eventloop: EventLoop) -> usize {
    let mut acked = 0;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::PubAck(_))) => acked += 1,
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("⚠️ MQTT error: {}", e);
                sleep(Duration::from_millis(200)).await;
                break;
            }
        }
    }
    acked
}
