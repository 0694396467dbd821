mod sim;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::{env, time::Duration};
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{FieldSim, Sample, Scenario};

/// Telemetry JSON as published by the field device.
#[derive(Debug, Serialize)]
struct Telemetry<'a> {
    device_id: &'a str,
    ph: f64,
    soil_percent: i64,
    soil_adc: i64,
    pump_status: &'static str,
}

impl<'a> Telemetry<'a> {
    fn new(device_id: &'a str, sample: Sample, pump_on: bool) -> Self {
        Self {
            device_id,
            ph: sample.ph,
            soil_percent: sample.soil_percent,
            soil_adc: sample.soil_adc,
            pump_status: if pump_on { "ON" } else { "OFF" },
        }
    }
}

/// `ON` / `OFF` (case-insensitive) from the command topic.
fn parse_command(payload: &[u8]) -> Option<bool> {
    let s = std::str::from_utf8(payload).ok()?.trim();
    if s.eq_ignore_ascii_case("ON") {
        Some(true)
    } else if s.eq_ignore_ascii_case("OFF") {
        Some(false)
    } else {
        None
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env_or("MQTT_HOST", "127.0.0.1");
    let port: u16 = env_or("MQTT_PORT", "1883")
        .parse()
        .context("MQTT_PORT must be a port number")?;
    let device_id = env_or("DEVICE_ID", "ESP32");
    let data_topic = env_or("MQTT_TOPIC_DATA", "smartfarm/data");
    let cmd_topic = env_or("MQTT_TOPIC_CMD", "smartfarm/cmd");
    let sample_every_s: u64 = env_or("SAMPLE_EVERY_S", "5")
        .parse()
        .context("SAMPLE_EVERY_S must be a whole number of seconds")?;
    let scenario = Scenario::from_str_lossy(&env_or("SIM_SCENARIO", "drying"));

    let mut mqttoptions = MqttOptions::new(format!("smartfarm-node-{device_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let Ok(user) = env::var("MQTT_USER") {
        mqttoptions.set_credentials(user, env_or("MQTT_PASSWORD", ""));
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
    let mut field = FieldSim::new(scenario);
    let mut ticker = interval(Duration::from_secs(sample_every_s.max(1)));

    info!(%device_id, %scenario, topic = %data_topic, "simulated device publishing");

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                    // try_: awaiting here would block the loop that drains requests.
                    if let Err(e) = client.try_subscribe(cmd_topic.as_str(), QoS::AtLeastOnce) {
                        error!(topic = %cmd_topic, "subscribe failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) if p.topic == cmd_topic => {
                    match parse_command(&p.payload) {
                        Some(on) => {
                            field.set_pump(on);
                            info!(pump = if on { "ON" } else { "OFF" }, "pump command received");
                        }
                        None => warn!(payload = ?p.payload, "ignoring unknown command"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            },
            _ = ticker.tick() => {
                let sample = field.step();
                let msg = Telemetry::new(&device_id, sample, field.pump_on());
                let payload = serde_json::to_vec(&msg)?;

                match client.try_publish(data_topic.as_str(), QoS::AtLeastOnce, false, payload) {
                    Ok(()) => debug!(
                        ph = msg.ph,
                        soil = msg.soil_percent,
                        adc = msg.soil_adc,
                        pump = msg.pump_status,
                        "published reading"
                    ),
                    Err(e) => warn!("publish error: {e}"),
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
