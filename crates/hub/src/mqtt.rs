//! MQTT transport: connection options, the telemetry decoder, the event
//! loop feeding the ingestion queue, and the command publisher.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::command::{CommandPublisher, PublishError};
use crate::config::MqttConfig;
use crate::db::{NewReading, PumpStatus};
use crate::state::SharedState;

/// Encryption is negotiated only on the conventional MQTT-over-TLS port.
pub const SECURE_PORT: u16 = 8883;

/// Used when a payload carries no `device_id`.
pub const DEFAULT_DEVICE_ID: &str = "ESP32";

/// Pause after a transport error before polling again.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Capacity of rumqttc's request channel.
const REQUEST_CAPACITY: usize = 20;

// ---------------------------------------------------------------------------
// Telemetry decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not a valid telemetry object: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown pump_status '{0}'")]
    PumpStatus(String),
    #[error("{field} must be a whole number, got {value}")]
    NotWhole { field: &'static str, value: String },
}

/// Wire format published by the device. Every field is optional; missing or
/// null values fall back to defaults.
#[derive(Debug, Deserialize)]
struct TelemetryMsg {
    device_id: Option<String>,
    ph: Option<f64>,
    soil_percent: Option<serde_json::Number>,
    soil_adc: Option<serde_json::Number>,
    pump_status: Option<String>,
}

/// Firmware that formats counters as floats sends `42.0`; accept that, but
/// not a fractional value.
fn whole(field: &'static str, n: Option<serde_json::Number>) -> Result<i64, DecodeError> {
    let Some(n) = n else { return Ok(0) };
    if let Some(i) = n.as_i64() {
        return Ok(i);
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
        _ => Err(DecodeError::NotWhole {
            field,
            value: n.to_string(),
        }),
    }
}

pub fn decode_reading(payload: &[u8]) -> Result<NewReading, DecodeError> {
    let msg: TelemetryMsg = serde_json::from_slice(payload)?;

    let pump_status = match msg.pump_status {
        None => PumpStatus::Off,
        Some(s) => PumpStatus::parse(&s).ok_or(DecodeError::PumpStatus(s))?,
    };

    Ok(NewReading {
        device_id: msg
            .device_id
            .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string()),
        ph: msg.ph.unwrap_or(0.0),
        soil_percent: whole("soil_percent", msg.soil_percent)?,
        soil_adc: whole("soil_adc", msg.soil_adc)?,
        pump_status,
    })
}

/// Decode one inbound payload and queue it for ingestion. Malformed payloads
/// are logged, recorded and dropped, and so is a reading that finds the queue
/// full: the transport loop never waits on the store. Returns whether a
/// reading was queued.
pub async fn forward_payload(
    topic: &str,
    payload: &[u8],
    queue: &mpsc::Sender<NewReading>,
    shared: &SharedState,
) -> bool {
    match decode_reading(payload) {
        Ok(reading) => {
            debug!(
                topic,
                device = %reading.device_id,
                ph = reading.ph,
                soil_percent = reading.soil_percent,
                "telemetry received"
            );
            match queue.try_send(reading) {
                Ok(()) => true,
                Err(TrySendError::Full(r)) => {
                    warn!(device = %r.device_id, "ingestion queue full, dropping reading");
                    shared
                        .write()
                        .await
                        .record_error("ingestion queue full, reading dropped".to_string());
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    error!("ingestion queue closed, dropping reading");
                    false
                }
            }
        }
        Err(e) => {
            warn!(topic, "bad telemetry: {e}");
            shared.write().await.record_error(format!("bad telemetry: {e}"));
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Connection options
// ---------------------------------------------------------------------------

pub fn uses_tls(port: u16) -> bool {
    port == SECURE_PORT
}

pub fn options(cfg: &MqttConfig) -> MqttOptions {
    let mut opts = MqttOptions::new(cfg.client_id.as_str(), cfg.host.as_str(), cfg.port);
    opts.set_keep_alive(cfg.keep_alive());

    if let Some(user) = &cfg.username {
        opts.set_credentials(user.as_str(), cfg.password.clone().unwrap_or_default());
    }

    if uses_tls(cfg.port) {
        warn!(
            broker = %cfg.host,
            port = cfg.port,
            "TLS enabled with certificate and hostname verification DISABLED"
        );
        opts.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
            Arc::new(insecure_tls_config()),
        )));
    }

    opts
}

pub fn client(cfg: &MqttConfig) -> (AsyncClient, EventLoop) {
    AsyncClient::new(options(cfg), REQUEST_CAPACITY)
}

/// rustls client config that accepts any server certificate for any name.
/// Field devices ship with self-signed broker certs.
fn insecure_tls_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
        .with_no_client_auth()
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    schemes: Vec<SignatureScheme>,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Drive the MQTT connection forever. Intended to be `tokio::spawn`-ed.
///
/// Never returns on transport errors: rumqttc reconnects on the next poll,
/// and the HTTP side keeps serving while the broker is unreachable.
pub async fn run(
    client: AsyncClient,
    mut eventloop: EventLoop,
    telemetry_topic: String,
    queue: mpsc::Sender<NewReading>,
    shared: SharedState,
) {
    loop {
        match eventloop.poll().await {
            Ok(event) => handle_event(&event, &client, &telemetry_topic, &queue, &shared).await,
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    if st.mqtt_connected {
                        st.record_system("mqtt connection lost".to_string());
                    }
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// React to one event from the broker.
pub async fn handle_event(
    event: &Event,
    client: &AsyncClient,
    telemetry_topic: &str,
    queue: &mpsc::Sender<NewReading>,
    shared: &SharedState,
) {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => {
            info!("mqtt connected");
            // Subscriptions do not survive a reconnect (clean session).
            // Spawned: the request channel is drained by the loop calling us.
            tokio::spawn(subscribe(client.clone(), telemetry_topic.to_string()));
            let mut st = shared.write().await;
            st.mqtt_connected = true;
            st.record_system("mqtt connected".to_string());
        }
        Event::Incoming(Packet::Publish(p)) => {
            forward_payload(&p.topic, &p.payload, queue, shared).await;
        }
        Event::Incoming(Packet::Disconnect) => {
            warn!("mqtt disconnected by broker");
            let mut st = shared.write().await;
            st.mqtt_connected = false;
            st.record_system("mqtt disconnected".to_string());
        }
        _ => {}
    }
}

async fn subscribe(client: AsyncClient, topic: String) {
    match client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
        Ok(()) => info!(%topic, "subscribed to telemetry"),
        Err(e) => error!(%topic, "subscribe failed: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Command publisher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    shared: SharedState,
    timeout: Duration,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, shared: SharedState, timeout: Duration) -> Self {
        Self {
            client,
            shared,
            timeout,
        }
    }
}

#[async_trait]
impl CommandPublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), PublishError> {
        if !self.shared.read().await.mqtt_connected {
            return Err(PublishError::NotConnected);
        }

        let send = self
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec());
        match tokio::time::timeout(self.timeout, send).await {
            Ok(res) => res?,
            Err(_) => return Err(PublishError::Timeout(self.timeout)),
        }

        self.shared.write().await.record_command(payload);
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
