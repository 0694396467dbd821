mod classifier;
mod command;
mod config;
mod dashboard;
mod db;
mod decision;
mod ingest;
mod liveness;
mod mqtt;
mod state;
mod web;

use anyhow::Result;
use std::{env, path::Path, sync::Arc};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use command::CommandDispatcher;
use db::Db;
use decision::DecisionEngine;
use ingest::IngestPipeline;
use liveness::LivenessDetector;
use mqtt::MqttPublisher;
use state::SystemState;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; the real environment still applies.
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect_with(
        &cfg.database.url,
        cfg.database.max_connections,
        cfg.database.op_timeout(),
    )
    .await?;
    db.migrate().await?;
    info!(url = %cfg.database.url, "db ready");

    // ── Classifier ──────────────────────────────────────────────────
    let classifier = classifier::load(Path::new(&cfg.classifier.model_path));
    let engine = DecisionEngine::new(classifier);

    // ── Shared state (ephemeral, for the status route) ──────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started".to_string());

    // ── MQTT + ingestion ────────────────────────────────────────────
    let (client, eventloop) = mqtt::client(&cfg.mqtt);
    let (tx, rx) = mpsc::channel(cfg.mqtt.queue_capacity);

    tokio::spawn(IngestPipeline::new(db.clone(), Arc::clone(&shared)).run(rx));
    tokio::spawn(mqtt::run(
        client.clone(),
        eventloop,
        cfg.mqtt.telemetry_topic.clone(),
        tx,
        Arc::clone(&shared),
    ));

    let publisher = MqttPublisher::new(client, Arc::clone(&shared), cfg.mqtt.publish_timeout());
    let dispatcher = CommandDispatcher::new(Arc::new(publisher), cfg.mqtt.command_topic.clone());

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        db,
        shared,
        liveness: LivenessDetector::new(cfg.liveness.offline_after()),
        engine,
        dispatcher,
    };
    web::serve(app, cfg.web.port).await
}
