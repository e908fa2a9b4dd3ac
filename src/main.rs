//! CLI for eventpipe
//!
//! Subcommands:
//! - `serve`: build every topology, run the consumers and serve the gateways
//! - `simulate`: push one upload through the storage trigger and report the
//!   resulting topic deliveries

use std::time::Duration;

use clap::Parser;
use eventpipe::config::{Settings, load_config};
use eventpipe::pipeline::{ComputeApi, QueueIngest, StorageTrigger, notification_topic};
use eventpipe::policy::Authorizer;
use eventpipe::table::{DurableTable, TableOptions};
use eventpipe::topic::Mailbox;
use eventpipe::transport;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "eventpipe")]
enum Command {
    /// Run all three topologies and the HTTP gateway
    Serve,
    /// Upload one object through the storage trigger topology
    Simulate {
        /// Object key; prefixed with the notify prefix if it lacks it
        #[arg(long, default_value = "hello.txt")]
        key: String,
        /// Object body
        #[arg(long, default_value = "hello from eventpipe")]
        body: String,
        /// How long to wait for the notification to reach the topic
        #[arg(long, default_value_t = 5)]
        wait_secs: u64,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eventpipe::utils::logging::init("info");
            error!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    eventpipe::utils::logging::init(&settings.server.log_level);

    let result = match cmd {
        Command::Serve => run_server(settings).await,
        Command::Simulate {
            key,
            body,
            wait_secs,
        } => run_simulation(settings, &key, body, Duration::from_secs(wait_secs)).await,
    };
    if let Err(e) = result {
        error!("eventpipe failed: {e}");
        std::process::exit(1);
    }
}

async fn run_server(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let authorizer = Authorizer::new();
    let mailbox = Mailbox::new();
    let topic = notification_topic(&settings.topic, authorizer.clone(), mailbox);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut storage = StorageTrigger::builder(&settings, authorizer.clone(), topic.clone()).build()?;
    let api = ComputeApi::builder(&settings, authorizer.clone()).build();
    let mut ingest = QueueIngest::builder(&settings, authorizer, topic).build();

    let mut tasks = storage.start(shutdown_rx.clone());
    tasks.extend(ingest.start(shutdown_rx));

    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
        }
        info!("Shutdown signal received. Exiting gracefully.");
    };
    transport::serve(&addr, vec![api.gateway, ingest.gateway.clone()], shutdown).await?;

    let _ = shutdown_tx.send(true);
    futures::future::join_all(tasks).await;
    storage.table.flush()?;
    Ok(())
}

async fn run_simulation(
    settings: Settings,
    key: &str,
    body: String,
    wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let authorizer = Authorizer::new();
    let mailbox = Mailbox::new();
    let topic = notification_topic(&settings.topic, authorizer.clone(), mailbox.clone());
    let table = DurableTable::temporary(
        "simulation",
        TableOptions::default(),
        authorizer.clone(),
    )?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut storage = StorageTrigger::builder(&settings, authorizer, topic)
        .table(table)
        .build()?;
    let tasks = storage.start(shutdown_rx);

    let key = object_key(&settings, key);
    let object = storage.store.put_object(&key, body)?;
    info!(key = %object.key, etag = %object.etag, "object uploaded");

    let deadline = tokio::time::Instant::now() + wait;
    while mailbox.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let _ = shutdown_tx.send(true);
    futures::future::join_all(tasks).await;

    let sent = mailbox.sent();
    if sent.is_empty() {
        return Err(format!("no notification delivered within {wait:?}").into());
    }
    for (address, notification) in sent {
        let line = serde_json::json!({ "to": address, "notification": notification });
        println!("{line}");
    }
    Ok(())
}

fn object_key(settings: &Settings, key: &str) -> String {
    let prefix = &settings.object_store.notify_prefix;
    if key.starts_with(prefix.as_str()) {
        key.to_string()
    } else {
        format!("{prefix}{key}")
    }
}
