//! langserv-client - console front end.
//!
//! Spawns a language server, performs the initialize handshake, prints
//! every message the server sends, optionally issues one request, and
//! shuts the server down on Ctrl-C or when it exits.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use langserv_client::config::Cli;
use langserv_client::{ClientConfig, EventForwarder, ServerProcess, Session, SessionEvent};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the message dump
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "langserv_client=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::from_cli(&cli)?;
    let one_shot = cli.one_shot_request()?;

    run(config, one_shot).await
}

async fn run(config: ClientConfig, one_shot: Option<(String, Value)>) -> Result<()> {
    let (process, io) = ServerProcess::spawn(&config)?;
    let (handler, events) = EventForwarder::channel();
    let printer = tokio::spawn(print_events(events));

    let session = Session::start(
        io.stdout,
        io.stdin,
        config.initialize_params(),
        Arc::new(handler),
    )
    .await
    .context("Initialize handshake failed")?;

    if let Some(capabilities) = session.server_capabilities() {
        println!("<<< capabilities {}", capabilities);
    }

    match one_shot {
        Some((method, params)) => {
            println!(">>> {} {}", method, params);
            let result = match config.request_timeout {
                Some(limit) => session.request_with_timeout(&method, params, limit).await,
                None => session.request(&method, params).await,
            };
            match result {
                Ok(value) => println!("<<< {}", value),
                Err(e) => warn!("Request {} failed: {}", method, e),
            }
        }
        None => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                _ = session.closed() => info!("Language server ended"),
            }
        }
    }

    session.shutdown(config.shutdown_grace).await;
    // Dropping the session releases the forwarder; the printer drains and ends
    drop(session);
    if let Err(e) = printer.await {
        warn!("Event printer failed: {}", e);
    }

    let status = process.wait_or_kill(config.shutdown_grace).await?;
    info!("Language server exited with {}", status);
    Ok(())
}

async fn print_events(mut events: UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        let line = match &event {
            SessionEvent::Notification(n) => serde_json::to_string(n),
            SessionEvent::Request(r) => serde_json::to_string(r),
        };
        match line {
            Ok(line) => println!("<<< {}", line),
            Err(e) => warn!("Unprintable message: {}", e),
        }
    }
}
