use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use client::{StatusIndicator, SyncConfig, SyncSession};
use protocol::{ClientMessage, ClockChange, GlobalState, ParameterChange, WidgetIndex};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("could not reach relay at {url} within {timeout_ms} ms")]
    NotConnected { url: String, timeout_ms: u64 },
    #[error("connection dropped before the message was sent")]
    SendFailed,
    #[error("relay did not confirm the change within {0} ms")]
    Unconfirmed(u64),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "clocksync", about = "Clock settings sync CLI")]
struct Cli {
    #[arg(long, env = "CLOCKSYNC_URL", default_value = "ws://127.0.0.1:8080")]
    url: String,

    #[arg(long, env = "CLOCKSYNC_RECONNECT_MS", default_value_t = 3000)]
    reconnect_ms: u64,

    #[arg(long, default_value_t = 5000, help = "How long one-shot commands wait for the relay")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Print every sync event as a JSON line until Ctrl-C.
    Watch,
    /// Switch every display to widget `index`.
    Select { index: WidgetIndex },
    /// Set one parameter of one widget. `value` is JSON, or a plain string.
    Set { index: WidgetIndex, parameter: String, value: String },
    /// Print the relay's current state.
    State,
}

#[derive(Serialize, Debug)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WatchEvent {
    StateSync { state: GlobalState },
    ClockChange { widget_index: WidgetIndex },
    ParameterChange { change: ParameterChange },
    Connection { connected: bool },
}

#[derive(Debug, Clone)]
struct CliContext {
    url: String,
    timeout_ms: u64,
}

struct StderrIndicator;

impl StatusIndicator for StderrIndicator {
    fn set_connected(&self, connected: bool) {
        eprintln!("{}", if connected { "connected" } else { "disconnected" });
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let session = SyncSession::new(
        SyncConfig::new(cli.url.clone()).with_reconnect_interval(Duration::from_millis(cli.reconnect_ms)),
    );
    let ctx = CliContext { url: cli.url, timeout_ms: cli.timeout_ms };

    match cli.command {
        Command::Watch => run_watch(&session).await,
        Command::Select { index } => {
            let (_, mut states) = connect_once(&session, &ctx).await?;
            send(&session, &ClientMessage::ClockChange(ClockChange { widget_index: index }))?;
            confirm(&session, &mut states, ctx.timeout_ms).await
        }
        Command::Set { index, parameter, value } => {
            let (_, mut states) = connect_once(&session, &ctx).await?;
            let change = ParameterChange::new(index, parameter, parse_value(&value));
            send(&session, &ClientMessage::ParameterChange(change))?;
            confirm(&session, &mut states, ctx.timeout_ms).await
        }
        Command::State => {
            let (state, _) = connect_once(&session, &ctx).await?;
            print_json(&serde_json::to_value(&state)?)
        }
    }
}

async fn run_watch(session: &SyncSession) -> Result<(), CliError> {
    let (tx, mut events) = mpsc::unbounded_channel();
    session.set_indicator(Arc::new(StderrIndicator));

    let sink = tx.clone();
    session.on_state_sync(move |state| {
        let _ = sink.send(WatchEvent::StateSync { state: state.clone() });
    });
    let sink = tx.clone();
    session.on_clock_change(move |widget_index| {
        let _ = sink.send(WatchEvent::ClockChange { widget_index });
    });
    let sink = tx.clone();
    session.on_parameter_change(move |change| {
        let _ = sink.send(WatchEvent::ParameterChange { change: change.clone() });
    });
    session.on_connection_change(move |connected| {
        let _ = tx.send(WatchEvent::Connection { connected });
    });

    session.connect();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    session.disconnect();
    Ok(())
}

/// Connect and wait for the relay's registration snapshot. Later snapshots
/// arrive on the returned receiver.
async fn connect_once(
    session: &SyncSession,
    ctx: &CliContext,
) -> Result<(GlobalState, mpsc::UnboundedReceiver<GlobalState>), CliError> {
    let (tx, mut states) = mpsc::unbounded_channel();
    session.on_state_sync(move |state| {
        let _ = tx.send(state.clone());
    });
    session.connect();

    match next_state(&mut states, ctx.timeout_ms).await {
        Some(state) => Ok((state, states)),
        None => Err(CliError::NotConnected { url: ctx.url.clone(), timeout_ms: ctx.timeout_ms }),
    }
}

fn send(session: &SyncSession, msg: &ClientMessage) -> Result<(), CliError> {
    if session.send(msg) { Ok(()) } else { Err(CliError::SendFailed) }
}

/// Wait until the relay has applied everything sent so far.
///
/// The relay answers the session's opening `get_state` and then the one sent
/// here, in order, so the second snapshot after registration comes after the
/// change.
async fn confirm(
    session: &SyncSession,
    states: &mut mpsc::UnboundedReceiver<GlobalState>,
    timeout_ms: u64,
) -> Result<(), CliError> {
    send(session, &ClientMessage::GetState)?;
    for _ in 0..2 {
        if next_state(states, timeout_ms).await.is_none() {
            return Err(CliError::Unconfirmed(timeout_ms));
        }
    }
    Ok(())
}

async fn next_state(states: &mut mpsc::UnboundedReceiver<GlobalState>, timeout_ms: u64) -> Option<GlobalState> {
    timeout(Duration::from_millis(timeout_ms), states.recv()).await.ok().flatten()
}

/// JSON if it parses (`1.5`, `true`, `"x"`), otherwise the raw text as a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
