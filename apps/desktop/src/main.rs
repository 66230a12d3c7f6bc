use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{list_widgets, ClientEvent, WidgetClient};
use futures::StreamExt;
use serde_json::Value;
use shared::domain::PathSegment;
use tracing::debug;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8765")]
    server_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists the widgets hosted by the server.
    List,
    /// Prints the model and backend messages as they change.
    Watch { widget: String },
    /// Calls a model function, e.g. `call counter add 1 2`.
    Call {
        widget: String,
        path: String,
        args: Vec<String>,
    },
    /// Runs a widget action, e.g. `dispatch counter inc 2`.
    Dispatch {
        widget: String,
        name: String,
        args: Vec<String>,
    },
    /// Assigns a JSON value at a dotted model path, e.g. `set counter state.counter 5`.
    Set {
        widget: String,
        path: String,
        value: String,
    },
}

fn parse_path(raw: &str) -> Vec<PathSegment> {
    raw.split('.')
        .filter(|part| !part.is_empty())
        .map(|part| match part.parse::<usize>() {
            Ok(index) => PathSegment::Index(index),
            Err(_) => PathSegment::from(part),
        })
        .collect()
}

/// Arguments are JSON where they parse as JSON and plain strings otherwise.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn watch(client: WidgetClient) -> Result<()> {
    let mut models = client.watch_model();
    let mut events = client.subscribe_events();
    loop {
        tokio::select! {
            model = models.next() => match model {
                Some(model) => println!("model: {}", serde_json::to_string(&model)?),
                None => break,
            },
            event = events.recv() => match event {
                Ok(ClientEvent::Message(message)) => {
                    println!("message {}: {}", message.kind, message.payload);
                }
                Ok(ClientEvent::Error(err)) => eprintln!("error: {err}"),
                Ok(ClientEvent::Closed) | Err(_) => break,
            },
        }
    }
    println!("connection closed");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    match args.command {
        Command::List => {
            for name in list_widgets(&args.server_url).await? {
                println!("{name}");
            }
        }
        Command::Watch { widget } => {
            let client = WidgetClient::connect(&args.server_url, &widget).await?;
            println!("connected as client_id={}", client.client_id());
            watch(client).await?;
        }
        Command::Call { widget, path, args: call_args } => {
            let client = WidgetClient::connect(&args.server_url, &widget).await?;
            let values = call_args.iter().map(|arg| parse_value(arg)).collect();
            let result = client
                .call(parse_path(&path), values)
                .await
                .with_context(|| format!("call to {path} failed"))?;
            println!("{}", serde_json::to_string(&result)?);
        }
        Command::Dispatch { widget, name, args: action_args } => {
            let client = WidgetClient::connect(&args.server_url, &widget).await?;
            let values = action_args.iter().map(|arg| parse_value(arg)).collect();
            client
                .dispatch(&name, values)
                .await
                .with_context(|| format!("action {name} failed"))?;
            println!("state: {}", serde_json::to_string(&client.model()["state"])?);
        }
        Command::Set { widget, path, value } => {
            let client = WidgetClient::connect(&args.server_url, &widget).await?;
            client.update_model(parse_path(&path), parse_value(&value)).await?;
            // Let the writer task drain before exiting.
            tokio::time::sleep(Duration::from_millis(200)).await;
            debug!(%widget, %path, "model update sent");
            println!("{}", serde_json::to_string(&client.model())?);
        }
    }

    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
