//! cirrus-host: drive a cirrus worker from the command line.
//!
//! - `cirrus-host worker` serves the bridge protocol on stdin/stdout
//! - `cirrus-host call <operation>` spawns a worker, makes one call, prints
//!   the response
//! - `cirrus-host watch` spawns a worker and probes it until it stops
//!   answering

mod reference_worker;

use std::ffi::OsString;
use std::process;
use std::sync::Arc;

use anyhow::{Context, bail};
use cirrus_bridge::{Bridge, BridgeConfig, CommandSpawner, Operation, run_stdio_worker};
use serde_json::{Map, Value};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::reference_worker::ReferenceWorker;

const USAGE: &str = "\
Usage: cirrus-host <command> [options]

Commands:
  worker                      Serve the worker protocol on stdin/stdout
  call <operation>            Spawn a worker and make one call
  watch                       Spawn a worker and probe it until it dies

Options:
  --params <json>             Call parameters as a JSON object [default: {}]
  --worker <program>          Worker program [default: this binary, with `worker`]";

#[derive(Debug, PartialEq)]
enum Command {
    Worker,
    Call {
        operation: String,
        params: Map<String, Value>,
        worker: Option<OsString>,
    },
    Watch {
        worker: Option<OsString>,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    if let Err(e) = run(command).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

/// Initialize tracing with CIRRUS_LOG and LOG_FORMAT support.
///
/// Logs go to stderr: in worker mode stdout carries the protocol.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("CIRRUS_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "cirrus_bridge={level},cirrus_host={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut positional: Vec<String> = Vec::new();
    let mut params: Option<String> = None;
    let mut worker: Option<OsString> = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--params" => {
                i += 1;
                params = Some(args.get(i).ok_or("--params requires a value")?.clone());
            }
            "--worker" => {
                i += 1;
                worker = Some(args.get(i).ok_or("--worker requires a value")?.into());
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let command = positional.next().ok_or("missing command")?;
    let command = match command.as_str() {
        "worker" => Command::Worker,
        "call" => {
            let operation = positional
                .next()
                .ok_or("call requires an <operation>")?;
            let params = match params {
                None => Map::new(),
                Some(raw) => match serde_json::from_str::<Value>(&raw) {
                    Ok(Value::Object(map)) => map,
                    Ok(_) => return Err("--params must be a JSON object".to_string()),
                    Err(e) => return Err(format!("invalid --params: {e}")),
                },
            };
            Command::Call {
                operation,
                params,
                worker,
            }
        }
        "watch" => Command::Watch { worker },
        other => return Err(format!("unknown command: {other}")),
    };

    if let Some(extra) = positional.next() {
        return Err(format!("unexpected argument: {extra}"));
    }
    Ok(command)
}

/// Build an operation from its wire tag and parameters.
fn build_operation(operation: &str, mut params: Map<String, Value>) -> anyhow::Result<Operation> {
    params.insert("type".to_string(), Value::String(operation.to_string()));
    serde_json::from_value(Value::Object(params))
        .with_context(|| format!("invalid parameters for {operation}"))
}

fn spawner(worker: Option<OsString>) -> anyhow::Result<CommandSpawner> {
    match worker {
        Some(program) => Ok(CommandSpawner::new(program)),
        None => {
            let exe = std::env::current_exe().context("failed to locate own executable")?;
            Ok(CommandSpawner::new(exe).arg("worker"))
        }
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Worker => {
            run_stdio_worker(Arc::new(ReferenceWorker::from_env()))
                .await
                .context("worker failed")?;
        }
        Command::Call {
            operation,
            params,
            worker,
        } => {
            let operation = build_operation(&operation, params)?;
            let bridge = connect(worker).await?;

            let mut progress = bridge.subscribe_progress();
            let progress_task = tokio::spawn(async move {
                while let Ok(event) = progress.recv().await {
                    tracing::info!(kind = event.kind.as_str(), payload = %event.payload, "Progress");
                }
            });

            let result = bridge.dispatcher().call(operation).await;
            progress_task.abort();
            bridge.shutdown().await;

            let response = result?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Watch { worker } => {
            let bridge = connect(worker).await?;
            let (dead_tx, dead_rx) = tokio::sync::oneshot::channel();
            let monitor = bridge.monitor(move |reason| {
                let _ = dead_tx.send(reason);
            });
            tracing::info!(instance = %bridge.instance_id(), "Watching worker, Ctrl-C to stop");

            tokio::select! {
                reason = dead_rx => {
                    monitor.join().await;
                    bridge.shutdown().await;
                    match reason {
                        Ok(reason) => bail!("worker died: {reason}"),
                        Err(_) => bail!("liveness monitor ended unexpectedly"),
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context("failed to listen for Ctrl-C")?;
                    monitor.stop();
                    monitor.join().await;
                    bridge.shutdown().await;
                }
            }
        }
    }
    Ok(())
}

async fn connect(worker: Option<OsString>) -> anyhow::Result<Bridge> {
    let config = BridgeConfig::from_env()?;
    let spawner = spawner(worker)?;
    let bridge = Bridge::spawn(config, &spawner)
        .await
        .context("failed to start worker")?;
    Ok(bridge)
}
