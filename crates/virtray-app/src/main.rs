use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use virtray_backend::{FakeHypervisor, Hypervisor};
use virtray_core::{EngineConfig, GuestAction, GuestId, RenderInstruction};
use virtray_engine::{build_engine, Dispatcher};

#[derive(Parser, Debug)]
#[command(name = "virtray", about = "Guest reconciliation engine for a tray indicator")]
struct Args {
    /// Backend connection URI (libvirt builds only).
    #[arg(long, env = "VIRTRAY_CONNECT", default_value = "qemu:///system")]
    connect: String,
    #[arg(long, env = "VIRTRAY_POLL_SECS", default_value_t = 10)]
    poll_secs: u64,
    /// Run against the deterministic in-memory backend.
    #[arg(long, env = "VIRTRAY_TEST", default_value_t = false)]
    test_mode: bool,
    /// Icon theme name hint, passed through to the presentation adapter.
    #[arg(long, env = "VIRTRAY_ICON_NAME")]
    icon_name: Option<String>,
    /// Icon file path hint, passed through to the presentation adapter.
    #[arg(long, env = "VIRTRAY_ICON_PATH")]
    icon_path: Option<String>,
}

fn init_tracing() {
    // Logs go to stderr; stdout carries only the render stream.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| std::env::var("VIRTRAY_LOG").map(EnvFilter::new))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn select_backend(args: &Args) -> anyhow::Result<Arc<dyn Hypervisor>> {
    if args.test_mode {
        info!(event = "backend_selected", kind = "fake");
        return Ok(Arc::new(FakeHypervisor::seeded()));
    }
    libvirt_backend(args)
}

#[cfg(feature = "libvirt")]
fn libvirt_backend(args: &Args) -> anyhow::Result<Arc<dyn Hypervisor>> {
    info!(event = "backend_selected", kind = "libvirt", uri = %args.connect);
    Ok(Arc::new(virtray_backend::LibvirtHypervisor::new(
        args.connect.clone(),
    )))
}

#[cfg(not(feature = "libvirt"))]
fn libvirt_backend(_args: &Args) -> anyhow::Result<Arc<dyn Hypervisor>> {
    anyhow::bail!(
        "built without the `libvirt` feature; run with --test-mode or rebuild with --features libvirt"
    )
}

fn print_instruction(instruction: &RenderInstruction) {
    match serde_json::to_string(instruction) {
        Ok(line) => println!("{line}"),
        Err(err) => warn!(event = "render_encode_failed", error = %err),
    }
}

/// One line of adapter input: `{"guest": "...", "action": "start"}`.
#[derive(Debug, Deserialize)]
struct CommandLine {
    guest: String,
    action: GuestAction,
}

async fn command_bridge(dispatcher: Dispatcher) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let command: CommandLine = match serde_json::from_str(line) {
            Ok(command) => command,
            Err(err) => {
                warn!(event = "command_parse_failed", error = %err);
                continue;
            }
        };
        match dispatcher
            .dispatch(GuestId::from(command.guest.as_str()), command.action)
            .await
        {
            Ok(pending) => {
                info!(
                    event = "command_dispatched",
                    guest = %pending.guest,
                    action = %pending.action,
                    outcome = ?pending.outcome
                );
            }
            Err(err) => {
                warn!(event = "dispatch_rejected", error = %err);
                print_instruction(&RenderInstruction::ShowError {
                    message: err.to_string(),
                });
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();
    info!(event = "virtray_starting", test_mode = args.test_mode);

    let config = EngineConfig {
        poll_interval: Duration::from_secs(args.poll_secs.max(1)),
        ..EngineConfig::default()
    };
    let shutdown_grace = config.shutdown_grace;
    let hypervisor = select_backend(&args).context("selecting backend")?;

    let (reconciler, dispatcher, mut render_rx) = build_engine(config, hypervisor);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut engine = tokio::spawn(reconciler.run(shutdown_rx));
    tokio::spawn(command_bridge(dispatcher));

    // Stream header for the adapter: configuration it needs before the first
    // instruction, icon hints included.
    println!(
        "{}",
        json!({
            "type": "hello",
            "poll_secs": args.poll_secs,
            "icon_name": args.icon_name,
            "icon_path": args.icon_path,
        })
    );

    loop {
        tokio::select! {
            maybe = render_rx.recv() => match maybe {
                Some(instruction) => print_instruction(&instruction),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!(event = "shutdown_requested");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(shutdown_grace, &mut engine).await.is_err() {
        warn!(event = "shutdown_grace_elapsed");
        engine.abort();
    }
    Ok(())
}
