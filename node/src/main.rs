// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # WEAVE Console Node
//!
//! Entry point for the `weave-node` binary. Hosts one or more peers on an
//! in-process fabric and serves the operator console on stdin/stdout: chat,
//! remote execution, queries, standing observations, and the `net`
//! configuration surface.
//!
//! Startup sequence:
//!
//! 1. Parse CLI args
//! 2. Initialize logging
//! 3. Load the settings file
//! 4. Build evaluator + sink + node per hosted peer and enter the fabric
//! 5. Rejoin saved groups
//! 6. Drive the tick interval and the console REPL until quit
//! 7. Exit every peer and persist settings

mod cli;
mod console;
mod evaluator;
mod logging;
mod settings;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncBufReadExt;

use weave_fabric::transport::memory::MemoryFabric;
use weave_fabric::{Node, FABRIC_VERSION};

use cli::{Commands, RunArgs, WeaveNodeCli};
use console::{Console, HostedPeer};
use evaluator::{ConsoleSink, DemoEvaluator};
use logging::LogFormat;
use settings::SettingsFile;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = WeaveNodeCli::parse();
    match cli.command {
        Commands::Run(args) => run_console(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// run — console startup
// ---------------------------------------------------------------------------

async fn run_console(args: RunArgs) -> Result<()> {
    let level = if cli::validate_log_level(&args.log_level) {
        args.log_level.as_str()
    } else {
        "info"
    };
    let filter = format!("weave_node={level},weave_fabric={level}");
    logging::init_logging(&filter, LogFormat::from_str_lossy(&args.log_format));

    let settings = SettingsFile::load(&args.config)?;
    let characters = normalize_peers(&args.peers);
    anyhow::ensure!(!characters.is_empty(), "at least one peer name is required");

    tracing::info!(
        server = %args.server,
        peers = ?characters,
        config = %args.config.display(),
        "starting weave-node"
    );

    // One shared in-process fabric; every hosted peer enters it.
    let fabric = MemoryFabric::new();
    let mut peers = Vec::with_capacity(characters.len());
    for character in &characters {
        let sink = Arc::new(ConsoleSink::new(character));
        let eval = Arc::new(DemoEvaluator::new(character, sink.clone()));
        let node = Node::new(
            &args.server,
            character,
            settings.general.net.clone(),
            eval.clone(),
            sink,
            Arc::new(fabric.clone()),
        );
        node.enter()
            .with_context(|| format!("peer {character} failed to enter the fabric"))?;
        for group in settings.saved_groups(node.name()) {
            node.join(&group);
        }
        peers.push(HostedPeer {
            character: character.clone(),
            node,
            eval,
        });
    }

    print_banner(&args.server, &characters, &args.config.display().to_string());

    let mut console = Console::new(peers, settings, args.config.clone());
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.tick_ms.max(10)));

    loop {
        tokio::select! {
            _ = ticker.tick() => console.tick_all(),
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    console.handle_line(&line).await;
                    if console.quit {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(%err, "stdin closed unexpectedly");
                    break;
                }
            }
        }
    }

    for peer in &console.peers {
        peer.node.exit();
    }
    console.settings.save(&console.settings_path)?;
    tracing::info!("weave-node stopped");
    Ok(())
}

/// Lowercases, trims, and dedups the hosted peer list, preserving order.
fn normalize_peers(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in raw {
        let name = name.trim().to_lowercase();
        if !name.is_empty() && !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

fn print_version() {
    println!("weave-node   {}", env!("CARGO_PKG_VERSION"));
    println!("weave-fabric {FABRIC_VERSION}");
}

fn print_banner(server: &str, peers: &[String], config: &str) {
    println!();
    println!("WEAVE console v{}", env!("CARGO_PKG_VERSION"));
    println!("  server : {server}");
    println!("  peers  : {}", peers.join(", "));
    println!("  config : {config}");
    println!("  type `help` for commands, `quit` to leave");
    println!();
}
