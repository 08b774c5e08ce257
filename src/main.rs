use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use tokio::sync::mpsc;

use netmgr_common::hosts;
use netmgr_common::uuid::Uuid;
use netmgr_core::Monitor;
use netmgr_netlink::{EventSource, NetlinkClient};

mod config;

/// netmgr: cluster network manager
#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Sets the level of verbosity
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Path to the configuration file
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the network manager
    Run,

    /// Dump the published host table
    Hosts {
        /// Host table file (defaults to the one under the working directory)
        #[clap(short, long)]
        file: Option<PathBuf>,

        /// Print as JSON
        #[clap(long)]
        json: bool,
    },

    /// Print this node's UUID, assigning one if necessary
    Uuid,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "info" }),
    )
    .init();

    let config = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Hosts { file, json } => dump_hosts(config, file, json),
        Commands::Uuid => {
            let uuid = Uuid::load_or_assign(&config.uuid_file)
                .context("could not load or assign the node UUID")?;
            println!("{uuid}");
            Ok(())
        }
    }
}

async fn run(config: netmgr_core::NetmgrConfig) -> Result<()> {
    fs::create_dir_all(&config.workdir).with_context(|| {
        format!(
            "could not create working directory {}",
            config.workdir.display()
        )
    })?;

    let uuid =
        Uuid::load_or_assign(&config.uuid_file).context("could not load or assign the node UUID")?;
    info!("node UUID is '{uuid}'");

    let client = NetlinkClient::connect().context("failed to open the netlink request channel")?;

    let (events_tx, events_rx) = mpsc::channel(256);
    let source =
        EventSource::subscribe().context("failed to subscribe to kernel network events")?;
    source.spawn(events_tx);

    let monitor = Monitor::new(config, client, uuid);

    tokio::select! {
        _ = monitor.run(events_rx) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
        }
    }
    Ok(())
}

fn dump_hosts(
    config: netmgr_core::NetmgrConfig,
    file: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let path = file.unwrap_or_else(|| config.workdir.join("hosts"));
    let image =
        fs::read(&path).with_context(|| format!("could not read host table {}", path.display()))?;
    let entries = hosts::decode_table(&image)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in entries {
        let kind = if entry.partner { "partner" } else { "member" };
        println!(
            "{} {} addr {} mac {} node_ordinal {} interface_ordinal {}{}",
            kind,
            entry.node_uuid,
            entry.primary_address,
            entry.mac,
            entry.node_ordinal,
            entry.interface_ordinal,
            if entry.is_private { " private" } else { "" },
        );
    }
    Ok(())
}
