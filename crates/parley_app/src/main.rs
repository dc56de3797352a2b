mod cli;
mod console;
mod logging;

use std::sync::Arc;

use anyhow::{Result, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use uuid::Uuid;

use parley_network::{Device, NetworkConfig, ParleyNode};

use crate::cli::Cli;
use crate::console::{Command, ConsolePrinter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    let logs_dir = cli::logs_dir()?;
    let _guard = if cli.quiet {
        logging::init_logging_to_dir(&logs_dir, logging::DEFAULT_FILTER)?
    } else {
        logging::init_logging(&logs_dir)?
    };

    let config_path = cli.config_path()?;
    let mut config = NetworkConfig::load_or_default(&config_path);
    cli.apply_overrides(&mut config);
    if cli.save_config {
        config.save_to_file(&config_path).map_err(anyhow::Error::msg)?;
        info!("Saved config to {}", config_path.display());
    }

    let node = ParleyNode::new(config);
    node.add_subscriber(Arc::new(ConsolePrinter));

    if !node
        .set_identity(&cli.service, &cli.name, cli.json_data.clone())
        .await
    {
        bail!("Could not advertise '{}' in '{}'", cli.name, cli.service);
    }
    node.start_discovery().await?;
    println!("{}", console::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        match console::parse_command(&line) {
            Command::Empty => {}
            Command::Quit => break,
            Command::Help => println!("{}", console::HELP),
            Command::Devices => {
                println!("{}", console::format_devices(&node.available_devices()))
            }
            Command::Direct { to, text } => send(&node, text, &[Device::named(to)]),
            Command::Broadcast(text) => {
                let targets = node.available_devices();
                if targets.is_empty() {
                    println!("{}", console::format_devices(&targets));
                } else {
                    send(&node, text, &targets);
                }
            }
            Command::Invalid(reason) => eprintln!("* {reason}"),
        }
    }

    info!("Shutting down");
    node.stop().await;
    Ok(())
}

fn send(node: &ParleyNode, text: String, targets: &[Device]) {
    let id = Uuid::new_v4().to_string();
    if let Err(e) = node.send_message(Some(text), None, targets, &id) {
        warn!("Send failed: {e}");
    }
}
