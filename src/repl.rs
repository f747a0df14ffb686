//! Interactive REPL.

use crate::commands;
use crate::{BadgeClient, Commands};
use badgelink_client::{ConnectionEvent, ConnectionState};
use clap::Parser;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use tokio::sync::broadcast::error::TryRecvError;

const HELP_TEXT: &str = r#"
Available commands:
  help                          Show this help
  info                          Device, protocol and firmware information
  ping [text]                   Check the link
  status                        Show the connection state
  connect                       Reconnect after the link went down

  ls [path]                     List a directory
  stat                          Show storage usage
  exists <path>                 Check whether a path exists
  mkdir <path>                  Create a directory
  rm <path>                     Remove a file or directory
  get <remote> [local]          Download a file
  put <local> <remote>          Upload a file

  apps                          List installed apps
  app-get <name> [local]        Download an app
  app-put <local> --name <n> [--title <t>] [--version <v>]
                                Install an app
  app-rm <name>                 Remove an app
  app-run <name>                Start an app (ends the session)

  nvs-ls [namespace]            List settings
  nvs-get <ns> <key> <type>     Read a setting
  nvs-set <ns> <key> <type> <value>
                                Write a setting
  nvs-rm <ns> <key>             Remove a setting

  quit, exit                    Exit the REPL
"#;

/// One REPL line, parsed with the same subcommands as the command line.
#[derive(Parser)]
#[command(no_binary_name = true)]
struct ReplLine {
    #[command(subcommand)]
    command: Commands,
}

pub async fn run(client: BadgeClient, as_json: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "badgelink".bold().cyan());
    let usb = &client.config().usb;
    println!("Connecting to {:04x}:{:04x}...", usb.vendor_id, usb.product_id);

    let version = client.connect().await?;
    println!("{} (protocol version {})", "Connected!".green(), version);
    let mut events = client.subscribe_events();

    // Create readline editor
    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    // Load history
    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".badgelink_history"))
        .unwrap_or_else(|_| ".badgelink_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        report_events(&mut events);

        let prompt = format!("{} ", "badge>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(&client, line, as_json).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break, // Exit command
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    // Save history
    let _ = rl.save_history(&history_path);

    if client.is_connected() {
        let reset = client.config().usb.reset_on_disconnect;
        let _ = client.disconnect(reset).await;
    }
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

/// Prints lifecycle events that arrived since the last prompt.
fn report_events(events: &mut tokio::sync::broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.try_recv() {
            Ok(ConnectionEvent::ConnectionLost { reason }) => {
                println!(
                    "{}: {} (type 'connect' to retry)",
                    "Connection lost".red(),
                    reason
                );
            }
            Ok(ConnectionEvent::Connected { protocol_version }) => {
                println!("{} (protocol version {})", "Connected".green(), protocol_version);
            }
            Ok(ConnectionEvent::Disconnected) => {
                println!("{}", "Disconnected".yellow());
            }
            Err(TryRecvError::Lagged(n)) => {
                println!("{}: missed {} events", "Warning".yellow(), n);
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
}

async fn execute_repl_command(
    client: &BadgeClient,
    line: &str,
    as_json: bool,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.is_empty() {
        return Ok(Some(String::new()));
    }

    match parts[0].to_lowercase().as_str() {
        "help" | "?" => return Ok(Some(HELP_TEXT.to_string())),
        "quit" | "exit" | "q" => return Ok(None),
        "status" => {
            let state = match client.state() {
                ConnectionState::Synchronized => "synchronized".green(),
                ConnectionState::AwaitingSync => "awaiting sync".yellow(),
                ConnectionState::BootstrappingControl => "bootstrapping".yellow(),
                ConnectionState::Disconnected => "disconnected".red(),
            };
            return Ok(Some(format!(
                "State: {}\nPending transactions: {}\nDiscarded bytes: {}",
                state,
                client.connection().pending_count(),
                client.connection().discarded_bytes()
            )));
        }
        "connect" => {
            if client.is_connected() {
                return Ok(Some("Already connected".yellow().to_string()));
            }
            // Clear out a link whose reader died.
            let _ = client.disconnect(false).await;
            let version = client.connect().await?;
            return Ok(Some(format!(
                "{} (protocol version {})",
                "Connected!".green(),
                version
            )));
        }
        _ => {}
    }

    let command = match ReplLine::try_parse_from(parts.iter().copied()) {
        Ok(parsed) => parsed.command,
        Err(e) => return Ok(Some(e.render().to_string())),
    };
    if matches!(command, Commands::Repl) {
        return Ok(Some("Already in the REPL".yellow().to_string()));
    }

    commands::execute(client, command, as_json)
        .await
        .map(Some)
}
