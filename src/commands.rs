//! Command execution.

use crate::Commands;
use badgelink_client::{Client, TransferProgress, UsbTransport};
use badgelink_protocol::{
    ConfigEntryDescriptor, ConfigType, ConfigValue, DirectoryEntry, EntryKind, FilesystemState,
    PackageDescriptor, StorageUsage,
};
use colored::Colorize;
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Executes a command and returns the formatted output.
pub async fn execute<T: UsbTransport>(
    client: &Client<T>,
    cmd: Commands,
    as_json: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Repl => Err("already in a session".into()),

        Commands::Info => {
            let firmware = client.control_firmware_version().await?;
            let info = client.device_info();
            let version = client.protocol_version();
            if as_json {
                return Ok(format_json(&json!({
                    "device": info,
                    "protocol_version": version,
                    "firmware_version": firmware,
                    "state": client.state(),
                })));
            }

            let mut output = String::new();
            if let Some(info) = info {
                output.push_str(&format!(
                    "{} {:04x}:{:04x}\n",
                    "Device".bold(),
                    info.vendor_id,
                    info.product_id
                ));
                output.push_str(&format!(
                    "  Manufacturer: {}\n  Product: {}\n  Serial: {}\n",
                    info.manufacturer.as_deref().unwrap_or("-"),
                    info.product.as_deref().unwrap_or("-").cyan(),
                    info.serial_number.as_deref().unwrap_or("-"),
                ));
            }
            output.push_str(&format!(
                "  Protocol version: {}\n  Firmware version: {}",
                version.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
                firmware
            ));
            Ok(output)
        }

        Commands::Ping { data } => {
            let started = Instant::now();
            let echo = client.ping(data.as_bytes()).await?;
            let elapsed = started.elapsed();
            if echo.as_ref() != data.as_bytes() {
                return Err(format!(
                    "echo mismatch: sent {} bytes, received {} bytes",
                    data.len(),
                    echo.len()
                )
                .into());
            }
            if as_json {
                return Ok(format_json(&json!({
                    "bytes": echo.len(),
                    "elapsed_ms": elapsed.as_secs_f64() * 1000.0,
                })));
            }
            Ok(format!(
                "{} ({} bytes in {:.1} ms)",
                "PONG".green(),
                echo.len(),
                elapsed.as_secs_f64() * 1000.0
            ))
        }

        Commands::Ls { path } => {
            let entries = client.filesystem_list(&path).await?;
            if as_json {
                return Ok(format_json(&json!(entries)));
            }
            Ok(format_listing(&path, &entries))
        }

        Commands::Stat => {
            let state = client.filesystem_state().await?;
            if as_json {
                return Ok(format_json(&json!(state)));
            }
            Ok(format_state(&state))
        }

        Commands::Exists { path } => {
            let exists = client.filesystem_exists(&path).await?;
            if as_json {
                return Ok(format_json(&json!({ "path": path, "exists": exists })));
            }
            if exists {
                Ok(format!("{} exists", path.cyan()))
            } else {
                Ok(format!("{} {}", path.cyan(), "does not exist".yellow()))
            }
        }

        Commands::Mkdir { path } => {
            let created = client.filesystem_create_directory(&path).await?;
            status_output(as_json, created, "Created", "Could not create", &path)
        }

        Commands::Rm { path } => {
            let removed = client.filesystem_remove(&path).await?;
            status_output(as_json, removed, "Removed", "Could not remove", &path)
        }

        Commands::Get { remote, local } => {
            let data = client
                .filesystem_read(&remote)
                .await?
                .ok_or_else(|| format!("cannot open {}", remote))?;
            let local = local.unwrap_or_else(|| default_local_path(&remote));
            tokio::fs::write(&local, &data).await?;
            transfer_output(as_json, "Downloaded", &remote, &local, data.len())
        }

        Commands::Put { local, remote } => {
            let data = tokio::fs::read(&local).await?;
            let complete = client
                .filesystem_write(&remote, &data, progress_reporter(as_json))
                .await?;
            finish_progress(as_json);
            if !complete {
                return Err(format!("{} was not written completely", remote).into());
            }
            transfer_output(as_json, "Uploaded", &remote, &local, data.len())
        }

        Commands::Apps => {
            let apps = client.app_list().await?;
            if as_json {
                return Ok(format_json(&json!(apps)));
            }
            Ok(format_apps(&apps))
        }

        Commands::AppGet { name, local } => {
            let data = client
                .app_read(&name)
                .await?
                .ok_or_else(|| format!("app {} not found", name))?;
            let local = local.unwrap_or_else(|| default_local_path(&name));
            tokio::fs::write(&local, &data).await?;
            transfer_output(as_json, "Downloaded", &name, &local, data.len())
        }

        Commands::AppPut {
            local,
            name,
            title,
            version,
        } => {
            let data = tokio::fs::read(&local).await?;
            let title = title.unwrap_or_else(|| name.clone());
            let complete = client
                .app_write(&name, &title, version, &data, progress_reporter(as_json))
                .await?;
            finish_progress(as_json);
            if !complete {
                return Err(format!("app {} was not written completely", name).into());
            }
            transfer_output(as_json, "Installed", &name, &local, data.len())
        }

        Commands::AppRm { name } => {
            let removed = client.app_remove(&name).await?;
            status_output(as_json, removed, "Removed", "Could not remove", &name)
        }

        Commands::AppRun { name } => {
            let started = client.app_run(&name).await?;
            status_output(as_json, started, "Started", "Could not start", &name)
        }

        Commands::NvsLs { namespace } => {
            let entries = client.configuration_list(&namespace).await?;
            if as_json {
                return Ok(format_json(&json!(entries)));
            }
            Ok(format_settings(&entries))
        }

        Commands::NvsGet {
            namespace,
            key,
            value_type,
        } => {
            let config_type: ConfigType = value_type.parse()?;
            let value = client
                .configuration_read(&namespace, &key, config_type)
                .await?;
            match value {
                Some(value) if as_json => Ok(format_json(&value_json(&namespace, &key, &value))),
                Some(value) => Ok(value.to_string()),
                None => Err(format!("{}/{} not found", namespace, key).into()),
            }
        }

        Commands::NvsSet {
            namespace,
            key,
            value_type,
            value,
        } => {
            let config_type: ConfigType = value_type.parse()?;
            let value = ConfigValue::parse(config_type, &value)?;
            let written = client
                .configuration_write(&namespace, &key, &value)
                .await?;
            let target = format!("{}/{}", namespace, key);
            status_output(as_json, written, "Stored", "Could not store", &target)
        }

        Commands::NvsRm { namespace, key } => {
            let removed = client.configuration_remove(&namespace, &key).await?;
            let target = format!("{}/{}", namespace, key);
            status_output(as_json, removed, "Removed", "Could not remove", &target)
        }
    }
}

/// Progress callback printing a single updating line to stderr.
fn progress_reporter(quiet: bool) -> impl FnMut(TransferProgress) + Send {
    move |progress: TransferProgress| {
        if quiet {
            return;
        }
        let mut stderr = std::io::stderr();
        let _ = write!(
            stderr,
            "\r{:<14} {:>3}%",
            progress.stage.label(),
            progress.percent
        );
        let _ = stderr.flush();
    }
}

fn finish_progress(quiet: bool) {
    if !quiet {
        eprintln!();
    }
}

fn status_output(
    as_json: bool,
    ok: bool,
    done: &str,
    failed: &str,
    target: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    if as_json {
        return Ok(format_json(&json!({ "target": target, "ok": ok })));
    }
    if ok {
        Ok(format!("{} {}", done.green(), target.cyan()))
    } else {
        Err(format!("{} {}", failed, target).into())
    }
}

fn transfer_output(
    as_json: bool,
    verb: &str,
    remote: &str,
    local: &Path,
    size: usize,
) -> Result<String, Box<dyn std::error::Error>> {
    if as_json {
        return Ok(format_json(&json!({
            "remote": remote,
            "local": local,
            "bytes": size,
        })));
    }
    Ok(format!(
        "{} {} ({}) <-> {}",
        verb.green(),
        remote.cyan(),
        format_bytes(size as u64),
        local.display()
    ))
}

fn value_json(namespace: &str, key: &str, value: &ConfigValue) -> Value {
    json!({
        "namespace": namespace,
        "key": key,
        "type": value.config_type(),
        "value": value.to_string(),
    })
}

/// Uses the last path component of a remote path as the local file name.
pub(crate) fn default_local_path(remote: &str) -> PathBuf {
    let name = remote
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("download.bin");
    PathBuf::from(name)
}

/// Renders a modification time given in seconds since the epoch.
pub(crate) fn format_mtime(seconds: u64) -> String {
    i64::try_from(seconds)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub(crate) fn format_listing(path: &str, entries: &[DirectoryEntry]) -> String {
    if entries.is_empty() {
        return format!("{} is empty", path).yellow().to_string();
    }

    let mut output = String::new();
    for entry in entries {
        let (size, modified) = match &entry.stat {
            Some(stat) => (format_bytes(stat.size as u64), format_mtime(stat.modified)),
            None => ("?".to_string(), "?".to_string()),
        };
        let name = match entry.kind {
            EntryKind::Directory => format!("{}/", entry.name).blue().bold().to_string(),
            EntryKind::File => entry.name.clone(),
        };
        output.push_str(&format!("{:>10}  {:<19}  {}\n", size, modified, name));
    }
    output.pop();
    output
}

fn format_usage(label: &str, usage: &StorageUsage) -> String {
    let used = usage.size.saturating_sub(usage.free);
    let percent = if usage.size == 0 {
        0.0
    } else {
        used as f64 * 100.0 / usage.size as f64
    };
    format!(
        "  {:<9} {:>10} used of {:>10} ({:.0}%), {} free",
        label,
        format_bytes(used),
        format_bytes(usage.size),
        percent,
        format_bytes(usage.free)
    )
}

pub(crate) fn format_state(state: &FilesystemState) -> String {
    [
        "Storage".bold().to_string(),
        format_usage("internal", &state.internal),
        format_usage("sd", &state.sd),
        format_usage("app", &state.app),
    ]
    .join("\n")
}

pub(crate) fn format_apps(apps: &[PackageDescriptor]) -> String {
    if apps.is_empty() {
        return "No apps installed".yellow().to_string();
    }
    apps.iter()
        .map(|app| {
            format!(
                "  {} {} v{} ({})",
                app.name.cyan(),
                format!("\"{}\"", app.title).dimmed(),
                app.version,
                format_bytes(app.size as u64)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn format_settings(entries: &[ConfigEntryDescriptor]) -> String {
    if entries.is_empty() {
        return "No settings stored".yellow().to_string();
    }
    entries
        .iter()
        .map(|entry| {
            let type_name = entry
                .config_type()
                .map(|t| t.name().to_string())
                .unwrap_or_else(|| format!("0x{:02x}", entry.type_tag));
            format!(
                "  {}/{} {} ({} bytes)",
                entry.namespace,
                entry.key.cyan(),
                type_name.yellow(),
                entry.size
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Formats bytes as human-readable string.
pub(crate) fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
