mod cache;
mod config;
mod error;
mod gateway;
mod http;
mod network;
mod notifications;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use cache::{CacheStorage, MemoryStorage, SqliteStorage};
use gateway::{
  load_offline_page, ClickOutcome, Gateway, GatewayState, Notification, SyncOutcome,
};
use http::{Method, Request};
use network::HttpNetwork;
use notifications::{badge_label, NotificationClient};

#[derive(Parser, Debug)]
#[command(name = "moldgate")]
#[command(about = "An offline cache gateway for the MoldPark web frontend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/moldgate/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install and activate the current version unless it is already active
  Register,
  /// Pre-cache the static manifest without activating
  Install,
  /// Activate a previously installed version
  Activate,
  /// Send a request through the gateway
  Fetch {
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: Method,
    /// Accept header, e.g. text/html for a page navigation
    #[arg(long)]
    accept: Option<String>,
    /// Print the response body
    #[arg(long)]
    body: bool,
  },
  /// List cache stores and their entries
  Caches,
  /// Build the notification shown for a push payload
  Push { payload: Option<String> },
  /// Handle a click on a notification action
  Click { action: Option<String> },
  /// Fire a background sync event
  Sync {
    #[arg(default_value = "background-sync")]
    tag: String,
  },
  /// Post a JSON message from the page, e.g. '{"type":"SKIP_WAITING"}'
  Message { data: String },
  /// Update read state on the notification backend
  #[command(subcommand)]
  Notifications(NotificationsCommand),
}

#[derive(Subcommand, Debug)]
enum NotificationsCommand {
  /// Mark one notification as read
  Read { id: u64 },
  /// Mark every notification as read
  ReadAll,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _guard = init_tracing(config.log_file.as_deref())?;

  if config.storage.in_memory {
    run(args.command, &config, Arc::new(MemoryStorage::new())).await
  } else {
    let storage = SqliteStorage::open(config.storage.path.as_deref())?;
    run(args.command, &config, Arc::new(storage)).await
  }
}

/// Log to stderr, and to `log_file` as well when configured.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("moldgate=info"));

  let (file_layer, guard) = match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;

      let appender = tracing_appender::rolling::never(dir, name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer().with_writer(writer).with_ansi(false);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

async fn run<S: CacheStorage>(
  command: Command,
  config: &config::Config,
  storage: Arc<S>,
) -> Result<()> {
  let network = HttpNetwork::new(config)?;
  let mut gateway = Gateway::new(
    config.gateway.clone(),
    config.origin_url()?,
    storage,
    network,
  );
  if let Some(path) = &config.gateway.offline_page {
    gateway = gateway.with_offline_page(load_offline_page(path)?);
  }

  let mut out = std::io::stdout().lock();

  match command {
    Command::Register => {
      let state = gateway.register().await?;
      writeln!(out, "{} {}", gateway.cache_name(), state)?;
    }
    Command::Install => {
      gateway.install().await?;
      writeln!(out, "{} {}", gateway.cache_name(), gateway.state())?;
    }
    Command::Activate => {
      if gateway.restore()? != GatewayState::Active {
        gateway.activate().await?;
      }
      writeln!(out, "{} {}", gateway.cache_name(), gateway.state())?;
    }
    Command::Fetch {
      url,
      method,
      accept,
      body,
    } => {
      // A failed install leaves any previous version in control
      if let Err(e) = gateway.register().await {
        warn!(error = %e, "Gateway not installed");
      }

      let mut request = Request::new(method, url);
      if let Some(accept) = accept {
        request = request.with_header("accept", accept);
      }

      let outcome = gateway.handle_fetch(&request).await?;
      writeln!(
        out,
        "{} {} {} bytes",
        outcome.response.status,
        outcome.source,
        outcome.response.body.len()
      )?;
      if let Some(cached_at) = outcome.cached_at {
        writeln!(out, "cached at {}", cached_at.to_rfc3339())?;
      }
      if let Some(content_type) = outcome.response.header("content-type") {
        writeln!(out, "content-type: {}", content_type)?;
      }
      if body {
        out.write_all(&outcome.response.body)?;
        writeln!(out)?;
      }
    }
    Command::Caches => {
      let active = gateway.storage().get_registration()?;
      for name in gateway.storage().store_names()? {
        let marker = if active.as_deref() == Some(name.as_str()) {
          " (active)"
        } else {
          ""
        };
        writeln!(out, "{}{}", name, marker)?;
        for key in gateway.storage().entry_keys(&name)? {
          writeln!(out, "  {}", key)?;
        }
      }
    }
    Command::Push { payload } => {
      let notification: Notification = gateway.handle_push(payload.as_deref());
      writeln!(out, "{}", serde_json::to_string_pretty(&notification)?)?;
    }
    Command::Click { action } => match gateway.handle_notification_click(action.as_deref()) {
      ClickOutcome::OpenWindow(url) => writeln!(out, "open {}", url)?,
      ClickOutcome::Dismissed => writeln!(out, "dismissed")?,
    },
    Command::Sync { tag } => match gateway.handle_sync(&tag).await {
      SyncOutcome::Completed => writeln!(out, "sync {} completed", tag)?,
      SyncOutcome::Ignored => writeln!(out, "sync {} ignored", tag)?,
    },
    Command::Message { data } => {
      let data: serde_json::Value =
        serde_json::from_str(&data).map_err(|e| eyre!("Message is not valid JSON: {}", e))?;
      if gateway.restore()? == GatewayState::Uninstalled {
        if let Err(e) = gateway.install().await {
          warn!(error = %e, "Gateway not installed");
        }
      }
      let state = gateway.handle_message(&data).await?;
      writeln!(out, "{} {}", gateway.cache_name(), state)?;
    }
    Command::Notifications(command) => run_notifications(command, config, &mut out).await?,
  }

  Ok(())
}

async fn run_notifications(
  command: NotificationsCommand,
  config: &config::Config,
  out: &mut impl Write,
) -> Result<()> {
  let client = NotificationClient::new(config)?;

  let ack = match command {
    NotificationsCommand::Read { id } => client.mark_read(id).await?,
    NotificationsCommand::ReadAll => client.mark_all_read().await?,
  };

  if !ack.success {
    return Err(eyre!("Notification backend rejected the update"));
  }

  match badge_label(ack.unread_count) {
    Some(label) => writeln!(out, "unread {}", label)?,
    None => writeln!(out, "no unread notifications")?,
  }

  Ok(())
}
