use chitcache::cache::{CacheStorage, SqliteStorage};
use chitcache::config::Config;
use chitcache::db;
use chitcache::net::HttpFetcher;
use chitcache::queue::SqliteQueue;
use chitcache::worker::{Event, EventOutcome, EventRecord, Handled, Host, Notification, Worker};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "chitcache")]
#[command(about = "Offline cache and background sync worker for the chit-fund app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/chitcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Release tag for the shell cache generation
  #[arg(short, long)]
  release: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install this release's shell cache and activate it
  Install,
  /// Fetch a URL through the worker
  Fetch {
    url: String,
    #[arg(long, default_value = "GET")]
    method: String,
    /// Treat as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Print the response body instead of a summary
    #[arg(long)]
    body: bool,
  },
  /// Submit a write; queued if the network is unavailable
  Submit {
    #[arg(long, default_value = "payment")]
    operation: String,
    #[arg(long)]
    endpoint: String,
    /// JSON payload
    #[arg(long, default_value = "{}")]
    payload: String,
    /// Queue without trying the network
    #[arg(long)]
    offline: bool,
  },
  /// Fire a background sync signal
  Sync {
    /// Defaults to the configured sync tag
    #[arg(long)]
    tag: Option<String>,
  },
  /// Deliver a push message
  Push {
    #[arg(long)]
    data: Option<String>,
  },
  /// Show worker state, caches and queued writes
  Status,
  /// Read JSON events from stdin, one per line, until EOF
  Run,
}

/// Host for a terminal: notifications and windows are printed.
struct ConsoleHost;

impl Host for ConsoleHost {
  fn claim(&self) -> impl Future<Output = Result<()>> + Send {
    info!("claimed open views");
    std::future::ready(Ok(()))
  }

  fn open_window(&self, url: &Url) -> impl Future<Output = Result<()>> + Send {
    println!("{}", json!({ "open_window": url.as_str() }));
    std::future::ready(Ok(()))
  }

  fn show_notification(
    &self,
    notification: &Notification,
  ) -> impl Future<Output = Result<()>> + Send {
    let shown = serde_json::to_string(notification)
      .map(|n| info!(notification = %n, "notification shown"))
      .map_err(|e| eyre!("Failed to render notification: {}", e));
    std::future::ready(shown)
  }
}

type CliWorker = Worker<SqliteStorage, HttpFetcher, ConsoleHost>;

fn init_logging() -> Result<WorkerGuard> {
  let log_dir = db::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "chitcache.log"));
  let filter =
    EnvFilter::try_from_env("CHITCACHE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(fmt::layer().with_ansi(false).with_writer(file_writer))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn start_worker(config: &Config) -> Result<CliWorker> {
  let db_path = config.database_path()?;
  let storage = Arc::new(SqliteStorage::open_path(&db_path)?);
  let queue = Arc::new(SqliteQueue::open_path(&db_path)?);
  let origin = config.worker.resolve("/")?;
  let fetcher = HttpFetcher::new(&origin)?;

  Worker::start(config, storage, queue, fetcher, ConsoleHost)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging()?;

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(release) = args.release {
    config.worker.version = release;
  }

  let worker = start_worker(&config)?;

  match args.command {
    Command::Install => {
      let report = worker.update().await?;
      println!("{}", json!({ "state": worker.state(), "activation": report }));
    }
    Command::Fetch {
      url,
      method,
      navigate,
      body,
    } => {
      let event = EventRecord::Fetch {
        url,
        method: Some(method),
        navigate,
      }
      .into_event(worker.config())?;
      let outcome = worker.dispatch(event).await;
      match (&outcome, body) {
        (EventOutcome::Fetched(Handled::Served(served)), true) => {
          println!("{}", served.response.text())
        }
        _ => println!("{}", outcome.summary()),
      }
    }
    Command::Submit {
      operation,
      endpoint,
      payload,
      offline,
    } => {
      let payload = serde_json::from_str(&payload)
        .map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      worker.set_online(!offline);
      let event = EventRecord::Submit {
        operation,
        endpoint,
        payload,
      }
      .into_event(worker.config())?;
      println!("{}", worker.dispatch(event).await.summary());
    }
    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| worker.config().sync_tag.clone());
      println!("{}", worker.dispatch(Event::Sync { tag }).await.summary());
    }
    Command::Push { data } => {
      println!("{}", worker.dispatch(Event::Push { data }).await.summary());
    }
    Command::Status => print_status(&worker)?,
    Command::Run => run_events(Arc::new(worker)).await?,
  }

  Ok(())
}

fn print_status(worker: &CliWorker) -> Result<()> {
  let storage = worker.storage();
  let caches = storage
    .keys()?
    .into_iter()
    .map(|name| {
      let entries = storage.entries(&name).map(|e| e.len()).unwrap_or(0);
      json!({ "name": name, "entries": entries })
    })
    .collect::<Vec<_>>();

  println!(
    "{}",
    json!({
      "state": worker.state(),
      "shell_cache": worker.config().shell_cache(),
      "caches": caches,
      "queue": worker.queue().status()?,
    })
  );
  Ok(())
}

/// Dispatch each event on its own task; return only once every task is done.
async fn run_events(worker: Arc<CliWorker>) -> Result<()> {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  let mut tasks = JoinSet::new();

  while let Some(line) = lines.next_line().await? {
    if line.trim().is_empty() {
      continue;
    }

    let event = serde_json::from_str::<EventRecord>(&line)
      .map_err(|e| eyre!("Invalid event '{}': {}", line, e))
      .and_then(|record| record.into_event(worker.config()));
    let event = match event {
      Ok(event) => event,
      Err(e) => {
        warn!(error = %e, "skipping event");
        continue;
      }
    };

    let worker = Arc::clone(&worker);
    tasks.spawn(async move {
      let outcome = worker.dispatch(event).await;
      println!("{}", outcome.summary());
    });
  }

  while let Some(joined) = tasks.join_next().await {
    if let Err(e) = joined {
      warn!(error = %e, "event task failed");
    }
  }

  Ok(())
}
