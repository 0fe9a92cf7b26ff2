mod repl;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use retrace_engine::api::RecorderService;
use retrace_engine::codegen::ExportFormat;
use retrace_engine::config::{ConfigLoader, RetraceConfig};
use retrace_engine::protocol::{BrowserKind, SessionDraft, SessionMetadata};
use retrace_engine::replay::ReplayOptions;
use retrace_engine::store::{SessionStore, SqliteDurableStore, StoreOptions};
use retrace_h::ChromiumLauncher;
use retrace_r::PushServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "retrace", version, about = "Record browser sessions and export self-healing scripts")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config file (defaults to ./retrace.yaml, then ~/.retrace/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database holding recorded sessions
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Browser {
    Chromium,
    Firefox,
    Webkit,
}

impl From<Browser> for BrowserKind {
    fn from(browser: Browser) -> Self {
        match browser {
            Browser::Chromium => BrowserKind::Chromium,
            Browser::Firefox => BrowserKind::Firefox,
            Browser::Webkit => BrowserKind::Webkit,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create a session and record interactions until `stop`
    Record {
        /// Session name
        #[arg(long)]
        name: String,
        /// Page to open when recording starts
        #[arg(long)]
        url: String,
        #[arg(long, value_enum, default_value_t = Browser::Chromium)]
        browser: Browser,
        /// Launch browser in visible mode (not headless)
        #[arg(long)]
        visible: bool,
        /// Also serve the session's events over WebSocket on this port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Serve session topics over WebSocket until Ctrl-C
    Serve {
        /// WebSocket port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Render a session as script, config, CI template or report
    Export {
        session_id: String,
        /// script | config | ci:<github|gitlab|jenkins> | report[:json|:markdown]
        #[arg(long, default_value = "script")]
        format: String,
        /// Write to this path instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List recorded sessions, most recently updated first
    List,
    /// Delete a session and all of its steps
    Delete { session_id: String },
    /// Replay a session with locator healing
    Replay {
        session_id: String,
        /// Directory for screenshots taken under the session's policy
        #[arg(long)]
        screenshots: Option<PathBuf>,
        /// Keep going after a failed step
        #[arg(long)]
        keep_going: bool,
    },
}

async fn load_config(args: &Args) -> anyhow::Result<RetraceConfig> {
    let mut config = match &args.config {
        Some(path) => ConfigLoader::load_from(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConfigLoader::load_default().await?,
    };
    if let Some(db) = &args.db {
        config.store.database_path = db.clone();
    }
    Ok(config)
}

fn open_service(config: &RetraceConfig, with_driver: bool) -> anyhow::Result<RecorderService> {
    let durable = SqliteDurableStore::open(&config.store.database_path).with_context(|| {
        format!("opening database {}", config.store.database_path.display())
    })?;
    let launcher = with_driver.then(|| {
        Arc::new(ChromiumLauncher::new(config.driver.clone()))
            as Arc<dyn retrace_engine::backend::DriverLauncher>
    });
    let store = SessionStore::new(
        Arc::new(durable),
        launcher,
        StoreOptions::from_config(config),
    );
    Ok(RecorderService::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries exported artifacts and event lines.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args).await?;

    let result = run(args.command, &config).await;
    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }
    result
}

async fn run(command: Command, config: &RetraceConfig) -> anyhow::Result<()> {
    match command {
        Command::Record {
            name,
            url,
            browser,
            visible,
            port,
        } => {
            let service = open_service(config, true)?;
            let mut draft = SessionDraft::new(name, url);
            draft.metadata = Some(SessionMetadata {
                browser: browser.into(),
                headless: !visible,
                ..config.defaults.metadata.clone()
            });
            let server = match port {
                Some(port) => Some(PushServer::new(service.clone(), port).start().await?),
                None => None,
            };
            let outcome = repl::record(&service, draft).await;
            if let Some(server) = server {
                server.stop();
            }
            service.shutdown().await;
            outcome
        }
        Command::Serve { port } => {
            let service = open_service(config, true)?;
            let port = port.unwrap_or(config.server.port);
            let server = PushServer::new(service.clone(), port).start().await?;
            info!("Serving session topics on {}", server.local_addr());
            tokio::signal::ctrl_c().await?;
            server.stop();
            service.shutdown().await;
            Ok(())
        }
        Command::Export {
            session_id,
            format,
            output,
        } => {
            let format: ExportFormat = format.parse()?;
            let service = open_service(config, false)?;
            let artifact = service.export(&session_id, format).await;
            service.shutdown().await;
            let artifact = artifact?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, artifact.content)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("{}", path.display());
                }
                None => print!("{}", artifact.content),
            }
            Ok(())
        }
        Command::List => {
            let service = open_service(config, false)?;
            let sessions = service.list_sessions().await;
            service.shutdown().await;
            for summary in sessions? {
                println!(
                    "{}  {:<10} {:>4} steps  {}  {}",
                    summary.id,
                    summary.status,
                    summary.step_count,
                    summary.updated_at.format("%Y-%m-%d %H:%M"),
                    summary.name
                );
            }
            Ok(())
        }
        Command::Delete { session_id } => {
            let service = open_service(config, false)?;
            let deleted = service.delete(&session_id).await;
            service.shutdown().await;
            let deleted = deleted?;
            for warning in &deleted.warnings {
                eprintln!("Warning: {}", warning);
            }
            println!("Deleted {}", session_id);
            Ok(())
        }
        Command::Replay {
            session_id,
            screenshots,
            keep_going,
        } => {
            let service = open_service(config, true)?;
            let options = ReplayOptions {
                screenshot_dir: screenshots,
                stop_on_failure: !keep_going,
            };
            let report = service.replay(&session_id, &options).await;
            service.shutdown().await;
            let report = report?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_success() {
                bail!(
                    "{} of {} steps failed ({} healed)",
                    report.failed(),
                    report.steps.len(),
                    report.healed()
                );
            }
            Ok(())
        }
    }
}
