use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sentra_config::AppConfig;
use sentra_llm::HttpBackend;
use sentra_pipeline::QueryOptions;
use sentra_runtime::{AgentRuntime, ProcessOptions, StartupError};
use sentra_tools::Mode;

/// Exit code for an interrupted run (SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Parser)]
#[command(name = "sentra", version, about = "Cybersecurity assistant orchestration core")]
struct Cli {
    /// Path to the TOML configuration file.  Falls back to
    /// `SENTRA_CONFIG`, then `<data_dir>/sentra.toml` defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Beginner,
    Pro,
    Safe,
    Simulation,
    Training,
}

impl From<CliMode> for Mode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Beginner => Mode::Beginner,
            CliMode::Pro => Mode::Pro,
            CliMode::Safe => Mode::Safe,
            CliMode::Simulation => Mode::Simulation,
            CliMode::Training => Mode::Training,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the core with background health and persistence schedulers.
    Start {
        #[arg(long, value_enum, default_value = "safe")]
        mode: CliMode,
    },
    /// One-shot knowledge query.
    Query {
        text: String,
        /// Bypass the answer cache.
        #[arg(long)]
        no_cache: bool,
    },
    /// Process a full request through the planner.
    Process {
        text: String,
        #[arg(long, default_value = "cli")]
        session: String,
        #[arg(long, value_enum, default_value = "safe")]
        mode: CliMode,
    },
    /// Ingest a document into semantic memory.
    Ingest { path: PathBuf },
    /// Startup checks: config, master key, store decryptability, backend.
    Doctor,
    /// Current health report (Markdown).
    Health,
    /// Run the self-healing actions.
    Heal,
    /// Memory statistics.
    MemoryStats,
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var("SENTRA_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| {
            AppConfig::default().data_dir().join("sentra.toml")
        });
    AppConfig::load_from(path)
}

async fn bootstrap(config: AppConfig) -> Result<Arc<AgentRuntime>, StartupError> {
    let backend = Arc::new(
        HttpBackend::new(&config.llm)
            .map_err(|e| StartupError::BackendUnavailable(e.to_string()))?,
    );
    AgentRuntime::bootstrap(config, backend).await
}

fn startup_failure(err: StartupError) -> ExitCode {
    error!(code = err.exit_code(), "{err}");
    ExitCode::from(err.exit_code() as u8)
}

async fn run(cli: Cli) -> ExitCode {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err}");
            return ExitCode::from(64);
        }
    };

    match cli.command {
        Commands::Start { mode } => {
            let runtime = match bootstrap(config).await {
                Ok(runtime) => runtime,
                Err(err) => return startup_failure(err),
            };
            if let Err(err) = runtime.verify_backend().await {
                return startup_failure(err);
            }
            runtime.set_mode(mode.into()).await;

            let handles = runtime.start_background();
            info!("sentra core running; Ctrl-C to stop");

            let interrupted = tokio::signal::ctrl_c().await.is_ok();
            for handle in handles {
                handle.abort();
            }
            if let Err(err) = runtime.shutdown().await {
                error!("shutdown flush failed: {err}");
            }
            if interrupted {
                info!("interrupted; state flushed");
                return ExitCode::from(EXIT_INTERRUPTED);
            }
            ExitCode::SUCCESS
        }

        Commands::Query { text, no_cache } => {
            let runtime = match bootstrap(config).await {
                Ok(runtime) => runtime,
                Err(err) => return startup_failure(err),
            };
            let opts = QueryOptions {
                use_cache: !no_cache,
                ..QueryOptions::default()
            };
            match runtime.query_knowledge(&text, &opts).await {
                Ok(answer) => {
                    if answer.degraded {
                        println!("[degraded: served from cache — generation backend unavailable]");
                    }
                    println!("{}", answer.response);
                    info!(
                        cached = answer.cached,
                        confidence = answer.confidence,
                        elapsed_ms = answer.processing_time_ms,
                        "query complete"
                    );
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    error!(code = err.code(), request = %err.request_id(), "{err}");
                    ExitCode::from(74)
                }
            }
        }

        Commands::Process { text, session, mode } => {
            let runtime = match bootstrap(config).await {
                Ok(runtime) => runtime,
                Err(err) => return startup_failure(err),
            };
            runtime.set_mode(mode.into()).await;

            let opts = ProcessOptions {
                session,
                ..ProcessOptions::default()
            };
            match runtime.process(&text, &opts).await {
                Ok(outcome) => {
                    println!("{}", outcome.text);
                    for call in &outcome.tool_calls {
                        let tag = if call.simulated { "simulated" } else { "real" };
                        info!(tool = %call.tool, mode = tag, "tool step");
                    }
                    if let Err(err) = runtime.shutdown().await {
                        error!("shutdown flush failed: {err}");
                    }
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    error!(code = err.code(), request = %err.request_id(), "{err}");
                    ExitCode::FAILURE
                }
            }
        }

        Commands::Ingest { path } => {
            let runtime = match bootstrap(config).await {
                Ok(runtime) => runtime,
                Err(err) => return startup_failure(err),
            };
            match runtime.ingest(&path).await {
                Ok((accepted, rejected)) => {
                    println!("accepted {accepted} chunks, rejected {rejected}");
                    if let Err(err) = runtime.shutdown().await {
                        error!("shutdown flush failed: {err}");
                    }
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    error!(code = err.code(), "{err}");
                    ExitCode::FAILURE
                }
            }
        }

        Commands::Doctor => {
            // Bootstrap exercises the master key and every store decrypt.
            let runtime = match bootstrap(config).await {
                Ok(runtime) => runtime,
                Err(err) => return startup_failure(err),
            };
            println!("config: ok");
            println!("master key: ok");
            println!("stores: decrypted cleanly");
            match runtime.verify_backend().await {
                Ok(()) => println!("llm backend: reachable"),
                Err(err) => {
                    println!("llm backend: UNREACHABLE ({err})");
                    return ExitCode::from(74);
                }
            }
            ExitCode::SUCCESS
        }

        Commands::Health => {
            let runtime = match bootstrap(config).await {
                Ok(runtime) => runtime,
                Err(err) => return startup_failure(err),
            };
            println!("{}", runtime.health_report().await);
            ExitCode::SUCCESS
        }

        Commands::Heal => {
            let runtime = match bootstrap(config).await {
                Ok(runtime) => runtime,
                Err(err) => return startup_failure(err),
            };
            for outcome in runtime.trigger_self_healing().await {
                let verdict = if outcome.succeeded { "ok" } else { "failed" };
                println!("{}: {verdict} — {}", outcome.action, outcome.detail);
            }
            ExitCode::SUCCESS
        }

        Commands::MemoryStats => {
            let runtime = match bootstrap(config).await {
                Ok(runtime) => runtime,
                Err(err) => return startup_failure(err),
            };
            let stats = runtime.memory().stats().await;
            println!("{}", serde_json::to_string_pretty(&stats).unwrap_or_default());
            ExitCode::SUCCESS
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    run(cli).await
}
