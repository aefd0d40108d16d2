use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use redraft_core::config::AppConfig;
use redraft_core::event::EventBus;
use redraft_core::state::RunInput;
use redraft_core::types::RunId;

use redraft_engine::durable::{DurableRunner, SqliteUnitStore, UnitPolicies, UnitStore};
use redraft_engine::graph::{GraphExecutor, Services};
use redraft_engine::nodes::{build_writer_graph, GraphOptions};
use redraft_engine::RunLogger;

#[derive(Parser)]
#[command(name = "redraft", version, about = "Plan, research, draft and revise an article")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "redraft.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the writer graph in memory and print the final draft
    Run {
        /// Maximum number of drafts (default: workflow.max_revisions)
        #[arg(long)]
        max_revisions: Option<u32>,
        /// The writing task
        #[arg(trailing_var_arg = true, required = true)]
        task: Vec<String>,
    },
    /// Start or resume a durable run
    Durable {
        /// Run id; re-use it to resume (default: a new uuid)
        #[arg(long)]
        run_id: Option<String>,
        /// Maximum number of drafts (default: workflow.max_revisions)
        #[arg(long)]
        max_revisions: Option<u32>,
        /// Include the critique loop (default: durable.critique_loop)
        #[arg(long = "loop")]
        critique_loop: bool,
        /// The writing task
        #[arg(trailing_var_arg = true, required = true)]
        task: Vec<String>,
    },
    /// Show the status of a durable run
    Status {
        #[arg(long)]
        run_id: String,
    },
    /// List the recorded units of a durable run
    Units {
        #[arg(long)]
        run_id: String,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("redraft=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Status { run_id } => {
            let store = open_store(&config)?;
            match store.run_info(&run_id)? {
                Some(info) => {
                    println!("run:     {}", info.run_id);
                    println!("status:  {}", info.status);
                    println!("created: {}", info.created_at);
                    println!("updated: {}", info.updated_at);
                    if let Some(err) = info.last_error {
                        println!("error:   {}", err);
                    }
                }
                None => anyhow::bail!("no durable run with id '{}'", run_id),
            }
        }
        Commands::Units { run_id } => {
            let store = open_store(&config)?;
            if store.run_info(&run_id)?.is_none() {
                anyhow::bail!("no durable run with id '{}'", run_id);
            }
            for unit_id in store.completed_units(&run_id)? {
                if let Some(record) = store.fetch_unit(&run_id, &unit_id)? {
                    println!(
                        "{:>5}  {}  attempts={}  recorded={}",
                        record.step, record.unit_id, record.attempts, record.recorded_at
                    );
                }
            }
        }
        Commands::Run {
            max_revisions,
            task,
        } => {
            let input = run_input(&config, task, max_revisions);
            let services = create_services(&config)?;
            let options = GraphOptions::from_config(&config, config.workflow.critique_loop);
            let runtime = Arc::new(build_writer_graph(options)?);

            let event_bus = Arc::new(EventBus::default());
            let run_id = RunId::new();
            let cancel = shutdown_token();
            let logger = spawn_logger(&config, &event_bus, &run_id);

            let executor = GraphExecutor::new(runtime).with_event_bus(event_bus);
            let result = executor
                .run(run_id.clone(), input, &services, Some(&cancel))
                .await;
            // Closing the bus lets the logger drain and stop
            drop(executor);
            if let Some(handle) = logger {
                handle.await.ok();
            }

            match result {
                Ok(result) => {
                    info!(
                        run_id = %run_id,
                        steps = result.steps.len(),
                        elapsed_ms = result.total_elapsed_ms,
                        "Run complete"
                    );
                    println!("{}", result.state.draft);
                }
                Err(failure) => {
                    warn!(run_id = %run_id, trace = ?failure.trace, "Run stopped");
                    return Err(failure.into());
                }
            }
        }
        Commands::Durable {
            run_id,
            max_revisions,
            critique_loop,
            task,
        } => {
            let input = run_input(&config, task, max_revisions);
            let services = create_services(&config)?;
            let critique_loop = critique_loop || config.durable.critique_loop;
            let options = GraphOptions::from_config(&config, critique_loop);
            let runtime = Arc::new(build_writer_graph(options)?);

            let run_id = run_id.map(|id| RunId::from_str(&id)).unwrap_or_default();
            let event_bus = Arc::new(EventBus::default());
            let cancel = shutdown_token();
            let logger = spawn_logger(&config, &event_bus, &run_id);

            let runner = DurableRunner::new(runtime, open_store(&config)?)
                .with_policies(UnitPolicies::from_config(&config.durable))
                .with_event_bus(event_bus);
            info!(run_id = %run_id, "Dispatching durable run");
            let result = runner.run(&run_id, input, &services, &cancel).await;
            drop(runner);
            if let Some(handle) = logger {
                handle.await.ok();
            }

            let outcome = result?;
            eprintln!(
                "run {}{}: {} units executed, {} replayed",
                outcome.run_id,
                if outcome.resumed { " (resumed)" } else { "" },
                outcome.executed_units.len(),
                outcome.replayed_units.len()
            );
            println!("{}", outcome.draft);
        }
    }

    Ok(())
}

/// Load the given config file, falling back to ~/.redraft/config.toml and
/// then to an OpenAI config built from the environment.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".redraft").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    eprintln!("Warning: No config file found. Using OPENAI_API_KEY and TAVILY_API_KEY from the environment.");
    create_env_config()
}

fn create_env_config() -> anyhow::Result<AppConfig> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| anyhow::anyhow!("No config file found and OPENAI_API_KEY is not set"))?;
    let model_id = std::env::var("REDRAFT_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());

    let mut config: AppConfig = toml::from_str("[model]\nmodel_id = \"\"\n")?;
    config.model.model_id = model_id;
    config.model.api_key = Some(api_key);
    config.validate()?;
    Ok(config)
}

fn run_input(config: &AppConfig, task: Vec<String>, max_revisions: Option<u32>) -> RunInput {
    RunInput::new(
        task.join(" "),
        max_revisions.unwrap_or(config.workflow.max_revisions),
    )
    .with_revision_number(config.workflow.revision_number)
}

fn create_services(config: &AppConfig) -> anyhow::Result<Services> {
    let generation = redraft_llm::create_retrying_client(config)?;
    let search = redraft_search::create_search(&config.search)?;
    Ok(Services::new(Arc::new(generation), Arc::from(search)))
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn UnitStore>> {
    let path = config.durable_store_path();
    Ok(Arc::new(SqliteUnitStore::open(&path)?))
}

fn spawn_logger(
    config: &AppConfig,
    event_bus: &EventBus,
    run_id: &RunId,
) -> Option<tokio::task::JoinHandle<Option<PathBuf>>> {
    let log_dir = config.log_dir()?;
    let level = config.log.as_ref().map(|l| l.level).unwrap_or(2);
    Some(RunLogger::new(log_dir, level).spawn(event_bus, run_id.clone()))
}

/// Token cancelled on Ctrl-C. Runs stop at the next node boundary.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling run...");
        cancel_clone.cancel();
    });
    cancel
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
