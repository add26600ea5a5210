//! Agent Client CLI - chat with ACP coding agents from the terminal
//!
//! The CLI is a thin view over agent-client-core: it owns one session
//! controller, renders its snapshots and maps REPL commands onto controller
//! commands.

mod render;
mod repl;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use console::style;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use agent_client_core::config::ConfigManager;
use agent_client_core::history::{AgentHistorySource, HistoryFilter, SessionHistoryManager};
use agent_client_core::session::{SessionHistoryEntry, SessionStore};
use agent_client_core::AcpAdapterFactory;

#[derive(Parser)]
#[command(name = "agent-client")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Chat with ACP coding agents from the terminal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Settings file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat mode
    Chat {
        /// Agent to connect to (defaults to the configured default agent)
        #[arg(short, long)]
        agent: Option<String>,

        /// Working directory the agent operates in
        #[arg(long, default_value = ".")]
        cwd: PathBuf,
    },

    /// List configured agents
    Agents,

    /// Show the first page of session history
    Sessions {
        #[arg(short, long)]
        agent: Option<String>,

        /// Include sessions from every working directory
        #[arg(long)]
        all_dirs: bool,

        /// Only sessions saved on this machine; does not start the agent
        #[arg(long)]
        local_only: bool,

        #[arg(long, default_value = ".")]
        cwd: PathBuf,
    },

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone())?,
        None => ConfigManager::new()?,
    };
    let verbose = cli.verbose || config_manager.config().debug_mode;

    // Interactive chat logs to a file so the prompt stays readable
    let interactive = matches!(cli.command, None | Some(Commands::Chat { .. }));
    let _log_guard = init_logging(verbose, interactive);

    match cli.command {
        Some(Commands::Chat { agent, cwd }) => {
            repl::run_chat(config_manager, agent, &resolve_dir(&cwd)).await?
        }
        Some(Commands::Agents) => show_agents(&config_manager),
        Some(Commands::Sessions {
            agent,
            all_dirs,
            local_only,
            cwd,
        }) => show_sessions(&config_manager, agent, all_dirs, local_only, &resolve_dir(&cwd)).await?,
        Some(Commands::Config) => show_config(&config_manager)?,
        None => repl::run_chat(config_manager, None, &resolve_dir(Path::new("."))).await?,
    }

    Ok(())
}

/// Setup logging: `warn` by default, debug for this workspace's crates when verbose
fn init_logging(verbose: bool, to_file: bool) -> Option<WorkerGuard> {
    let default_filter = if verbose {
        "info,agent_client_core=debug,agent_client_acp=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let log_dir = directories::ProjectDirs::from("com", "agent-client", "agent-client")
        .map(|dirs| dirs.data_dir().join("logs"));

    match (to_file, log_dir) {
        (true, Some(dir)) => {
            let appender = tracing_appender::rolling::daily(dir, "agent-client.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

/// Absolute form of a user-supplied directory
fn resolve_dir(dir: &Path) -> PathBuf {
    // dunce avoids the UNC prefix on Windows (\\?\)
    dunce::canonicalize(dir).unwrap_or_else(|_| {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(dir))
                .unwrap_or_else(|_| dir.to_path_buf())
        }
    })
}

fn show_agents(config_manager: &ConfigManager) {
    let settings = config_manager.config();
    println!("{}", style("Configured Agents:").bold());
    println!();

    for agent in settings.agents() {
        let marker = if agent.id == settings.default_agent_id {
            style("*").green().bold()
        } else {
            style(" ")
        };
        println!(
            "  {} {} {}",
            marker,
            style(&agent.id).cyan(),
            style(format!("({})", agent.display_name)).dim()
        );
        let command = std::iter::once(agent.command.as_str())
            .chain(agent.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        println!("      {}", style(command).dim());
    }
}

pub(crate) fn print_history(entries: &[SessionHistoryEntry]) {
    if entries.is_empty() {
        println!("  {}", style("No sessions found").dim());
        return;
    }
    for entry in entries {
        let updated = entry
            .updated_at
            .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let local = if entry.has_local_data {
            style("local").green()
        } else {
            style("agent").dim()
        };
        println!(
            "  {}  {}  {}  {}",
            style(&entry.session_id).cyan(),
            style(updated).dim(),
            local,
            entry.title.as_deref().unwrap_or("(untitled)")
        );
    }
}

async fn show_sessions(
    config_manager: &ConfigManager,
    agent: Option<String>,
    all_dirs: bool,
    local_only: bool,
    cwd: &Path,
) -> anyhow::Result<()> {
    let settings = config_manager.config().clone();
    let agent_id = agent.unwrap_or_else(|| settings.default_agent_id.clone());
    let store = Arc::new(SessionStore::open_default()?);

    println!("{}", style(format!("Sessions for {}:", agent_id)).bold());
    println!();

    if local_only {
        let entries: Vec<_> = store
            .list()?
            .into_iter()
            .filter(|e| e.agent_id == agent_id)
            .filter(|e| all_dirs || e.working_directory == cwd)
            .collect();
        print_history(&entries);
        return Ok(());
    }

    let source = Arc::new(AgentHistorySource::new(
        Arc::new(AcpAdapterFactory::default()),
        settings,
        Some(store),
        cwd,
    ));
    let history = SessionHistoryManager::new(source.clone());
    let filter = HistoryFilter {
        current_vault_only: !all_dirs,
        hide_without_local_data: false,
    };

    let result = history.list_sessions(&agent_id, filter).await;
    source.disconnect_all().await;
    let listing = result?;

    print_history(&listing.entries);
    if listing.has_more() {
        println!();
        println!("  {}", style("More sessions available; use /more in chat").dim());
    }
    Ok(())
}

fn show_config(config_manager: &ConfigManager) -> anyhow::Result<()> {
    println!("{}", style("Configuration:").bold());
    println!();
    println!("  Config file: {}", style(config_manager.path().display()).green());
    println!(
        "  Sessions dir: {}",
        style(
            SessionStore::default_dir()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|_| "N/A".to_string())
        )
        .dim()
    );
    println!();
    println!("{}", toml::to_string_pretty(config_manager.config())?);
    Ok(())
}
