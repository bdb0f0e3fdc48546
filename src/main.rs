use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use vigil::cmd;
use vigil::config::KernelConfig;
use vigil::kernel::Kernel;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(version, about = "Autonomous security-assessment orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub yes: bool,

    /// Session id for developer commands; defaults to the latest session.
    #[arg(long, global = true)]
    pub session: Option<String>,

    /// Process root holding the session store and audit logs.
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Print reconciled session status.
    #[arg(long)]
    pub status: bool,

    /// Run a single phase of an existing session.
    #[arg(long, value_name = "PHASE")]
    pub run_phase: Option<String>,

    /// Re-run a single agent, clearing its previous completion.
    #[arg(long, value_name = "AGENT")]
    pub rerun: Option<String>,

    /// Run everything still outstanding in an existing session.
    #[arg(long)]
    pub run_all: bool,

    /// Roll the workspace back to an agent's checkpoint.
    #[arg(long, value_name = "AGENT")]
    pub rollback_to: Option<String>,

    /// List every agent across all pipelines.
    #[arg(long)]
    pub list_agents: bool,

    /// Delete one session by id, or all sessions when no id is given.
    #[arg(long, value_name = "SESSION", num_args = 0..=1, default_missing_value = "")]
    pub cleanup: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full assessment pipeline against a web target.
    Run {
        /// Target URL.
        target: String,
        /// Workspace directory (a clone or snapshot of the source tree).
        workspace: PathBuf,
        /// Declarative target profile with authentication and rule hints.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Skip the startup banner.
        #[arg(long)]
        disable_loader: bool,
        /// Create and reconcile the session, then exit.
        #[arg(long)]
        setup_only: bool,
    },
    /// Run the standalone reverse-engineering pipeline over a binary.
    Re {
        binary: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        setup_only: bool,
    },
    /// Run the standalone open-source-vulnerability pipeline over a repo.
    Osv {
        repository: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        setup_only: bool,
    },
}

fn init_tracing(
    verbose: bool,
    log_dir: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = if verbose { "vigil=debug" } else { "vigil=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    match log_dir {
        Some(dir) => {
            let _ = std::fs::create_dir_all(dir);
            let appender = tracing_appender::rolling::never(dir, "console.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let root = cli
        .root
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let config = match KernelConfig::from_env() {
        Ok(mut config) => {
            config.debug |= cli.verbose;
            config
        }
        Err(e) => {
            eprintln!("Configuration error [kind: config, retryable: false]: {e}");
            return ExitCode::from(1);
        }
    };

    // Pipeline commands also log to console.log under the audit-logs
    // root; everything else logs to stderr only.
    let log_dir = cli.command.is_some().then(|| root.join("audit-logs"));
    let _guard = init_tracing(cli.verbose || config.debug, log_dir.as_deref());

    let kernel = match Kernel::new(&root, config) {
        Ok(kernel) => Arc::new(kernel),
        Err(e) => {
            eprintln!("{}", e.display_with_kind());
            return ExitCode::from(1);
        }
    };

    match dispatch(cli, kernel).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.display_with_kind());
            ExitCode::from(1)
        }
    }
}

async fn dispatch(cli: Cli, kernel: Arc<Kernel>) -> Result<u8, vigil::errors::KernelError> {
    if let Some(command) = cli.command {
        let code = match command {
            Commands::Run {
                target,
                workspace,
                config,
                disable_loader,
                setup_only,
            } => {
                let options = cmd::RunOptions {
                    config_path: config,
                    setup_only,
                    disable_loader,
                };
                cmd::cmd_run(kernel, &target, &workspace, options).await?
            }
            Commands::Re {
                binary,
                config,
                setup_only,
            } => {
                let options = cmd::RunOptions {
                    config_path: config,
                    setup_only,
                    disable_loader: false,
                };
                cmd::cmd_re(kernel, &binary, options).await?
            }
            Commands::Osv {
                repository,
                config,
                setup_only,
            } => {
                let options = cmd::RunOptions {
                    config_path: config,
                    setup_only,
                    disable_loader: false,
                };
                cmd::cmd_osv(kernel, &repository, options).await?
            }
        };
        return Ok(code as u8);
    }

    if cli.list_agents {
        cmd::cmd_list_agents();
        return Ok(0);
    }
    if cli.status {
        cmd::cmd_status(&kernel, cli.session.as_deref()).await?;
        return Ok(0);
    }
    if let Some(phase) = cli.run_phase {
        cmd::cmd_run_phase(kernel, &phase, cli.session.as_deref()).await?;
        return Ok(0);
    }
    if let Some(agent) = cli.rerun {
        cmd::cmd_rerun(kernel, &agent, cli.session.as_deref()).await?;
        return Ok(0);
    }
    if cli.run_all {
        cmd::cmd_run_all(kernel, cli.session.as_deref()).await?;
        return Ok(0);
    }
    if let Some(agent) = cli.rollback_to {
        cmd::cmd_rollback_to(kernel, &agent, cli.session.as_deref()).await?;
        return Ok(0);
    }
    if let Some(id) = cli.cleanup {
        let target = (!id.is_empty()).then_some(id);
        cmd::cmd_cleanup(&kernel, target.as_deref(), cli.yes).await?;
        return Ok(0);
    }

    eprintln!("No command given; try 'vigil run <target> <workspace>' or --help.");
    Ok(1)
}
