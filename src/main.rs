use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sandman::config::{LogFormat, LoggingConfig};

mod commands;

#[derive(Parser)]
#[command(name = "sandman")]
#[command(author, version, about = "Sandbox orchestration through a manager container")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: ./sandman.toml, then the user config dir)
    #[arg(long, global = true, env = "SANDMAN_CONFIG")]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List sandboxes
    List {
        /// Include stopped sandboxes
        #[arg(short, long)]
        all: bool,
    },

    /// Show one sandbox
    Show {
        /// Sandbox id
        id: String,
    },

    /// Count running and stopped sandboxes
    Stats,

    /// List sandbox types from the templates directory
    Types {
        /// Templates directory (overrides config)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Run a shell command inside a sandbox
    Exec {
        /// Sandbox id
        id: String,

        /// Command to run
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,

        /// User inside the sandbox
        #[arg(short, long)]
        user: Option<String>,

        /// Timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Create a sandbox
    Create {
        /// Sandbox type
        #[arg(short = 't', long = "type")]
        sandbox_type: Option<String>,

        /// Sandbox name (generated if omitted)
        #[arg(short, long)]
        name: Option<String>,

        /// Port to expose (repeatable)
        #[arg(short, long = "port")]
        ports: Vec<u16>,

        /// Track under this operation id
        #[arg(long)]
        operation_id: Option<String>,
    },

    /// Start a stopped sandbox
    Start {
        id: String,

        #[arg(long)]
        operation_id: Option<String>,
    },

    /// Stop a sandbox
    Stop {
        id: String,

        /// Seconds to wait before killing
        #[arg(short, long)]
        timeout: Option<u64>,

        #[arg(long)]
        operation_id: Option<String>,
    },

    /// Recreate a sandbox from a type
    Reset {
        id: String,

        #[arg(short = 't', long = "type")]
        sandbox_type: Option<String>,

        #[arg(long)]
        operation_id: Option<String>,
    },

    /// Destroy a sandbox
    Destroy {
        id: String,

        #[arg(long)]
        operation_id: Option<String>,
    },

    /// Remove all sandboxes
    Cleanup {
        #[arg(long)]
        operation_id: Option<String>,
    },

    /// Inspect tracked operations
    Ops {
        #[command(subcommand)]
        command: OpsCommands,
    },

    /// Run source code in a sandbox
    Run {
        /// Language id (python, javascript, ...)
        language: String,

        /// Code to run
        #[arg(short, long, conflicts_with = "file")]
        code: Option<String>,

        /// File containing the code to run
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Run in this existing sandbox instead of a throwaway one
        #[arg(short, long)]
        sandbox: Option<String>,

        /// Type for the throwaway sandbox
        #[arg(short = 't', long = "type")]
        sandbox_type: Option<String>,

        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Working directory inside the sandbox
        #[arg(short, long)]
        workdir: Option<String>,

        /// File to read back after the run (repeatable)
        #[arg(short, long = "output-file")]
        output_files: Vec<String>,

        /// Keep the throwaway sandbox afterwards
        #[arg(long)]
        keep: bool,
    },

    /// Create a named sandbox ready for a language
    Persist {
        language: String,

        /// Packages to install
        packages: Vec<String>,

        #[arg(short, long)]
        name: Option<String>,

        #[arg(short = 't', long = "type")]
        sandbox_type: Option<String>,

        #[arg(short, long)]
        workdir: Option<String>,
    },

    /// Install packages into a sandbox
    Install {
        id: String,
        language: String,

        #[arg(required = true)]
        packages: Vec<String>,
    },

    /// Report installed languages and tools
    Env { id: String },

    /// Copy a local file into a sandbox
    Upload {
        id: String,
        local: PathBuf,
        remote: String,
    },

    /// Copy a file out of a sandbox
    Download {
        id: String,
        remote: String,

        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum OpsCommands {
    /// Show one operation with its log
    Show { operation_id: String },

    /// List operations, newest first
    List,
}

fn init_logging(config: &LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("sandman=debug")
        } else {
            EnvFilter::new("sandman=info")
        }
    });

    let stderr_layer = match config.format {
        LogFormat::Pretty => fmt::layer().with_writer(std::io::stderr).boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map_or_else(|| "sandman.log".into(), |name| name.to_os_string());
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = commands::load_config(cli.config.as_deref())?;
    let guard = init_logging(&config.logging, cli.verbose);
    let ctx = commands::Context::new(config, cli.json);

    let exit_code = match cli.command {
        Commands::List { all } => commands::sandbox::list(&ctx, all).await.map(|()| 0)?,
        Commands::Show { id } => commands::sandbox::show(&ctx, &id).await.map(|()| 0)?,
        Commands::Stats => commands::sandbox::stats(&ctx).await.map(|()| 0)?,
        Commands::Types { dir } => commands::sandbox::types(&ctx, dir).map(|()| 0)?,
        Commands::Exec {
            id,
            command,
            user,
            timeout,
        } => {
            // A single word is passed through as a shell snippet; several are
            // re-quoted so each reaches the sandbox as one argument.
            let command = match command.as_slice() {
                [snippet] => snippet.clone(),
                words => shell_words::join(words),
            };
            commands::sandbox::exec(&ctx, &id, &command, user.as_deref(), timeout).await?
        }
        Commands::Create {
            sandbox_type,
            name,
            ports,
            operation_id,
        } => {
            commands::lifecycle::create(&ctx, sandbox_type.as_deref(), name.as_deref(), &ports, operation_id)
                .await?
        }
        Commands::Start { id, operation_id } => commands::lifecycle::start(&ctx, &id, operation_id).await?,
        Commands::Stop {
            id,
            timeout,
            operation_id,
        } => commands::lifecycle::stop(&ctx, &id, timeout, operation_id).await?,
        Commands::Reset {
            id,
            sandbox_type,
            operation_id,
        } => commands::lifecycle::reset(&ctx, &id, sandbox_type.as_deref(), operation_id).await?,
        Commands::Destroy { id, operation_id } => commands::lifecycle::destroy(&ctx, &id, operation_id).await?,
        Commands::Cleanup { operation_id } => commands::lifecycle::cleanup(&ctx, operation_id).await?,
        Commands::Ops { command } => match command {
            OpsCommands::Show { operation_id } => commands::ops::show(&ctx, &operation_id).map(|()| 0)?,
            OpsCommands::List => commands::ops::list(&ctx).map(|()| 0)?,
        },
        Commands::Run {
            language,
            code,
            file,
            sandbox,
            sandbox_type,
            timeout,
            workdir,
            output_files,
            keep,
        } => {
            let request = commands::code::RunRequest {
                language,
                code,
                file,
                sandbox,
                sandbox_type,
                timeout,
                working_dir: workdir,
                output_files,
                keep,
            };
            commands::code::run(&ctx, request).await?
        }
        Commands::Persist {
            language,
            packages,
            name,
            sandbox_type,
            workdir,
        } => commands::code::persist(&ctx, &language, &packages, name, sandbox_type, workdir).await?,
        Commands::Install { id, language, packages } => {
            commands::code::install(&ctx, &id, &language, &packages).await?
        }
        Commands::Env { id } => commands::code::env(&ctx, &id).await.map(|()| 0)?,
        Commands::Upload { id, local, remote } => {
            commands::code::upload(&ctx, &id, &local, &remote).await.map(|()| 0)?
        }
        Commands::Download { id, remote, output } => {
            commands::code::download(&ctx, &id, &remote, output.as_deref()).await.map(|()| 0)?
        }
    };

    if exit_code != 0 {
        drop(guard);
        std::process::exit(exit_code);
    }
    Ok(())
}
