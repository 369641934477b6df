//! localexec - run code submitted over a loopback WebSocket.
//!
//! Usage:
//!   localexec serve [--port 4001] [--trust TOKEN]...   # Start the server
//!   localexec submit --language python --file a.py      # Send one request
//!   localexec toolchains                                # Check installed toolchains

use clap::{Parser, Subcommand};
use localexec::client::{self, SubmitOptions};
use localexec::config::{default_workspace_root, ServerConfig, DEFAULT_DEADLINE_SECS, DEFAULT_PORT};
use localexec::languages::HandlerRegistry;
use localexec::process::probe_handler;
use localexec::state::AppState;
use localexec::trust::run_console_operator;
use localexec::ws_server;
use std::io::Read;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "localexec")]
#[command(about = "Loopback code execution server")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the WebSocket server
    Serve {
        /// Loopback address to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,

        /// Port to listen on
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Directory under which per-run workspaces are created
        #[arg(long)]
        workspace_root: Option<PathBuf>,

        /// Wall-clock limit for build + run, in seconds
        #[arg(long, default_value_t = DEFAULT_DEADLINE_SECS)]
        timeout_secs: u64,

        /// Client token to trust without prompting (repeatable)
        #[arg(long = "trust")]
        trusted: Vec<String>,
    },

    /// Submit code to a running server and print its output
    Submit {
        /// Language id (bash, python, javascript, java, c, cpp)
        #[arg(long, short)]
        language: String,

        /// Source file; reads stdin when omitted
        #[arg(long, short)]
        file: Option<PathBuf>,

        #[arg(long, default_value_t = format!("ws://127.0.0.1:{DEFAULT_PORT}"))]
        url: String,

        /// Client token; a fresh one is generated when omitted
        #[arg(long)]
        token: Option<String>,

        /// Run inside this existing directory instead of a throwaway one
        #[arg(long)]
        custom_dir: Option<PathBuf>,

        /// Extra arguments for the program, whitespace separated
        #[arg(long, allow_hyphen_values = true)]
        run_args: Option<String>,

        /// Extra arguments for the compiler, whitespace separated
        #[arg(long, allow_hyphen_values = true)]
        comp_args: Option<String>,
    },

    /// Report which language toolchains are installed
    Toolchains,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let code = match args.command {
        Commands::Serve {
            host,
            port,
            workspace_root,
            timeout_secs,
            trusted,
        } => {
            let config = ServerConfig {
                host,
                port,
                workspace_root: workspace_root.unwrap_or_else(default_workspace_root),
                deadline: Duration::from_secs(timeout_secs),
                trusted_tokens: trusted,
            };
            serve(config).await
        }
        Commands::Submit {
            language,
            file,
            url,
            token,
            custom_dir,
            run_args,
            comp_args,
        } => {
            let code = match read_source(file) {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            };
            let options = SubmitOptions {
                url,
                language,
                code,
                token: token.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                custom_dir,
                run_args,
                comp_args,
            };
            submit(options).await
        }
        Commands::Toolchains => toolchains().await,
    };
    exit(code);
}

async fn serve(config: ServerConfig) -> i32 {
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return 2;
    }

    let (state, approvals) = AppState::new(config, HandlerRegistry::builtin());
    tokio::spawn(run_console_operator(approvals));

    match ws_server::run_server(state).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "Server stopped");
            1
        }
    }
}

async fn submit(options: SubmitOptions) -> i32 {
    let mut out = std::io::stdout();
    let mut err = std::io::stderr();
    match client::submit(&options, &mut out, &mut err).await {
        Ok(outcome) if outcome.is_success() => 0,
        Ok(client::Outcome::Incomplete) => {
            eprintln!("Error: connection closed before the run finished");
            1
        }
        Ok(_) => 1,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn toolchains() -> i32 {
    let registry = HandlerRegistry::builtin();
    let mut missing = 0;
    for handler in registry.handlers() {
        match probe_handler(handler.as_ref()).await {
            Ok(version) => println!("{:<12} ok       {}", handler.language(), version),
            Err(e) => {
                missing += 1;
                println!("{:<12} missing  {}", handler.language(), e);
            }
        }
    }
    if missing == 0 {
        0
    } else {
        1
    }
}

fn read_source(file: Option<PathBuf>) -> std::io::Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path),
        None => {
            let mut code = String::new();
            std::io::stdin().read_to_string(&mut code)?;
            Ok(code)
        }
    }
}
