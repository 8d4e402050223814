//! Orchestrator CLI: `orchestrator serve --socket <path> --listen <addr>
//! --max-concurrent <n> --max-depth <n>`.
//!
//! Exit codes: 0 normal shutdown, 1 configuration error, 2 bind error,
//! 3 fatal runtime error.

mod logging;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mcp::{Orchestrator, OrchestratorConfig};

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;
const EXIT_FATAL: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "orchestrator")]
#[command(about = "Cartrita MCP orchestrator — tier-0 gateway and message fabric")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the agent socket and the HTTP/WebSocket ingress.
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Unix socket agents connect to.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// HTTP/WebSocket ingress address.
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Cap on parallel requests.
    #[arg(long, value_name = "N")]
    max_concurrent: Option<usize>,

    /// Cap on supervisor delegation depth.
    #[arg(long, value_name = "N")]
    max_depth: Option<u32>,
}

fn main() {
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let args = Args::parse();
    logging::init();

    if let Err(e) = config::load_and_apply(None) {
        eprintln!("config error: {e}");
        return EXIT_CONFIG;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime error: {e}");
            return EXIT_FATAL;
        }
    };

    match args.cmd {
        Command::Serve(serve_args) => runtime.block_on(run_serve(serve_args)),
    }
}

async fn run_serve(args: ServeArgs) -> i32 {
    let mut cfg = match OrchestratorConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e}");
            return EXIT_CONFIG;
        }
    };
    if let Some(socket) = args.socket {
        cfg.socket_path = socket;
    }
    if let Some(listen) = args.listen {
        cfg.listen_addr = listen;
    }
    if let Some(n) = args.max_concurrent {
        cfg.max_concurrent = n;
    }
    if let Some(n) = args.max_depth {
        cfg.max_depth = n;
    }

    let listen_addr = cfg.listen_addr;
    let orchestrator = Orchestrator::new(cfg);

    let background = match orchestrator.start().await {
        Ok(handles) => handles,
        Err(e) => {
            eprintln!("bind error: {e}");
            return EXIT_BIND;
        }
    };

    let ingress = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { serve::serve(orchestrator, listen_addr).await })
    };

    let code = tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                tracing::info!("shutdown signal received");
                EXIT_OK
            }
            Err(e) => {
                tracing::error!(error = %e, "signal handler failed");
                EXIT_FATAL
            }
        },
        served = ingress => match served {
            Ok(Ok(())) => EXIT_OK,
            Ok(Err(e @ serve::ServeError::Bind { .. })) => {
                eprintln!("bind error: {e}");
                EXIT_BIND
            }
            Ok(Err(e)) => {
                eprintln!("fatal: {e}");
                EXIT_FATAL
            }
            Err(e) => {
                eprintln!("fatal: ingress task panicked: {e}");
                EXIT_FATAL
            }
        },
    };

    orchestrator.shutdown();
    for handle in background {
        handle.abort();
    }
    code
}
