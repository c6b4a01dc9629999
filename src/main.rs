//! qtlflow CLI: a make-style runner for QTL analysis pipelines.

use clap::{CommandFactory, Parser};
use qtlflow::cli::Commands;
use qtlflow::transport::{signal, CancelToken};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "qtlflow",
    version,
    about = "QTL analysis pipelines — declared tasks, file-timestamp freshness, SQLite result loading"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("qtlflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "qtlflow", &mut std::io::stdout());
        return;
    }

    let cancel = CancelToken::new();
    if let Err(e) = signal::install(cancel.clone()) {
        tracing::warn!("signals will not stop running tools: {e}");
    }

    if let Err(e) = qtlflow::cli::dispatch(cli.command, &cancel) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
