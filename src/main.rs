//! lancast - cast local video to any device on the LAN
//!
//! # Usage
//!
//! ```bash
//! lancast profile
//! lancast cast movie.mkv --subtitle movie.en.srt
//! lancast stop
//! ```

use clap::Parser;

use lancast::cli::{Cli, Command, ExitCode, Output};
use lancast::{commands, logging};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet);

    run_cli(cli).await.into()
}

/// Run CLI command and return exit code
async fn run_cli(cli: Cli) -> ExitCode {
    let output = Output::new(&cli);
    let config = cli.load_config();

    match cli.command {
        Command::Profile(cmd) => commands::profile_cmd(cmd, config, &output).await,
        Command::Cast(cmd) => commands::cast_cmd(cmd, config, &output).await,
        Command::Stop(cmd) => commands::stop_cmd(cmd, config, &output).await,
        Command::Serve(cmd) => commands::serve_cmd(cmd, &output).await,
    }
}
