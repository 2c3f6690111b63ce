use clap::Parser;

use ferry::cli::{self, Cli, Command};
use ferry::logging::{init_logging, LogConfig, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = if std::env::var("FERRY_LOG_JSON").is_ok() {
        LogConfig {
            format: LogFormat::Json,
            ..LogConfig::default()
        }
    } else {
        LogConfig::default()
    };
    init_logging(log_config);

    match cli.command {
        // No subcommand or explicit `serve` both launch the server.
        None => cli::handle_serve(None).await,
        Some(Command::Serve { bind }) => cli::handle_serve(bind).await,

        Some(Command::Agent {
            server,
            token,
            api_key,
            files_dir,
        }) => cli::handle_agent(server, token, api_key, files_dir).await,

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}
