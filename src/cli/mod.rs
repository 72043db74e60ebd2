use anyhow::Result;
use clap::{Parser, Subcommand};

pub mod chat;
pub mod history;
pub mod migrate;
pub mod serve;

use crate::core::AppConfig;

#[derive(Subcommand)]
enum Command {
    /// Migrate the db schema
    Migrate {},
    /// Run the API server and web UI
    Serve {
        /// Set the server host address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Set the server port
        #[arg(long, default_value = "2222")]
        port: String,
    },
    /// Start an interactive chat session
    Chat {
        /// Don't restore or save the conversation
        #[arg(long, action, default_value = "false")]
        ephemeral: bool,
    },
    /// Print the saved conversation
    History {
        /// Delete the saved conversation instead
        #[arg(long, action, default_value = "false")]
        clear: bool,
    },
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

pub async fn run() -> Result<()> {
    let args = Cli::parse();
    let config = AppConfig::default();

    // Handle each sub command
    match args.command {
        Some(Command::Migrate {}) => {
            migrate::run(&config.db_path).await?;
        }
        Some(Command::Serve { host, port }) => {
            serve::run(host, port, config).await?;
        }
        Some(Command::Chat { ephemeral }) => {
            chat::run(config, ephemeral).await?;
        }
        Some(Command::History { clear }) => {
            history::run(&config.db_path, clear).await?;
        }
        None => {}
    }

    Ok(())
}
