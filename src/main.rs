mod args;
mod audio;
mod builder;
mod cache;
mod config;
mod error;
mod events;
mod export;
mod index;
mod lang;
mod llm;
mod manifest;
mod narration;
mod narration_core;
mod outline;
mod paths;
mod postprocess;
mod prompts;
mod subtitle;
mod tts;

use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use crate::args::{Cli, Command};
use crate::config::AppConfig;
use crate::error::exit_code_for;
use crate::events::{Event, emit};

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    let app = AppConfig::load(cli.config.as_deref())?;
    debug!("configuration: {:?}", app);
    match &cli.command {
        Command::Outline(args) => outline::run(args, &app).await,
        Command::Prompts(args) => prompts::run(args),
        Command::Narrate(args) => narration::run(args, &app).await,
        Command::Build(args) => builder::run(args, &app).await,
        Command::Postprocess(args) => postprocess::run(args, &app).await,
        Command::Tts(args) => tts::run(args, &app).await,
        Command::Export(args) => export::run(args),
        Command::Index(args) => index::run(args),
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = dispatch(&cli).await {
        let code = exit_code_for(&e);
        error!("{:#}", e);
        emit(Event::error(&code.to_string(), format!("{e:#}")));
        std::process::exit(code);
    }
}
