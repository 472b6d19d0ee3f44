mod commands;
mod demo;
mod runtime;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "meao",
    version,
    disable_version_flag = true,
    about = "Local AI agent with defense-in-depth tool execution"
)]
struct Cli {
    /// Print version
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Model override (e.g. claude-sonnet-4-5-20250929)
    #[arg(long, global = true)]
    model: Option<String>,

    /// Working directory for file and shell tools
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Manage a single session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// List stored sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
    /// Run canned end-to-end scenarios against a scripted model
    Demo {
        #[command(subcommand)]
        action: DemoAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Start an interactive session with a fresh conversation
    New,
    /// Resume a stored session by id
    Resume { id: String },
}

#[derive(Subcommand)]
enum SessionsAction {
    List,
}

#[derive(Subcommand)]
enum DemoAction {
    List,
    Show { name: String },
    Run { name: String },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Session {
            action: SessionAction::New,
        }) => commands::interactive(cli.model, cli.work_dir, None).await,
        Some(Command::Session {
            action: SessionAction::Resume { id },
        }) => commands::interactive(cli.model, cli.work_dir, Some(id)).await,
        Some(Command::Sessions {
            action: SessionsAction::List,
        }) => commands::list_sessions().await,
        Some(Command::Demo { action }) => match action {
            DemoAction::List => demo::list(),
            DemoAction::Show { name } => demo::show(&name),
            DemoAction::Run { name } => demo::run(&name, cli.work_dir).await,
        },
    }
}
