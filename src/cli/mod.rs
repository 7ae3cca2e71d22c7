pub mod args;
pub mod commands;

pub use args::{RunArgs, ValidateArgs};
use clap::{Parser, Subcommand};

const HELP_TEMPLATE: &str = "\
{name} {version}\n\
{about-with-newline}\n\
USAGE:\n    {usage}\n\
\nOPTIONS:\n{options}\n\
COMMANDS:\n{subcommands}\n";

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(version = crate::VERSION)]
#[command(about = "Level-parallel CI workflow execution engine")]
#[command(help_template = HELP_TEMPLATE)]
#[command(
    after_long_help = "Exit codes: 0 when every job succeeded, 1 on any job failure, 130 when cancelled."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[command(
        about = "Execute a plan",
        long_about = "Run executes every level of the plan in order, jobs within a level concurrently, and prints a per-job status table.",
        after_help = "Example:\n    conveyor run plan.yaml --log-format json"
    )]
    Run(RunArgs),
    #[command(
        about = "Check a plan without running it",
        long_about = "Validate parses the plan and checks job names, retry policies and artifact hand-offs between levels.",
        after_help = "Example:\n    conveyor validate plan.yaml"
    )]
    Validate(ValidateArgs),
}

/// Dispatch a parsed command and return the process exit code.
pub async fn run(args: Args) -> crate::Result<i32> {
    match args.command {
        Command::Run(run_args) => commands::run(run_args).await,
        Command::Validate(validate_args) => commands::validate(validate_args).await,
    }
}
