use crate::logging::LogFormat;
use clap::Args;
use std::path::PathBuf;

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Plan file to execute (YAML, or JSON by extension)
    #[arg(value_name = "PLAN")]
    pub plan: PathBuf,

    /// Directory holding conveyor.toml and the default run/action roots (defaults to current directory)
    #[arg(long, value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    /// Console rendering of engine events
    #[arg(long, value_name = "FORMAT", value_parser = parse_log_format)]
    pub log_format: Option<LogFormat>,

    /// Leave sandboxes in place when the run ends
    #[arg(long)]
    pub keep_sandboxes: bool,
}

#[derive(Args, Clone, Debug)]
pub struct ValidateArgs {
    /// Plan file to load and check
    #[arg(value_name = "PLAN")]
    pub plan: PathBuf,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}
