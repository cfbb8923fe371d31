use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "inbox-pipeline")]
#[command(about = "Watch an inbox directory and run an external conversion tool on every arriving file")]
#[command(version)]
pub struct Cli {
    /// Path to the JSON settings file
    #[arg(short, long, default_value = "appsettings.json")]
    pub config: PathBuf,
}
