use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
pub struct MainArgs {
    /// The path to the config file for the bot
    #[clap(long, short)]
    pub config: PathBuf,
}
