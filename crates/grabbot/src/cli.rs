use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "grabbot")]
#[command(author, version, about = "Telegram bot that downloads videos or extracts audio at a chosen quality", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Run the bot (long polling)
    Run,

    /// Empty the temp directory and exit
    PurgeTemp,

    /// Resolve a URL and print the selectable formats
    Info {
        /// Media page URL
        url: String,

        /// Print the raw format list as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
