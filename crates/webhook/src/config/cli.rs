use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::serve::CheckConfigArgs;
use crate::config::serve::ServeArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the admission webhook server
    Serve(Box<ServeArgs>),
    /// Load the configuration documents and report what they contain
    #[command(name = "check-config")]
    CheckConfig(CheckConfigArgs),
}
