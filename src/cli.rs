use clap::{command, Parser, Subcommand};

// ///////////// //
// CLI interface //
// ///////////// //

/// flashforge2mqtt - A service that periodically polls FlashForge 3D printers for their job status and publishes these statuses to a MQTT server.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queries each configured printer once and dumps the parsed status to stdout.
    Dump,
}
