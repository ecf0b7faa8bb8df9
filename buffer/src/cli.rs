use clap::Parser;

/// Rate-decoupling FIFO between two nodes
#[derive(Debug, Parser)]
pub struct Args {
    /// SOURCE node address (upstream)
    pub source: String,

    /// SINK node address (downstream)
    pub sink: String,
}
