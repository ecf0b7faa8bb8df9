use clap::Parser;

/// Sample stream inspector
#[derive(Debug, Parser)]
pub struct Args {
    /// SOURCE node address to attach to
    pub address: String,

    /// Log every n-th observed sample
    #[arg(short, default_value_t = 100)]
    pub log_every: u64,
}
