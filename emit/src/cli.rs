use clap::Parser;

/// Test sample generator
#[derive(Debug, Parser)]
pub struct Args {
    /// SINK node address to publish on
    pub address: String,

    /// Number of samples to publish
    ///
    /// Set to 0 to publish until interrupted
    #[arg(short, default_value_t = 1000)]
    pub count: u64,

    /// Publication rate in samples per second
    #[arg(short, default_value_t = 100)]
    pub rate: u32,
}
