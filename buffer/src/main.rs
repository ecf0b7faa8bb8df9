use std::{
    process::exit,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use tracing::Level;

pub mod buffer;
pub mod cli;

use buffer::Buffer;
use cli::Args;
use fabric::component::run_component;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let stop = Arc::new(AtomicBool::new(false));
    let s = stop.clone();
    ctrlc::set_handler(move || {
        if s.swap(true, Ordering::Relaxed) {
            eprintln!("Killing");
            exit(1);
        } else {
            eprintln!("CTRL-C received, terminating (press again to kill)");
        }
    })?;

    let mut buffer = Buffer::new(&args.source, &args.sink);
    run_component(&mut buffer, &stop)?;

    Ok(())
}
