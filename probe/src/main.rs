use std::{
    process::exit,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use clap::Parser;
use tracing::{info, warn, Level};

pub mod cli;

use cli::Args;
use fabric::{
    component::{run_component, Component},
    record::{RecordSource, Tick},
    Error, NodeState,
};

/// Consumes numbered records from a node, checking sequence continuity
/// and reporting publish-to-observe latency.
struct Probe {
    name: String,
    address: String,
    source: Option<RecordSource<Tick>>,
    log_every: u64,
    seen: u64,
    last_seq: Option<u64>,
}

impl Probe {
    fn new(args: &Args) -> Self {
        Self {
            name: format!("probe[{}]", args.address),
            address: args.address.clone(),
            source: None,
            log_every: args.log_every.max(1),
            seen: 0,
            last_seq: None,
        }
    }
}

impl Component for Probe {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) -> Result<(), Error> {
        let mut source = RecordSource::touch(&self.address)?;
        source.connect()?;
        self.source = Some(source);
        Ok(())
    }

    fn process(&mut self) -> Result<NodeState, Error> {
        let source = self.source.as_mut().expect("connected");

        let tick = match source.read() {
            Ok(tick) => tick,
            Err(Error::EndOfStream) => return Ok(NodeState::End),
            Err(e) => return Err(e),
        };

        if let Some(prev) = self.last_seq {
            if tick.seq != prev + 1 {
                warn!(prev, seq = tick.seq, "sequence gap");
            }
        }
        self.last_seq = Some(tick.seq);
        self.seen += 1;

        if self.seen % self.log_every == 0 {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_micros() as u64;
            info!(
                seq = tick.seq,
                latency_us = now.saturating_sub(tick.micros),
                "sample"
            );
        }

        Ok(NodeState::Running)
    }
}

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

    let mut probe = Probe::new(&args);
    run_component(&mut probe, &stop)?;
    info!(observed = probe.seen, "probe done");

    Ok(())
}
