use std::{
    process::exit,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use clap::Parser;
use tracing::{info, Level};

pub mod cli;

use cli::Args;
use fabric::{
    component::{run_component, Component},
    record::{RecordSink, Tick},
    Error, NodeState,
};

/// Publishes numbered records on a node at a fixed rate.
struct Emitter {
    name: String,
    address: String,
    sink: Option<RecordSink<Tick>>,
    period: Duration,
    remaining: Option<u64>,
    seq: u64,
}

impl Emitter {
    fn new(args: &Args) -> Self {
        Self {
            name: format!("emit[{}]", args.address),
            address: args.address.clone(),
            sink: None,
            period: Duration::from_secs(1) / args.rate.max(1),
            remaining: (args.count > 0).then_some(args.count),
            seq: 0,
        }
    }
}

impl Component for Emitter {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) -> Result<(), Error> {
        self.sink = Some(RecordSink::bind(&self.address)?);
        Ok(())
    }

    fn process(&mut self) -> Result<NodeState, Error> {
        if self.remaining == Some(0) {
            return Ok(NodeState::End);
        }

        let sink = self.sink.as_mut().expect("connected");
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_micros() as u64;
        sink.write(Tick {
            seq: self.seq,
            micros,
        })?;

        self.seq += 1;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }

        thread::sleep(self.period);
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

    let mut emitter = Emitter::new(&args);
    run_component(&mut emitter, &stop)?;
    info!(published = emitter.seq, "emit done");

    Ok(())
}
