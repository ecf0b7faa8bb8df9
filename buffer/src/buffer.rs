use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, warn};

use fabric::{component::Component, Error, NodeState, Sink, Source};

/// Bounded FIFO capacity. Once full, the oldest queued sample is dropped
/// to make room (an overrun).
pub const CAPACITY: usize = 1000;

/// Interval at which the drain thread re-checks the FIFO even without a
/// wakeup.
const DRAIN_TICK: Duration = Duration::from_millis(10);

/// The in-process queue shared between the reader (upstream source) and
/// the drain thread (downstream sink).
struct Fifo {
    queue: Mutex<FifoState>,
    available: Condvar,
}

struct FifoState {
    samples: VecDeque<Vec<u8>>,
    finished: bool,
    overruns: u64,
}

impl Fifo {
    fn new() -> Self {
        Self {
            queue: Mutex::new(FifoState {
                samples: VecDeque::with_capacity(CAPACITY),
                finished: false,
                overruns: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueues one sample, dropping the oldest on overrun.
    fn push(&self, sample: Vec<u8>) {
        let mut state = self.queue.lock().unwrap();
        if state.samples.len() == CAPACITY {
            state.samples.pop_front();
            state.overruns += 1;
            warn!(overruns = state.overruns, "buffer overrun, dropping oldest sample");
        }
        state.samples.push_back(sample);
        drop(state);
        self.available.notify_one();
    }

    /// Marks the upstream finished; the drain thread ends the downstream
    /// stream once the queue is empty.
    fn finish(&self) {
        self.queue.lock().unwrap().finished = true;
        self.available.notify_one();
    }
}

/// Couples a source on one node to a sink on another through the bounded
/// FIFO, absorbing producer/consumer rate mismatch. Every other
/// source/sink pair in a pipeline runs lock-step; this is the one place
/// where timing decouples.
pub struct Buffer {
    name: String,
    source_address: String,
    sink_address: String,
    source: Option<Source>,
    fifo: Arc<Fifo>,
    drain: Option<JoinHandle<Result<(), Error>>>,
}

impl Buffer {
    pub fn new(source_address: &str, sink_address: &str) -> Self {
        Self {
            name: format!("buffer[{source_address}->{sink_address}]"),
            source_address: source_address.to_owned(),
            sink_address: sink_address.to_owned(),
            source: None,
            fifo: Arc::new(Fifo::new()),
            drain: None,
        }
    }

    fn join_drain(&mut self) -> Result<(), Error> {
        if let Some(handle) = self.drain.take() {
            handle.join().expect("drain thread panicked")?;
        }
        Ok(())
    }
}

impl Component for Buffer {
    fn name(&self) -> &str {
        &self.name
    }

    /// The downstream slot mirrors the upstream descriptor, so the source
    /// is connected first; the drain thread then binds the sink.
    fn connect(&mut self) -> Result<(), Error> {
        let mut source = Source::touch(&self.source_address)?;
        source.connect()?;
        let descriptor = source.parameters();

        let fifo = self.fifo.clone();
        let address = self.sink_address.clone();
        self.drain = Some(thread::spawn(move || drain(&fifo, &address, descriptor)));

        self.source = Some(source);
        Ok(())
    }

    fn process(&mut self) -> Result<NodeState, Error> {
        let source = self.source.as_mut().expect("connected");

        if source.wait()? == NodeState::End {
            self.fifo.finish();
            self.join_drain()?;
            return Ok(NodeState::End);
        }

        // Clone the sample out of the slot and release it immediately;
        // the upstream writer never waits on the downstream consumer.
        self.fifo.push(source.retrieve().to_vec());
        source.post()?;

        Ok(NodeState::Running)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.fifo.finish();
        if let Some(handle) = self.drain.take() {
            let _ = handle.join();
        }
    }
}

/// Drain thread body: owns the downstream sink for its whole life and
/// republishes queued samples in arrival order.
fn drain(
    fifo: &Fifo,
    address: &str,
    descriptor: fabric::PayloadDescriptor,
) -> Result<(), Error> {
    let mut sink = Sink::bind(address, descriptor)?;

    loop {
        let mut state = fifo.queue.lock().unwrap();
        while state.samples.is_empty() {
            if state.finished {
                drop(state);
                debug!(address, "upstream finished, ending downstream stream");
                sink.set_end_of_stream()?;
                return Ok(());
            }
            let (next, _timed_out) = fifo
                .available
                .wait_timeout(state, DRAIN_TICK)
                .unwrap();
            state = next;
        }
        let sample = state.samples.pop_front().expect("queue non-empty");
        drop(state);

        sink.wait()?;
        sink.retrieve().copy_from_slice(&sample);
        sink.post()?;
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{atomic::AtomicBool, mpsc},
        time::Duration,
    };

    use fabric::{component::run_component, PayloadDescriptor};

    use super::*;

    fn addr(tag: &str) -> String {
        format!("buffer_{tag}_{}", std::process::id())
    }

    #[test]
    fn fifo_drops_oldest_on_overrun() {
        let fifo = Fifo::new();

        for i in 0..(CAPACITY + 10) {
            fifo.push((i as u64).to_le_bytes().to_vec());
        }

        let state = fifo.queue.lock().unwrap();
        assert_eq!(state.samples.len(), CAPACITY);
        assert_eq!(state.overruns, 10);
        assert_eq!(state.samples.front().unwrap(), &10u64.to_le_bytes().to_vec());
        assert_eq!(
            state.samples.back().unwrap(),
            &((CAPACITY + 9) as u64).to_le_bytes().to_vec()
        );
    }

    #[test]
    fn fifo_keeps_everything_within_capacity() {
        let fifo = Fifo::new();

        for i in 0..CAPACITY {
            fifo.push((i as u64).to_le_bytes().to_vec());
        }

        let state = fifo.queue.lock().unwrap();
        assert_eq!(state.samples.len(), CAPACITY);
        assert_eq!(state.overruns, 0);
    }

    #[test]
    fn buffered_link_delivers_every_sample_in_order() {
        let upstream = addr("up");
        let downstream = addr("down");
        let (cons_ready_tx, cons_ready_rx) = mpsc::channel();

        thread::scope(|s| {
            // Producer: lock-step with the buffer's source.
            let up = &upstream;
            s.spawn(move || {
                let mut sink = Sink::bind(up, PayloadDescriptor::raw(8)).unwrap();
                cons_ready_rx.recv().unwrap();
                for i in 0..200u64 {
                    sink.wait().unwrap();
                    sink.retrieve().copy_from_slice(&i.to_le_bytes());
                    sink.post().unwrap();
                }
            });

            // The buffer component between the two nodes.
            let up = &upstream;
            let down = &downstream;
            s.spawn(move || {
                let stop = AtomicBool::new(false);
                let mut buffer = Buffer::new(up, down);
                run_component(&mut buffer, &stop).unwrap();
            });

            // Consumer: attaches downstream before the producer starts,
            // so within-capacity delivery is lossless and ordered.
            let mut source =
                Source::touch_timeout(&downstream, Duration::from_secs(10)).unwrap();
            source.connect().unwrap();
            cons_ready_tx.send(()).unwrap();

            let mut next = 0u64;
            loop {
                match source.wait().unwrap() {
                    NodeState::End => break,
                    NodeState::Running => {
                        let mut bytes = [0u8; 8];
                        bytes.copy_from_slice(source.retrieve());
                        assert_eq!(u64::from_le_bytes(bytes), next);
                        next += 1;
                        source.post().unwrap();
                    }
                }
            }
            assert_eq!(next, 200);
        });
    }
}
