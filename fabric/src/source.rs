use std::{slice, time::Duration};

use tracing::debug;

use crate::{
    node::{check_guard, settle_barrier, ControlBlock, NodeState, PayloadDescriptor, SinkState},
    region_name,
    shm::SharedRegion,
    Error,
};

/// Limit applied by [`Source::touch`] while waiting for a sink to create
/// the node.
pub const DEFAULT_TOUCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Reader endpoint of a node. Attaches to an existing region, observes
/// every sample published after its registration exactly once, and
/// deregisters on drop so the writer is never left waiting on a departed
/// reader.
pub struct Source {
    address: String,
    region: SharedRegion<ControlBlock>,
    slot: u32,
    /// Local copy of `write_number` up to which samples have been seen.
    last_seen: u64,
    connected: bool,
    reading: bool,
}

impl Source {
    /// Attaches to the node at `address`, waiting up to the default limit
    /// for a sink to create it, and registers as a reader. The stream
    /// position is taken here: samples already published are never
    /// observed.
    pub fn touch(address: &str) -> Result<Self, Error> {
        Self::touch_timeout(address, DEFAULT_TOUCH_TIMEOUT)
    }

    pub fn touch_timeout(address: &str, limit: Duration) -> Result<Self, Error> {
        let name = region_name(address);
        let region =
            SharedRegion::<ControlBlock>::open_timeout(&name, limit).map_err(|e| match e {
                Error::Timeout(_) => Error::Timeout(address.to_owned()),
                e => e,
            })?;

        let slot;
        let last_seen;
        {
            let ctrl = unsafe { &*region.get() };
            let mut guard = ctrl.lock_shared()?;

            guard.source_count += 1;
            slot = guard.next_slot;
            guard.next_slot += 1;

            // A sample may be in flight; it was counted against the old
            // roster, so this reader is treated as having acknowledged it
            // and starts with the next publish.
            if guard.state == SinkState::SourceWait {
                guard.ack_count += 1;
            }
            last_seen = guard.write_number;
        }

        debug!(address, slot, "source registered");

        Ok(Self {
            address: address.to_owned(),
            region,
            slot,
            last_seen,
            connected: false,
            reading: false,
        })
    }

    /// Completes the attachment: waits until a writer is bound. In the
    /// single-region layout the region only exists once a sink has bound
    /// it, so this normally returns at once.
    pub fn connect(&mut self) -> Result<(), Error> {
        let ctrl = self.ctrl();

        let mut guard = ctrl.lock_shared()?;
        while guard.state == SinkState::Undefined {
            guard = ctrl.reader_cv.wait(guard);
            check_guard(&mut guard)?;
        }
        drop(guard);

        self.connected = true;
        Ok(())
    }

    /// The node's payload descriptor. Immutable after bind; read without
    /// the node lock.
    pub fn parameters(&self) -> PayloadDescriptor {
        self.ctrl().descriptor
    }

    /// Blocks until an unseen sample is available or the stream ends.
    pub fn wait(&mut self) -> Result<NodeState, Error> {
        debug_assert!(self.connected, "wait before connect");
        let ctrl = self.ctrl();

        let mut guard = ctrl.lock_shared()?;
        while !guard.end_of_stream && guard.write_number == self.last_seen {
            guard = ctrl.reader_cv.wait(guard);
            check_guard(&mut guard)?;
        }

        // A final sample published just before end-of-stream is still
        // delivered; End is reported once nothing unseen remains.
        if guard.write_number == self.last_seen {
            return Ok(NodeState::End);
        }

        let write_number = guard.write_number;
        drop(guard);
        self.last_seen = write_number;

        self.reading = true;
        Ok(NodeState::Running)
    }

    /// Read-only view of the payload slot. Valid only between `wait` and
    /// `post`.
    pub fn retrieve(&self) -> &[u8] {
        debug_assert!(self.reading, "retrieve outside wait/post");
        unsafe { slice::from_raw_parts(self.region.payload_ptr(), self.region.payload_len()) }
    }

    /// Number of the sample currently held. Valid only between `wait`
    /// and `post`.
    pub fn sample_number(&self) -> u64 {
        debug_assert!(self.reading, "sample_number outside wait/post");
        self.last_seen - 1
    }

    /// Acknowledges the current sample, releasing the slot back to the
    /// writer once every reader has done so.
    pub fn post(&mut self) -> Result<(), Error> {
        debug_assert!(self.reading, "post without wait");
        let ctrl = self.ctrl();

        let mut guard = ctrl.lock_shared()?;
        guard.ack_count += 1;
        let release = settle_barrier(&mut guard);
        drop(guard);

        if release {
            ctrl.writer_cv.signal();
        }
        self.reading = false;
        Ok(())
    }

    /// Reader slot index assigned at registration.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn ctrl(&self) -> &ControlBlock {
        unsafe { &*self.region.get() }
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        let ctrl = self.ctrl();

        let mut guard = ctrl.shared.lock();
        if guard.owner_died() {
            guard.poisoned = true;
        }
        if !guard.poisoned {
            // A reader departing mid-sample must not strand the writer;
            // the smaller roster may already satisfy the barrier.
            guard.source_count -= 1;
            settle_barrier(&mut guard);
        }
        drop(guard);

        // Wake the writer unconditionally: either the barrier moved or
        // the node is poisoned and the writer must notice.
        ctrl.writer_cv.signal();
    }
}

#[cfg(test)]
mod test {
    use std::{mem, thread};

    use crate::{node::PayloadDescriptor, sink::Sink, Error, NodeState};

    use super::Source;

    fn addr(tag: &str) -> String {
        format!("source_{tag}_{}", std::process::id())
    }

    #[test]
    fn dead_peer_poisons_the_node() {
        let addr = addr("poison");
        let mut sink = Sink::bind(&addr, PayloadDescriptor::raw(8)).unwrap();
        let mut source = Source::touch(&addr).unwrap();
        source.connect().unwrap();

        sink.wait().unwrap();
        sink.post().unwrap();
        assert_eq!(source.wait().unwrap(), NodeState::Running);

        // A peer dies while holding the node lock.
        thread::scope(|s| {
            s.spawn(|| {
                let guard = source.ctrl().shared.lock();
                mem::forget(guard);
            });
        });

        // The first operation to take the lock observes the death...
        assert!(matches!(source.post(), Err(Error::PeerDied)));

        // ...and every further operation on any endpoint fails fast.
        assert!(matches!(source.wait(), Err(Error::Poisoned)));
        assert!(matches!(sink.wait(), Err(Error::Poisoned)));
        assert!(matches!(sink.set_end_of_stream(), Err(Error::Poisoned)));
    }
}
