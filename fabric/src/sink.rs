use std::{slice, time::Duration};

use tracing::debug;

use crate::{
    node::{check_guard, ControlBlock, PayloadDescriptor, SinkState},
    region_name,
    shm::{remove_region, SharedRegion},
    sync::TryLock,
    Error,
};

/// Control-block initialization is microseconds of work; a region still
/// not ready after this long was abandoned by a crashed creator.
const INIT_GRACE: Duration = Duration::from_millis(250);

/// Exclusive writer endpoint of a node. Owns the backing region: `bind`
/// creates it, drop signals end-of-stream and unlinks it.
///
/// Not `Send`: the binder lock is owned by the binding thread and must be
/// released on it.
pub struct Sink {
    address: String,
    region: SharedRegion<ControlBlock>,
    publishing: bool,
    posted: u64,
}

impl Sink {
    /// Binds the exclusive writer to `address`, creating the node region
    /// sized for `descriptor`. Residue left by a crashed writer is
    /// reclaimed; a live writer makes the bind fail with `AddressInUse`.
    pub fn bind(address: &str, descriptor: PayloadDescriptor) -> Result<Self, Error> {
        let name = region_name(address);

        // A region that already exists either belongs to a live sink or
        // is residue from an earlier run. The binder mutex decides which.
        match SharedRegion::<ControlBlock>::open_residue(&name) {
            Ok(residue) => {
                if residue.is_ready() {
                    let ctrl = unsafe { &*residue.get() };
                    match ctrl.binder.try_lock_raw() {
                        TryLock::Busy => return Err(Error::AddressInUse(address.to_owned())),
                        TryLock::Acquired | TryLock::OwnerDied => {
                            unsafe { ctrl.binder.unlock_raw() };
                            debug!(name = %name, "reclaiming stale node region");
                            remove_region(&name);
                        }
                    }
                } else {
                    // Mid-initialization: either a concurrent binder is
                    // about to set the ready flag, or a crashed one never
                    // will. Wait out the grace period before treating the
                    // region as abandoned.
                    drop(residue);
                    match SharedRegion::<ControlBlock>::open_timeout(&name, INIT_GRACE) {
                        Ok(_) => return Err(Error::AddressInUse(address.to_owned())),
                        Err(Error::Timeout(_)) => {
                            debug!(name = %name, "reclaiming region abandoned mid-initialization");
                            remove_region(&name);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let region = SharedRegion::<ControlBlock>::create(
            &name,
            descriptor.bytes as usize,
            |block| unsafe {
                ControlBlock::init_in_shm(block, descriptor);
                // Exclusivity: held until this sink drops.
                let acquired = (*block).binder.try_lock_raw();
                debug_assert_eq!(acquired, TryLock::Acquired);
            },
        )
        .map_err(|e| match e {
            Error::AddressInUse(_) => Error::AddressInUse(address.to_owned()),
            e => e,
        })?;

        debug!(address, bytes = descriptor.bytes, "sink bound");

        Ok(Self {
            address: address.to_owned(),
            region,
            publishing: false,
            posted: 0,
        })
    }

    /// Blocks until every attached source has acknowledged the previous
    /// sample. Returns immediately on the first call, and never blocks
    /// while no sources are attached: with nobody listening the writer
    /// runs free and samples are dropped.
    pub fn wait(&mut self) -> Result<(), Error> {
        let ctrl = self.ctrl();
        let mut guard = ctrl.lock_shared()?;

        while guard.state == SinkState::SourceWait
            && guard.source_count > 0
            && guard.ack_count < guard.source_count
        {
            guard = ctrl.writer_cv.wait(guard);
            check_guard(&mut guard)?;
        }

        // Sources may all have departed mid-sample; take the slot back.
        if guard.state == SinkState::SourceWait {
            guard.state = SinkState::SinkBound;
        }

        drop(guard);
        self.publishing = true;
        Ok(())
    }

    /// Mutable view of the payload slot. Valid only between `wait` and
    /// `post`.
    pub fn retrieve(&mut self) -> &mut [u8] {
        debug_assert!(self.publishing, "retrieve outside wait/post");
        unsafe {
            slice::from_raw_parts_mut(self.region.payload_ptr(), self.region.payload_len())
        }
    }

    /// Publishes the slot contents as the next sample and wakes all
    /// readers.
    pub fn post(&mut self) -> Result<(), Error> {
        debug_assert!(self.publishing, "post without wait");
        let ctrl = self.ctrl();

        let mut guard = ctrl.lock_shared()?;
        guard.write_number += 1;
        guard.ack_count = 0;
        guard.state = SinkState::SourceWait;
        drop(guard);

        ctrl.reader_cv.broadcast();
        self.publishing = false;
        self.posted += 1;
        Ok(())
    }

    /// Marks the stream finished and wakes every reader. Also performed
    /// on drop.
    pub fn set_end_of_stream(&mut self) -> Result<(), Error> {
        let ctrl = self.ctrl();

        let mut guard = ctrl.lock_shared()?;
        guard.end_of_stream = true;
        guard.state = SinkState::End;
        drop(guard);

        ctrl.reader_cv.broadcast();
        Ok(())
    }

    /// Number of samples published by this sink.
    pub fn sequence(&self) -> u64 {
        self.posted
    }

    pub fn parameters(&self) -> PayloadDescriptor {
        self.ctrl().descriptor
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn ctrl(&self) -> &ControlBlock {
        unsafe { &*self.region.get() }
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        if self.set_end_of_stream().is_err() {
            // Poisoned node: still wake any blocked readers so they
            // observe the poison themselves.
            self.ctrl().reader_cv.broadcast();
        }
        unsafe { self.ctrl().binder.unlock_raw() };
        // Dropping the region unlinks the OS name exactly once.
    }
}

#[cfg(test)]
mod test {
    use rustix::{
        fs::{ftruncate, Mode},
        shm::{self, OFlags},
    };

    use crate::shm::payload_offset;

    use super::*;

    fn addr(tag: &str) -> String {
        format!("sink_{tag}_{}", std::process::id())
    }

    #[test]
    fn bind_reclaims_region_abandoned_before_ready() {
        let addr = addr("unready");
        let name = region_name(&addr);

        // A creator that died between sizing the region and writing the
        // ready flag leaves a correctly sized but never-ready region.
        let fd = shm::open(
            &name,
            OFlags::CREATE | OFlags::EXCL | OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .unwrap();
        ftruncate(&fd, (payload_offset::<ControlBlock>() + 16) as u64).unwrap();
        drop(fd);

        let sink = Sink::bind(&addr, PayloadDescriptor::raw(16)).unwrap();
        assert_eq!(sink.sequence(), 0);
    }
}
