use std::ptr;

use crate::{
    shm::ShmSafe,
    sync::{Condvar, Mutex, MutexGuard},
    Error,
};

/// State of a node's payload slot, shared by all attached processes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    /// Region allocated, control block not yet initialized. Never
    /// observable behind the ready flag.
    Undefined = 0,
    /// Writer bound; the slot is writable by the sink.
    SinkBound = 1,
    /// A sample is published and awaits acknowledgement from all sources.
    SourceWait = 2,
    /// Terminal: the writer departed.
    End = 3,
}

/// What a source learns from `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Running,
    End,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Raw = 0,
    Frame = 1,
    Record = 2,
}

/// Pixel layout tag for frame nodes. The numeric values are part of the
/// on-wire descriptor and must stay stable.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Gray = 1,
    Bgr = 3,
    Bgra = 4,
}

impl PixelFormat {
    pub fn channels(self) -> u32 {
        match self {
            PixelFormat::Gray => 1,
            PixelFormat::Bgr => 3,
            PixelFormat::Bgra => 4,
        }
    }
}

/// Shape of the payload slot, declared by the sink at bind time and
/// immutable afterwards; sources read it without taking the node lock.
///
/// `rows`, `cols`, `format` and `elem_bytes` are meaningful only for
/// frame nodes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PayloadDescriptor {
    pub bytes: u64,
    pub kind: PayloadKind,
    pub rows: u32,
    pub cols: u32,
    pub format: PixelFormat,
    pub elem_bytes: u32,
}

impl PayloadDescriptor {
    /// Untyped byte slot.
    pub fn raw(bytes: usize) -> Self {
        Self {
            bytes: bytes as u64,
            kind: PayloadKind::Raw,
            rows: 0,
            cols: 0,
            format: PixelFormat::Gray,
            elem_bytes: 1,
        }
    }

    /// Frame slot sized from its geometry.
    pub fn frame(rows: u32, cols: u32, format: PixelFormat, elem_bytes: u32) -> Self {
        Self {
            bytes: u64::from(rows) * u64::from(cols) * u64::from(format.channels())
                * u64::from(elem_bytes),
            kind: PayloadKind::Frame,
            rows,
            cols,
            format,
            elem_bytes,
        }
    }

    /// Fixed-size record slot.
    pub fn record(bytes: usize) -> Self {
        Self {
            bytes: bytes as u64,
            kind: PayloadKind::Record,
            rows: 0,
            cols: 0,
            format: PixelFormat::Gray,
            elem_bytes: bytes as u32,
        }
    }
}

unsafe impl ShmSafe for SinkState {}
unsafe impl ShmSafe for PayloadDescriptor {}

/// Mutable node state, guarded by `ControlBlock::shared`.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct NodeShared {
    pub state: SinkState,
    /// Number of attached sources.
    pub source_count: u32,
    /// Next reader slot index to hand out.
    pub next_slot: u32,
    /// Sources that have acknowledged the in-flight sample.
    pub ack_count: u32,
    /// Count of publishes so far; the sample currently in the slot is
    /// number `write_number - 1`.
    pub write_number: u64,
    pub end_of_stream: bool,
    /// Set by the first endpoint that observes a dead peer; every later
    /// operation fails fast.
    pub poisoned: bool,
}

unsafe impl ShmSafe for NodeShared {}

/// In-region rendezvous state of one node.
#[repr(C)]
pub struct ControlBlock {
    /// Held by the live sink for its entire lifetime. Bind exclusivity
    /// and crash detection both hinge on try-locking it.
    pub(crate) binder: Mutex<()>,
    pub(crate) shared: Mutex<NodeShared>,
    /// Wakes the sink when the acknowledgement barrier completes or a
    /// reader departs.
    pub(crate) writer_cv: Condvar,
    /// Wakes sources on publish and on end-of-stream.
    pub(crate) reader_cv: Condvar,
    pub(crate) descriptor: PayloadDescriptor,
}

unsafe impl ShmSafe for ControlBlock {}

impl ControlBlock {
    /// In-place construction inside a freshly created, zero-filled
    /// region. Runs before the region's ready flag is written, so no
    /// intermediate state is observable.
    pub(crate) unsafe fn init_in_shm(block: *mut ControlBlock, descriptor: PayloadDescriptor) {
        unsafe {
            Mutex::init_at(&raw mut (*block).binder, |data| ptr::write(data, ()));
            Mutex::init_at(&raw mut (*block).shared, |data| {
                ptr::write(
                    data,
                    NodeShared {
                        state: SinkState::SinkBound,
                        source_count: 0,
                        next_slot: 0,
                        ack_count: 0,
                        write_number: 0,
                        end_of_stream: false,
                        poisoned: false,
                    },
                )
            });
            Condvar::init_at(&raw mut (*block).writer_cv);
            Condvar::init_at(&raw mut (*block).reader_cv);
            ptr::write(&raw mut (*block).descriptor, descriptor);
        }
    }

    /// Locks the node state, translating robust-mutex recovery into the
    /// poison protocol: the first observer of a dead peer marks the
    /// node, later lockers fail fast.
    pub(crate) fn lock_shared(&self) -> Result<MutexGuard<'_, NodeShared>, Error> {
        let mut guard = self.shared.lock();
        check_guard(&mut guard)?;
        Ok(guard)
    }
}

/// Re-validates a guard after a condition wait.
pub(crate) fn check_guard(guard: &mut MutexGuard<'_, NodeShared>) -> Result<(), Error> {
    if guard.owner_died() {
        guard.poisoned = true;
        return Err(Error::PeerDied);
    }
    if guard.poisoned {
        return Err(Error::Poisoned);
    }
    Ok(())
}

/// Applies the acknowledgement barrier: once every attached source has
/// acknowledged the in-flight sample, the slot returns to the writer.
/// Returns whether the writer should be woken.
pub(crate) fn settle_barrier(shared: &mut NodeShared) -> bool {
    if shared.state == SinkState::SourceWait && shared.ack_count >= shared.source_count {
        shared.state = SinkState::SinkBound;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_descriptor_sizes_from_geometry() {
        let d = PayloadDescriptor::frame(480, 640, PixelFormat::Bgr, 1);
        assert_eq!(d.bytes, 480 * 640 * 3);
        assert_eq!(d.kind, PayloadKind::Frame);

        let gray16 = PayloadDescriptor::frame(4, 4, PixelFormat::Gray, 2);
        assert_eq!(gray16.bytes, 32);
    }

    #[test]
    fn record_descriptor_carries_size() {
        let d = PayloadDescriptor::record(16);
        assert_eq!(d.bytes, 16);
        assert_eq!(d.elem_bytes, 16);
        assert_eq!(d.kind, PayloadKind::Record);
    }

    #[test]
    fn barrier_settles_only_when_all_acked() {
        let mut shared = NodeShared {
            state: SinkState::SourceWait,
            source_count: 2,
            next_slot: 2,
            ack_count: 1,
            write_number: 1,
            end_of_stream: false,
            poisoned: false,
        };

        assert!(!settle_barrier(&mut shared));
        assert_eq!(shared.state, SinkState::SourceWait);

        shared.ack_count = 2;
        assert!(settle_barrier(&mut shared));
        assert_eq!(shared.state, SinkState::SinkBound);

        // Idempotent once the slot is back with the writer.
        assert!(!settle_barrier(&mut shared));
    }
}
