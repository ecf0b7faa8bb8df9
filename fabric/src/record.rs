//! Typed adapters for fixed-size record nodes.

use std::{marker::PhantomData, ptr};

use crate::{
    node::{NodeState, PayloadDescriptor, PayloadKind},
    shm::ShmSafe,
    sink::Sink,
    source::Source,
    Error,
};

/// 16-byte test record published by the signal-generator components:
/// a monotonic sequence number plus the publish timestamp.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub seq: u64,
    pub micros: u64,
}

unsafe impl ShmSafe for Tick {}

/// Writer of `T`-shaped records.
pub struct RecordSink<T: ShmSafe + Copy> {
    inner: Sink,
    _marker: PhantomData<T>,
}

impl<T: ShmSafe + Copy> RecordSink<T> {
    pub fn bind(address: &str) -> Result<Self, Error> {
        let inner = Sink::bind(address, PayloadDescriptor::record(size_of::<T>()))?;
        Ok(Self {
            inner,
            _marker: PhantomData,
        })
    }

    /// Publishes one record: wait for the slot, write, post.
    pub fn write(&mut self, value: T) -> Result<(), Error> {
        self.inner.wait()?;
        let slot = self.inner.retrieve();
        unsafe { ptr::write_unaligned(slot.as_mut_ptr().cast::<T>(), value) };
        self.inner.post()
    }

    pub fn set_end_of_stream(&mut self) -> Result<(), Error> {
        self.inner.set_end_of_stream()
    }

    pub fn sequence(&self) -> u64 {
        self.inner.sequence()
    }
}

/// Reader of `T`-shaped records; the record layout is checked against
/// the node's descriptor at attach.
pub struct RecordSource<T: ShmSafe + Copy> {
    inner: Source,
    _marker: PhantomData<T>,
}

impl<T: ShmSafe + Copy> RecordSource<T> {
    pub fn touch(address: &str) -> Result<Self, Error> {
        let inner = Source::touch(address)?;
        let d = inner.parameters();
        if d.kind != PayloadKind::Record || d.bytes as usize != size_of::<T>() {
            return Err(Error::ProtocolViolation("record layout does not match the node"));
        }
        Ok(Self {
            inner,
            _marker: PhantomData,
        })
    }

    pub fn connect(&mut self) -> Result<(), Error> {
        self.inner.connect()
    }

    /// Consumes the next record, or `EndOfStream` once the writer
    /// departs.
    pub fn read(&mut self) -> Result<T, Error> {
        match self.inner.wait()? {
            NodeState::End => Err(Error::EndOfStream),
            NodeState::Running => {
                let value =
                    unsafe { ptr::read_unaligned(self.inner.retrieve().as_ptr().cast::<T>()) };
                self.inner.post()?;
                Ok(value)
            }
        }
    }

    pub fn slot(&self) -> u32 {
        self.inner.slot()
    }
}
