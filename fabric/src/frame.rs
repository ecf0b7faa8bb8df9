//! Typed frame adapters over the untyped payload slot.
//!
//! The node itself carries bytes; these wrappers declare and check frame
//! geometry through the payload descriptor, dispatching on its
//! pixel-format tag.

use crate::{
    node::{NodeState, PayloadDescriptor, PayloadKind, PixelFormat},
    sink::Sink,
    source::Source,
    Error,
};

/// Geometry of a frame node, decoded from the payload descriptor.
#[derive(Debug, Clone, Copy)]
pub struct FrameParameters {
    pub rows: u32,
    pub cols: u32,
    pub format: PixelFormat,
    pub elem_bytes: u32,
}

impl FrameParameters {
    pub fn bytes(&self) -> usize {
        self.rows as usize
            * self.cols as usize
            * self.format.channels() as usize
            * self.elem_bytes as usize
    }
}

/// Writer of row-major, channel-interleaved frames.
pub struct FrameSink {
    inner: Sink,
    params: FrameParameters,
}

impl FrameSink {
    pub fn bind(address: &str, rows: u32, cols: u32, format: PixelFormat) -> Result<Self, Error> {
        let params = FrameParameters {
            rows,
            cols,
            format,
            elem_bytes: 1,
        };
        let inner = Sink::bind(address, PayloadDescriptor::frame(rows, cols, format, 1))?;
        Ok(Self { inner, params })
    }

    pub fn wait(&mut self) -> Result<(), Error> {
        self.inner.wait()
    }

    /// Writable pixel data. Valid only between `wait` and `post`.
    pub fn retrieve(&mut self) -> &mut [u8] {
        self.inner.retrieve()
    }

    pub fn post(&mut self) -> Result<(), Error> {
        self.inner.post()
    }

    pub fn set_end_of_stream(&mut self) -> Result<(), Error> {
        self.inner.set_end_of_stream()
    }

    pub fn parameters(&self) -> FrameParameters {
        self.params
    }
}

/// Reader of frames; checks the node's descriptor at attach.
pub struct FrameSource {
    inner: Source,
    params: FrameParameters,
}

impl FrameSource {
    pub fn touch(address: &str) -> Result<Self, Error> {
        let inner = Source::touch(address)?;
        let d = inner.parameters();
        if d.kind != PayloadKind::Frame {
            return Err(Error::ProtocolViolation("node does not carry frames"));
        }
        Ok(Self {
            params: FrameParameters {
                rows: d.rows,
                cols: d.cols,
                format: d.format,
                elem_bytes: d.elem_bytes,
            },
            inner,
        })
    }

    pub fn connect(&mut self) -> Result<(), Error> {
        self.inner.connect()
    }

    pub fn wait(&mut self) -> Result<NodeState, Error> {
        self.inner.wait()
    }

    /// Read-only pixel data. Valid only between `wait` and `post`.
    pub fn retrieve(&self) -> &[u8] {
        self.inner.retrieve()
    }

    /// Clones the current frame out of the slot so it survives `post`.
    pub fn copy_to(&self, out: &mut Vec<u8>) {
        out.clear();
        out.extend_from_slice(self.inner.retrieve());
    }

    pub fn post(&mut self) -> Result<(), Error> {
        self.inner.post()
    }

    pub fn parameters(&self) -> FrameParameters {
        self.params
    }
}
