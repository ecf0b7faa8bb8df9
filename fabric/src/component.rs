//! Connect-then-process lifecycle shared by every pipeline participant.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::{node::NodeState, Error};

/// A pipeline participant: sample generator, filter, buffer, recorder.
pub trait Component {
    fn name(&self) -> &str;

    /// Establishes all node attachments. The convention is touch on all
    /// sources, bind the sink, then complete the source connections;
    /// components whose sink geometry depends on an upstream descriptor
    /// connect that source first.
    fn connect(&mut self) -> Result<(), Error>;

    /// Handles one sample. Returns `End` when the upstream finishes.
    fn process(&mut self) -> Result<NodeState, Error>;
}

/// Drives a component until end-of-stream or until `stop` is raised by
/// the signal handler.
pub fn run_component(component: &mut dyn Component, stop: &AtomicBool) -> Result<(), Error> {
    component.connect()?;
    info!(component = component.name(), "connected");

    while !stop.load(Ordering::Relaxed) {
        if component.process()? == NodeState::End {
            break;
        }
    }

    info!(component = component.name(), "finished");
    Ok(())
}
