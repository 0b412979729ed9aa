//! Inputs: polled command producers.
//!
//! An [`Input`] is polled once per duty cycle and may send commands for any
//! source through the [`CommandSender`]. Inputs that derive commands from
//! state should skip sending while their source still has commands in
//! flight, rather than piling up requests computed from stale state:
//!
//! ```ignore
//! fn poll(&mut self, sender: &mut CommandSender<'_>) -> anyhow::Result<usize> {
//!     if sender.has_in_flight_command_for(self.source_id) {
//!         return Ok(0);
//!     }
//!     sender.send(self.source_id, REBALANCE, b"")?;
//!     Ok(1)
//! }
//! ```

use crate::composite::Capability;
use crate::sequencer::CommandSender;

/// A command producer polled by the duty cycle.
pub trait Input: Capability {
    /// Send any pending commands, returning how many units of work were done.
    fn poll(&mut self, sender: &mut CommandSender<'_>) -> anyhow::Result<usize>;
}

/// Input backed by a closure. See [`input_fn`].
pub struct FnInput<F> {
    name: String,
    f: F,
}

/// Wrap a closure as a named [`Input`].
pub fn input_fn<F>(name: impl Into<String>, f: F) -> FnInput<F>
where
    F: FnMut(&mut CommandSender<'_>) -> anyhow::Result<usize>,
{
    FnInput {
        name: name.into(),
        f,
    }
}

impl<F> Capability for FnInput<F> {
    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> Input for FnInput<F>
where
    F: FnMut(&mut CommandSender<'_>) -> anyhow::Result<usize>,
{
    fn poll(&mut self, sender: &mut CommandSender<'_>) -> anyhow::Result<usize> {
        (self.f)(sender)
    }
}
