//! Extensions.
//!
//! A [`Plugin`] adds behavior to an engine without the application knowing
//! about it. When the engine is built each plugin installs any number of
//! processors, appliers, outputs and inputs, and these are chained with the
//! application's own members following the usual order rules (see
//! [`composite`](crate::composite)).
//!
//! A plugin may also offer a default base state. It is only used when the
//! application did not supply one, and the first plugin offering one wins.
//!
//! # Example
//!
//! ```ignore
//! struct Audit;
//!
//! impl Plugin for Audit {
//!     fn name(&self) -> &str {
//!         "audit"
//!     }
//!
//!     fn install(&mut self, installer: &mut Installer) {
//!         installer.add_output(output_fn("audit", |event, _| {
//!             tracing::info!(event_sequence = event.event_sequence(), "audit");
//!             Ok(Ack::Committed)
//!         }));
//!     }
//! }
//! ```

use crate::applier::EventApplier;
use crate::input::Input;
use crate::output::Output;
use crate::processor::CommandProcessor;
use crate::state::MutableBaseState;

/// An engine extension.
pub trait Plugin {
    fn name(&self) -> &str;

    /// Register this plugin's members.
    fn install(&mut self, installer: &mut Installer);

    /// Base state to use when the application supplies none.
    fn base_state_provider(&mut self) -> Option<Box<dyn MutableBaseState>> {
        None
    }
}

/// Collects the members installed by plugins.
#[derive(Default)]
pub struct Installer {
    pub(crate) processors: Vec<Box<dyn CommandProcessor>>,
    pub(crate) appliers: Vec<Box<dyn EventApplier>>,
    pub(crate) outputs: Vec<Box<dyn Output>>,
    pub(crate) inputs: Vec<Box<dyn Input>>,
}

impl Installer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_processor(&mut self, processor: impl CommandProcessor + 'static) -> &mut Self {
        self.processors.push(Box::new(processor));
        self
    }

    pub fn add_applier(&mut self, applier: impl EventApplier + 'static) -> &mut Self {
        self.appliers.push(Box::new(applier));
        self
    }

    pub fn add_output(&mut self, output: impl Output + 'static) -> &mut Self {
        self.outputs.push(Box::new(output));
        self
    }

    pub fn add_input(&mut self, input: impl Input + 'static) -> &mut Self {
        self.inputs.push(Box::new(input));
        self
    }

    /// Returns true if nothing was installed.
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
            && self.appliers.is_empty()
            && self.outputs.is_empty()
            && self.inputs.is_empty()
    }
}

/// Plugin backed by a closure. See [`plugin_fn`].
pub struct FnPlugin<F> {
    name: String,
    f: F,
}

/// Wrap an install closure as a named [`Plugin`].
pub fn plugin_fn<F>(name: impl Into<String>, f: F) -> FnPlugin<F>
where
    F: FnMut(&mut Installer),
{
    FnPlugin {
        name: name.into(),
        f,
    }
}

impl<F> Plugin for FnPlugin<F>
where
    F: FnMut(&mut Installer),
{
    fn name(&self) -> &str {
        &self.name
    }

    fn install(&mut self, installer: &mut Installer) {
        (self.f)(installer)
    }
}
