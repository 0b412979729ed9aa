//! Composite chaining of capabilities.
//!
//! Every pluggable capability (command processor, event applier, output,
//! input) is assembled from the application's members plus the members
//! installed by extensions into one [`Chain`] that is invoked in a fixed
//! order:
//!
//! | Capability        | Order                               |
//! |-------------------|-------------------------------------|
//! | Command processor | [`ChainOrder::ApplicationFirst`]    |
//! | Event applier     | [`ChainOrder::ApplicationLast`]     |
//! | Output            | [`ChainOrder::ApplicationFirst`]    |
//! | Input             | [`ChainOrder::ApplicationFirst`]    |
//!
//! Members reporting [`Capability::is_noop`] are dropped when the chain is
//! composed, so they cost nothing per call.

use std::fmt;

use tracing::debug;

/// Common surface of every chainable capability.
pub trait Capability {
    /// Name used in logs and error reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Returns true if invoking this member never has an effect.
    fn is_noop(&self) -> bool {
        false
    }
}

/// Where the application's members go relative to extension members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOrder {
    /// Application members run before extension members.
    ApplicationFirst,
    /// Extension members run before application members.
    ApplicationLast,
}

/// A fixed-order list of capability members.
pub struct Chain<T: ?Sized + Capability> {
    members: Vec<Box<T>>,
    skipped: Vec<String>,
}

impl<T: ?Sized + Capability> Chain<T> {
    /// Compose application and extension members in `order`, skipping no-ops.
    pub fn compose(application: Vec<Box<T>>, extensions: Vec<Box<T>>, order: ChainOrder) -> Self {
        let ordered = match order {
            ChainOrder::ApplicationFirst => application.into_iter().chain(extensions),
            ChainOrder::ApplicationLast => extensions.into_iter().chain(application),
        };

        let mut members = Vec::new();
        let mut skipped = Vec::new();
        for member in ordered {
            if member.is_noop() {
                debug!(member = member.name(), "skipping no-op chain member");
                skipped.push(member.name().to_string());
            } else {
                members.push(member);
            }
        }
        Self { members, skipped }
    }

    /// An empty chain.
    pub fn empty() -> Self {
        Self {
            members: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.members.iter().map(|m| &**m)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.members.iter_mut().map(|m| &mut **m)
    }

    /// Names of the members, in invocation order.
    pub fn names(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.name()).collect()
    }

    /// Names of the members dropped as no-ops.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub(crate) fn into_members(self) -> Vec<Box<T>> {
        self.members
    }
}

impl<T: ?Sized + Capability> Default for Chain<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized + Capability> fmt::Debug for Chain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("members", &self.names())
            .field("skipped", &self.skipped)
            .finish()
    }
}
