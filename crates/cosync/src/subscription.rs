//! Subscription handles.

use std::sync::Weak;

use cosync_core::ValueId;

use crate::node::NodeInner;

/// Keeps a listener registered. Dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    node: Weak<NodeInner>,
    value: ValueId,
    key: u64,
}

impl Subscription {
    pub(crate) fn new(node: Weak<NodeInner>, value: ValueId, key: u64) -> Self {
        Self { node, value, key }
    }

    /// The value being watched.
    pub fn value_id(&self) -> ValueId {
        self.value
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(node) = self.node.upgrade() {
            node.unsubscribe(&self.value, self.key);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("value", &self.value)
            .finish()
    }
}
