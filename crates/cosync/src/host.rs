//! Values held by a node, as the sync manager sees them.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::oneshot;

use cosync_core::{
    validate_content, AgentSecret, ContentMessage, CryptoProvider, Ruleset, SessionId,
    ValueContent, ValueCore, ValueId,
};
use cosync_perms::{PermissionEngine, Role};
use cosync_sync::{IngestOutcome, PeerId, ValueHost};

use crate::error::{NodeError, Result};

/// Called with fresh content whenever a subscribed value changes.
pub type Listener = Arc<dyn Fn(&ValueContent) + Send + Sync>;

pub(crate) struct NodeHost {
    crypto: Arc<dyn CryptoProvider>,
    allow_unsafe: bool,
    pub(crate) values: HashMap<ValueId, ValueCore>,
    pub(crate) engine: PermissionEngine,
    /// The session this node writes each value in.
    pub(crate) sessions: HashMap<ValueId, SessionId>,
    pub(crate) subscribers: HashMap<ValueId, Vec<(u64, Listener)>>,
    pub(crate) load_waiters: HashMap<ValueId, Vec<oneshot::Sender<bool>>>,
    /// Values changed since subscribers were last notified.
    changed: BTreeSet<ValueId>,
}

impl NodeHost {
    pub(crate) fn new(crypto: Arc<dyn CryptoProvider>, allow_unsafe: bool) -> Self {
        Self {
            engine: PermissionEngine::new(Arc::clone(&crypto)),
            crypto,
            allow_unsafe,
            values: HashMap::new(),
            sessions: HashMap::new(),
            subscribers: HashMap::new(),
            load_waiters: HashMap::new(),
            changed: BTreeSet::new(),
        }
    }

    pub(crate) fn require(&self, id: &ValueId) -> Result<&ValueCore> {
        self.values.get(id).ok_or(NodeError::NotLoaded(*id))
    }

    pub(crate) fn insert(&mut self, core: ValueCore) {
        let id = core.id();
        self.values.insert(id, core);
        self.changed.insert(id);
        self.settle_waiters(&id, true);
    }

    /// Drop a value that was never shared.
    pub(crate) fn discard(&mut self, id: &ValueId) {
        self.values.remove(id);
        self.sessions.remove(id);
        self.changed.remove(id);
        self.engine.forget(id);
    }

    pub(crate) fn touch(&mut self, id: ValueId) {
        self.changed.insert(id);
    }

    /// Content of `id` as `reader` sees it.
    pub(crate) fn content_for(&mut self, id: &ValueId, reader: &AgentSecret) -> Option<ValueContent> {
        let core = self.values.get(id)?;
        Some(self.engine.materialize(&self.values, core, Some(reader)))
    }

    /// Whether anyone may read the group, so writes to values it owns stay
    /// unencrypted.
    pub(crate) fn is_public(&mut self, group: &ValueId) -> bool {
        self.engine
            .group(&self.values, group)
            .and_then(|state| state.everyone_role_at(u64::MAX))
            .is_some_and(|role| role != Role::Revoked)
    }

    /// Values `id` cannot be evaluated without: its owner group, its source
    /// and, for groups, their parents.
    pub(crate) fn dependencies_of(&mut self, id: &ValueId) -> Vec<ValueId> {
        let Some(core) = self.values.get(id) else {
            return Vec::new();
        };
        let mut deps = core.header().dependencies();
        if matches!(core.header().ruleset, Ruleset::Group { .. }) {
            if let Some(state) = self.engine.group(&self.values, id) {
                deps.extend(state.parents());
            }
        }
        deps
    }

    /// Listeners to call and what to call them with.
    ///
    /// A change to a group also reaches subscribers of every value whose
    /// permissions depend on it.
    pub(crate) fn take_notifications(
        &mut self,
        reader: &AgentSecret,
    ) -> Vec<(Vec<Listener>, ValueContent)> {
        if self.changed.is_empty() {
            return Vec::new();
        }
        let mut affected = std::mem::take(&mut self.changed);
        if self.subscribers.is_empty() {
            return Vec::new();
        }

        loop {
            let before = affected.len();
            let ids: Vec<ValueId> = self
                .values
                .keys()
                .filter(|id| !affected.contains(id))
                .copied()
                .collect();
            for id in ids {
                if self.dependencies_of(&id).iter().any(|dep| affected.contains(dep)) {
                    affected.insert(id);
                }
            }
            if affected.len() == before {
                break;
            }
        }

        let mut out = Vec::new();
        for id in affected {
            let Some(listeners) = self.subscribers.get(&id) else {
                continue;
            };
            let listeners: Vec<Listener> = listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            if let Some(content) = self.content_for(&id, reader) {
                out.push((listeners, content));
            }
        }
        out
    }

    fn settle_waiters(&mut self, id: &ValueId, available: bool) {
        for waiter in self.load_waiters.remove(id).unwrap_or_default() {
            let _ = waiter.send(available);
        }
    }
}

impl ValueHost for NodeHost {
    fn value(&self, id: &ValueId) -> Option<&ValueCore> {
        self.values.get(id)
    }

    fn value_ids(&self) -> Vec<ValueId> {
        self.values.keys().copied().collect()
    }

    fn ingest(&mut self, from: &PeerId, content: &ContentMessage) -> IngestOutcome {
        if let Err(e) = validate_content(content) {
            return IngestOutcome::Rejected(e.to_string());
        }

        let id = content.id;
        let created = !self.values.contains_key(&id);
        if created {
            let core = match ValueCore::from_header_of(content) {
                None => return IngestOutcome::MissingHeader,
                Some(Err(e)) => return IngestOutcome::Rejected(e.to_string()),
                Some(Ok(core)) => core,
            };
            if matches!(core.header().ruleset, Ruleset::UnsafeAllowAll) && !self.allow_unsafe {
                return IngestOutcome::Rejected("unsafe ruleset not allowed".into());
            }
            tracing::debug!(value = %id, %from, kind = core.kind().name(), "value received");
            self.values.insert(id, core);
        }

        let Some(core) = self.values.get_mut(&id) else {
            return IngestOutcome::MissingHeader;
        };
        let report = core.ingest(self.crypto.as_ref(), content);
        if created || report.added > 0 {
            self.changed.insert(id);
        }
        if created {
            self.settle_waiters(&id, true);
        }
        IngestOutcome::Applied(report)
    }

    fn unavailable(&mut self, id: &ValueId) {
        tracing::debug!(value = %id, "value unavailable upstream");
        self.settle_waiters(id, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosync_core::{Change, DefaultCrypto, Transaction, ValueHeader, ValueKind};
    use serde_json::json;

    fn host(allow_unsafe: bool) -> NodeHost {
        NodeHost::new(Arc::new(DefaultCrypto), allow_unsafe)
    }

    fn shared_map(ruleset: Ruleset) -> ValueCore {
        let secret = AgentSecret::from_seed(&[3; 32]);
        let session = SessionId::new_random(DefaultCrypto.agent_id(&secret));
        let mut core = ValueCore::new(ValueHeader::new(ValueKind::Map, ruleset, 0));
        let tx = Transaction::trusting(
            1,
            &[Change::MapSet {
                key: "a".into(),
                value: json!(1),
            }],
        )
        .unwrap();
        core.append_local(&DefaultCrypto, &secret, session, tx);
        core
    }

    #[test]
    fn test_ingest_creates_value_and_settles_waiters() {
        let mut host = host(true);
        let core = shared_map(Ruleset::UnsafeAllowAll);
        let (tx, mut rx) = oneshot::channel();
        host.load_waiters.insert(core.id(), vec![tx]);

        let message = core.new_content_since(None).remove(0);
        let outcome = host.ingest(&PeerId::new("server"), &message);
        assert!(matches!(outcome, IngestOutcome::Applied(report) if report.added == 1));
        assert_eq!(rx.try_recv(), Ok(true));
        assert_eq!(host.values[&core.id()].known_state(), core.known_state());
    }

    #[test]
    fn test_ingest_without_header_for_unknown_value() {
        let mut host = host(true);
        let core = shared_map(Ruleset::UnsafeAllowAll);
        let mut message = core.new_content_since(None).remove(0);
        message.header = None;
        assert!(matches!(
            host.ingest(&PeerId::new("server"), &message),
            IngestOutcome::MissingHeader
        ));
        assert!(host.values.is_empty());
    }

    #[test]
    fn test_unsafe_ruleset_needs_opt_in() {
        let mut host = host(false);
        let core = shared_map(Ruleset::UnsafeAllowAll);
        let message = core.new_content_since(None).remove(0);
        assert!(matches!(
            host.ingest(&PeerId::new("server"), &message),
            IngestOutcome::Rejected(_)
        ));
        assert!(host.values.is_empty());
    }

    #[test]
    fn test_unavailable_settles_waiters_false() {
        let mut host = host(false);
        let id = ValueId::from_bytes([9; 32]);
        let (tx, mut rx) = oneshot::channel();
        host.load_waiters.insert(id, vec![tx]);
        host.unavailable(&id);
        assert_eq!(rx.try_recv(), Ok(false));
        assert!(host.load_waiters.is_empty());
    }

    #[test]
    fn test_notifications_reach_subscribers_once() {
        let mut host = host(true);
        let reader = AgentSecret::from_seed(&[4; 32]);
        let core = shared_map(Ruleset::UnsafeAllowAll);
        let id = core.id();
        host.insert(core);

        let listener: Listener = Arc::new(|_| {});
        host.subscribers.insert(id, vec![(1, listener)]);

        let batch = host.take_notifications(&reader);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].1.as_map().and_then(|m| m.get("a")), Some(&json!(1)));
        assert!(host.take_notifications(&reader).is_empty());
    }
}
