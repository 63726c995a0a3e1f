//! Permission evaluation over locally known values.
//!
//! The engine answers three questions for any value:
//!
//! - which transactions count (author had write access when it was made)
//! - which key decrypts a private transaction, for a given reader
//! - what the merged content looks like to that reader
//!
//! Group states are cached and recomputed only when the known state of the
//! group, or of any group consulted while computing it, changes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cosync_core::{
    nonce_material, AgentId, AgentSecret, CryptoProvider, DecodedEntry, Entry, KeyId, KeySecret,
    KnownState, Ruleset, ValueContent, ValueCore, ValueHeader, ValueId,
};

use crate::group::{reveal_nonce, GroupField, GroupState};
use crate::role::{Access, Role};

/// Read access to the values a node holds.
pub trait ValueResolver {
    fn value(&self, id: &ValueId) -> Option<&ValueCore>;
}

impl ValueResolver for HashMap<ValueId, ValueCore> {
    fn value(&self, id: &ValueId) -> Option<&ValueCore> {
        self.get(id)
    }
}

struct CachedGroup {
    state: Arc<GroupState>,
    /// Known state of every group consulted, `None` if it was unavailable.
    deps: Vec<(ValueId, Option<KnownState>)>,
}

impl CachedGroup {
    fn is_fresh(&self, resolver: &dyn ValueResolver) -> bool {
        self.deps
            .iter()
            .all(|(id, known)| resolver.value(id).map(ValueCore::known_state) == *known)
    }
}

/// Evaluates roles, validity and keys.
pub struct PermissionEngine {
    crypto: Arc<dyn CryptoProvider>,
    groups: HashMap<ValueId, CachedGroup>,
    keys: HashMap<(AgentId, KeyId), KeySecret>,
    touched: Vec<ValueId>,
}

impl PermissionEngine {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            crypto,
            groups: HashMap::new(),
            keys: HashMap::new(),
            touched: Vec::new(),
        }
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoProvider> {
        &self.crypto
    }

    /// Replayed state of a group, if it is available and is a group.
    pub fn group(&mut self, resolver: &dyn ValueResolver, id: &ValueId) -> Option<Arc<GroupState>> {
        let mark = self.touched.len();
        let state = self.group_state(resolver, id, &mut Vec::new());
        self.touched.truncate(mark);
        state
    }

    fn group_state(
        &mut self,
        resolver: &dyn ValueResolver,
        id: &ValueId,
        visiting: &mut Vec<ValueId>,
    ) -> Option<Arc<GroupState>> {
        if visiting.contains(id) {
            tracing::warn!(group = %id, "cycle in group parents");
            return None;
        }

        if let Some(cached) = self.groups.get(id) {
            if cached.is_fresh(resolver) {
                let state = cached.state.clone();
                let deps: Vec<ValueId> = cached.deps.iter().map(|(d, _)| *d).collect();
                self.touched.extend(deps);
                return Some(state);
            }
        }

        let Some(core) = resolver.value(id) else {
            self.touched.push(*id);
            return None;
        };

        let mark = self.touched.len();
        visiting.push(*id);
        let state = GroupState::replay(core, &mut |parent, agent, at| {
            self.access_in_group(resolver, parent, agent, at, visiting)
        });
        visiting.pop();

        let mut deps: Vec<ValueId> = self.touched.drain(mark..).collect();
        deps.push(*id);
        deps.sort();
        deps.dedup();
        self.touched.extend(deps.iter().copied());

        let state = Arc::new(state?);
        let deps = deps
            .into_iter()
            .map(|d| (d, resolver.value(&d).map(ValueCore::known_state)))
            .collect();
        self.groups.insert(
            *id,
            CachedGroup {
                state: state.clone(),
                deps,
            },
        );
        Some(state)
    }

    /// Access of `agent` in `group` as of `at`, including inherited roles.
    ///
    /// An agent's own `revoked` role blocks everything else, including
    /// roles inherited from parents and the `everyone` role.
    fn access_in_group(
        &mut self,
        resolver: &dyn ValueResolver,
        group: &ValueId,
        agent: &AgentId,
        at: u64,
        visiting: &mut Vec<ValueId>,
    ) -> Access {
        let Some(state) = self.group_state(resolver, group, visiting) else {
            return Access::NoAccess;
        };

        let own = state.role_at(agent, at);
        if own == Some(Role::Revoked) {
            return Access::NoAccess;
        }
        let mut access = own
            .map(Role::access)
            .unwrap_or_default()
            .union(state.everyone_role_at(at).map(Role::access).unwrap_or_default());

        visiting.push(*group);
        for parent in state.parents_at(at) {
            if visiting.contains(&parent) {
                tracing::warn!(group = %group, %parent, "cycle in group parents");
                continue;
            }
            access = access.union(self.access_in_group(resolver, &parent, agent, at, visiting));
        }
        visiting.pop();
        access
    }

    /// Access of `agent` to a group as of `at`.
    pub fn role_of(
        &mut self,
        resolver: &dyn ValueResolver,
        group: &ValueId,
        agent: &AgentId,
        at: u64,
    ) -> Access {
        let mark = self.touched.len();
        let access = self.access_in_group(resolver, group, agent, at, &mut Vec::new());
        self.touched.truncate(mark);
        access
    }

    /// Access of `agent` to the value with `header`, as of `at`.
    pub fn access(
        &mut self,
        resolver: &dyn ValueResolver,
        header: &ValueHeader,
        agent: &AgentId,
        at: u64,
    ) -> Access {
        match &header.ruleset {
            Ruleset::Group { .. } => self.role_of(resolver, &header.id(), agent, at),
            Ruleset::OwnedByGroup { group } => self.role_of(resolver, group, agent, at),
            Ruleset::OwnedByAgent { owner } if owner == agent => Access::Admin,
            Ruleset::OwnedByAgent { .. } => Access::Read,
            Ruleset::UnsafeAllowAll => Access::Write,
        }
    }

    /// Access right now, i.e. as of the latest known edits.
    pub fn current_access(
        &mut self,
        resolver: &dyn ValueResolver,
        header: &ValueHeader,
        agent: &AgentId,
    ) -> Access {
        self.access(resolver, header, agent, u64::MAX)
    }

    /// Whether a transaction of `core` counts.
    pub fn is_valid_entry(
        &mut self,
        resolver: &dyn ValueResolver,
        core: &ValueCore,
        entry: &Entry<'_>,
    ) -> bool {
        if core.is_invalid(&entry.tx) {
            return false;
        }
        let author = entry.tx.session.agent;
        match &core.header().ruleset {
            Ruleset::Group { .. } => self
                .group(resolver, &core.id())
                .is_some_and(|state| state.is_valid(&entry.tx)),
            Ruleset::OwnedByGroup { group } => self
                .role_of(resolver, group, &author, entry.made_at)
                .can_write(),
            Ruleset::OwnedByAgent { owner } => *owner == author,
            Ruleset::UnsafeAllowAll => true,
        }
    }

    /// Obtain the secret of `key` in `group` for `reader`.
    ///
    /// Follows direct revelations sealed for the reader, then keys encrypted
    /// under other keys of this group or of its parents.
    pub fn resolve_key(
        &mut self,
        resolver: &dyn ValueResolver,
        group: &ValueId,
        key: &KeyId,
        reader: &AgentSecret,
    ) -> Option<KeySecret> {
        let me = self.crypto.agent_id(reader);
        self.resolve_key_inner(resolver, group, key, reader, &me, &mut HashSet::new())
    }

    fn resolve_key_inner(
        &mut self,
        resolver: &dyn ValueResolver,
        group: &ValueId,
        key: &KeyId,
        reader: &AgentSecret,
        me: &AgentId,
        visited: &mut HashSet<(ValueId, KeyId)>,
    ) -> Option<KeySecret> {
        if let Some(secret) = self.keys.get(&(*me, *key)) {
            return Some(secret.clone());
        }
        if !visited.insert((*group, *key)) {
            return None;
        }
        let state = self.group(resolver, group)?;

        if let Some(reveal) = state.sealed_for(key, me) {
            let field = GroupField::SealedKey { key: *key, agent: *me };
            let opened = self.crypto.unseal(
                &reader.sealer,
                &reveal.by.sealer,
                &reveal_nonce(group, &field),
                &reveal.sealed,
            );
            if let Some(secret) = opened.and_then(|bytes| secret_with_id(&bytes, key)) {
                self.keys.insert((*me, *key), secret.clone());
                return Some(secret);
            }
            tracing::debug!(%group, %key, "sealed key did not open");
        }

        for (by, encrypted) in state.key_revelations(key) {
            let mut holder = self.resolve_key_inner(resolver, group, by, reader, me, visited);
            if holder.is_none() {
                for parent in state.parents() {
                    holder = self.resolve_key_inner(resolver, &parent, by, reader, me, visited);
                    if holder.is_some() {
                        break;
                    }
                }
            }
            let Some(holder) = holder else {
                continue;
            };
            let field = GroupField::KeyForKey { key: *key, by: *by };
            let opened = self
                .crypto
                .decrypt(&holder, &reveal_nonce(group, &field), encrypted);
            if let Some(secret) = opened.and_then(|bytes| secret_with_id(&bytes, key)) {
                self.keys.insert((*me, *key), secret.clone());
                return Some(secret);
            }
        }
        None
    }

    /// The key `writer` encrypts new private transactions with.
    ///
    /// Write-only members use their own key; everyone else the read key.
    pub fn writing_key(
        &mut self,
        resolver: &dyn ValueResolver,
        group: &ValueId,
        writer: &AgentSecret,
    ) -> Option<KeySecret> {
        let state = self.group(resolver, group)?;
        let me = self.crypto.agent_id(writer);
        let key = state.write_key_for(&me).or_else(|| state.read_key())?;
        self.resolve_key(resolver, group, &key, writer)
    }

    /// Remember a key generated locally so it never needs resolving.
    pub fn remember_key(&mut self, holder: AgentId, secret: KeySecret) {
        self.keys.insert((holder, secret.id()), secret);
    }

    /// Content of `core` as seen by `reader`.
    ///
    /// Invalid transactions, transactions by authors without write access and
    /// private transactions the reader cannot decrypt are left out.
    pub fn materialize(
        &mut self,
        resolver: &dyn ValueResolver,
        core: &ValueCore,
        reader: Option<&AgentSecret>,
    ) -> ValueContent {
        let mut content = ValueContent::new(core.kind());
        let owner = core.header().ruleset.owner_group();

        for entry in core.ordered_entries() {
            if !self.is_valid_entry(resolver, core, &entry) {
                tracing::debug!(value = %core.id(), tx = ?entry.tx, "skipping transaction");
                continue;
            }

            let changes = match entry.transaction.key_id() {
                None => core.trusting_changes(&entry),
                Some(key) => {
                    let secret = match (owner, reader) {
                        (Some(group), Some(reader)) => {
                            self.resolve_key(resolver, &group, &key, reader)
                        }
                        _ => None,
                    };
                    let Some(secret) = secret else {
                        tracing::debug!(value = %core.id(), tx = ?entry.tx, %key, "no key for private transaction");
                        continue;
                    };
                    let nonce = nonce_material(&core.id(), &entry.tx);
                    match entry.transaction.decrypt(self.crypto.as_ref(), &secret, &nonce) {
                        Some(Ok(changes)) => Some(changes),
                        Some(Err(e)) => {
                            tracing::debug!(value = %core.id(), tx = ?entry.tx, error = %e, "malformed private transaction");
                            None
                        }
                        None => None,
                    }
                }
            };

            if let Some(changes) = changes {
                content.apply(&DecodedEntry {
                    tx: entry.tx,
                    made_at: entry.made_at,
                    changes,
                });
            }
        }
        content
    }

    /// Drop cached state, e.g. after a value was unloaded.
    pub fn forget(&mut self, id: &ValueId) {
        self.groups.remove(id);
    }
}

fn secret_with_id(bytes: &[u8], key: &KeyId) -> Option<KeySecret> {
    let arr: [u8; 32] = bytes.try_into().ok()?;
    let secret = KeySecret(arr);
    (secret.id() == *key).then_some(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;
    use cosync_core::{Change, DefaultCrypto, SessionId, Transaction, ValueKind};
    use serde_json::json;

    pub(crate) struct Actor {
        pub secret: AgentSecret,
        pub id: AgentId,
        pub session: SessionId,
    }

    pub(crate) fn actor(seed: u8) -> Actor {
        let secret = AgentSecret::from_seed(&[seed; 32]);
        let id = DefaultCrypto.agent_id(&secret);
        Actor {
            secret,
            id,
            session: SessionId { agent: id, nonce: seed as u64 },
        }
    }

    struct World {
        values: HashMap<ValueId, ValueCore>,
        engine: PermissionEngine,
        clock: u64,
    }

    impl World {
        fn new() -> Self {
            Self {
                values: HashMap::new(),
                engine: PermissionEngine::new(Arc::new(DefaultCrypto)),
                clock: 0,
            }
        }

        fn tick(&mut self) -> u64 {
            self.clock += 1;
            self.clock
        }

        fn create_group(&mut self, admin: &Actor) -> ValueId {
            let header = ValueHeader::new(
                ValueKind::Group,
                Ruleset::Group {
                    initial_admin: admin.id,
                },
                0,
            );
            let id = header.id();
            self.values.insert(id, ValueCore::new(header));
            let changes = ops::new_group_changes(&DefaultCrypto, &id, &admin.secret).unwrap();
            self.append(id, admin, changes);
            id
        }

        fn append(&mut self, id: ValueId, who: &Actor, changes: Vec<Change>) {
            let at = self.tick();
            let tx = Transaction::trusting(at, &changes).unwrap();
            let core = self.values.get_mut(&id).unwrap();
            core.append_local(&DefaultCrypto, &who.secret, who.session, tx);
        }

        fn append_private(&mut self, id: ValueId, group: ValueId, who: &Actor, changes: Vec<Change>) {
            let at = self.tick();
            let key = self
                .engine
                .writing_key(&self.values, &group, &who.secret)
                .unwrap();
            let core = self.values.get_mut(&id).unwrap();
            let index = core.session(&who.session).map_or(0, |s| s.len());
            let nonce = nonce_material(
                &id,
                &cosync_core::TransactionId {
                    session: who.session,
                    index,
                },
            );
            let tx = Transaction::private(&DefaultCrypto, &key, &nonce, at, &changes).unwrap();
            core.append_local(&DefaultCrypto, &who.secret, who.session, tx);
        }

        fn owned_map(&mut self, group: ValueId) -> ValueId {
            let header = ValueHeader::new(ValueKind::Map, Ruleset::OwnedByGroup { group }, 0);
            let id = header.id();
            self.values.insert(id, ValueCore::new(header));
            id
        }

        fn view(&mut self, id: ValueId, reader: &Actor) -> serde_json::Value {
            let core = self.values.get(&id).unwrap();
            self.engine
                .materialize(&self.values, core, Some(&reader.secret))
                .to_json()
        }
    }

    fn set(key: &str, value: serde_json::Value) -> Vec<Change> {
        vec![Change::MapSet {
            key: key.into(),
            value,
        }]
    }

    #[test]
    fn test_member_reads_private_content() {
        let alice = actor(1);
        let bob = actor(2);
        let mut w = World::new();
        let group = w.create_group(&alice);
        let changes =
            ops::add_member_changes(&mut w.engine, &w.values, &group, &alice.secret, bob.id, Role::Writer)
                .unwrap();
        w.append(group, &alice, changes);

        let map = w.owned_map(group);
        w.append_private(map, group, &alice, set("title", json!("hello")));
        w.append_private(map, group, &bob, set("by", json!("bob")));

        assert_eq!(w.view(map, &alice), json!({"title": "hello", "by": "bob"}));
        assert_eq!(w.view(map, &bob), w.view(map, &alice));

        let stranger = actor(3);
        assert_eq!(w.view(map, &stranger), json!({}));
    }

    #[test]
    fn test_reader_writes_are_excluded() {
        let alice = actor(1);
        let reader = actor(2);
        let mut w = World::new();
        let group = w.create_group(&alice);
        let changes = ops::add_member_changes(
            &mut w.engine,
            &w.values,
            &group,
            &alice.secret,
            reader.id,
            Role::Reader,
        )
        .unwrap();
        w.append(group, &alice, changes);

        let map = w.owned_map(group);
        w.append_private(map, group, &alice, set("x", json!(1)));
        w.append_private(map, group, &reader, set("x", json!(2)));

        assert_eq!(w.view(map, &reader), json!({"x": 1}));
    }

    #[test]
    fn test_revocation_applies_from_its_time() {
        let alice = actor(1);
        let bob = actor(2);
        let mut w = World::new();
        let group = w.create_group(&alice);
        let add =
            ops::add_member_changes(&mut w.engine, &w.values, &group, &alice.secret, bob.id, Role::Writer)
                .unwrap();
        w.append(group, &alice, add);

        let map = w.owned_map(group);
        w.append_private(map, group, &bob, set("before", json!(true)));
        let old_key = w.engine.writing_key(&w.values, &group, &bob.secret).unwrap();

        let remove =
            ops::remove_member_changes(&mut w.engine, &w.values, &group, &alice.secret, &bob.id)
                .unwrap();
        w.append(group, &alice, remove);

        // Bob still holds the old key and tries to keep writing
        let at = w.tick();
        let core = w.values.get_mut(&map).unwrap();
        let index = core.session(&bob.session).map_or(0, |s| s.len());
        let nonce = nonce_material(
            &map,
            &cosync_core::TransactionId {
                session: bob.session,
                index,
            },
        );
        let tx = Transaction::private(&DefaultCrypto, &old_key, &nonce, at, &set("after", json!(true)))
            .unwrap();
        core.append_local(&DefaultCrypto, &bob.secret, bob.session, tx);

        assert_eq!(w.view(map, &alice), json!({"before": true}));
        assert_eq!(
            w.engine.role_of(&w.values, &group, &bob.id, u64::MAX),
            Access::NoAccess
        );
    }

    #[test]
    fn test_rotated_key_hidden_from_removed_member() {
        let alice = actor(1);
        let bob = actor(2);
        let mut w = World::new();
        let group = w.create_group(&alice);
        let first_key = w.engine.group(&w.values, &group).unwrap().read_key().unwrap();
        let add =
            ops::add_member_changes(&mut w.engine, &w.values, &group, &alice.secret, bob.id, Role::Reader)
                .unwrap();
        w.append(group, &alice, add);
        let remove =
            ops::remove_member_changes(&mut w.engine, &w.values, &group, &alice.secret, &bob.id)
                .unwrap();
        w.append(group, &alice, remove);

        let new_key = w.engine.group(&w.values, &group).unwrap().read_key().unwrap();
        assert_ne!(new_key, first_key);
        assert!(w.engine.resolve_key(&w.values, &group, &new_key, &bob.secret).is_none());
        // Alice reaches the old key through the new one
        let mut fresh = PermissionEngine::new(Arc::new(DefaultCrypto));
        assert!(fresh.resolve_key(&w.values, &group, &first_key, &alice.secret).is_some());
    }

    #[test]
    fn test_parent_members_inherit_access() {
        let alice = actor(1);
        let carol = actor(3);
        let mut w = World::new();
        let parent = w.create_group(&alice);
        let add = ops::add_member_changes(
            &mut w.engine,
            &w.values,
            &parent,
            &alice.secret,
            carol.id,
            Role::Writer,
        )
        .unwrap();
        w.append(parent, &alice, add);

        let child = w.create_group(&alice);
        let extend =
            ops::extend_changes(&mut w.engine, &w.values, &child, &parent, &alice.secret).unwrap();
        w.append(child, &alice, extend);

        assert_eq!(
            w.engine.role_of(&w.values, &child, &carol.id, u64::MAX),
            Access::Write
        );

        let map = w.owned_map(child);
        w.append_private(map, child, &alice, set("x", json!(1)));
        w.append_private(map, child, &carol, set("y", json!(2)));
        assert_eq!(w.view(map, &carol), json!({"x": 1, "y": 2}));
    }

    #[test]
    fn test_extend_cycle_rejected() {
        let alice = actor(1);
        let mut w = World::new();
        let a = w.create_group(&alice);
        let b = w.create_group(&alice);
        let extend = ops::extend_changes(&mut w.engine, &w.values, &b, &a, &alice.secret).unwrap();
        w.append(b, &alice, extend);
        let err = ops::extend_changes(&mut w.engine, &w.values, &a, &b, &alice.secret).unwrap_err();
        assert!(matches!(err, crate::PermsError::ParentCycle { .. }));
    }

    #[test]
    fn test_everyone_reader_on_trusting_group() {
        let alice = actor(1);
        let anyone = actor(9);
        let mut w = World::new();
        let group = w.create_group(&alice);
        w.append(group, &alice, set("everyone", json!("writer")));
        assert_eq!(
            w.engine.role_of(&w.values, &group, &anyone.id, u64::MAX),
            Access::Write
        );
    }

    #[test]
    fn test_cache_refreshes_on_new_group_content() {
        let alice = actor(1);
        let bob = actor(2);
        let mut w = World::new();
        let group = w.create_group(&alice);
        assert_eq!(
            w.engine.role_of(&w.values, &group, &bob.id, u64::MAX),
            Access::NoAccess
        );
        let add =
            ops::add_member_changes(&mut w.engine, &w.values, &group, &alice.secret, bob.id, Role::Reader)
                .unwrap();
        w.append(group, &alice, add);
        assert_eq!(
            w.engine.role_of(&w.values, &group, &bob.id, u64::MAX),
            Access::Read
        );
    }

    #[test]
    fn test_owned_by_agent() {
        let alice = actor(1);
        let bob = actor(2);
        let mut w = World::new();
        let header = ValueHeader::new(ValueKind::Map, Ruleset::OwnedByAgent { owner: alice.id }, 0);
        let id = header.id();
        w.values.insert(id, ValueCore::new(header));
        w.append(id, &alice, set("a", json!(1)));
        w.append(id, &bob, set("b", json!(2)));
        assert_eq!(w.view(id, &bob), json!({"a": 1}));
    }
}
