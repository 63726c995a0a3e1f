//! Creating values and changing their content.
//!
//! Every change becomes one signed transaction in this node's session of
//! the value. Values owned by a group are encrypted with the group's key
//! unless the group is readable by everyone.

use bytes::Bytes;
use serde_json::Value as JsonValue;

use cosync_core::{
    nonce_material, validate_header, AgentSecret, Change, ListAnchor, OpId, Ruleset, SessionId,
    SessionLog, Transaction, TransactionId, ValueCore, ValueHeader, ValueId, ValueKind,
};

use crate::error::{NodeError, Result};
use crate::node::{LocalNode, NodeState};

/// Who controls a new value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Members of a group, by role.
    Group(ValueId),
    /// Only the creating agent.
    Agent,
    /// Anyone. Requires [`NodeConfig::allow_unsafe_rulesets`](crate::NodeConfig::allow_unsafe_rulesets).
    Everyone,
}

impl LocalNode {
    // ─────────────────────────────────────────────────────────────────────────
    // Creation
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a value, optionally with initial content.
    pub fn create(&self, kind: ValueKind, owner: Owner, initial: Vec<Change>) -> Result<ValueId> {
        if kind.is_identity() {
            return Err(NodeError::InvalidOperation(format!(
                "{} values are created with create_group or create_account",
                kind.name()
            )));
        }
        let ruleset = match owner {
            Owner::Group(group) => Ruleset::OwnedByGroup { group },
            Owner::Agent => Ruleset::OwnedByAgent {
                owner: self.agent_id(),
            },
            Owner::Everyone if self.inner.config.allow_unsafe_rulesets => Ruleset::UnsafeAllowAll,
            Owner::Everyone => {
                return Err(NodeError::Config("unsafe rulesets are disabled".into()));
            }
        };
        let header = ValueHeader::new(kind, ruleset, self.now());
        validate_header(&header)?;
        let id = header.id();

        {
            let mut guard = self.state();
            let state = &mut *guard;
            if let Some(group) = header.ruleset.owner_group() {
                state.host.require(&group)?;
                let access = state.host.engine.role_of(
                    &state.host.values,
                    &group,
                    &self.agent_id(),
                    u64::MAX,
                );
                if !access.can_write() {
                    return Err(NodeError::PermissionDenied(format!(
                        "cannot create values owned by {group}"
                    )));
                }
            }

            state.host.insert(ValueCore::new(header));
            if !initial.is_empty() {
                if let Err(e) = self.append_own(state, id, &initial) {
                    state.host.discard(&id);
                    return Err(e);
                }
            }
            state.sync.mark_dirty(&state.host, id);
            self.schedule_flush(state);
        }
        tracing::debug!(value = %id, kind = kind.name(), "value created");
        self.dispatch();
        Ok(id)
    }

    /// Create a group with this node's agent as its admin.
    pub fn create_group(&self) -> Result<ValueId> {
        self.create_identity(ValueKind::Group)
    }

    /// Create an account and run `migrate` on it once.
    pub fn create_account<F>(&self, migrate: F) -> Result<ValueId>
    where
        F: FnOnce(&LocalNode, ValueId) -> Result<()>,
    {
        let id = self.create_identity(ValueKind::Account)?;
        migrate(self, id)?;
        Ok(id)
    }

    fn create_identity(&self, kind: ValueKind) -> Result<ValueId> {
        let header = ValueHeader::new(
            kind,
            Ruleset::Group {
                initial_admin: self.agent_id(),
            },
            self.now(),
        );
        validate_header(&header)?;
        let id = header.id();
        let changes =
            cosync_perms::new_group_changes(self.inner.crypto.as_ref(), &id, &self.inner.agent)?;

        {
            let mut guard = self.state();
            let state = &mut *guard;
            state.host.insert(ValueCore::new(header));
            let session = self.own_session(state, id);
            if let Err(e) = self.append_as(state, id, &self.inner.agent, session, &changes) {
                state.host.discard(&id);
                return Err(e);
            }
            self.schedule_flush(state);
        }
        tracing::debug!(value = %id, kind = kind.name(), "group created");
        self.dispatch();
        Ok(id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Content
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply raw changes as one transaction.
    ///
    /// Groups and accounts only change through the group operations.
    pub fn transact(&self, id: ValueId, changes: Vec<Change>) -> Result<TransactionId> {
        self.mutate(id, None, |_, _| Ok(changes))
    }

    pub fn map_set(&self, id: ValueId, key: impl Into<String>, value: JsonValue) -> Result<()> {
        let key = key.into();
        self.mutate(id, Some(ValueKind::Map), |_, _| {
            Ok(vec![Change::MapSet { key, value }])
        })?;
        Ok(())
    }

    pub fn map_delete(&self, id: ValueId, key: impl Into<String>) -> Result<()> {
        let key = key.into();
        self.mutate(id, Some(ValueKind::Map), |_, _| Ok(vec![Change::MapDelete { key }]))?;
        Ok(())
    }

    /// Insert `value` so that it ends up at `index`.
    pub fn list_insert(&self, id: ValueId, index: usize, value: JsonValue) -> Result<OpId> {
        let tx = self.mutate(id, Some(ValueKind::List), |node, state| {
            let after = node.anchor_at(state, &id, index)?;
            Ok(vec![Change::ListInsert { after, value }])
        })?;
        Ok(OpId { tx, change: 0 })
    }

    /// Append to the end of a list.
    pub fn list_push(&self, id: ValueId, value: JsonValue) -> Result<OpId> {
        let tx = self.mutate(id, Some(ValueKind::List), |node, state| {
            let after = node
                .items(state, &id)?
                .last()
                .copied()
                .map_or(ListAnchor::Start, ListAnchor::After);
            Ok(vec![Change::ListInsert { after, value }])
        })?;
        Ok(OpId { tx, change: 0 })
    }

    pub fn list_delete(&self, id: ValueId, index: usize) -> Result<()> {
        self.mutate(id, Some(ValueKind::List), |node, state| {
            let target = node.item_at(state, &id, index)?;
            Ok(vec![Change::ListDelete { target }])
        })?;
        Ok(())
    }

    pub fn stream_push(&self, id: ValueId, value: JsonValue) -> Result<()> {
        self.mutate(id, Some(ValueKind::Stream), |_, _| {
            Ok(vec![Change::StreamPush { value }])
        })?;
        Ok(())
    }

    /// Insert text at a character position.
    ///
    /// Each character is one list item, chained after the previous one so
    /// the inserted run stays together under concurrent edits.
    pub fn text_insert(&self, id: ValueId, index: usize, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.mutate(id, Some(ValueKind::PlainText), |node, state| {
            let first = node.anchor_at(state, &id, index)?;
            let session = node.own_session(state, id);
            let next_index = state
                .host
                .require(&id)?
                .session(&session)
                .map_or(0, SessionLog::len);
            let tx = TransactionId {
                session,
                index: next_index,
            };
            Ok(text
                .chars()
                .enumerate()
                .map(|(n, c)| Change::ListInsert {
                    after: match n {
                        0 => first,
                        n => ListAnchor::After(OpId {
                            tx,
                            change: n as u32 - 1,
                        }),
                    },
                    value: JsonValue::String(c.to_string()),
                })
                .collect())
        })?;
        Ok(())
    }

    /// Delete `len` characters starting at `index`.
    pub fn text_delete(&self, id: ValueId, index: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.mutate(id, Some(ValueKind::PlainText), |node, state| {
            let items = node.items(state, &id)?;
            let end = index + len;
            if end > items.len() {
                return Err(NodeError::OutOfRange {
                    index: end,
                    len: items.len(),
                });
            }
            Ok(items[index..end]
                .iter()
                .map(|target| Change::ListDelete { target: *target })
                .collect())
        })?;
        Ok(())
    }

    /// Write a whole blob to a binary stream.
    ///
    /// The blob goes out as a start transaction, one transaction per chunk
    /// and an end transaction. Every transaction is checked before the first
    /// is appended, so a failed write leaves the stream untouched.
    pub fn binary_write(&self, id: ValueId, mime_type: impl Into<String>, data: &[u8]) -> Result<()> {
        let chunk_size = self.inner.config.binary_chunk_size.max(1);
        let mut batches = vec![vec![Change::BinaryStart {
            mime_type: mime_type.into(),
            total_size: Some(data.len() as u64),
        }]];
        batches.extend(data.chunks(chunk_size).map(|chunk| {
            vec![Change::BinaryChunk {
                data: Bytes::copy_from_slice(chunk),
            }]
        }));
        batches.push(vec![Change::BinaryEnd]);

        {
            let mut guard = self.state();
            let state = &mut *guard;
            check_kind(state, &id, ValueKind::BinaryStream)?;
            for changes in &batches {
                Transaction::trusting(0, changes)?;
            }
            for changes in &batches {
                self.append_own(state, id, changes)?;
            }
            self.schedule_flush(state);
        }
        self.dispatch();
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    /// Build changes under the lock and append them as one transaction.
    fn mutate<F>(&self, id: ValueId, kind: Option<ValueKind>, build: F) -> Result<TransactionId>
    where
        F: FnOnce(&LocalNode, &mut NodeState) -> Result<Vec<Change>>,
    {
        let tx = {
            let mut guard = self.state();
            let state = &mut *guard;
            match kind {
                Some(kind) => check_kind(state, &id, kind)?,
                None => {
                    let actual = state.host.require(&id)?.kind();
                    if actual.is_identity() {
                        return Err(NodeError::InvalidOperation(format!(
                            "{} values change through group operations",
                            actual.name()
                        )));
                    }
                }
            }
            let changes = build(self, state)?;
            let tx = self.append_own(state, id, &changes)?;
            self.schedule_flush(state);
            tx
        };
        self.dispatch();
        Ok(tx)
    }

    /// Visible list items in order.
    fn items(&self, state: &mut NodeState, id: &ValueId) -> Result<Vec<OpId>> {
        let content = state
            .host
            .content_for(id, &self.inner.agent)
            .ok_or(NodeError::NotLoaded(*id))?;
        let list = content.as_list().ok_or_else(|| {
            NodeError::InvalidOperation(format!("value {id} has no list content"))
        })?;
        Ok(list.entries().into_iter().map(|(op, _)| op).collect())
    }

    fn item_at(&self, state: &mut NodeState, id: &ValueId, index: usize) -> Result<OpId> {
        let items = self.items(state, id)?;
        items.get(index).copied().ok_or(NodeError::OutOfRange {
            index,
            len: items.len(),
        })
    }

    /// Anchor that puts a new item at `index`.
    fn anchor_at(&self, state: &mut NodeState, id: &ValueId, index: usize) -> Result<ListAnchor> {
        if index == 0 {
            return Ok(ListAnchor::Start);
        }
        let items = self.items(state, id)?;
        items
            .get(index - 1)
            .copied()
            .map(ListAnchor::After)
            .ok_or(NodeError::OutOfRange {
                index,
                len: items.len(),
            })
    }

    /// Append in this node's own session, after checking write access.
    pub(crate) fn append_own(
        &self,
        state: &mut NodeState,
        id: ValueId,
        changes: &[Change],
    ) -> Result<TransactionId> {
        let header = state.host.require(&id)?.header().clone();
        let access = state
            .host
            .engine
            .current_access(&state.host.values, &header, &self.agent_id());
        if !access.can_write() {
            return Err(NodeError::PermissionDenied(format!(
                "no write access to {id}"
            )));
        }
        let session = self.own_session(state, id);
        self.append_as(state, id, &self.inner.agent, session, changes)
    }

    /// Sign and append a transaction by `author` in `session`.
    pub(crate) fn append_as(
        &self,
        state: &mut NodeState,
        id: ValueId,
        author: &AgentSecret,
        session: SessionId,
        changes: &[Change],
    ) -> Result<TransactionId> {
        let crypto = self.inner.crypto.as_ref();
        let host = &mut state.host;
        let (index, made_at, owner) = {
            let core = host.require(&id)?;
            (
                core.session(&session).map_or(0, SessionLog::len),
                core.next_made_at(&session, self.now()),
                core.header().ruleset.owner_group(),
            )
        };
        let tx_id = TransactionId { session, index };

        let key = match owner {
            Some(group) if !host.is_public(&group) => Some(
                host.engine
                    .writing_key(&host.values, &group, author)
                    .ok_or_else(|| {
                        NodeError::PermissionDenied(format!("no writing key for group {group}"))
                    })?,
            ),
            _ => None,
        };
        let transaction = match key {
            Some(key) => Transaction::private(
                crypto,
                &key,
                &nonce_material(&id, &tx_id),
                made_at,
                changes,
            )?,
            None => Transaction::trusting(made_at, changes)?,
        };

        if let Some(core) = host.values.get_mut(&id) {
            core.append_local(crypto, author, session, transaction);
        }
        host.touch(id);
        state.sync.mark_dirty(&state.host, id);
        tracing::trace!(value = %id, tx = ?tx_id, changes = changes.len(), "local transaction");
        Ok(tx_id)
    }
}

fn check_kind(state: &NodeState, id: &ValueId, expected: ValueKind) -> Result<()> {
    let actual = state.host.require(id)?.kind();
    if actual != expected {
        return Err(NodeError::wrong_kind(*id, expected, actual));
    }
    Ok(())
}
