//! Group state computed by replaying a group's log.
//!
//! A group is a value whose trusting transactions are map changes forming a
//! role table plus key revelations:
//!
//! | key                     | value                                   |
//! |-------------------------|-----------------------------------------|
//! | `agent_…`               | role (`admin`, `writer`, `reader`, …)   |
//! | `everyone`              | `reader`, `writer`, `writeOnly`, `revoked` |
//! | `readKey`               | current read key id                     |
//! | `key_…_for_agent_…`     | key sealed for one agent (hex)          |
//! | `key_…_for_key_…`       | key encrypted under another key (hex)   |
//! | `writeKeyFor_agent_…`   | key id a write-only member encrypts with |
//! | `parent_co_…`           | `extend` or `revoked`                   |
//!
//! Transactions are replayed in global order. Each one is checked against the
//! state built so far; one disallowed change invalidates its whole
//! transaction. Role edits are kept as a history so that permissions can be
//! evaluated as of any point in time.

use std::collections::{BTreeMap, HashMap, HashSet};

use cosync_core::{
    AgentId, Change, DecodedEntry, KeyId, MapContent, Ruleset, TransactionId, ValueContent,
    ValueCore, ValueId, ValueKind,
};

use crate::role::{Access, Role};

/// Who a role table entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleSubject {
    Agent(AgentId),
    Everyone,
}

/// A parsed group map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupField {
    Role(RoleSubject),
    ReadKey,
    SealedKey { key: KeyId, agent: AgentId },
    KeyForKey { key: KeyId, by: KeyId },
    WriteKeyFor(AgentId),
    Parent(ValueId),
    Other,
}

impl GroupField {
    pub fn parse(key: &str) -> Self {
        if key == "everyone" {
            return GroupField::Role(RoleSubject::Everyone);
        }
        if key == "readKey" {
            return GroupField::ReadKey;
        }
        if let Ok(agent) = key.parse::<AgentId>() {
            return GroupField::Role(RoleSubject::Agent(agent));
        }
        if let Some(rest) = key.strip_prefix("writeKeyFor_") {
            return rest
                .parse()
                .map(GroupField::WriteKeyFor)
                .unwrap_or(GroupField::Other);
        }
        if let Some(rest) = key.strip_prefix("parent_") {
            return rest.parse().map(GroupField::Parent).unwrap_or(GroupField::Other);
        }
        if let Some((left, right)) = key.split_once("_for_") {
            let Ok(key) = left.parse::<KeyId>() else {
                return GroupField::Other;
            };
            if let Ok(agent) = right.parse::<AgentId>() {
                return GroupField::SealedKey { key, agent };
            }
            if let Ok(by) = right.parse::<KeyId>() {
                return GroupField::KeyForKey { key, by };
            }
        }
        GroupField::Other
    }

    /// The map key for this field. `Other` has no canonical key.
    pub fn to_key(&self) -> String {
        match self {
            GroupField::Role(RoleSubject::Agent(agent)) => agent.to_string(),
            GroupField::Role(RoleSubject::Everyone) => "everyone".to_string(),
            GroupField::ReadKey => "readKey".to_string(),
            GroupField::SealedKey { key, agent } => format!("{key}_for_{agent}"),
            GroupField::KeyForKey { key, by } => format!("{key}_for_{by}"),
            GroupField::WriteKeyFor(agent) => format!("writeKeyFor_{agent}"),
            GroupField::Parent(group) => format!("parent_{group}"),
            GroupField::Other => String::new(),
        }
    }
}

/// Nonce material for a key revelation stored under `field` in `group`.
pub fn reveal_nonce(group: &ValueId, field: &GroupField) -> Vec<u8> {
    let mut buf = group.as_bytes().to_vec();
    buf.extend_from_slice(field.to_key().as_bytes());
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RoleEdit {
    made_at: u64,
    role: Role,
}

fn as_of(history: &[RoleEdit], at: u64) -> Option<Role> {
    history
        .iter()
        .rev()
        .find(|edit| edit.made_at <= at)
        .map(|edit| edit.role)
}

/// A key sealed for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedReveal {
    pub sealed: Vec<u8>,
    /// The agent whose sealing key was used.
    pub by: AgentId,
}

/// Replayed state of one group.
#[derive(Debug, Clone)]
pub struct GroupState {
    id: ValueId,
    initial_admin: AgentId,
    roles: HashMap<AgentId, Vec<RoleEdit>>,
    everyone: Vec<RoleEdit>,
    read_keys: Vec<(u64, KeyId)>,
    sealed: HashMap<(KeyId, AgentId), SealedReveal>,
    key_for_key: HashMap<KeyId, Vec<(KeyId, Vec<u8>)>>,
    write_keys: HashMap<AgentId, KeyId>,
    parents: BTreeMap<ValueId, Vec<(u64, bool)>>,
    valid: HashSet<TransactionId>,
    content: MapContent,
}

impl GroupState {
    /// Replay a group's log.
    ///
    /// `inherited` reports the access an agent has in a parent group at a
    /// point in time. Returns `None` if the value is not a group.
    pub fn replay(
        core: &ValueCore,
        inherited: &mut dyn FnMut(&ValueId, &AgentId, u64) -> Access,
    ) -> Option<Self> {
        let Ruleset::Group { initial_admin } = core.header().ruleset else {
            return None;
        };

        let mut state = GroupState {
            id: core.id(),
            initial_admin,
            roles: HashMap::new(),
            everyone: Vec::new(),
            read_keys: Vec::new(),
            sealed: HashMap::new(),
            key_for_key: HashMap::new(),
            write_keys: HashMap::new(),
            parents: BTreeMap::new(),
            valid: HashSet::new(),
            content: MapContent::default(),
        };
        let mut content = ValueContent::new(ValueKind::Map);

        for entry in core.ordered_entries() {
            let Some(changes) = core.trusting_changes(&entry) else {
                tracing::debug!(group = %state.id, tx = ?entry.tx, "group transaction is private or malformed");
                continue;
            };
            let author = entry.tx.session.agent;

            let mut parent_access = Access::NoAccess;
            for parent in state.parents_at(entry.made_at) {
                parent_access = parent_access.union(inherited(&parent, &author, entry.made_at));
            }

            if !state.check_transaction(&author, parent_access, &changes) {
                tracing::debug!(group = %state.id, tx = ?entry.tx, "group transaction not permitted");
                continue;
            }

            for change in &changes {
                state.apply(&author, entry.made_at, change);
            }
            state.valid.insert(entry.tx);
            content.apply(&DecodedEntry {
                tx: entry.tx,
                made_at: entry.made_at,
                changes,
            });
        }

        if let ValueContent::Map(map) = content {
            state.content = map;
        }
        Some(state)
    }

    fn effective_role(&self, author: &AgentId, parent_access: Access) -> Option<Role> {
        let own = self.latest_role(author);
        if own == Some(Role::Revoked) {
            return own;
        }
        match (own, parent_access) {
            (_, Access::Admin) => Some(Role::Admin),
            (Some(role), _) => Some(role),
            (None, Access::Write) => Some(Role::Writer),
            (None, Access::Read) => Some(Role::Reader),
            (None, Access::WriteOnly) => Some(Role::WriteOnly),
            (None, Access::NoAccess) => None,
        }
    }

    fn check_transaction(&self, author: &AgentId, parent_access: Access, changes: &[Change]) -> bool {
        let mut acting = self.effective_role(author, parent_access);
        for change in changes {
            if !self.check_change(author, acting, change) {
                return false;
            }
            // Bootstrapping: the author's own role may change mid-transaction
            if let Change::MapSet { key, value } = change {
                if GroupField::parse(key) == GroupField::Role(RoleSubject::Agent(*author)) {
                    acting = value.as_str().and_then(|s| s.parse().ok());
                }
            }
        }
        true
    }

    fn check_change(&self, author: &AgentId, acting: Option<Role>, change: &Change) -> bool {
        let is_admin = acting == Some(Role::Admin);
        match change {
            Change::MapSet { key, value } => {
                let field = GroupField::parse(key);
                let text = value.as_str();
                match field {
                    GroupField::Role(subject) => {
                        let Some(role) = text.and_then(|s| s.parse::<Role>().ok()) else {
                            return false;
                        };
                        match subject {
                            RoleSubject::Everyone => is_admin && role.allowed_for_everyone(),
                            RoleSubject::Agent(target) => {
                                self.check_role_change(author, acting, &target, role)
                            }
                        }
                    }
                    GroupField::ReadKey => is_admin && text.is_some_and(|s| s.parse::<KeyId>().is_ok()),
                    GroupField::SealedKey { .. } => {
                        (is_admin || acting.is_some_and(Role::is_invite))
                            && text.is_some_and(|s| hex::decode(s).is_ok())
                    }
                    GroupField::KeyForKey { .. } => {
                        is_admin && text.is_some_and(|s| hex::decode(s).is_ok())
                    }
                    GroupField::WriteKeyFor(_) => {
                        is_admin && text.is_some_and(|s| s.parse::<KeyId>().is_ok())
                    }
                    GroupField::Parent(parent) => {
                        is_admin && parent != self.id && matches!(text, Some("extend" | "revoked"))
                    }
                    GroupField::Other => is_admin,
                }
            }
            Change::MapDelete { key } => is_admin && GroupField::parse(key) == GroupField::Other,
            _ => false,
        }
    }

    fn check_role_change(
        &self,
        author: &AgentId,
        acting: Option<Role>,
        target: &AgentId,
        role: Role,
    ) -> bool {
        let current = self.latest_role(target);

        if author == target
            && *author == self.initial_admin
            && role == Role::Admin
            && current.is_none()
        {
            return true;
        }

        match acting {
            Some(Role::Admin) => {
                // Admins cannot demote other admins
                !(author != target && current == Some(Role::Admin) && role != Role::Admin)
            }
            Some(invite) if invite.is_invite() => {
                invite.invite_may_grant(role)
                    && current.map_or(true, |c| c.rank() <= role.rank())
            }
            _ => false,
        }
    }

    fn apply(&mut self, author: &AgentId, made_at: u64, change: &Change) {
        let Change::MapSet { key, value } = change else {
            return;
        };
        let Some(text) = value.as_str() else {
            return;
        };
        match GroupField::parse(key) {
            GroupField::Role(subject) => {
                let Ok(role) = text.parse::<Role>() else {
                    return;
                };
                let edit = RoleEdit { made_at, role };
                match subject {
                    RoleSubject::Agent(agent) => self.roles.entry(agent).or_default().push(edit),
                    RoleSubject::Everyone => self.everyone.push(edit),
                }
            }
            GroupField::ReadKey => {
                if let Ok(key) = text.parse() {
                    self.read_keys.push((made_at, key));
                }
            }
            GroupField::SealedKey { key, agent } => {
                if let Ok(sealed) = hex::decode(text) {
                    self.sealed
                        .insert((key, agent), SealedReveal { sealed, by: *author });
                }
            }
            GroupField::KeyForKey { key, by } => {
                if let Ok(encrypted) = hex::decode(text) {
                    self.key_for_key.entry(key).or_default().push((by, encrypted));
                }
            }
            GroupField::WriteKeyFor(agent) => {
                if let Ok(key) = text.parse() {
                    self.write_keys.insert(agent, key);
                }
            }
            GroupField::Parent(parent) => {
                self.parents
                    .entry(parent)
                    .or_default()
                    .push((made_at, text == "extend"));
            }
            GroupField::Other => {}
        }
    }

    pub fn id(&self) -> ValueId {
        self.id
    }

    pub fn initial_admin(&self) -> AgentId {
        self.initial_admin
    }

    /// The agent's own role as of `at` (inclusive).
    pub fn role_at(&self, agent: &AgentId, at: u64) -> Option<Role> {
        self.roles.get(agent).and_then(|h| as_of(h, at))
    }

    pub fn latest_role(&self, agent: &AgentId) -> Option<Role> {
        self.role_at(agent, u64::MAX)
    }

    pub fn everyone_role_at(&self, at: u64) -> Option<Role> {
        as_of(&self.everyone, at)
    }

    /// Every agent with a role, with their latest role.
    pub fn members(&self) -> Vec<(AgentId, Role)> {
        let mut members: Vec<(AgentId, Role)> = self
            .roles
            .iter()
            .filter_map(|(agent, history)| history.last().map(|e| (*agent, e.role)))
            .collect();
        members.sort_by_key(|(agent, _)| *agent);
        members
    }

    pub fn read_key(&self) -> Option<KeyId> {
        self.read_keys.last().map(|(_, key)| *key)
    }

    pub fn sealed_for(&self, key: &KeyId, agent: &AgentId) -> Option<&SealedReveal> {
        self.sealed.get(&(*key, *agent))
    }

    /// Encrypted copies of `key`, each with the key it is encrypted under.
    pub fn key_revelations(&self, key: &KeyId) -> &[(KeyId, Vec<u8>)] {
        self.key_for_key.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn write_key_for(&self, agent: &AgentId) -> Option<KeyId> {
        self.write_keys.get(agent).copied()
    }

    /// Parent groups extended as of `at`.
    pub fn parents_at(&self, at: u64) -> Vec<ValueId> {
        self.parents
            .iter()
            .filter(|(_, history)| {
                history
                    .iter()
                    .rev()
                    .find(|(made_at, _)| *made_at <= at)
                    .is_some_and(|(_, extended)| *extended)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn parents(&self) -> Vec<ValueId> {
        self.parents_at(u64::MAX)
    }

    pub fn is_valid(&self, tx: &TransactionId) -> bool {
        self.valid.contains(tx)
    }

    /// Valid map content of the group (role table plus any profile keys).
    pub fn content(&self) -> &MapContent {
        &self.content
    }
}
