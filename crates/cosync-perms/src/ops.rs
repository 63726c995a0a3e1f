//! Builders for group changes.
//!
//! Each function checks the acting agent's rights against the current group
//! state and returns the changes to append to the group as one trusting
//! transaction. The same rules are enforced again when the group is replayed,
//! so a builder refusing early only saves writing a transaction that would be
//! ignored.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use cosync_core::{AgentId, AgentSecret, Change, CryptoProvider, KeySecret, ValueId};

use crate::engine::{PermissionEngine, ValueResolver};
use crate::error::{PermsError, Result};
use crate::group::{reveal_nonce, GroupField, GroupState, RoleSubject};
use crate::role::Role;

fn set(field: GroupField, value: impl Into<JsonValue>) -> Change {
    Change::MapSet {
        key: field.to_key(),
        value: value.into(),
    }
}

fn seal_key(
    crypto: &dyn CryptoProvider,
    group: &ValueId,
    from: &AgentSecret,
    key: &KeySecret,
    to: &AgentId,
) -> Result<Change> {
    let field = GroupField::SealedKey {
        key: key.id(),
        agent: *to,
    };
    let sealed = crypto.seal(&from.sealer, &to.sealer, &reveal_nonce(group, &field), &key.0)?;
    Ok(set(field, hex::encode(sealed)))
}

fn key_for_key(
    crypto: &dyn CryptoProvider,
    group: &ValueId,
    key: &KeySecret,
    by: &KeySecret,
) -> Result<Change> {
    let field = GroupField::KeyForKey {
        key: key.id(),
        by: by.id(),
    };
    let encrypted = crypto.encrypt(by, &reveal_nonce(group, &field), &key.0)?;
    Ok(set(field, hex::encode(encrypted)))
}

/// Changes of the first transaction of a new group: the creator becomes
/// admin and receives a fresh read key.
pub fn new_group_changes(
    crypto: &dyn CryptoProvider,
    group: &ValueId,
    admin: &AgentSecret,
) -> Result<Vec<Change>> {
    let me = crypto.agent_id(admin);
    let key = crypto.new_key_secret();
    Ok(vec![
        set(GroupField::Role(RoleSubject::Agent(me)), Role::Admin.as_str()),
        seal_key(crypto, group, admin, &key, &me)?,
        set(GroupField::ReadKey, key.id().to_string()),
    ])
}

fn group_state(
    engine: &mut PermissionEngine,
    resolver: &dyn ValueResolver,
    group: &ValueId,
) -> Result<Arc<GroupState>> {
    match engine.group(resolver, group) {
        Some(state) => Ok(state),
        None if resolver.value(group).is_none() => Err(PermsError::GroupUnavailable(*group)),
        None => Err(PermsError::NotAGroup(*group)),
    }
}

fn require_admin(
    engine: &mut PermissionEngine,
    resolver: &dyn ValueResolver,
    group: &ValueId,
    actor: &AgentId,
) -> Result<Arc<GroupState>> {
    let state = group_state(engine, resolver, group)?;
    if !engine.role_of(resolver, group, actor, u64::MAX).is_admin() {
        return Err(PermsError::PermissionDenied(format!(
            "{actor} is not an admin of {group}"
        )));
    }
    Ok(state)
}

fn current_read_key(
    engine: &mut PermissionEngine,
    resolver: &dyn ValueResolver,
    state: &GroupState,
    reader: &AgentSecret,
) -> Result<KeySecret> {
    let key = state.read_key().ok_or_else(|| {
        PermsError::PermissionDenied(format!("group {} has no read key", state.id()))
    })?;
    engine
        .resolve_key(resolver, &state.id(), &key, reader)
        .ok_or(PermsError::KeyUnavailable(key))
}

/// Give `member` a role, revealing the keys that role needs.
///
/// Write-only members receive their own write key, readable by everyone who
/// holds the read key.
pub fn add_member_changes(
    engine: &mut PermissionEngine,
    resolver: &dyn ValueResolver,
    group: &ValueId,
    actor: &AgentSecret,
    member: AgentId,
    role: Role,
) -> Result<Vec<Change>> {
    if role == Role::Revoked {
        return Err(PermsError::InvalidRole(
            "use remove_member to revoke a member".into(),
        ));
    }
    let crypto = engine.crypto().clone();
    let me = crypto.agent_id(actor);
    let state = require_admin(engine, resolver, group, &me)?;

    if member != me && state.latest_role(&member) == Some(Role::Admin) && role != Role::Admin {
        return Err(PermsError::PermissionDenied(format!(
            "{member} is an admin and cannot be demoted"
        )));
    }

    let read_key = current_read_key(engine, resolver, &state, actor)?;
    let mut changes = vec![set(
        GroupField::Role(RoleSubject::Agent(member)),
        role.as_str(),
    )];

    if role == Role::WriteOnly {
        let write_key = crypto.new_key_secret();
        changes.push(set(
            GroupField::WriteKeyFor(member),
            write_key.id().to_string(),
        ));
        changes.push(seal_key(crypto.as_ref(), group, actor, &write_key, &member)?);
        changes.push(key_for_key(crypto.as_ref(), group, &write_key, &read_key)?);
        engine.remember_key(me, write_key);
    } else {
        changes.push(seal_key(crypto.as_ref(), group, actor, &read_key, &member)?);
    }
    Ok(changes)
}

/// Revoke `member` and rotate the read key.
///
/// The new key is sealed to every remaining reader, the old key is made
/// readable through the new one, and the new key is made readable through
/// each parent's read key the actor can obtain.
pub fn remove_member_changes(
    engine: &mut PermissionEngine,
    resolver: &dyn ValueResolver,
    group: &ValueId,
    actor: &AgentSecret,
    member: &AgentId,
) -> Result<Vec<Change>> {
    let crypto = engine.crypto().clone();
    let me = crypto.agent_id(actor);
    let state = require_admin(engine, resolver, group, &me)?;

    match state.latest_role(member) {
        None | Some(Role::Revoked) => return Err(PermsError::NotAMember(*member)),
        Some(Role::Admin) if *member != me => {
            return Err(PermsError::PermissionDenied(format!(
                "{member} is an admin and cannot be removed"
            )))
        }
        Some(_) => {}
    }

    let old_key = current_read_key(engine, resolver, &state, actor)?;
    let new_key = crypto.new_key_secret();

    let mut changes = vec![set(
        GroupField::Role(RoleSubject::Agent(*member)),
        Role::Revoked.as_str(),
    )];
    for (agent, role) in state.members() {
        if agent != *member && role.access().can_read() {
            changes.push(seal_key(crypto.as_ref(), group, actor, &new_key, &agent)?);
        }
    }
    changes.push(key_for_key(crypto.as_ref(), group, &old_key, &new_key)?);

    for parent in state.parents() {
        let parent_key = engine
            .group(resolver, &parent)
            .and_then(|p| p.read_key())
            .and_then(|key| engine.resolve_key(resolver, &parent, &key, actor));
        match parent_key {
            Some(parent_key) => {
                changes.push(key_for_key(crypto.as_ref(), group, &new_key, &parent_key)?)
            }
            None => tracing::warn!(%group, %parent, "cannot reveal rotated key to parent"),
        }
    }

    changes.push(set(GroupField::ReadKey, new_key.id().to_string()));
    engine.remember_key(me, new_key);
    Ok(changes)
}

/// Give every agent, known or not, a role in the group.
pub fn set_everyone_changes(
    engine: &mut PermissionEngine,
    resolver: &dyn ValueResolver,
    group: &ValueId,
    actor: &AgentSecret,
    role: Role,
) -> Result<Vec<Change>> {
    if !role.allowed_for_everyone() {
        return Err(PermsError::InvalidRole(format!("{role} cannot be given to everyone")));
    }
    let me = engine.crypto().agent_id(actor);
    require_admin(engine, resolver, group, &me)?;
    Ok(vec![set(
        GroupField::Role(RoleSubject::Everyone),
        role.as_str(),
    )])
}

/// Create an invite granting `role`.
///
/// Returns the changes plus the invite secret to hand to the invitee.
pub fn create_invite_changes(
    engine: &mut PermissionEngine,
    resolver: &dyn ValueResolver,
    group: &ValueId,
    actor: &AgentSecret,
    role: Role,
) -> Result<(Vec<Change>, AgentSecret)> {
    let invite_role = role
        .invite_for()
        .ok_or_else(|| PermsError::InvalidRole(format!("no invite for role {role}")))?;
    let crypto = engine.crypto().clone();
    let invite = crypto.new_agent_secret();
    let changes = add_member_changes(
        engine,
        resolver,
        group,
        actor,
        crypto.agent_id(&invite),
        invite_role,
    )?;
    Ok((changes, invite))
}

/// Accept an invite for `member`; the changes must be authored by the invite
/// agent.
///
/// Returns the changes and the role granted. No changes are returned if the
/// member already holds that role or a better one.
pub fn accept_invite_changes(
    engine: &mut PermissionEngine,
    resolver: &dyn ValueResolver,
    group: &ValueId,
    invite: &AgentSecret,
    member: AgentId,
) -> Result<(Vec<Change>, Role)> {
    let crypto = engine.crypto().clone();
    let state = group_state(engine, resolver, group)?;
    let invite_id = crypto.agent_id(invite);

    let role = match state.latest_role(&invite_id) {
        Some(Role::ReaderInvite) => Role::Reader,
        Some(Role::WriterInvite) => Role::Writer,
        Some(Role::AdminInvite) => Role::Admin,
        _ => {
            return Err(PermsError::PermissionDenied(format!(
                "invite is not valid for {group}"
            )))
        }
    };

    if let Some(existing) = state.latest_role(&member) {
        if existing != Role::Revoked && existing.rank() >= role.rank() {
            return Ok((Vec::new(), existing));
        }
    }

    let read_key = current_read_key(engine, resolver, &state, invite)?;
    let changes = vec![
        set(GroupField::Role(RoleSubject::Agent(member)), role.as_str()),
        seal_key(crypto.as_ref(), group, invite, &read_key, &member)?,
    ];
    Ok((changes, role))
}

/// Make `child` inherit the roles of `parent`.
pub fn extend_changes(
    engine: &mut PermissionEngine,
    resolver: &dyn ValueResolver,
    child: &ValueId,
    parent: &ValueId,
    actor: &AgentSecret,
) -> Result<Vec<Change>> {
    if child == parent {
        return Err(PermsError::ParentCycle {
            child: *child,
            parent: *parent,
        });
    }
    let crypto = engine.crypto().clone();
    let me = crypto.agent_id(actor);
    let state = require_admin(engine, resolver, child, &me)?;
    let parent_state = group_state(engine, resolver, parent)?;

    // Walk the parent's ancestry looking for the child
    let mut seen = HashSet::new();
    let mut stack = vec![*parent];
    while let Some(id) = stack.pop() {
        if id == *child {
            return Err(PermsError::ParentCycle {
                child: *child,
                parent: *parent,
            });
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(ancestor) = engine.group(resolver, &id) {
            stack.extend(ancestor.parents());
        }
    }

    let child_key = current_read_key(engine, resolver, &state, actor)?;
    let parent_key = current_read_key(engine, resolver, &parent_state, actor)?;
    Ok(vec![
        set(GroupField::Parent(*parent), "extend"),
        key_for_key(crypto.as_ref(), child, &child_key, &parent_key)?,
    ])
}
