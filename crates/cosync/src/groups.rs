//! Group membership, invites and accounts.

use cosync_core::{AgentId, AgentSecret, Change, SessionId, ValueId};
use cosync_perms::{self as perms, Role};

use crate::error::{NodeError, Result};
use crate::node::{LoadOptions, Loaded, LocalNode, NodeState};

impl LocalNode {
    /// Give `member` a role in `group`.
    pub fn add_member(&self, group: ValueId, member: AgentId, role: Role) -> Result<()> {
        self.change_group(group, |node, state| {
            Ok(perms::add_member_changes(
                &mut state.host.engine,
                &state.host.values,
                &group,
                &node.inner.agent,
                member,
                role,
            )?)
        })
    }

    /// Revoke `member` and rotate the group's read key so it cannot read
    /// anything written afterwards.
    pub fn remove_member(&self, group: ValueId, member: AgentId) -> Result<()> {
        self.change_group(group, |node, state| {
            Ok(perms::remove_member_changes(
                &mut state.host.engine,
                &state.host.values,
                &group,
                &node.inner.agent,
                &member,
            )?)
        })
    }

    /// Role given to every agent, including ones that never joined.
    pub fn set_everyone_role(&self, group: ValueId, role: Role) -> Result<()> {
        self.change_group(group, |node, state| {
            Ok(perms::set_everyone_changes(
                &mut state.host.engine,
                &state.host.values,
                &group,
                &node.inner.agent,
                role,
            )?)
        })
    }

    /// Make `child` inherit members from `parent`.
    pub fn extend_group(&self, child: ValueId, parent: ValueId) -> Result<()> {
        self.change_group(child, |node, state| {
            state.host.require(&parent)?;
            Ok(perms::extend_changes(
                &mut state.host.engine,
                &state.host.values,
                &child,
                &parent,
                &node.inner.agent,
            )?)
        })
    }

    /// Create an invite granting `role`. Share the returned secret with the
    /// invitee.
    pub fn create_invite(&self, group: ValueId, role: Role) -> Result<AgentSecret> {
        let mut invite = None;
        self.change_group(group, |node, state| {
            let (changes, secret) = perms::create_invite_changes(
                &mut state.host.engine,
                &state.host.values,
                &group,
                &node.inner.agent,
                role,
            )?;
            invite = Some(secret);
            Ok(changes)
        })?;
        invite.ok_or_else(|| NodeError::InvalidOperation("invite was not created".into()))
    }

    /// Join `group` with an invite secret. Returns the role obtained.
    ///
    /// The group is loaded first if needed. The joining transaction is
    /// signed by the invite, in a session of its own.
    pub async fn accept_invite(&self, group: ValueId, invite: AgentSecret) -> Result<Role> {
        if !self.load(group, LoadOptions::default()).await?.is_available() {
            return Err(NodeError::NotLoaded(group));
        }

        let role = {
            let mut guard = self.state();
            let state = &mut *guard;
            let (changes, role) = perms::accept_invite_changes(
                &mut state.host.engine,
                &state.host.values,
                &group,
                &invite,
                self.agent_id(),
            )?;
            if !changes.is_empty() {
                let session = SessionId::new_random(self.inner.crypto.agent_id(&invite));
                self.append_as(state, group, &invite, session, &changes)?;
            }
            self.schedule_flush(state);
            role
        };
        tracing::info!(%group, %role, "invite accepted");
        self.dispatch();
        Ok(role)
    }

    /// Members of a group and their current roles.
    pub fn members(&self, group: &ValueId) -> Result<Vec<(AgentId, Role)>> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.host.require(group)?;
        let group_state = state
            .host
            .engine
            .group(&state.host.values, group)
            .ok_or(perms::PermsError::NotAGroup(*group))?;
        Ok(group_state.members())
    }

    /// Load an account and run `migrate` on it once.
    pub async fn load_account<F>(&self, id: ValueId, migrate: F) -> Result<Loaded>
    where
        F: FnOnce(&LocalNode, ValueId) -> Result<()>,
    {
        let loaded = self.load(id, LoadOptions::default()).await?;
        if loaded.is_available() {
            migrate(self, id)?;
        }
        Ok(loaded)
    }

    /// Append group changes in this node's session.
    ///
    /// The change builders check roles themselves.
    fn change_group<F>(&self, group: ValueId, build: F) -> Result<()>
    where
        F: FnOnce(&LocalNode, &mut NodeState) -> Result<Vec<Change>>,
    {
        {
            let mut guard = self.state();
            let state = &mut *guard;
            let kind = state.host.require(&group)?.kind();
            if !kind.is_identity() {
                return Err(perms::PermsError::NotAGroup(group).into());
            }
            let changes = build(self, state)?;
            if changes.is_empty() {
                return Ok(());
            }
            let session = self.own_session(state, group);
            self.append_as(state, group, &self.inner.agent, session, &changes)?;
            self.schedule_flush(state);
        }
        self.dispatch();
        Ok(())
    }
}
