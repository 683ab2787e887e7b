//! Privileged moderation operations. Every operation checks the caller against
//! the constraints of its intent before touching any state.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use super::constraints::ConstraintIntent;
use super::directive::DirectiveKey;
use super::error::ReconcileResult;
use super::events::{ChannelId, GuildId, RoleId, UserId};
use super::registry::Registry;
use super::server::{PresetMessageKind, Server};
use super::validation::{
    MAX_CHANNEL_MUTE_DURATION, MAX_JAIL_DURATION, MAX_ROLE_PERSIST_DURATION, MIN_DURATION,
    render_preset, validate_duration,
};

/// Who issued a moderation command, and where.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub role_ids: Vec<RoleId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModerationOutcome {
    NoPermission,
    InvalidDuration(String),
    UnknownPreset,
    NoEditableRoles,
    NotInVoice,
    NotPersisted,
    NoJailRole,
    JailRoleNotEditable,
    RolesPersisted {
        roles: Vec<RoleId>,
        /// Requested roles the bot may not edit.
        skipped: Vec<RoleId>,
        expiry: Option<DateTime<Utc>>,
        /// Whether the roles were given right away (the target is in the guild).
        applied: bool,
    },
    RoleUnpersisted {
        taken_off: bool,
    },
    ChannelMuted {
        channel_id: ChannelId,
        expiry: Option<DateTime<Utc>>,
        reason: Option<String>,
        muted_now: bool,
    },
    ChannelUnmuted {
        unmuted_now: bool,
    },
    Jailed {
        role_id: RoleId,
        expiry: Option<DateTime<Utc>>,
        reason: Option<String>,
        applied: bool,
    },
}

/// Expiry for an optional duration, after checking it against `max`.
fn checked_expiry(
    duration: Option<Duration>,
    max: Duration,
) -> Result<Option<DateTime<Utc>>, String> {
    let Some(duration) = duration else {
        return Ok(None);
    };
    validate_duration(duration, MIN_DURATION, max)?;
    let delta = chrono::Duration::from_std(duration).map_err(|e| e.to_string())?;
    Ok(Some(Utc::now() + delta))
}

/// Pick the temporary or permanent variant.
fn by_duration<T>(duration: Option<Duration>, temporary: T, permanent: T) -> T {
    if duration.is_some() { temporary } else { permanent }
}

/// Resolve preset reason `n`, filling in the duration. `Err` when the guild has no such preset.
fn preset_reason(
    server: &Server,
    kind: PresetMessageKind,
    n: Option<usize>,
    duration: Option<Duration>,
) -> Result<Option<String>, ()> {
    match n {
        None => Ok(None),
        Some(n) => server
            .preset_message(kind, n)
            .map(|template| Some(render_preset(template, duration)))
            .ok_or(()),
    }
}

impl Registry {
    async fn caller_allowed(
        &self,
        server: &Server,
        intent: ConstraintIntent,
        caller: &Caller,
    ) -> ReconcileResult<bool> {
        Ok(server
            .user_matches_constraints(
                intent,
                Some(caller.channel_id),
                Some(caller.role_ids.as_slice()),
                Some(caller.user_id),
            )
            .await?)
    }

    /// Persist roles on a member, optionally for a limited time.
    pub async fn persist_roles(
        &self,
        caller: &Caller,
        guild_id: GuildId,
        target: UserId,
        role_ids: &[RoleId],
        duration: Option<Duration>,
    ) -> ReconcileResult<ModerationOutcome> {
        let expiry = match checked_expiry(duration, MAX_ROLE_PERSIST_DURATION) {
            Ok(expiry) => expiry,
            Err(e) => return Ok(ModerationOutcome::InvalidDuration(e)),
        };
        let server = self.get_or_create_server(guild_id).await?;
        let intent = by_duration(
            duration,
            ConstraintIntent::RolePersistGiveTemporary,
            ConstraintIntent::RolePersistGivePermanent,
        );
        if !self.caller_allowed(&server, intent, caller).await? {
            return Ok(ModerationOutcome::NoPermission);
        }

        let (roles, skipped): (Vec<RoleId>, Vec<RoleId>) = role_ids
            .iter()
            .partition(|r| self.platform().may_edit_role(guild_id, **r));
        if roles.is_empty() {
            return Ok(ModerationOutcome::NoEditableRoles);
        }

        let applied = self.give_roles(&server, target, &roles, expiry).await?;
        info!(guild_id, user_id = target, ?roles, ?expiry, "roles persisted");
        Ok(ModerationOutcome::RolesPersisted {
            roles,
            skipped,
            expiry,
            applied,
        })
    }

    /// Resolve contingents for giving `roles`, apply them, then persist them.
    /// Returns whether the target was in the guild.
    async fn give_roles(
        &self,
        server: &Server,
        target: UserId,
        roles: &[RoleId],
        expiry: Option<DateTime<Utc>>,
    ) -> ReconcileResult<bool> {
        let current = self.platform().member_roles(server.id, target).await?;
        if let Some(current) = &current {
            let user = self.get_or_create_user(server.id, target).await?;
            let mut after = current.clone();
            after.extend(roles.iter().copied());
            self.reconcile_roles(server, &user, current, &after, current)
                .await?;
        }
        self.add_role_directives(server.id, target, roles, expiry)
            .await?;
        Ok(current.is_some())
    }

    /// Drop a member's role directive and take the role off them.
    pub async fn unpersist_role(
        &self,
        caller: &Caller,
        guild_id: GuildId,
        target: UserId,
        role_id: RoleId,
    ) -> ReconcileResult<ModerationOutcome> {
        let server = self.get_or_create_server(guild_id).await?;
        if !self
            .caller_allowed(&server, ConstraintIntent::RolePersistRemove, caller)
            .await?
        {
            return Ok(ModerationOutcome::NoPermission);
        }

        if !self
            .remove_directive(DirectiveKey::role(guild_id, target, role_id))
            .await?
        {
            return Ok(ModerationOutcome::NotPersisted);
        }

        let mut taken_off = false;
        if let Some(current) = self.platform().member_roles(guild_id, target).await?
            && current.contains(&role_id)
            && self.platform().may_edit_role(guild_id, role_id)
        {
            let user = self.get_or_create_user(guild_id, target).await?;
            let after: HashSet<RoleId> = current.iter().copied().filter(|r| *r != role_id).collect();
            self.reconcile_roles(&server, &user, &current, &after, &current)
                .await?;
            taken_off = true;
        }
        info!(guild_id, user_id = target, role_id, taken_off, "role unpersisted");
        Ok(ModerationOutcome::RoleUnpersisted { taken_off })
    }

    /// Mute a member in the voice channel they are currently in.
    pub async fn channel_mute(
        &self,
        caller: &Caller,
        guild_id: GuildId,
        target: UserId,
        duration: Option<Duration>,
        preset: Option<usize>,
    ) -> ReconcileResult<ModerationOutcome> {
        let expiry = match checked_expiry(duration, MAX_CHANNEL_MUTE_DURATION) {
            Ok(expiry) => expiry,
            Err(e) => return Ok(ModerationOutcome::InvalidDuration(e)),
        };
        let server = self.get_or_create_server(guild_id).await?;
        let intent = by_duration(
            duration,
            ConstraintIntent::ChannelMuteGiveTemporary,
            ConstraintIntent::ChannelMuteGivePermanent,
        );
        if !self.caller_allowed(&server, intent, caller).await? {
            return Ok(ModerationOutcome::NoPermission);
        }

        let kind = by_duration(
            duration,
            PresetMessageKind::ChannelMuteTemporary,
            PresetMessageKind::ChannelMutePermanent,
        );
        let Ok(reason) = preset_reason(&server, kind, preset, duration) else {
            return Ok(ModerationOutcome::UnknownPreset);
        };

        let Some(voice) = self.platform().voice_state(guild_id, target).await? else {
            return Ok(ModerationOutcome::NotInVoice);
        };
        let Some(channel_id) = voice.channel_id else {
            return Ok(ModerationOutcome::NotInVoice);
        };

        self.add_directive(DirectiveKey::mute(guild_id, target, channel_id), expiry)
            .await?;
        let muted_now = !voice.muted;
        if muted_now {
            let user = self.get_or_create_user(guild_id, target).await?;
            self.set_mute(&user, true).await?;
        }

        info!(guild_id, user_id = target, channel_id, ?expiry, "channel mute persisted");
        Ok(ModerationOutcome::ChannelMuted {
            channel_id,
            expiry,
            reason,
            muted_now,
        })
    }

    /// Lift a member's mute directive for a channel.
    pub async fn channel_unmute(
        &self,
        caller: &Caller,
        guild_id: GuildId,
        target: UserId,
        channel_id: ChannelId,
    ) -> ReconcileResult<ModerationOutcome> {
        let server = self.get_or_create_server(guild_id).await?;
        if !self
            .caller_allowed(&server, ConstraintIntent::ChannelMuteRemove, caller)
            .await?
        {
            return Ok(ModerationOutcome::NoPermission);
        }

        if !self
            .remove_directive(DirectiveKey::mute(guild_id, target, channel_id))
            .await?
        {
            return Ok(ModerationOutcome::NotPersisted);
        }

        let mut unmuted_now = false;
        if let Some(voice) = self.platform().voice_state(guild_id, target).await?
            && voice.channel_id == Some(channel_id)
            && voice.muted
        {
            let user = self.get_or_create_user(guild_id, target).await?;
            self.set_mute(&user, false).await?;
            unmuted_now = true;
        }
        info!(guild_id, user_id = target, channel_id, unmuted_now, "channel mute lifted");
        Ok(ModerationOutcome::ChannelUnmuted { unmuted_now })
    }

    /// Give a member the guild's jail role, optionally for a limited time.
    pub async fn jail(
        &self,
        caller: &Caller,
        guild_id: GuildId,
        target: UserId,
        duration: Option<Duration>,
        preset: Option<usize>,
    ) -> ReconcileResult<ModerationOutcome> {
        let expiry = match checked_expiry(duration, MAX_JAIL_DURATION) {
            Ok(expiry) => expiry,
            Err(e) => return Ok(ModerationOutcome::InvalidDuration(e)),
        };
        let server = self.get_or_create_server(guild_id).await?;
        let intent = by_duration(
            duration,
            ConstraintIntent::JailTemporary,
            ConstraintIntent::JailPermanent,
        );
        if !self.caller_allowed(&server, intent, caller).await? {
            return Ok(ModerationOutcome::NoPermission);
        }

        let kind = by_duration(
            duration,
            PresetMessageKind::JailTemporary,
            PresetMessageKind::JailPermanent,
        );
        let Ok(reason) = preset_reason(&server, kind, preset, duration) else {
            return Ok(ModerationOutcome::UnknownPreset);
        };

        let Some(role_id) = server.jail_role_id else {
            return Ok(ModerationOutcome::NoJailRole);
        };
        if !self.platform().may_edit_role(guild_id, role_id) {
            return Ok(ModerationOutcome::JailRoleNotEditable);
        }

        let applied = self.give_roles(&server, target, &[role_id], expiry).await?;
        info!(guild_id, user_id = target, role_id, ?expiry, "member jailed");
        Ok(ModerationOutcome::Jailed {
            role_id,
            expiry,
            reason,
            applied,
        })
    }
}
