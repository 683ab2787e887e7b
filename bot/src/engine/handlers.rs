//! Inbound platform notifications. Each handler first checks the echo
//! suppressor so the bot's own mutations are not processed twice.

use std::collections::HashSet;

use tracing::{debug, info};

use super::contingent::Resolution;
use super::directive::DirectiveKey;
use super::error::ReconcileResult;
use super::events::{GuildId, RoleDelta, RoleId, UserId, VoiceDelta, VoiceState};
use super::registry::Registry;
use crate::db::queries;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// Nothing relevant changed.
    Ignored,
    /// The change was caused by the bot and its pending tokens were consumed.
    SelfCaused,
    Processed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberUpdateOutcome {
    Ignored,
    SelfCaused,
    Processed(Resolution),
}

impl Registry {
    /// A member's voice state changed.
    pub async fn on_voice_state_updated(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        before: VoiceState,
        after: VoiceState,
    ) -> ReconcileResult<NotificationOutcome> {
        // Leaving voice needs nothing
        let Some(channel_id) = after.channel_id else {
            return Ok(NotificationOutcome::Ignored);
        };

        let server = self.get_or_create_server(guild_id).await?;
        let user = self.get_or_create_user(guild_id, user_id).await?;

        if user.echo.consume_voice(VoiceDelta::between(&before, &after)) {
            debug!(guild_id, user_id, "voice change was self-caused");
            return Ok(NotificationOutcome::SelfCaused);
        }

        if before.channel_id.is_none() {
            if user.global_mute_persisted() && !after.muted {
                self.set_mute(&user, true).await?;
            }
            if user.global_deafen_persisted() && !after.deafened {
                self.set_deafen(&user, true).await?;
            }
        } else {
            let mute_changed = before.muted != after.muted;
            let deafen_changed = before.deafened != after.deafened;

            if mute_changed {
                if !after.muted
                    && self
                        .remove_directive(DirectiveKey::mute(guild_id, user_id, channel_id))
                        .await?
                {
                    info!(guild_id, user_id, channel_id, "channel mute lifted by unmute");
                }
                if server.auto_mute_persist {
                    user.set_global_mute_persisted(after.muted);
                }
            }
            if deafen_changed && server.auto_deafen_persist {
                user.set_global_deafen_persisted(after.deafened);
            }
            self.save_user(&user).await?;
        }

        // Moved channels: follow the new channel's mute directive
        if before.channel_id != after.channel_id && !user.global_mute_persisted() {
            let persisted = user.has_mute_directive(channel_id);
            if persisted != after.muted {
                self.set_mute(&user, persisted).await?;
            }
        }

        Ok(NotificationOutcome::Processed)
    }

    /// A member's roles changed.
    pub async fn on_member_updated(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        before: &HashSet<RoleId>,
        after: &HashSet<RoleId>,
    ) -> ReconcileResult<MemberUpdateOutcome> {
        let delta = RoleDelta::between(before, after);
        if delta.is_empty() {
            return Ok(MemberUpdateOutcome::Ignored);
        }

        let server = self.get_or_create_server(guild_id).await?;
        let user = self.get_or_create_user(guild_id, user_id).await?;
        if user.echo.consume_roles(&delta) {
            debug!(guild_id, user_id, "role change was self-caused");
            return Ok(MemberUpdateOutcome::SelfCaused);
        }

        if server.auto_role_persist && !delta.added.is_empty() {
            let added: Vec<RoleId> = delta.added.iter().copied().collect();
            self.add_role_directives(guild_id, user_id, &added, None)
                .await?;
        }
        if !delta.removed.is_empty() {
            let removed: Vec<RoleId> = delta.removed.iter().copied().collect();
            self.remove_role_directives(guild_id, user_id, &removed)
                .await?;
        }

        let resolution = self
            .reconcile_roles(&server, &user, before, after, after)
            .await?;
        Ok(MemberUpdateOutcome::Processed(resolution))
    }

    /// A member (re)joined the guild. Re-adds their persisted roles, except
    /// roles a held trigger still suppresses. Returns the roles added.
    pub async fn on_member_joined(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        current_roles: &HashSet<RoleId>,
    ) -> ReconcileResult<Vec<RoleId>> {
        let user = self.get_or_create_user(guild_id, user_id).await?;
        let persisted = user.persisted_role_ids();
        if persisted.is_empty() {
            return Ok(Vec::new());
        }

        let suppressed: HashSet<RoleId> = {
            let mut suppression = user.lock_suppression(self.db()).await?;
            let stale: Vec<RoleId> = suppression
                .keys()
                .filter(|trigger| !persisted.contains(*trigger))
                .copied()
                .collect();
            for trigger in stale {
                suppression.remove(&trigger);
                if let Some(pool) = self.db() {
                    queries::contingent_roles::remove_active_contingent_roles(
                        pool, guild_id, user_id, trigger,
                    )
                    .await?;
                }
            }
            suppression.values().flatten().copied().collect()
        };

        let mut to_add: Vec<RoleId> = persisted
            .iter()
            .filter(|r| !suppressed.contains(*r) && !current_roles.contains(*r))
            .filter(|r| self.platform().may_edit_role(guild_id, **r))
            .copied()
            .collect();
        to_add.sort_unstable();
        if to_add.is_empty() {
            return Ok(to_add);
        }

        let none: [RoleId; 0] = [];
        user.echo.expect_roles(&to_add, &none);
        if let Err(e) = self.platform().add_roles(guild_id, user_id, &to_add).await {
            user.echo.withdraw_roles(&to_add, &none);
            return Err(e.into());
        }
        info!(guild_id, user_id, count = to_add.len(), "restored persisted roles on join");
        Ok(to_add)
    }
}
