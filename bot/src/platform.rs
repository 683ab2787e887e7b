//! Boundary to the chat platform. The engine only talks to the platform
//! through [`PlatformClient`]; the gateway/transport lives behind it.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::engine::events::{GuildId, RoleId, UserId, VoiceState};

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("platform unavailable")]
    Unavailable,
    #[error("member {user_id} not found in guild {guild_id}")]
    MemberNotFound { guild_id: GuildId, user_id: UserId },
    #[error("missing permission: {0}")]
    Forbidden(String),
    #[error("platform request failed: {0}")]
    Request(String),
}

/// Outbound mutations and state lookups against the chat platform.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn add_roles(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        roles: &[RoleId],
    ) -> Result<(), PlatformError>;

    async fn remove_roles(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        roles: &[RoleId],
    ) -> Result<(), PlatformError>;

    async fn set_mute(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        muted: bool,
    ) -> Result<(), PlatformError>;

    async fn set_deafen(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        deafened: bool,
    ) -> Result<(), PlatformError>;

    /// Current roles of a member, `None` if they are not in the guild.
    async fn member_roles(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> Result<Option<HashSet<RoleId>>, PlatformError>;

    /// Current voice state of a member, `None` if they are not in the guild.
    async fn voice_state(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> Result<Option<VoiceState>, PlatformError>;

    /// Whether the bot sits above `role_id` in the guild's role hierarchy.
    fn may_edit_role(&self, guild_id: GuildId, role_id: RoleId) -> bool;

    /// Guilds the bot is currently in.
    async fn guild_ids(&self) -> Result<Vec<GuildId>, PlatformError>;
}

/// Client used when no gateway is attached. Sees no members, so expiring
/// directives are dropped without a reversal and mutations fail.
#[derive(Debug, Default)]
pub struct OfflinePlatform;

#[async_trait]
impl PlatformClient for OfflinePlatform {
    async fn add_roles(&self, _: GuildId, _: UserId, _: &[RoleId]) -> Result<(), PlatformError> {
        Err(PlatformError::Unavailable)
    }

    async fn remove_roles(
        &self,
        _: GuildId,
        _: UserId,
        _: &[RoleId],
    ) -> Result<(), PlatformError> {
        Err(PlatformError::Unavailable)
    }

    async fn set_mute(&self, _: GuildId, _: UserId, _: bool) -> Result<(), PlatformError> {
        Err(PlatformError::Unavailable)
    }

    async fn set_deafen(&self, _: GuildId, _: UserId, _: bool) -> Result<(), PlatformError> {
        Err(PlatformError::Unavailable)
    }

    async fn member_roles(
        &self,
        _: GuildId,
        _: UserId,
    ) -> Result<Option<HashSet<RoleId>>, PlatformError> {
        Ok(None)
    }

    async fn voice_state(&self, _: GuildId, _: UserId) -> Result<Option<VoiceState>, PlatformError> {
        Ok(None)
    }

    fn may_edit_role(&self, _: GuildId, _: RoleId) -> bool {
        false
    }

    async fn guild_ids(&self) -> Result<Vec<GuildId>, PlatformError> {
        Ok(Vec::new())
    }
}
