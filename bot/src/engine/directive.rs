use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{ChannelId, GuildId, RoleId, UserId};
use crate::db::models::{MutePersistRow, RolePersistRow};

/// What a directive enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum DirectiveKind {
    /// The member keeps this role.
    Role(RoleId),
    /// The member stays server-muted while in this voice channel.
    Mute(ChannelId),
}

/// Identity of a directive: at most one exists per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirectiveKey {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub kind: DirectiveKind,
}

impl DirectiveKey {
    pub fn role(guild_id: GuildId, user_id: UserId, role_id: RoleId) -> Self {
        Self {
            guild_id,
            user_id,
            kind: DirectiveKind::Role(role_id),
        }
    }

    pub fn mute(guild_id: GuildId, user_id: UserId, channel_id: ChannelId) -> Self {
        Self {
            guild_id,
            user_id,
            kind: DirectiveKind::Mute(channel_id),
        }
    }
}

/// A persisted mute or role. `expiry == None` is permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub key: DirectiveKey,
    pub expiry: Option<DateTime<Utc>>,
}

impl Directive {
    pub fn new(key: DirectiveKey, expiry: Option<DateTime<Utc>>) -> Self {
        Self { key, expiry }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|e| e <= now)
    }
}

impl From<&RolePersistRow> for Directive {
    fn from(row: &RolePersistRow) -> Self {
        Self::new(
            DirectiveKey::role(
                row.server_id as u64,
                row.user_id as u64,
                row.role_id as u64,
            ),
            row.expiry,
        )
    }
}

impl From<&MutePersistRow> for Directive {
    fn from(row: &MutePersistRow) -> Self {
        Self::new(
            DirectiveKey::mute(
                row.server_id as u64,
                row.user_id as u64,
                row.channel_id as u64,
            ),
            row.expiry,
        )
    }
}
