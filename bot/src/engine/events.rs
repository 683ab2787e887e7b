use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Platform snowflake of a guild.
pub type GuildId = u64;

/// Platform snowflake of a member account.
pub type UserId = u64;

/// Platform snowflake of a role.
pub type RoleId = u64;

/// Platform snowflake of a (voice) channel.
pub type ChannelId = u64;

/// A member's voice state as the platform reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceState {
    /// `None` when the member is not connected to voice.
    pub channel_id: Option<ChannelId>,
    pub muted: bool,
    pub deafened: bool,
}

impl VoiceState {
    pub fn in_channel(channel_id: ChannelId, muted: bool, deafened: bool) -> Self {
        Self {
            channel_id: Some(channel_id),
            muted,
            deafened,
        }
    }
}

/// Signed mute/deafen change between two voice states: +1 set, -1 cleared, 0 unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoiceDelta {
    pub mute: i8,
    pub deafen: i8,
}

impl VoiceDelta {
    pub fn between(before: &VoiceState, after: &VoiceState) -> Self {
        Self {
            mute: flag_delta(before.muted, after.muted),
            deafen: flag_delta(before.deafened, after.deafened),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mute == 0 && self.deafen == 0
    }
}

fn flag_delta(before: bool, after: bool) -> i8 {
    match (before, after) {
        (false, true) => 1,
        (true, false) => -1,
        _ => 0,
    }
}

/// Roles added and removed between two member snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleDelta {
    pub added: HashSet<RoleId>,
    pub removed: HashSet<RoleId>,
}

impl RoleDelta {
    pub fn between(before: &HashSet<RoleId>, after: &HashSet<RoleId>) -> Self {
        Self {
            added: after.difference(before).copied().collect(),
            removed: before.difference(after).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
