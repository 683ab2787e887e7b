use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Snowflake ids are u64 on the platform and stored as i64 in SQLite
// (cast to/from u64, same bit pattern).

/// A stored guild configuration row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ServerRow {
    pub id: i64,
    pub command_prefix: Option<String>,
    pub log_channel_id: Option<i64>,
    pub jail_role_id: Option<i64>,
    pub auto_mute_persist: i32,
    pub auto_deafen_persist: i32,
    pub auto_role_persist: i32,
    pub created_at: String,
    pub updated_at: String,
}

/// A channel in which commands are accepted.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CommandChannelRow {
    pub server_id: i64,
    pub channel_id: i64,
}

/// One entry of a guild's preset message catalog.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PresetMessageRow {
    pub server_id: i64,
    pub message_type: i64,
    pub position: i64,
    pub message_text: String,
}

/// Per-guild member state.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRow {
    pub server_id: i64,
    pub user_id: i64,
    pub global_mute_persisted: i32,
    pub global_deafen_persisted: i32,
}

/// A persisted role directive.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RolePersistRow {
    pub server_id: i64,
    pub user_id: i64,
    pub role_id: i64,
    pub expiry: Option<DateTime<Utc>>,
}

/// A persisted voice-channel mute directive.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MutePersistRow {
    pub server_id: i64,
    pub user_id: i64,
    pub channel_id: i64,
    pub expiry: Option<DateTime<Utc>>,
}

/// One (trigger, contingent) pair of a guild's contingent role table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContingentRoleRow {
    pub server_id: i64,
    pub role_id: i64,
    pub contingent_role_id: i64,
}

/// One role currently suppressed for a user because of a trigger role.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActiveContingentRoleRow {
    pub server_id: i64,
    pub user_id: i64,
    pub role_id: i64,
    pub contingent_role_id: i64,
}

/// A channel or user allow/deny entry for an intent.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GenericConstraintRow {
    pub server_id: i64,
    pub intent: i64,
    pub constraint_type: i64,
    pub whitelist: i32,
    pub data: i64,
}

/// Strictness flags of a role constraint for an intent.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RoleConstraintSettingsRow {
    pub server_id: i64,
    pub intent: i64,
    pub whitelist_strict: i32,
    pub blacklist_strict: i32,
}

/// A role listed in the whitelist (`whitelist = 1`) or blacklist half of a role constraint.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RoleConstraintRow {
    pub server_id: i64,
    pub intent: i64,
    pub role_id: i64,
    pub whitelist: i32,
}

/// Parameters for upserting a guild configuration (avoids too-many-arguments warning).
pub struct UpsertServerParams<'a> {
    pub id: u64,
    pub command_prefix: Option<&'a str>,
    pub log_channel_id: Option<u64>,
    pub jail_role_id: Option<u64>,
    pub auto_mute_persist: bool,
    pub auto_deafen_persist: bool,
    pub auto_role_persist: bool,
}
