use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::OnceCell;
use tracing::debug;

use super::constraints::{ConstraintIntent, CruConstraints};
use super::contingent::ContingentTable;
use super::directive::{Directive, DirectiveKind};
use super::events::{ChannelId, GuildId, RoleId, UserId};
use crate::db::models::{PresetMessageRow, ServerRow};
use crate::db::queries;

/// Kinds of canned moderation reasons a guild can configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetMessageKind {
    ChannelMuteTemporary,
    ChannelMutePermanent,
    JailTemporary,
    JailPermanent,
}

impl PresetMessageKind {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::ChannelMuteTemporary),
            1 => Some(Self::ChannelMutePermanent),
            2 => Some(Self::JailTemporary),
            3 => Some(Self::JailPermanent),
            _ => None,
        }
    }
}

/// In-memory state for a guild: configuration plus directive indexes.
pub struct Server {
    pub id: GuildId,
    command_prefix: String,
    pub log_channel_id: Option<ChannelId>,
    pub jail_role_id: Option<RoleId>,
    pub auto_mute_persist: bool,
    pub auto_deafen_persist: bool,
    pub auto_role_persist: bool,
    /// Empty means commands are accepted everywhere.
    command_channels: HashSet<ChannelId>,
    preset_messages: HashMap<PresetMessageKind, Vec<String>>,
    /// `None` marks an intent with nothing configured.
    constraints: DashMap<ConstraintIntent, Option<Arc<CruConstraints>>>,
    contingent_roles: OnceCell<Arc<ContingentTable>>,
    /// Directives by role id and by channel id, each list behind its own lock.
    role_directives: DashMap<RoleId, Mutex<Vec<Directive>>>,
    mute_directives: DashMap<ChannelId, Mutex<Vec<Directive>>>,
    db: Option<SqlitePool>,
}

impl Server {
    /// A guild with default settings, as created on first reference.
    pub fn new(id: GuildId, default_prefix: &str, db: Option<SqlitePool>) -> Self {
        Self {
            id,
            command_prefix: default_prefix.to_string(),
            log_channel_id: None,
            jail_role_id: None,
            auto_mute_persist: true,
            auto_deafen_persist: true,
            auto_role_persist: false,
            command_channels: HashSet::new(),
            preset_messages: HashMap::new(),
            constraints: DashMap::new(),
            contingent_roles: OnceCell::new(),
            role_directives: DashMap::new(),
            mute_directives: DashMap::new(),
            db,
        }
    }

    pub fn from_rows(
        row: &ServerRow,
        command_channels: Vec<ChannelId>,
        presets: &[PresetMessageRow],
        default_prefix: &str,
        db: Option<SqlitePool>,
    ) -> Self {
        let mut preset_messages: HashMap<PresetMessageKind, Vec<String>> = HashMap::new();
        // Rows arrive ordered by type then position.
        for preset in presets {
            if let Some(kind) = PresetMessageKind::from_code(preset.message_type) {
                preset_messages
                    .entry(kind)
                    .or_default()
                    .push(preset.message_text.clone());
            }
        }

        Self {
            command_prefix: row
                .command_prefix
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| default_prefix.to_string()),
            log_channel_id: row.log_channel_id.map(|id| id as u64),
            jail_role_id: row.jail_role_id.map(|id| id as u64),
            auto_mute_persist: row.auto_mute_persist != 0,
            auto_deafen_persist: row.auto_deafen_persist != 0,
            auto_role_persist: row.auto_role_persist != 0,
            command_channels: command_channels.into_iter().collect(),
            preset_messages,
            ..Self::new(row.id as u64, default_prefix, db)
        }
    }

    // ── Configuration ───────────────────────────────────────────────

    pub fn command_prefix(&self) -> &str {
        &self.command_prefix
    }

    pub fn is_command_channel(&self, channel_id: ChannelId) -> bool {
        self.command_channels.is_empty() || self.command_channels.contains(&channel_id)
    }

    /// Preset message number `n` (1-based) of a kind.
    pub fn preset_message(&self, kind: PresetMessageKind, n: usize) -> Option<&str> {
        let index = n.checked_sub(1)?;
        self.preset_messages
            .get(&kind)?
            .get(index)
            .map(String::as_str)
    }

    // ── Constraints ─────────────────────────────────────────────────

    /// Whether the caller passes the constraints configured for `intent`.
    /// An intent without configured constraints allows everyone.
    pub async fn user_matches_constraints(
        &self,
        intent: ConstraintIntent,
        channel_id: Option<ChannelId>,
        role_ids: Option<&[RoleId]>,
        user_id: Option<UserId>,
    ) -> Result<bool, sqlx::Error> {
        let constraints = match self.constraints.get(&intent).map(|c| c.clone()) {
            Some(cached) => cached,
            None => {
                let loaded = self.load_constraints(intent).await?;
                self.constraints
                    .entry(intent)
                    .or_insert(loaded)
                    .clone()
            }
        };

        Ok(constraints.is_none_or(|c| c.matches(channel_id, role_ids, user_id)))
    }

    async fn load_constraints(
        &self,
        intent: ConstraintIntent,
    ) -> Result<Option<Arc<CruConstraints>>, sqlx::Error> {
        let Some(pool) = &self.db else {
            return Ok(None);
        };
        let generic = queries::constraints::get_generic_constraints(pool, self.id, intent.code()).await?;
        let settings =
            queries::constraints::get_role_constraint_settings(pool, self.id, intent.code()).await?;
        let roles = queries::constraints::get_role_constraints(pool, self.id, intent.code()).await?;
        debug!(guild_id = self.id, ?intent, "loaded constraints");
        Ok(CruConstraints::from_rows(&generic, settings.as_ref(), &roles).map(Arc::new))
    }

    // ── Contingent roles ────────────────────────────────────────────

    /// The guild's contingent role table, loaded on first use.
    pub async fn contingent_roles(&self) -> Result<Arc<ContingentTable>, sqlx::Error> {
        self.contingent_roles
            .get_or_try_init(|| async {
                let Some(pool) = &self.db else {
                    return Ok(Arc::new(ContingentTable::default()));
                };
                let rows = queries::contingent_roles::list_contingent_roles(pool, self.id).await?;
                Ok::<_, sqlx::Error>(Arc::new(ContingentTable::from_rows(&rows)))
            })
            .await
            .cloned()
    }

    // ── Directive indexes ───────────────────────────────────────────

    /// Insert a directive, or replace the one with the same key.
    pub fn index_directive(&self, directive: Directive) {
        let list = match directive.key.kind {
            DirectiveKind::Role(role_id) => self.role_directives.entry(role_id).or_default(),
            DirectiveKind::Mute(channel_id) => self.mute_directives.entry(channel_id).or_default(),
        };
        let mut list = list.lock();
        match list.iter_mut().find(|d| d.key == directive.key) {
            Some(existing) => existing.expiry = directive.expiry,
            None => list.push(directive),
        }
    }

    pub fn unindex_directive(&self, directive: &Directive) {
        let list = match directive.key.kind {
            DirectiveKind::Role(role_id) => self.role_directives.get(&role_id),
            DirectiveKind::Mute(channel_id) => self.mute_directives.get(&channel_id),
        };
        if let Some(list) = list {
            list.lock().retain(|d| d.key != directive.key);
        }
    }

    /// Copy of all directives for a role.
    pub fn role_directives(&self, role_id: RoleId) -> Vec<Directive> {
        self.role_directives
            .get(&role_id)
            .map(|list| list.lock().clone())
            .unwrap_or_default()
    }

    /// Copy of all mute directives for a voice channel.
    pub fn mute_directives(&self, channel_id: ChannelId) -> Vec<Directive> {
        self.mute_directives
            .get(&channel_id)
            .map(|list| list.lock().clone())
            .unwrap_or_default()
    }

    /// Role ids with at least one directive.
    pub fn persisted_role_ids(&self) -> Vec<RoleId> {
        self.role_directives
            .iter()
            .filter(|entry| !entry.value().lock().is_empty())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Channel ids with at least one mute directive.
    pub fn muted_channel_ids(&self) -> Vec<ChannelId> {
        self.mute_directives
            .iter()
            .filter(|entry| !entry.value().lock().is_empty())
            .map(|entry| *entry.key())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::{create_pool, run_migrations};
    use crate::engine::directive::DirectiveKey;
    use chrono::{Duration, Utc};

    async fn setup_db() -> SqlitePool {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn row(id: i64, prefix: Option<&str>) -> ServerRow {
        ServerRow {
            id,
            command_prefix: prefix.map(str::to_string),
            log_channel_id: None,
            jail_role_id: Some(42),
            auto_mute_persist: 0,
            auto_deafen_persist: 1,
            auto_role_persist: 1,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_defaults_for_new_server() {
        let server = Server::new(1, "+", None);
        assert_eq!(server.command_prefix(), "+");
        assert!(server.auto_mute_persist);
        assert!(server.auto_deafen_persist);
        assert!(!server.auto_role_persist);
        assert!(server.is_command_channel(12345));
    }

    #[test]
    fn test_from_rows() {
        let presets = vec![
            PresetMessageRow {
                server_id: 1,
                message_type: PresetMessageKind::JailTemporary.code(),
                position: 1,
                message_text: "first".into(),
            },
            PresetMessageRow {
                server_id: 1,
                message_type: PresetMessageKind::JailTemporary.code(),
                position: 2,
                message_text: "second".into(),
            },
        ];
        let server = Server::from_rows(&row(1, None), vec![100], &presets, "+", None);

        assert_eq!(server.command_prefix(), "+");
        assert_eq!(server.jail_role_id, Some(42));
        assert!(!server.auto_mute_persist);
        assert!(server.auto_role_persist);
        assert!(server.is_command_channel(100));
        assert!(!server.is_command_channel(101));
        assert_eq!(
            server.preset_message(PresetMessageKind::JailTemporary, 2),
            Some("second")
        );
        assert_eq!(server.preset_message(PresetMessageKind::JailTemporary, 0), None);
        assert_eq!(server.preset_message(PresetMessageKind::JailTemporary, 3), None);
        assert_eq!(server.preset_message(PresetMessageKind::JailPermanent, 1), None);

        let custom = Server::from_rows(&row(2, Some("!")), vec![], &[], "+", None);
        assert_eq!(custom.command_prefix(), "!");
    }

    #[test]
    fn test_directive_index_upsert_and_snapshot() {
        let server = Server::new(1, "+", None);
        let expiry = Utc::now() + Duration::minutes(5);

        server.index_directive(Directive::new(DirectiveKey::role(1, 10, 7), None));
        server.index_directive(Directive::new(DirectiveKey::role(1, 11, 7), None));
        server.index_directive(Directive::new(DirectiveKey::role(1, 10, 7), Some(expiry)));
        server.index_directive(Directive::new(DirectiveKey::mute(1, 10, 99), None));

        let snapshot = server.role_directives(7);
        assert_eq!(snapshot.len(), 2);
        assert!(
            snapshot
                .iter()
                .any(|d| d.key.user_id == 10 && d.expiry == Some(expiry))
        );

        server.unindex_directive(&Directive::new(DirectiveKey::role(1, 11, 7), None));
        assert_eq!(server.role_directives(7).len(), 1);
        assert_eq!(server.persisted_role_ids(), vec![7]);
        assert_eq!(server.muted_channel_ids(), vec![99]);
        assert!(server.mute_directives(98).is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_intent_allows() {
        let pool = setup_db().await;
        let server = Server::new(1, "+", Some(pool));
        assert!(
            server
                .user_matches_constraints(ConstraintIntent::JailPermanent, Some(1), Some(&[2]), Some(3))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_constraints_loaded_and_cached() {
        let pool = setup_db().await;
        let intent = ConstraintIntent::RolePersistRemove;
        queries::constraints::add_generic_constraint(&pool, 1, intent.code(), 1, true, 500)
            .await
            .unwrap();

        let server = Server::new(1, "+", Some(pool.clone()));
        assert!(
            server
                .user_matches_constraints(intent, Some(500), None, None)
                .await
                .unwrap()
        );
        assert!(
            !server
                .user_matches_constraints(intent, Some(501), None, None)
                .await
                .unwrap()
        );

        // Cached until the server is reloaded
        queries::constraints::add_generic_constraint(&pool, 1, intent.code(), 1, true, 501)
            .await
            .unwrap();
        assert!(
            !server
                .user_matches_constraints(intent, Some(501), None, None)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_contingent_roles_loaded_once() {
        let pool = setup_db().await;
        queries::contingent_roles::add_contingent_role(&pool, 1, 10, 11)
            .await
            .unwrap();

        let server = Server::new(1, "+", Some(pool));
        let table = server.contingent_roles().await.unwrap();
        assert_eq!(table.contingents(10), Some(&HashSet::from([11])));

        let again = server.contingent_roles().await.unwrap();
        assert!(Arc::ptr_eq(&table, &again));
    }
}
