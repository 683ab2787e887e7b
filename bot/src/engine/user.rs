use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};

use super::contingent::{SuppressionMap, suppression_from_rows};
use super::directive::{Directive, DirectiveKey, DirectiveKind};
use super::echo::EchoSuppressor;
use super::events::{ChannelId, GuildId, RoleId, UserId};
use crate::db::models::UserRow;
use crate::db::queries;

/// Per-guild state of a member.
#[derive(Debug)]
pub struct User {
    pub guild_id: GuildId,
    pub id: UserId,
    global_mute_persisted: AtomicBool,
    global_deafen_persisted: AtomicBool,
    roles: DashMap<RoleId, Directive>,
    mutes: DashMap<ChannelId, Directive>,
    pub echo: EchoSuppressor,
    /// Loaded on first use. The lock also serializes contingent resolution for this member.
    suppression: Mutex<SuppressionState>,
}

#[derive(Debug, Default)]
struct SuppressionState {
    loaded: bool,
    map: SuppressionMap,
}

impl User {
    pub fn new(guild_id: GuildId, id: UserId, mute_persisted: bool, deafen_persisted: bool) -> Self {
        Self {
            guild_id,
            id,
            global_mute_persisted: AtomicBool::new(mute_persisted),
            global_deafen_persisted: AtomicBool::new(deafen_persisted),
            roles: DashMap::new(),
            mutes: DashMap::new(),
            echo: EchoSuppressor::new(),
            suppression: Mutex::new(SuppressionState::default()),
        }
    }

    pub fn from_row(row: &UserRow) -> Self {
        Self::new(
            row.server_id as u64,
            row.user_id as u64,
            row.global_mute_persisted != 0,
            row.global_deafen_persisted != 0,
        )
    }

    // ── Global voice flags ──────────────────────────────────────────

    pub fn global_mute_persisted(&self) -> bool {
        self.global_mute_persisted.load(Ordering::Acquire)
    }

    pub fn global_deafen_persisted(&self) -> bool {
        self.global_deafen_persisted.load(Ordering::Acquire)
    }

    pub fn set_global_mute_persisted(&self, value: bool) {
        self.global_mute_persisted.store(value, Ordering::Release);
    }

    pub fn set_global_deafen_persisted(&self, value: bool) {
        self.global_deafen_persisted.store(value, Ordering::Release);
    }

    // ── Directives ──────────────────────────────────────────────────

    /// Insert or replace a directive. Returns the previous one for the key.
    pub fn put_directive(&self, directive: Directive) -> Option<Directive> {
        match directive.key.kind {
            DirectiveKind::Role(role_id) => self.roles.insert(role_id, directive),
            DirectiveKind::Mute(channel_id) => self.mutes.insert(channel_id, directive),
        }
    }

    pub fn take_directive(&self, key: &DirectiveKey) -> Option<Directive> {
        match key.kind {
            DirectiveKind::Role(role_id) => self.roles.remove(&role_id).map(|(_, d)| d),
            DirectiveKind::Mute(channel_id) => self.mutes.remove(&channel_id).map(|(_, d)| d),
        }
    }

    pub fn directive(&self, key: &DirectiveKey) -> Option<Directive> {
        match key.kind {
            DirectiveKind::Role(role_id) => self.roles.get(&role_id).map(|d| *d),
            DirectiveKind::Mute(channel_id) => self.mutes.get(&channel_id).map(|d| *d),
        }
    }

    pub fn role_directives(&self) -> Vec<Directive> {
        self.roles.iter().map(|d| *d.value()).collect()
    }

    pub fn persisted_role_ids(&self) -> HashSet<RoleId> {
        self.roles.iter().map(|d| *d.key()).collect()
    }

    pub fn mute_directives(&self) -> Vec<Directive> {
        self.mutes.iter().map(|d| *d.value()).collect()
    }

    pub fn muted_channel_ids(&self) -> HashSet<ChannelId> {
        self.mutes.iter().map(|d| *d.key()).collect()
    }

    pub fn has_mute_directive(&self, channel_id: ChannelId) -> bool {
        self.mutes.contains_key(&channel_id)
    }

    /// Every directive of this member.
    pub fn directives(&self) -> Vec<Directive> {
        let mut all = self.role_directives();
        all.extend(self.mute_directives());
        all
    }

    // ── Contingent suppression ──────────────────────────────────────

    /// Lock the suppression map, loading it from the store on first use.
    /// Held for the whole of a contingent resolution.
    pub async fn lock_suppression(
        &self,
        db: Option<&sqlx::SqlitePool>,
    ) -> Result<SuppressionGuard<'_>, sqlx::Error> {
        let mut guard = self.suppression.lock().await;
        if !guard.loaded {
            guard.map = match db {
                Some(pool) => {
                    let rows =
                        queries::contingent_roles::get_active_contingent_roles(pool, self.guild_id, self.id)
                            .await?;
                    suppression_from_rows(&rows)
                }
                None => SuppressionMap::new(),
            };
            guard.loaded = true;
        }
        Ok(SuppressionGuard { guard })
    }
}

/// Exclusive access to a member's loaded suppression map.
pub struct SuppressionGuard<'a> {
    guard: MutexGuard<'a, SuppressionState>,
}

impl std::ops::Deref for SuppressionGuard<'_> {
    type Target = SuppressionMap;

    fn deref(&self) -> &SuppressionMap {
        &self.guard.map
    }
}

impl std::ops::DerefMut for SuppressionGuard<'_> {
    fn deref_mut(&mut self) -> &mut SuppressionMap {
        &mut self.guard.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::{create_pool, run_migrations};
    use chrono::{Duration, Utc};

    #[test]
    fn test_directive_maps_keep_one_per_id() {
        let user = User::new(1, 2, false, false);
        let later = Utc::now() + Duration::minutes(3);

        assert!(user.put_directive(Directive::new(DirectiveKey::role(1, 2, 10), None)).is_none());
        let previous = user.put_directive(Directive::new(DirectiveKey::role(1, 2, 10), Some(later)));
        assert_eq!(previous.map(|d| d.expiry), Some(None));
        user.put_directive(Directive::new(DirectiveKey::mute(1, 2, 50), None));

        assert_eq!(user.role_directives().len(), 1);
        assert_eq!(user.persisted_role_ids(), HashSet::from([10]));
        assert!(user.has_mute_directive(50));
        assert_eq!(user.directives().len(), 2);
        assert_eq!(
            user.directive(&DirectiveKey::role(1, 2, 10)).and_then(|d| d.expiry),
            Some(later)
        );

        assert!(user.take_directive(&DirectiveKey::mute(1, 2, 50)).is_some());
        assert!(user.take_directive(&DirectiveKey::mute(1, 2, 50)).is_none());
        assert!(user.muted_channel_ids().is_empty());
    }

    #[test]
    fn test_global_flags() {
        let user = User::new(1, 2, true, false);
        assert!(user.global_mute_persisted());
        user.set_global_deafen_persisted(true);
        assert!(user.global_deafen_persisted());
    }

    #[tokio::test]
    async fn test_suppression_loaded_from_store() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        queries::contingent_roles::add_active_contingent_roles(&pool, 1, 2, 10, &[11, 12])
            .await
            .unwrap();

        let user = User::new(1, 2, false, false);
        {
            let mut map = user.lock_suppression(Some(&pool)).await.unwrap();
            assert_eq!(map.get(&10), Some(&HashSet::from([11, 12])));
            map.remove(&10);
        }
        // Loaded once; later locks see the in-memory state
        let map = user.lock_suppression(Some(&pool)).await.unwrap();
        assert!(map.is_empty());
    }
}
