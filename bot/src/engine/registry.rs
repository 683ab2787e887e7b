use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::contingent::{Resolution, SuppressionChange, resolve};
use super::directive::{Directive, DirectiveKey, DirectiveKind};
use super::error::ReconcileResult;
use super::events::{ChannelId, GuildId, RoleId, UserId, VoiceDelta};
use super::scheduler::ExpiryScheduler;
use super::server::Server;
use super::user::User;
use crate::config::{BotConfig, SchedulerSection};
use crate::db::models::UpsertServerParams;
use crate::db::queries;
use crate::platform::PlatformClient;

/// What happened when a directive's expiry came due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// The directive was already removed or re-armed for later.
    Stale,
    /// Removed, and the platform state was reverted.
    Reversed,
    /// Removed; the platform no longer reflected it, so nothing was reverted.
    Removed,
}

/// Counts from startup recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub guilds: usize,
    pub restored: usize,
    pub expired: usize,
}

/// Owns the server and user caches and every path that mutates directives.
pub struct Registry {
    servers: DashMap<GuildId, Arc<Server>>,
    users: DashMap<(GuildId, UserId), Arc<User>>,
    /// Optional database pool. When present, all state is written through.
    db: Option<SqlitePool>,
    platform: Arc<dyn PlatformClient>,
    scheduler: ExpiryScheduler,
    default_prefix: String,
    retry: SchedulerSection,
}

impl Registry {
    pub fn new(
        db: Option<SqlitePool>,
        platform: Arc<dyn PlatformClient>,
        scheduler: ExpiryScheduler,
        config: &BotConfig,
    ) -> Self {
        Self {
            servers: DashMap::new(),
            users: DashMap::new(),
            db,
            platform,
            scheduler,
            default_prefix: config.bot.command_prefix.clone(),
            retry: config.scheduler.clone(),
        }
    }

    /// Build a registry with its expiry scheduler and expiry worker running.
    pub fn start(
        db: Option<SqlitePool>,
        platform: Arc<dyn PlatformClient>,
        config: &BotConfig,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let (scheduler, scheduler_task) = ExpiryScheduler::spawn(fired_tx, shutdown.clone());
        let registry = Arc::new(Self::new(db, platform, scheduler, config));
        let worker_task = tokio::spawn(registry.clone().run_expiry_worker(fired_rx, shutdown));
        (registry, vec![scheduler_task, worker_task])
    }

    pub fn db(&self) -> Option<&SqlitePool> {
        self.db.as_ref()
    }

    pub fn platform(&self) -> &dyn PlatformClient {
        self.platform.as_ref()
    }

    /// Number of cached servers and members.
    pub fn cache_sizes(&self) -> (usize, usize) {
        (self.servers.len(), self.users.len())
    }

    // ── Servers ─────────────────────────────────────────────────────

    /// Get the cached server, loading it (or creating it with defaults) on first reference.
    pub async fn get_or_create_server(&self, id: GuildId) -> ReconcileResult<Arc<Server>> {
        if let Some(server) = self.servers.get(&id) {
            return Ok(server.clone());
        }

        let loaded = self.load_server(id).await?;
        let mut inserted = false;
        let server = self
            .servers
            .entry(id)
            .or_insert_with(|| {
                inserted = true;
                Arc::new(loaded)
            })
            .clone();

        if inserted {
            self.reindex_server(&server);
        }
        Ok(server)
    }

    pub fn cached_server(&self, id: GuildId) -> Option<Arc<Server>> {
        self.servers.get(&id).map(|s| s.clone())
    }

    async fn load_server(&self, id: GuildId) -> ReconcileResult<Server> {
        let Some(pool) = &self.db else {
            return Ok(Server::new(id, &self.default_prefix, None));
        };

        match queries::servers::get_server(pool, id).await? {
            Some(row) => {
                let channels = queries::servers::get_command_channels(pool, id).await?;
                let presets = queries::servers::get_preset_messages(pool, id).await?;
                Ok(Server::from_rows(
                    &row,
                    channels,
                    &presets,
                    &self.default_prefix,
                    Some(pool.clone()),
                ))
            }
            None => {
                let server = Server::new(id, &self.default_prefix, Some(pool.clone()));
                queries::servers::upsert_server(
                    pool,
                    &UpsertServerParams {
                        id,
                        command_prefix: None,
                        log_channel_id: None,
                        jail_role_id: None,
                        auto_mute_persist: server.auto_mute_persist,
                        auto_deafen_persist: server.auto_deafen_persist,
                        auto_role_persist: server.auto_role_persist,
                    },
                )
                .await?;
                info!(guild_id = id, "created server with default settings");
                Ok(server)
            }
        }
    }

    /// Rebuild a fresh server's directive indexes from the members already cached.
    fn reindex_server(&self, server: &Server) {
        let mut count = 0;
        for entry in self.users.iter().filter(|e| e.key().0 == server.id) {
            for directive in entry.value().directives() {
                server.index_directive(directive);
                count += 1;
            }
        }
        if count > 0 {
            debug!(guild_id = server.id, count, "reindexed directives");
        }
    }

    /// Evict a server so its configuration is reloaded on next use. User
    /// caches are left alone.
    pub fn invalidate_server(&self, id: GuildId) -> bool {
        let evicted = self.servers.remove(&id).is_some();
        if evicted {
            info!(guild_id = id, "server cache invalidated");
        }
        evicted
    }

    /// Write a guild's configuration and drop the cached copy.
    pub async fn save_server(&self, params: &UpsertServerParams<'_>) -> ReconcileResult<()> {
        if let Some(pool) = &self.db {
            queries::servers::upsert_server(pool, params).await?;
        }
        self.invalidate_server(params.id);
        Ok(())
    }

    // ── Users ───────────────────────────────────────────────────────

    /// Get the cached member, loading it (or creating it) on first reference.
    pub async fn get_or_create_user(
        &self,
        guild_id: GuildId,
        user_id: UserId,
    ) -> ReconcileResult<Arc<User>> {
        if let Some(user) = self.users.get(&(guild_id, user_id)) {
            return Ok(user.clone());
        }

        let loaded = match &self.db {
            Some(pool) => match queries::users::get_user(pool, guild_id, user_id).await? {
                Some(row) => User::from_row(&row),
                None => {
                    queries::users::upsert_user(pool, guild_id, user_id, false, false).await?;
                    User::new(guild_id, user_id, false, false)
                }
            },
            None => User::new(guild_id, user_id, false, false),
        };

        Ok(self
            .users
            .entry((guild_id, user_id))
            .or_insert_with(|| Arc::new(loaded))
            .clone())
    }

    pub fn cached_user(&self, guild_id: GuildId, user_id: UserId) -> Option<Arc<User>> {
        self.users.get(&(guild_id, user_id)).map(|u| u.clone())
    }

    /// Persist a member's global mute/deafen flags.
    pub async fn save_user(&self, user: &User) -> ReconcileResult<()> {
        if let Some(pool) = &self.db {
            queries::users::upsert_user(
                pool,
                user.guild_id,
                user.id,
                user.global_mute_persisted(),
                user.global_deafen_persisted(),
            )
            .await?;
        }
        Ok(())
    }

    // ── Directives ──────────────────────────────────────────────────

    /// Create a directive, or update the expiry of the existing one and re-arm it.
    /// Returns whether a new directive was created.
    pub async fn add_directive(
        &self,
        key: DirectiveKey,
        expiry: Option<chrono::DateTime<Utc>>,
    ) -> ReconcileResult<bool> {
        let user = self.get_or_create_user(key.guild_id, key.user_id).await?;
        let directive = Directive::new(key, expiry);

        // Index into whichever server is cached after the put; a server loaded
        // in between has already reindexed it from the user.
        let previous = user.put_directive(directive);
        self.get_or_create_server(key.guild_id)
            .await?
            .index_directive(directive);

        if let Some(pool) = &self.db {
            match key.kind {
                DirectiveKind::Role(role_id) => {
                    queries::persists::upsert_role_persist(
                        pool,
                        key.guild_id,
                        key.user_id,
                        role_id,
                        expiry,
                    )
                    .await?
                }
                DirectiveKind::Mute(channel_id) => {
                    queries::persists::upsert_mute_persist(
                        pool,
                        key.guild_id,
                        key.user_id,
                        channel_id,
                        expiry,
                    )
                    .await?
                }
            }
        }

        self.arm(directive, previous).await?;
        Ok(previous.is_none())
    }

    /// Persist several roles for a member with one shared expiry.
    pub async fn add_role_directives(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        role_ids: &[RoleId],
        expiry: Option<chrono::DateTime<Utc>>,
    ) -> ReconcileResult<()> {
        let stored = self
            .store_role_directives(guild_id, user_id, role_ids, expiry)
            .await?;
        for (directive, previous) in stored {
            self.arm(directive, previous).await?;
        }
        Ok(())
    }

    /// Cache, index and persist role directives without arming anything.
    async fn store_role_directives(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        role_ids: &[RoleId],
        expiry: Option<chrono::DateTime<Utc>>,
    ) -> ReconcileResult<Vec<(Directive, Option<Directive>)>> {
        if role_ids.is_empty() {
            return Ok(Vec::new());
        }
        let user = self.get_or_create_user(guild_id, user_id).await?;

        let mut stored = Vec::with_capacity(role_ids.len());
        for role_id in role_ids {
            let directive = Directive::new(DirectiveKey::role(guild_id, user_id, *role_id), expiry);
            let previous = user.put_directive(directive);
            stored.push((directive, previous));
        }
        let server = self.get_or_create_server(guild_id).await?;
        for (directive, _) in &stored {
            server.index_directive(*directive);
        }

        if let Some(pool) = &self.db {
            queries::persists::upsert_role_persists(pool, guild_id, user_id, role_ids, expiry)
                .await?;
        }
        Ok(stored)
    }

    async fn arm(&self, directive: Directive, previous: Option<Directive>) -> ReconcileResult<()> {
        match directive.expiry {
            Some(expiry) if directive.is_expired_at(Utc::now()) => {
                debug!(key = ?directive.key, %expiry, "directive already expired");
                self.run_expiry(directive.key).await;
            }
            Some(expiry) => self.scheduler.arm(directive.key, expiry)?,
            None => {
                if previous.is_some_and(|p| p.expiry.is_some()) {
                    self.scheduler.cancel(directive.key)?;
                }
            }
        }
        Ok(())
    }

    /// Remove a directive from the cache and the store and disarm its expiry.
    /// Returns whether one existed.
    pub async fn remove_directive(&self, key: DirectiveKey) -> ReconcileResult<bool> {
        let user = self.get_or_create_user(key.guild_id, key.user_id).await?;
        let cached = user.take_directive(&key);
        if let Some(directive) = &cached {
            self.forget(directive)?;
        }

        let stored = match (&self.db, key.kind) {
            (Some(pool), DirectiveKind::Role(role_id)) => {
                queries::persists::remove_role_persist(pool, key.guild_id, key.user_id, role_id)
                    .await?
            }
            (Some(pool), DirectiveKind::Mute(channel_id)) => {
                queries::persists::remove_mute_persist(pool, key.guild_id, key.user_id, channel_id)
                    .await?
            }
            (None, _) => false,
        };

        Ok(cached.is_some() || stored)
    }

    /// Remove several role directives. Returns whether any existed.
    pub async fn remove_role_directives(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        role_ids: &[RoleId],
    ) -> ReconcileResult<bool> {
        if role_ids.is_empty() {
            return Ok(false);
        }
        let user = self.get_or_create_user(guild_id, user_id).await?;
        let mut any = false;
        for role_id in role_ids {
            if let Some(directive) = user.take_directive(&DirectiveKey::role(guild_id, user_id, *role_id)) {
                self.forget(&directive)?;
                any = true;
            }
        }

        if let Some(pool) = &self.db {
            let removed =
                queries::persists::remove_role_persists(pool, guild_id, user_id, role_ids).await?;
            any |= removed > 0;
        }
        Ok(any)
    }

    /// Drop a directive already taken out of its user from the server index and the scheduler.
    fn forget(&self, directive: &Directive) -> ReconcileResult<()> {
        if let Some(server) = self.cached_server(directive.key.guild_id) {
            server.unindex_directive(directive);
        }
        if directive.expiry.is_some() {
            self.scheduler.cancel(directive.key)?;
        }
        Ok(())
    }

    /// Copy of every role directive for a role in a guild.
    pub async fn role_directives(
        &self,
        guild_id: GuildId,
        role_id: RoleId,
    ) -> ReconcileResult<Vec<Directive>> {
        Ok(self.get_or_create_server(guild_id).await?.role_directives(role_id))
    }

    /// Copy of every mute directive for a voice channel in a guild.
    pub async fn mute_directives(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> ReconcileResult<Vec<Directive>> {
        Ok(self
            .get_or_create_server(guild_id)
            .await?
            .mute_directives(channel_id))
    }

    // ── Startup recovery ────────────────────────────────────────────

    /// Guilds to recover: every guild with stored state plus every guild the platform reports.
    pub async fn known_guild_ids(&self) -> ReconcileResult<Vec<GuildId>> {
        let mut ids: Vec<GuildId> = match &self.db {
            Some(pool) => queries::servers::list_known_server_ids(pool).await?,
            None => Vec::new(),
        };
        ids.extend(self.platform.guild_ids().await?);
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    /// Load every stored directive of the given guilds. Expired ones are removed
    /// and reverted; the rest are cached and re-armed.
    pub async fn recover(&self, guild_ids: &[GuildId]) -> ReconcileResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let Some(pool) = &self.db else {
            return Ok(report);
        };

        for &guild_id in guild_ids {
            let server = self.get_or_create_server(guild_id).await?;
            let mut directives: Vec<Directive> = queries::persists::list_role_persists(pool, guild_id)
                .await?
                .iter()
                .map(Directive::from)
                .collect();
            directives.extend(
                queries::persists::list_mute_persists(pool, guild_id)
                    .await?
                    .iter()
                    .map(Directive::from),
            );

            let now = Utc::now();
            let (mut restored, mut expired) = (0, 0);
            for directive in directives {
                let key = directive.key;
                let user = self.get_or_create_user(guild_id, key.user_id).await?;

                if directive.is_expired_at(now) {
                    self.remove_directive(key).await?;
                    if let Err(e) = self.reverse(key).await {
                        warn!(?key, error = %e, "failed to revert expired directive during recovery");
                    }
                    expired += 1;
                    continue;
                }

                user.put_directive(directive);
                server.index_directive(directive);
                if let Some(expiry) = directive.expiry {
                    self.scheduler.arm(key, expiry)?;
                }
                restored += 1;
            }

            info!(guild_id, restored, expired, "recovered directives");
            report.guilds += 1;
            report.restored += restored;
            report.expired += expired;
        }

        Ok(report)
    }

    // ── Expiry ──────────────────────────────────────────────────────

    async fn run_expiry_worker(
        self: Arc<Self>,
        mut fired: mpsc::UnboundedReceiver<DirectiveKey>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                key = fired.recv() => {
                    let Some(key) = key else { break };
                    let registry = self.clone();
                    tokio::spawn(async move {
                        registry.run_expiry(key).await;
                    });
                }
            }
        }
    }

    /// Run a due expiry, retrying failures with backoff. Failures are logged,
    /// never dropped silently.
    pub async fn run_expiry(&self, key: DirectiveKey) -> Option<ExpiryOutcome> {
        let attempts = self.retry.retry_attempts.max(1);
        let mut delay = self.retry.retry_backoff();

        for attempt in 1..=attempts {
            // After a partial failure the directive may already be gone; only the reversal is retried.
            let removed = attempt > 1
                && self
                    .cached_user(key.guild_id, key.user_id)
                    .is_none_or(|u| u.directive(&key).is_none());
            let result = if removed {
                self.reverse(key).await
            } else {
                self.expire_due(key).await
            };

            match result {
                Ok(outcome) => {
                    debug!(?key, ?outcome, attempt, "directive expiry handled");
                    return Some(outcome);
                }
                Err(e) if attempt < attempts => {
                    warn!(?key, error = %e, attempt, "directive expiry failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    error!(?key, error = %e, attempts, "directive expiry failed");
                }
            }
        }
        None
    }

    /// Remove a directive whose expiry is due, then revert it on the platform.
    async fn expire_due(&self, key: DirectiveKey) -> ReconcileResult<ExpiryOutcome> {
        let Some(directive) = self
            .cached_user(key.guild_id, key.user_id)
            .and_then(|u| u.directive(&key))
        else {
            return Ok(ExpiryOutcome::Stale);
        };
        match directive.expiry {
            None => return Ok(ExpiryOutcome::Stale),
            // Re-armed for later, or the timer ran slightly ahead of the wall clock
            Some(expiry) if !directive.is_expired_at(Utc::now()) => {
                self.scheduler.arm(key, expiry)?;
                return Ok(ExpiryOutcome::Stale);
            }
            Some(_) => {}
        }

        self.remove_directive(key).await?;
        info!(?key, "directive expired");
        self.reverse(key).await
    }

    /// Undo what a directive enforced, but only if the platform still reflects it.
    async fn reverse(&self, key: DirectiveKey) -> ReconcileResult<ExpiryOutcome> {
        match key.kind {
            DirectiveKind::Role(role_id) => {
                let Some(roles) = self.platform.member_roles(key.guild_id, key.user_id).await?
                else {
                    return Ok(ExpiryOutcome::Removed);
                };
                if !roles.contains(&role_id) || !self.platform.may_edit_role(key.guild_id, role_id) {
                    return Ok(ExpiryOutcome::Removed);
                }

                let server = self.get_or_create_server(key.guild_id).await?;
                let user = self.get_or_create_user(key.guild_id, key.user_id).await?;
                let mut after = roles.clone();
                after.remove(&role_id);
                self.reconcile_roles(&server, &user, &roles, &after, &roles)
                    .await?;
                Ok(ExpiryOutcome::Reversed)
            }
            DirectiveKind::Mute(channel_id) => {
                let Some(voice) = self.platform.voice_state(key.guild_id, key.user_id).await? else {
                    return Ok(ExpiryOutcome::Removed);
                };
                if voice.channel_id != Some(channel_id) || !voice.muted {
                    return Ok(ExpiryOutcome::Removed);
                }

                let user = self.get_or_create_user(key.guild_id, key.user_id).await?;
                self.set_mute(&user, false).await?;
                Ok(ExpiryOutcome::Reversed)
            }
        }
    }

    // ── Outbound mutations ──────────────────────────────────────────

    /// Server-mute or unmute a member, expecting the echo.
    pub(crate) async fn set_mute(&self, user: &User, muted: bool) -> ReconcileResult<()> {
        let delta = VoiceDelta {
            mute: if muted { 1 } else { -1 },
            deafen: 0,
        };
        user.echo.expect_voice(delta);
        if let Err(e) = self.platform.set_mute(user.guild_id, user.id, muted).await {
            user.echo.withdraw_voice(delta);
            return Err(e.into());
        }
        Ok(())
    }

    pub(crate) async fn set_deafen(&self, user: &User, deafened: bool) -> ReconcileResult<()> {
        let delta = VoiceDelta {
            mute: 0,
            deafen: if deafened { 1 } else { -1 },
        };
        user.echo.expect_voice(delta);
        if let Err(e) = self.platform.set_deafen(user.guild_id, user.id, deafened).await {
            user.echo.withdraw_voice(delta);
            return Err(e.into());
        }
        Ok(())
    }

    /// Resolve contingent roles for `before → after` and bring the member's
    /// platform roles (`held`) in line with the result.
    pub(crate) async fn reconcile_roles(
        &self,
        server: &Server,
        user: &User,
        before: &HashSet<RoleId>,
        after: &HashSet<RoleId>,
        held: &HashSet<RoleId>,
    ) -> ReconcileResult<Resolution> {
        let table = server.contingent_roles().await?;
        let mut suppression = user.lock_suppression(self.db.as_ref()).await?;
        // Resolved against a copy; the member's map only takes the result once
        // the platform calls went through.
        let mut resolved = suppression.clone();
        let resolution = resolve(&table, &mut resolved, before, after);

        let editable = |r: &&RoleId| self.platform.may_edit_role(user.guild_id, **r);
        let mut to_add: Vec<RoleId> = resolution
            .final_roles
            .difference(held)
            .filter(editable)
            .copied()
            .collect();
        let mut to_remove: Vec<RoleId> = held
            .difference(&resolution.final_roles)
            .filter(editable)
            .copied()
            .collect();
        to_add.sort_unstable();
        to_remove.sort_unstable();

        user.echo.expect_roles(&to_add, &to_remove);
        if !to_remove.is_empty()
            && let Err(e) = self
                .platform
                .remove_roles(user.guild_id, user.id, &to_remove)
                .await
        {
            user.echo.withdraw_roles(&to_add, &to_remove);
            return Err(e.into());
        }
        if !to_add.is_empty()
            && let Err(e) = self.platform.add_roles(user.guild_id, user.id, &to_add).await
        {
            user.echo.withdraw_roles(&to_add, &Vec::<RoleId>::new());
            return Err(e.into());
        }

        *suppression = resolved;
        if let Some(pool) = &self.db {
            for change in &resolution.suppression_changes {
                match change {
                    SuppressionChange::Recorded { trigger, roles } => {
                        let roles: Vec<RoleId> = roles.iter().copied().collect();
                        queries::contingent_roles::add_active_contingent_roles(
                            pool,
                            user.guild_id,
                            user.id,
                            *trigger,
                            &roles,
                        )
                        .await?;
                    }
                    SuppressionChange::Cleared { trigger } => {
                        queries::contingent_roles::remove_active_contingent_roles(
                            pool,
                            user.guild_id,
                            user.id,
                            *trigger,
                        )
                        .await?;
                    }
                }
            }
        }

        if server.auto_role_persist && !resolution.to_add.is_empty() {
            let restored: Vec<RoleId> = resolution.to_add.iter().copied().collect();
            for (directive, previous) in self
                .store_role_directives(user.guild_id, user.id, &restored, None)
                .await?
            {
                if previous.is_some_and(|p| p.expiry.is_some()) {
                    self.scheduler.cancel(directive.key)?;
                }
            }
        }

        if !resolution.converged {
            warn!(
                guild_id = user.guild_id,
                user_id = user.id,
                rounds = resolution.rounds,
                "contingent roles did not converge"
            );
        }
        drop(suppression);
        Ok(resolution)
    }
}
