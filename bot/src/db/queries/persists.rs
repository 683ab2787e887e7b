use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::models::{MutePersistRow, RolePersistRow};

// ── Role persists ──────────────────────────────────────────────

/// Insert a role directive or replace the expiry of an existing one.
pub async fn upsert_role_persist(
    pool: &SqlitePool,
    server_id: u64,
    user_id: u64,
    role_id: u64,
    expiry: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO role_persists (server_id, user_id, role_id, expiry) VALUES (?, ?, ?, ?) \
         ON CONFLICT(server_id, user_id, role_id) DO UPDATE SET expiry = excluded.expiry",
    )
    .bind(server_id as i64)
    .bind(user_id as i64)
    .bind(role_id as i64)
    .bind(expiry)
    .execute(pool)
    .await?;
    Ok(())
}

/// Upsert several role directives sharing one expiry in a single transaction.
pub async fn upsert_role_persists(
    pool: &SqlitePool,
    server_id: u64,
    user_id: u64,
    role_ids: &[u64],
    expiry: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    if role_ids.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for role_id in role_ids {
        sqlx::query(
            "INSERT INTO role_persists (server_id, user_id, role_id, expiry) VALUES (?, ?, ?, ?) \
             ON CONFLICT(server_id, user_id, role_id) DO UPDATE SET expiry = excluded.expiry",
        )
        .bind(server_id as i64)
        .bind(user_id as i64)
        .bind(*role_id as i64)
        .bind(expiry)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Delete a role directive. Returns whether a row existed.
pub async fn remove_role_persist(
    pool: &SqlitePool,
    server_id: u64,
    user_id: u64,
    role_id: u64,
) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("DELETE FROM role_persists WHERE server_id = ? AND user_id = ? AND role_id = ?")
            .bind(server_id as i64)
            .bind(user_id as i64)
            .bind(role_id as i64)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete several role directives in a single transaction. Returns the number of rows removed.
pub async fn remove_role_persists(
    pool: &SqlitePool,
    server_id: u64,
    user_id: u64,
    role_ids: &[u64],
) -> Result<u64, sqlx::Error> {
    if role_ids.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;
    let mut removed = 0;
    for role_id in role_ids {
        let result = sqlx::query(
            "DELETE FROM role_persists WHERE server_id = ? AND user_id = ? AND role_id = ?",
        )
        .bind(server_id as i64)
        .bind(user_id as i64)
        .bind(*role_id as i64)
        .execute(&mut *tx)
        .await?;
        removed += result.rows_affected();
    }
    tx.commit().await?;
    Ok(removed)
}

/// All role directives of a guild (startup recovery).
pub async fn list_role_persists(
    pool: &SqlitePool,
    server_id: u64,
) -> Result<Vec<RolePersistRow>, sqlx::Error> {
    sqlx::query_as::<_, RolePersistRow>(
        "SELECT * FROM role_persists WHERE server_id = ? ORDER BY user_id, role_id",
    )
    .bind(server_id as i64)
    .fetch_all(pool)
    .await
}

/// All role directives of one member.
pub async fn list_user_role_persists(
    pool: &SqlitePool,
    server_id: u64,
    user_id: u64,
) -> Result<Vec<RolePersistRow>, sqlx::Error> {
    sqlx::query_as::<_, RolePersistRow>(
        "SELECT * FROM role_persists WHERE server_id = ? AND user_id = ? ORDER BY role_id",
    )
    .bind(server_id as i64)
    .bind(user_id as i64)
    .fetch_all(pool)
    .await
}

// ── Mute persists ──────────────────────────────────────────────

/// Insert a channel mute directive or replace the expiry of an existing one.
pub async fn upsert_mute_persist(
    pool: &SqlitePool,
    server_id: u64,
    user_id: u64,
    channel_id: u64,
    expiry: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO mute_persists (server_id, user_id, channel_id, expiry) VALUES (?, ?, ?, ?) \
         ON CONFLICT(server_id, user_id, channel_id) DO UPDATE SET expiry = excluded.expiry",
    )
    .bind(server_id as i64)
    .bind(user_id as i64)
    .bind(channel_id as i64)
    .bind(expiry)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a channel mute directive. Returns whether a row existed.
pub async fn remove_mute_persist(
    pool: &SqlitePool,
    server_id: u64,
    user_id: u64,
    channel_id: u64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM mute_persists WHERE server_id = ? AND user_id = ? AND channel_id = ?",
    )
    .bind(server_id as i64)
    .bind(user_id as i64)
    .bind(channel_id as i64)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// All channel mute directives of a guild (startup recovery).
pub async fn list_mute_persists(
    pool: &SqlitePool,
    server_id: u64,
) -> Result<Vec<MutePersistRow>, sqlx::Error> {
    sqlx::query_as::<_, MutePersistRow>(
        "SELECT * FROM mute_persists WHERE server_id = ? ORDER BY user_id, channel_id",
    )
    .bind(server_id as i64)
    .fetch_all(pool)
    .await
}
