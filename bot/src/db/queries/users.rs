use sqlx::SqlitePool;

use crate::db::models::UserRow;

/// Get a member's state in a guild.
pub async fn get_user(
    pool: &SqlitePool,
    server_id: u64,
    user_id: u64,
) -> Result<Option<UserRow>, sqlx::Error> {
    sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE server_id = ? AND user_id = ?")
        .bind(server_id as i64)
        .bind(user_id as i64)
        .fetch_optional(pool)
        .await
}

/// Insert or update a member's global mute/deafen persistence flags.
pub async fn upsert_user(
    pool: &SqlitePool,
    server_id: u64,
    user_id: u64,
    global_mute_persisted: bool,
    global_deafen_persisted: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO users (server_id, user_id, global_mute_persisted, global_deafen_persisted) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT(server_id, user_id) DO UPDATE SET \
         global_mute_persisted = excluded.global_mute_persisted, \
         global_deafen_persisted = excluded.global_deafen_persisted",
    )
    .bind(server_id as i64)
    .bind(user_id as i64)
    .bind(global_mute_persisted as i32)
    .bind(global_deafen_persisted as i32)
    .execute(pool)
    .await?;
    Ok(())
}
