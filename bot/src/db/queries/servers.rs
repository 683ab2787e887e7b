use sqlx::SqlitePool;

use crate::db::models::{PresetMessageRow, ServerRow, UpsertServerParams};

/// Get a guild configuration by ID.
pub async fn get_server(pool: &SqlitePool, id: u64) -> Result<Option<ServerRow>, sqlx::Error> {
    sqlx::query_as::<_, ServerRow>("SELECT * FROM servers WHERE id = ?")
        .bind(id as i64)
        .fetch_optional(pool)
        .await
}

/// Insert a guild configuration, or update it if one already exists.
pub async fn upsert_server(
    pool: &SqlitePool,
    params: &UpsertServerParams<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO servers (id, command_prefix, log_channel_id, jail_role_id, \
         auto_mute_persist, auto_deafen_persist, auto_role_persist) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
         command_prefix = excluded.command_prefix, \
         log_channel_id = excluded.log_channel_id, \
         jail_role_id = excluded.jail_role_id, \
         auto_mute_persist = excluded.auto_mute_persist, \
         auto_deafen_persist = excluded.auto_deafen_persist, \
         auto_role_persist = excluded.auto_role_persist, \
         updated_at = datetime('now')",
    )
    .bind(params.id as i64)
    .bind(params.command_prefix)
    .bind(params.log_channel_id.map(|id| id as i64))
    .bind(params.jail_role_id.map(|id| id as i64))
    .bind(params.auto_mute_persist as i32)
    .bind(params.auto_deafen_persist as i32)
    .bind(params.auto_role_persist as i32)
    .execute(pool)
    .await?;
    Ok(())
}

/// Every guild the database knows about: configured guilds plus any guild
/// that still has persisted directives.
pub async fn list_known_server_ids(pool: &SqlitePool) -> Result<Vec<u64>, sqlx::Error> {
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT id FROM servers \
         UNION SELECT server_id FROM role_persists \
         UNION SELECT server_id FROM mute_persists \
         ORDER BY 1",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids.into_iter().map(|id| id as u64).collect())
}

/// Channels in which commands are accepted. Empty means every channel.
pub async fn get_command_channels(
    pool: &SqlitePool,
    server_id: u64,
) -> Result<Vec<u64>, sqlx::Error> {
    let ids: Vec<i64> =
        sqlx::query_scalar("SELECT channel_id FROM command_channels WHERE server_id = ?")
            .bind(server_id as i64)
            .fetch_all(pool)
            .await?;
    Ok(ids.into_iter().map(|id| id as u64).collect())
}

/// Allow commands in a channel.
pub async fn add_command_channel(
    pool: &SqlitePool,
    server_id: u64,
    channel_id: u64,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO command_channels (server_id, channel_id) VALUES (?, ?)")
        .bind(server_id as i64)
        .bind(channel_id as i64)
        .execute(pool)
        .await?;
    Ok(())
}

/// Stop accepting commands in a channel. Returns whether it was listed.
pub async fn remove_command_channel(
    pool: &SqlitePool,
    server_id: u64,
    channel_id: u64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM command_channels WHERE server_id = ? AND channel_id = ?")
        .bind(server_id as i64)
        .bind(channel_id as i64)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// All preset messages of a guild, ordered by type then position.
pub async fn get_preset_messages(
    pool: &SqlitePool,
    server_id: u64,
) -> Result<Vec<PresetMessageRow>, sqlx::Error> {
    sqlx::query_as::<_, PresetMessageRow>(
        "SELECT * FROM preset_messages WHERE server_id = ? ORDER BY message_type, position",
    )
    .bind(server_id as i64)
    .fetch_all(pool)
    .await
}

/// Set the preset message at `position` for a message type.
pub async fn set_preset_message(
    pool: &SqlitePool,
    server_id: u64,
    message_type: i64,
    position: i64,
    message_text: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO preset_messages (server_id, message_type, position, message_text) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT(server_id, message_type, position) DO UPDATE SET message_text = excluded.message_text",
    )
    .bind(server_id as i64)
    .bind(message_type)
    .bind(position)
    .bind(message_text)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::{create_pool, run_migrations};
    use crate::db::queries::persists;

    async fn setup_db() -> SqlitePool {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn default_params(id: u64) -> UpsertServerParams<'static> {
        UpsertServerParams {
            id,
            command_prefix: None,
            log_channel_id: None,
            jail_role_id: None,
            auto_mute_persist: true,
            auto_deafen_persist: true,
            auto_role_persist: false,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get_server() {
        let pool = setup_db().await;

        assert!(get_server(&pool, 10).await.unwrap().is_none());

        upsert_server(&pool, &default_params(10)).await.unwrap();
        let row = get_server(&pool, 10).await.unwrap().unwrap();
        assert_eq!(row.id, 10);
        assert_eq!(row.auto_mute_persist, 1);
        assert_eq!(row.auto_role_persist, 0);
        assert!(row.jail_role_id.is_none());

        upsert_server(
            &pool,
            &UpsertServerParams {
                command_prefix: Some("!"),
                jail_role_id: Some(77),
                auto_role_persist: true,
                ..default_params(10)
            },
        )
        .await
        .unwrap();
        let row = get_server(&pool, 10).await.unwrap().unwrap();
        assert_eq!(row.command_prefix.as_deref(), Some("!"));
        assert_eq!(row.jail_role_id, Some(77));
        assert_eq!(row.auto_role_persist, 1);
    }

    #[tokio::test]
    async fn test_large_snowflake_round_trips() {
        let pool = setup_db().await;
        let id = u64::MAX - 5;

        upsert_server(&pool, &default_params(id)).await.unwrap();
        let row = get_server(&pool, id).await.unwrap().unwrap();
        assert_eq!(row.id as u64, id);
    }

    #[tokio::test]
    async fn test_command_channels() {
        let pool = setup_db().await;
        upsert_server(&pool, &default_params(1)).await.unwrap();

        assert!(get_command_channels(&pool, 1).await.unwrap().is_empty());

        add_command_channel(&pool, 1, 100).await.unwrap();
        add_command_channel(&pool, 1, 100).await.unwrap();
        add_command_channel(&pool, 1, 200).await.unwrap();
        let mut channels = get_command_channels(&pool, 1).await.unwrap();
        channels.sort();
        assert_eq!(channels, vec![100, 200]);

        assert!(remove_command_channel(&pool, 1, 100).await.unwrap());
        assert!(!remove_command_channel(&pool, 1, 100).await.unwrap());
    }

    #[tokio::test]
    async fn test_preset_messages_ordered() {
        let pool = setup_db().await;
        upsert_server(&pool, &default_params(1)).await.unwrap();

        set_preset_message(&pool, 1, 2, 2, "second").await.unwrap();
        set_preset_message(&pool, 1, 2, 1, "first").await.unwrap();
        set_preset_message(&pool, 1, 0, 1, "mute").await.unwrap();
        set_preset_message(&pool, 1, 2, 1, "first (edited)").await.unwrap();

        let rows = get_preset_messages(&pool, 1).await.unwrap();
        let texts: Vec<&str> = rows.iter().map(|r| r.message_text.as_str()).collect();
        assert_eq!(texts, vec!["mute", "first (edited)", "second"]);
    }

    #[tokio::test]
    async fn test_list_known_server_ids_includes_directive_only_guilds() {
        let pool = setup_db().await;
        upsert_server(&pool, &default_params(1)).await.unwrap();
        persists::upsert_role_persist(&pool, 2, 5, 6, None)
            .await
            .unwrap();
        persists::upsert_mute_persist(&pool, 3, 5, 7, None)
            .await
            .unwrap();

        let ids = list_known_server_ids(&pool).await.unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
