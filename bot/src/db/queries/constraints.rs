use sqlx::SqlitePool;

use crate::db::models::{GenericConstraintRow, RoleConstraintRow, RoleConstraintSettingsRow};

/// Channel and user allow/deny entries for an intent.
pub async fn get_generic_constraints(
    pool: &SqlitePool,
    server_id: u64,
    intent: i64,
) -> Result<Vec<GenericConstraintRow>, sqlx::Error> {
    sqlx::query_as::<_, GenericConstraintRow>(
        "SELECT * FROM generic_constraints WHERE server_id = ? AND intent = ?",
    )
    .bind(server_id as i64)
    .bind(intent)
    .fetch_all(pool)
    .await
}

/// Add a channel or user entry. `whitelist` applies to the whole sub-constraint.
pub async fn add_generic_constraint(
    pool: &SqlitePool,
    server_id: u64,
    intent: i64,
    constraint_type: i64,
    whitelist: bool,
    data: u64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO generic_constraints (server_id, intent, constraint_type, whitelist, data) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(server_id, intent, constraint_type, data) DO UPDATE SET whitelist = excluded.whitelist",
    )
    .bind(server_id as i64)
    .bind(intent)
    .bind(constraint_type)
    .bind(whitelist as i32)
    .bind(data as i64)
    .execute(pool)
    .await?;
    Ok(())
}

/// Strictness flags of the role constraint for an intent, if configured.
pub async fn get_role_constraint_settings(
    pool: &SqlitePool,
    server_id: u64,
    intent: i64,
) -> Result<Option<RoleConstraintSettingsRow>, sqlx::Error> {
    sqlx::query_as::<_, RoleConstraintSettingsRow>(
        "SELECT * FROM role_constraint_settings WHERE server_id = ? AND intent = ?",
    )
    .bind(server_id as i64)
    .bind(intent)
    .fetch_optional(pool)
    .await
}

/// Set the strictness flags of the role constraint for an intent.
pub async fn set_role_constraint_settings(
    pool: &SqlitePool,
    server_id: u64,
    intent: i64,
    whitelist_strict: bool,
    blacklist_strict: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO role_constraint_settings (server_id, intent, whitelist_strict, blacklist_strict) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT(server_id, intent) DO UPDATE SET \
         whitelist_strict = excluded.whitelist_strict, blacklist_strict = excluded.blacklist_strict",
    )
    .bind(server_id as i64)
    .bind(intent)
    .bind(whitelist_strict as i32)
    .bind(blacklist_strict as i32)
    .execute(pool)
    .await?;
    Ok(())
}

/// Roles listed in either half of the role constraint for an intent.
pub async fn get_role_constraints(
    pool: &SqlitePool,
    server_id: u64,
    intent: i64,
) -> Result<Vec<RoleConstraintRow>, sqlx::Error> {
    sqlx::query_as::<_, RoleConstraintRow>(
        "SELECT * FROM role_constraints WHERE server_id = ? AND intent = ?",
    )
    .bind(server_id as i64)
    .bind(intent)
    .fetch_all(pool)
    .await
}

/// List a role in the whitelist (`whitelist = true`) or blacklist half.
pub async fn add_role_constraint(
    pool: &SqlitePool,
    server_id: u64,
    intent: i64,
    role_id: u64,
    whitelist: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT OR IGNORE INTO role_constraints (server_id, intent, role_id, whitelist) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(server_id as i64)
    .bind(intent)
    .bind(role_id as i64)
    .bind(whitelist as i32)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::{create_pool, run_migrations};

    async fn setup_db() -> SqlitePool {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_generic_constraints_scoped_by_intent() {
        let pool = setup_db().await;

        add_generic_constraint(&pool, 1, 4, 0, true, 500).await.unwrap();
        add_generic_constraint(&pool, 1, 5, 1, false, 600).await.unwrap();

        let rows = get_generic_constraints(&pool, 1, 4).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data, 500);
        assert_eq!(rows[0].whitelist, 1);
        assert!(get_generic_constraints(&pool, 2, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_role_constraint_settings_upsert() {
        let pool = setup_db().await;

        assert!(get_role_constraint_settings(&pool, 1, 0).await.unwrap().is_none());

        set_role_constraint_settings(&pool, 1, 0, true, false)
            .await
            .unwrap();
        set_role_constraint_settings(&pool, 1, 0, false, true)
            .await
            .unwrap();

        let row = get_role_constraint_settings(&pool, 1, 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.whitelist_strict, 0);
        assert_eq!(row.blacklist_strict, 1);
    }

    #[tokio::test]
    async fn test_role_constraints_both_halves() {
        let pool = setup_db().await;

        add_role_constraint(&pool, 1, 0, 10, true).await.unwrap();
        add_role_constraint(&pool, 1, 0, 11, false).await.unwrap();
        add_role_constraint(&pool, 1, 0, 11, false).await.unwrap();

        let rows = get_role_constraints(&pool, 1, 0).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.role_id == 10 && r.whitelist == 1));
        assert!(rows.iter().any(|r| r.role_id == 11 && r.whitelist == 0));
    }
}
