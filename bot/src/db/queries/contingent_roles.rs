use sqlx::SqlitePool;

use crate::db::models::{ActiveContingentRoleRow, ContingentRoleRow};

/// The static contingent role table of a guild, one row per (trigger, contingent) pair.
pub async fn list_contingent_roles(
    pool: &SqlitePool,
    server_id: u64,
) -> Result<Vec<ContingentRoleRow>, sqlx::Error> {
    sqlx::query_as::<_, ContingentRoleRow>(
        "SELECT * FROM contingent_roles WHERE server_id = ? ORDER BY role_id, contingent_role_id",
    )
    .bind(server_id as i64)
    .fetch_all(pool)
    .await
}

/// Declare that holding `role_id` forces the absence of `contingent_role_id`.
pub async fn add_contingent_role(
    pool: &SqlitePool,
    server_id: u64,
    role_id: u64,
    contingent_role_id: u64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT OR IGNORE INTO contingent_roles (server_id, role_id, contingent_role_id) \
         VALUES (?, ?, ?)",
    )
    .bind(server_id as i64)
    .bind(role_id as i64)
    .bind(contingent_role_id as i64)
    .execute(pool)
    .await?;
    Ok(())
}

/// Roles currently suppressed for a member, one row per (trigger, suppressed role).
pub async fn get_active_contingent_roles(
    pool: &SqlitePool,
    server_id: u64,
    user_id: u64,
) -> Result<Vec<ActiveContingentRoleRow>, sqlx::Error> {
    sqlx::query_as::<_, ActiveContingentRoleRow>(
        "SELECT * FROM active_contingent_roles WHERE server_id = ? AND user_id = ? \
         ORDER BY role_id, contingent_role_id",
    )
    .bind(server_id as i64)
    .bind(user_id as i64)
    .fetch_all(pool)
    .await
}

/// Record roles suppressed because of `role_id`, in a single transaction.
pub async fn add_active_contingent_roles(
    pool: &SqlitePool,
    server_id: u64,
    user_id: u64,
    role_id: u64,
    contingent_role_ids: &[u64],
) -> Result<(), sqlx::Error> {
    if contingent_role_ids.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for contingent_role_id in contingent_role_ids {
        sqlx::query(
            "INSERT OR IGNORE INTO active_contingent_roles \
             (server_id, user_id, role_id, contingent_role_id) VALUES (?, ?, ?, ?)",
        )
        .bind(server_id as i64)
        .bind(user_id as i64)
        .bind(role_id as i64)
        .bind(*contingent_role_id as i64)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Clear every suppression recorded under `role_id`. Returns whether any existed.
pub async fn remove_active_contingent_roles(
    pool: &SqlitePool,
    server_id: u64,
    user_id: u64,
    role_id: u64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM active_contingent_roles WHERE server_id = ? AND user_id = ? AND role_id = ?",
    )
    .bind(server_id as i64)
    .bind(user_id as i64)
    .bind(role_id as i64)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
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
    async fn test_contingent_table_rows() {
        let pool = setup_db().await;

        add_contingent_role(&pool, 1, 100, 201).await.unwrap();
        add_contingent_role(&pool, 1, 100, 200).await.unwrap();
        add_contingent_role(&pool, 1, 100, 200).await.unwrap();
        add_contingent_role(&pool, 2, 100, 300).await.unwrap();

        let rows = list_contingent_roles(&pool, 1).await.unwrap();
        let pairs: Vec<(i64, i64)> = rows
            .iter()
            .map(|r| (r.role_id, r.contingent_role_id))
            .collect();
        assert_eq!(pairs, vec![(100, 200), (100, 201)]);
    }

    #[tokio::test]
    async fn test_active_contingent_roles_add_and_clear() {
        let pool = setup_db().await;

        add_active_contingent_roles(&pool, 1, 5, 100, &[200, 201])
            .await
            .unwrap();
        add_active_contingent_roles(&pool, 1, 5, 101, &[202])
            .await
            .unwrap();
        assert_eq!(get_active_contingent_roles(&pool, 1, 5).await.unwrap().len(), 3);

        assert!(remove_active_contingent_roles(&pool, 1, 5, 100).await.unwrap());
        assert!(!remove_active_contingent_roles(&pool, 1, 5, 100).await.unwrap());

        let rows = get_active_contingent_roles(&pool, 1, 5).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].role_id, 101);
        assert_eq!(rows[0].contingent_role_id, 202);
    }
}
