use sqlx::PgPool;

use super::error::DeploymentStoreError;
use super::model::Deployment;

/// Supersede every currently-active deployment and insert a new one as the
/// active deployment, atomically. The partial unique index on
/// `superseded_at IS NULL` guarantees no observer ever sees zero or two
/// active rows, even under concurrent callers racing this same function.
#[tracing::instrument(skip(pool), err)]
pub async fn create(pool: &PgPool, commit_id: &str) -> Result<Deployment, DeploymentStoreError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| DeploymentStoreError::CreationFailed(e.to_string()))?;

    sqlx::query!(
        "UPDATE deployments SET superseded_at = now() WHERE superseded_at IS NULL",
    )
    .execute(&mut *tx)
    .await
    .map_err(|e| DeploymentStoreError::CreationFailed(e.to_string()))?;

    let row = sqlx::query!(
        r#"
        INSERT INTO deployments (commit_id, created_at, superseded_at)
        VALUES ($1, now(), NULL)
        RETURNING id, commit_id, created_at, superseded_at
        "#,
        commit_id,
    )
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| DeploymentStoreError::CreationFailed(e.to_string()))?;

    tx.commit()
        .await
        .map_err(|e| DeploymentStoreError::CreationFailed(e.to_string()))?;

    tracing::info!(deployment_id = row.id, %commit_id, "deployment created");

    Ok(Deployment {
        id: row.id,
        commit_id: row.commit_id,
        created_at: row.created_at,
        superseded_at: row.superseded_at,
    })
}

/// Return the currently active deployment, if any.
#[tracing::instrument(skip(pool), err)]
pub async fn get_active(pool: &PgPool) -> Result<Option<Deployment>, DeploymentStoreError> {
    let row = sqlx::query!(
        r#"
        SELECT id, commit_id, created_at, superseded_at
        FROM deployments WHERE superseded_at IS NULL
        "#,
    )
    .fetch_optional(pool)
    .await
    .map_err(|e| DeploymentStoreError::GetActiveFailed(e.to_string()))?;

    Ok(row.map(|row| Deployment {
        id: row.id,
        commit_id: row.commit_id,
        created_at: row.created_at,
        superseded_at: row.superseded_at,
    }))
}

/// Fetch a single deployment by id.
#[tracing::instrument(skip(pool), err)]
pub async fn get(pool: &PgPool, id: i64) -> Result<Deployment, DeploymentStoreError> {
    let row = sqlx::query!(
        "SELECT id, commit_id, created_at, superseded_at FROM deployments WHERE id = $1",
        id,
    )
    .fetch_optional(pool)
    .await?
    .ok_or(DeploymentStoreError::NotFound)?;

    Ok(Deployment {
        id: row.id,
        commit_id: row.commit_id,
        created_at: row.created_at,
        superseded_at: row.superseded_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test(migrations = "./migrations")]
    async fn create_activates_new_and_supersedes_old(pool: PgPool) {
        let first = create(&pool, "a".repeat(40).as_str()).await.unwrap();
        assert!(first.is_active());

        let second = create(&pool, "b".repeat(40).as_str()).await.unwrap();
        assert!(second.is_active());

        let refreshed_first = get(&pool, first.id).await.unwrap();
        assert!(!refreshed_first.is_active());

        let active = get_active(&pool).await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn get_active_none_when_empty(pool: PgPool) {
        assert!(get_active(&pool).await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn get_missing_is_not_found(pool: PgPool) {
        let err = get(&pool, 9999).await.unwrap_err();
        assert!(matches!(err, DeploymentStoreError::NotFound));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn only_one_active_at_a_time(pool: PgPool) {
        for i in 0..5 {
            create(&pool, format!("{i}").repeat(40).as_str())
                .await
                .unwrap();
        }

        let count = sqlx::query_scalar!(
            "SELECT count(*) FROM deployments WHERE superseded_at IS NULL",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(count, Some(1));
    }
}
