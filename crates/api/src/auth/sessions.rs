//! Identity sessions backing JWT revocation
//!
//! Every issued access token has a row in `identity_sessions` keyed by its
//! JTI. A token is only honoured while its row is unrevoked and unexpired.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiResult;

/// Maximum concurrent sessions per identity; the oldest is revoked beyond this
pub(crate) const MAX_SESSIONS_PER_IDENTITY: i64 = 10;

pub async fn save_session(
    pool: &PgPool,
    identity_id: Uuid,
    jti: &str,
    expires_at: OffsetDateTime,
    ip_address: Option<&str>,
    user_agent: Option<&str>,
) -> ApiResult<()> {
    let mut tx = pool.begin().await?;

    let active: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM identity_sessions
        WHERE identity_id = $1
          AND revoked_at IS NULL
          AND expires_at > NOW()
        "#,
    )
    .bind(identity_id)
    .fetch_one(&mut *tx)
    .await?;

    if active >= MAX_SESSIONS_PER_IDENTITY {
        tracing::info!(
            identity_id = %identity_id,
            current_sessions = active,
            max_sessions = MAX_SESSIONS_PER_IDENTITY,
            "Revoking oldest session due to max sessions limit"
        );

        sqlx::query(
            r#"
            UPDATE identity_sessions
            SET revoked_at = NOW(),
                revocation_reason = 'max_sessions_exceeded'
            WHERE id IN (
                SELECT id FROM identity_sessions
                WHERE identity_id = $1
                  AND revoked_at IS NULL
                ORDER BY created_at ASC
                LIMIT 1
            )
            "#,
        )
        .bind(identity_id)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO identity_sessions (identity_id, jti, expires_at, ip_address, user_agent)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(identity_id)
    .bind(jti)
    .bind(expires_at)
    .bind(ip_address)
    .bind(user_agent)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Unrevoked, unexpired and owned by `expected_identity_id`
pub async fn is_session_valid(
    pool: &PgPool,
    jti: &str,
    expected_identity_id: Uuid,
) -> ApiResult<bool> {
    let found: Option<bool> = sqlx::query_scalar(
        r#"
        SELECT TRUE
        FROM identity_sessions
        WHERE jti = $1
          AND identity_id = $2
          AND revoked_at IS NULL
          AND expires_at > NOW()
        "#,
    )
    .bind(jti)
    .bind(expected_identity_id)
    .fetch_optional(pool)
    .await?;

    Ok(found.is_some())
}

/// Returns true if the session was found and revoked
pub async fn revoke_session(pool: &PgPool, jti: &str, reason: &str) -> ApiResult<bool> {
    let rows_affected = sqlx::query(
        r#"
        UPDATE identity_sessions
        SET revoked_at = NOW(),
            revocation_reason = $2
        WHERE jti = $1
          AND revoked_at IS NULL
        "#,
    )
    .bind(jti)
    .bind(reason)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(rows_affected > 0)
}

pub async fn revoke_all_sessions(pool: &PgPool, identity_id: Uuid, reason: &str) -> ApiResult<u64> {
    let rows_affected = sqlx::query(
        r#"
        UPDATE identity_sessions
        SET revoked_at = NOW(),
            revocation_reason = $2
        WHERE identity_id = $1
          AND revoked_at IS NULL
        "#,
    )
    .bind(identity_id)
    .bind(reason)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(rows_affected)
}
