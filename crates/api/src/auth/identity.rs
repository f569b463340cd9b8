//! Identity accounts and credential checks
//!
//! Sign-in accepts an email, a username or a membership identifier; the
//! latter is resolved through the member record linked to the identity.

use nitp_shared::Identifier;
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::password;
use crate::error::{ApiError, ApiResult};

pub const ROLE_MEMBER: &str = "member";
pub const ROLE_ADMIN: &str = "admin";

#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub role: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_login_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, FromRow)]
struct IdentityRow {
    id: Uuid,
    email: String,
    username: String,
    password_hash: String,
    role: String,
    last_login_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl From<IdentityRow> for Identity {
    fn from(row: IdentityRow) -> Self {
        Self {
            id: row.id,
            email: row.email,
            username: row.username,
            role: row.role,
            last_login_at: row.last_login_at,
            created_at: row.created_at,
        }
    }
}

const IDENTITY_COLUMNS: &str =
    "i.id, i.email, i.username, i.password_hash, i.role, i.last_login_at, i.created_at";

pub(crate) fn validate_username(username: &str) -> ApiResult<()> {
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    // '@' and '-' are excluded so usernames never parse as emails or membership IDs
    if !(3..=32).contains(&username.len()) || !valid_chars {
        return Err(ApiError::Validation(
            "Username must be 3-32 characters of letters, digits, '_' or '.'".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_email(email: &str) -> ApiResult<()> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(ApiError::Validation("A valid email is required".to_string())),
    }
}

/// Create a member-role identity; email and username must be unused
pub async fn create_identity(
    pool: &PgPool,
    email: &str,
    username: &str,
    password: &str,
) -> ApiResult<Identity> {
    let email = email.trim().to_ascii_lowercase();
    let username = username.trim();
    validate_email(&email)?;
    validate_username(username)?;
    password::validate_password_strength(password)?;
    let password_hash = password::hash_password(password)?;

    let row: IdentityRow = sqlx::query_as(
        r#"
        INSERT INTO identities (email, username, password_hash, role)
        VALUES ($1, $2, $3, $4)
        RETURNING id, email, username, password_hash, role, last_login_at, created_at
        "#,
    )
    .bind(&email)
    .bind(username)
    .bind(&password_hash)
    .bind(ROLE_MEMBER)
    .fetch_one(pool)
    .await
    .map_err(|e| match e.as_database_error() {
        Some(db) if db.code().as_deref() == Some("23505") => {
            ApiError::Conflict("Email or username already registered".to_string())
        }
        _ => ApiError::from(e),
    })?;

    tracing::info!(identity_id = %row.id, "Identity created");
    Ok(row.into())
}

/// Remove an identity whose member record could not be created
pub async fn delete_identity(pool: &PgPool, identity_id: Uuid) -> ApiResult<()> {
    sqlx::query("DELETE FROM identities WHERE id = $1")
        .bind(identity_id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn find_by_identifier(
    pool: &PgPool,
    identifier: &Identifier,
) -> ApiResult<Option<IdentityRow>> {
    let sql = match identifier {
        Identifier::Email(_) => {
            format!("SELECT {} FROM identities i WHERE i.email = $1", IDENTITY_COLUMNS)
        }
        Identifier::Username(_) => {
            format!("SELECT {} FROM identities i WHERE i.username = $1", IDENTITY_COLUMNS)
        }
        Identifier::MembershipId(_) => format!(
            "SELECT {} FROM identities i JOIN members m ON m.identity_id = i.id \
             WHERE m.membership_id = $1",
            IDENTITY_COLUMNS
        ),
    };

    let row = sqlx::query_as::<_, IdentityRow>(&sql)
        .bind(identifier.value())
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn get_identity(pool: &PgPool, identity_id: Uuid) -> ApiResult<Identity> {
    let sql = format!("SELECT {} FROM identities i WHERE i.id = $1", IDENTITY_COLUMNS);
    sqlx::query_as::<_, IdentityRow>(&sql)
        .bind(identity_id)
        .fetch_optional(pool)
        .await?
        .map(Identity::from)
        .ok_or_else(|| ApiError::NotFound("Identity not found".to_string()))
}

/// Check credentials. Unknown identifiers and wrong passwords are
/// indistinguishable to the caller.
pub async fn authenticate(pool: &PgPool, raw_identifier: &str, password: &str) -> ApiResult<Identity> {
    let identifier = Identifier::parse(raw_identifier);
    let Some(row) = find_by_identifier(pool, &identifier).await? else {
        tracing::warn!(identifier_kind = identifier.kind(), "Login for unknown identifier");
        return Err(ApiError::Unauthorized);
    };

    if !password::verify_password(password, &row.password_hash) {
        tracing::warn!(identity_id = %row.id, "Login with wrong password");
        return Err(ApiError::Unauthorized);
    }

    sqlx::query("UPDATE identities SET last_login_at = NOW(), updated_at = NOW() WHERE id = $1")
        .bind(row.id)
        .execute(pool)
        .await?;

    tracing::info!(
        identity_id = %row.id,
        identifier_kind = identifier.kind(),
        "Identity authenticated"
    );
    Ok(row.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_rules() {
        assert!(validate_username("ada_obi").is_ok());
        assert!(validate_username("ab").is_err());
        assert!(validate_username("ada obi").is_err());
        assert!(validate_username("TP-A12345678").is_err());
    }

    #[test]
    fn test_email_rules() {
        assert!(validate_email("ada@nitp.org.ng").is_ok());
        assert!(validate_email("ada@localhost").is_err());
        assert!(validate_email("@nitp.org.ng").is_err());
        assert!(validate_email("ada").is_err());
    }
}
