use chrono::{DateTime, Utc};
use color_eyre::eyre::eyre;
use serde::Serialize;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

/// A full user row, including the secret columns. Never serialized;
/// responses go through [`SanitizedUser`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    /// At most one valid refresh token per user; rotating or clearing
    /// it invalidates whatever was stored before.
    pub refresh_token: Option<String>,
    pub avatar_url: String,
    pub cover_image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// User view safe to return to clients. The password hash and refresh
/// token have no field here at all, so they cannot leak even as null.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SanitizedUser {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub avatar_url: String,
    pub cover_image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<User> for SanitizedUser {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            full_name: user.full_name,
            avatar_url: user.avatar_url,
            cover_image_url: user.cover_image_url,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

pub struct NewUser {
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    pub avatar_url: String,
    pub cover_image_url: Option<String>,
}

const USER_COLUMNS: &str = "id, username, email, full_name, password_hash, refresh_token, \
     avatar_url, cover_image_url, created_at, updated_at";

const SANITIZED_COLUMNS: &str =
    "id, username, email, full_name, avatar_url, cover_image_url, created_at, updated_at";

impl User {
    pub async fn get_by_id(pool: &PgPool, user_id: Uuid) -> color_eyre::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        Ok(user)
    }

    /// Fetch a user with the secret columns left out of the query
    /// entirely, for building responses.
    pub async fn get_sanitized(
        pool: &PgPool,
        user_id: Uuid,
    ) -> color_eyre::Result<Option<SanitizedUser>> {
        let user = sqlx::query_as::<_, SanitizedUser>(&format!(
            "SELECT {SANITIZED_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        Ok(user)
    }

    /// Look a user up by username or email with a single identifier.
    pub async fn find_by_identifier(
        pool: &PgPool,
        identifier: &str,
    ) -> color_eyre::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1 OR email = $1"
        ))
        .bind(identifier)
        .fetch_optional(pool)
        .await?;

        Ok(user)
    }

    pub async fn exists_with_username_or_email(
        pool: &PgPool,
        username: &str,
        email: &str,
    ) -> color_eyre::Result<bool> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE username = $1 OR email = $2 LIMIT 1")
                .bind(username)
                .bind(email)
                .fetch_optional(pool)
                .await?;

        Ok(row.is_some())
    }

    pub async fn create(pool: &PgPool, new_user: &NewUser) -> color_eyre::Result<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (username, email, full_name, password_hash, avatar_url, cover_image_url) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(&new_user.username)
        .bind(&new_user.email)
        .bind(&new_user.full_name)
        .bind(&new_user.password_hash)
        .bind(&new_user.avatar_url)
        .bind(&new_user.cover_image_url)
        .fetch_one(pool)
        .await?;

        info!("Created new user with ID: {}", user.id);

        Ok(user)
    }

    /// Persist (or clear, with `None`) the single active refresh token.
    /// Touches only that column; nothing else on the record is
    /// revalidated or rewritten.
    pub async fn set_refresh_token(
        pool: &PgPool,
        user_id: Uuid,
        refresh_token: Option<&str>,
    ) -> color_eyre::Result<()> {
        sqlx::query("UPDATE users SET refresh_token = $1, updated_at = NOW() WHERE id = $2")
            .bind(refresh_token)
            .bind(user_id)
            .execute(pool)
            .await?;

        Ok(())
    }

    pub async fn update_profile(
        pool: &PgPool,
        user_id: Uuid,
        full_name: &str,
        email: &str,
    ) -> color_eyre::Result<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET full_name = $1, email = $2, updated_at = NOW() \
             WHERE id = $3 RETURNING {USER_COLUMNS}"
        ))
        .bind(full_name)
        .bind(email)
        .bind(user_id)
        .fetch_one(pool)
        .await?;

        info!("Updated account details for user {}", user.id);

        Ok(user)
    }

    pub async fn set_password_hash(
        pool: &PgPool,
        user_id: Uuid,
        password_hash: &str,
    ) -> color_eyre::Result<()> {
        sqlx::query("UPDATE users SET password_hash = $1, updated_at = NOW() WHERE id = $2")
            .bind(password_hash)
            .bind(user_id)
            .execute(pool)
            .await?;

        info!("Updated password for user {}", user_id);

        Ok(())
    }

    pub async fn set_avatar_url(
        pool: &PgPool,
        user_id: Uuid,
        avatar_url: &str,
    ) -> color_eyre::Result<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET avatar_url = $1, updated_at = NOW() \
             WHERE id = $2 RETURNING {USER_COLUMNS}"
        ))
        .bind(avatar_url)
        .bind(user_id)
        .fetch_one(pool)
        .await?;

        Ok(user)
    }

    pub async fn set_cover_image_url(
        pool: &PgPool,
        user_id: Uuid,
        cover_image_url: &str,
    ) -> color_eyre::Result<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET cover_image_url = $1, updated_at = NOW() \
             WHERE id = $2 RETURNING {USER_COLUMNS}"
        ))
        .bind(cover_image_url)
        .bind(user_id)
        .fetch_one(pool)
        .await?;

        Ok(user)
    }
}

pub fn hash_password(password: &str) -> color_eyre::Result<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(|e| eyre!("failed to hash password: {e}"))
}

/// Compare a candidate password against a stored hash. Malformed
/// hashes count as a mismatch rather than an error.
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    bcrypt::verify(password, password_hash).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> User {
        User {
            id: Uuid::new_v4(),
            username: "annlee".to_string(),
            email: "ann@x.com".to_string(),
            full_name: "Ann Lee".to_string(),
            password_hash: "$2b$12$secret".to_string(),
            refresh_token: Some("some.jwt.token".to_string()),
            avatar_url: "https://media.example/image/upload/v1/accounts/abc.png".to_string(),
            cover_image_url: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn sanitized_user_has_no_secret_fields() {
        let sanitized = SanitizedUser::from(sample_user());
        let value = serde_json::to_value(&sanitized).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();

        assert!(keys.contains(&"username"));
        assert!(keys.contains(&"fullName"));
        assert!(!keys.contains(&"password"));
        assert!(!keys.contains(&"passwordHash"));
        assert!(!keys.contains(&"refreshToken"));
    }

    #[test]
    fn password_hash_round_trip() -> color_eyre::Result<()> {
        let hash = hash_password("secret1")?;
        assert_ne!(hash, "secret1");
        assert!(verify_password("secret1", &hash));
        assert!(!verify_password("wrong", &hash));
        Ok(())
    }

    #[test]
    fn malformed_hash_is_a_mismatch() {
        assert!(!verify_password("secret1", "not-a-bcrypt-hash"));
    }
}
