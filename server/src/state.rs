use std::env;

use axum::http::HeaderValue;
use color_eyre::eyre::{eyre, WrapErr as _};
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::media::MediaClient;
use crate::tokens::TokenIssuer;

/// Signing secrets and lifetimes for the two token kinds. Loaded once
/// at startup; a missing secret is fatal before the server accepts a
/// single request.
#[derive(Clone)]
pub struct JwtConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_days: i64,
}

impl JwtConfig {
    pub fn from_env() -> color_eyre::Result<Self> {
        let access_secret = env::var("ACCESS_TOKEN_SECRET")
            .map_err(|_| eyre!("ACCESS_TOKEN_SECRET environment variable not set"))?;
        let refresh_secret = env::var("REFRESH_TOKEN_SECRET")
            .map_err(|_| eyre!("REFRESH_TOKEN_SECRET environment variable not set"))?;

        if access_secret.is_empty() || refresh_secret.is_empty() {
            return Err(eyre!("token signing secrets must not be empty"));
        }

        Ok(Self {
            access_secret,
            refresh_secret,
            access_ttl_minutes: env_parse("ACCESS_TOKEN_TTL_MINUTES", "15")?,
            refresh_ttl_days: env_parse("REFRESH_TOKEN_TTL_DAYS", "10")?,
        })
    }
}

/// Credentials for the external media host.
#[derive(Clone)]
pub struct MediaConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub api_base: String,
    pub upload_folder: String,
}

impl MediaConfig {
    pub fn from_env() -> color_eyre::Result<Self> {
        Ok(Self {
            cloud_name: env::var("MEDIA_CLOUD_NAME")
                .map_err(|_| eyre!("MEDIA_CLOUD_NAME environment variable not set"))?,
            api_key: env::var("MEDIA_API_KEY")
                .map_err(|_| eyre!("MEDIA_API_KEY environment variable not set"))?,
            api_secret: env::var("MEDIA_API_SECRET")
                .map_err(|_| eyre!("MEDIA_API_SECRET environment variable not set"))?,
            api_base: env::var("MEDIA_API_BASE")
                .unwrap_or_else(|_| "https://api.cloudinary.com".to_string()),
            upload_folder: env::var("MEDIA_UPLOAD_FOLDER")
                .unwrap_or_else(|_| "accounts".to_string()),
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub jwt: JwtConfig,
    pub tokens: TokenIssuer,
    pub media: MediaClient,
    pub cors_origin: HeaderValue,
    pub port: u16,
}

impl AppState {
    pub async fn from_env() -> color_eyre::Result<Self> {
        let db = setup_db_pool().await?;
        let jwt = JwtConfig::from_env()?;
        let media = MediaClient::new(MediaConfig::from_env()?)?;

        let cors_origin = env::var("CORS_ORIGIN")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .parse::<HeaderValue>()
            .wrap_err("CORS_ORIGIN is not a valid header value")?;

        Ok(Self {
            db,
            tokens: TokenIssuer::new(jwt.clone()),
            jwt,
            media,
            cors_origin,
            port: env_parse("PORT", "8000")?,
        })
    }
}

#[tracing::instrument(err)]
pub async fn setup_db_pool() -> color_eyre::Result<PgPool> {
    let database_url =
        env::var("DATABASE_URL").map_err(|_| eyre!("DATABASE_URL environment variable not set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;

    sqlx::migrate!("../migrations").run(&pool).await?;

    Ok(pool)
}

fn env_parse<T>(name: &str, default: &str) -> color_eyre::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .map_err(|e| eyre!("{name} has an invalid value {raw:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_to_default() -> color_eyre::Result<()> {
        std::env::remove_var("STATE_TEST_MISSING");
        let port: u16 = env_parse("STATE_TEST_MISSING", "8000")?;
        assert_eq!(port, 8000);
        Ok(())
    }

    #[test]
    fn env_parse_rejects_garbage() {
        std::env::set_var("STATE_TEST_GARBAGE", "not-a-number");
        let result: color_eyre::Result<u16> = env_parse("STATE_TEST_GARBAGE", "8000");
        assert!(result.is_err());
        std::env::remove_var("STATE_TEST_GARBAGE");
    }
}
