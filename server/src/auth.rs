use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use color_eyre::eyre::eyre;
use time::Duration;
use tower_cookies::{Cookie, Cookies};
use uuid::Uuid;

use crate::errors::ApiError;
use crate::state::{AppState, JwtConfig};
use crate::tokens::TokenKind;
use crate::user::User;

pub const ACCESS_TOKEN_COOKIE: &str = "accessToken";
pub const REFRESH_TOKEN_COOKIE: &str = "refreshToken";

/// Extract the current user from the request. Accepts the access token
/// from the session cookie or an `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let cookies = Cookies::from_request_parts(parts, state)
            .await
            .map_err(|_| ApiError::Internal(eyre!("cookie layer missing from router")))?;

        let token = cookies
            .get(ACCESS_TOKEN_COOKIE)
            .map(|cookie| cookie.value().to_string())
            .or_else(|| bearer_token(parts));

        let Some(token) = token else {
            return Err(ApiError::Unauthorized("Missing access token".to_string()));
        };

        let claims = state
            .tokens
            .verify(&token, TokenKind::Access)
            .map_err(|_| ApiError::Unauthorized("Invalid access token".to_string()))?;

        let user_id: Uuid = claims
            .sub
            .parse()
            .map_err(|_| ApiError::Unauthorized("Invalid access token".to_string()))?;

        let user = User::get_by_id(&state.db, user_id)
            .await?
            .ok_or_else(|| ApiError::Unauthorized("Invalid access token".to_string()))?;

        Ok(AuthUser { user })
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_owned)
}

fn session_cookie(name: &'static str, value: String, max_age: Duration) -> Cookie<'static> {
    let mut cookie = Cookie::new(name, value);
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_secure(true);
    cookie.set_max_age(max_age);
    cookie
}

/// Set both session cookies, scoped to the token lifetimes.
pub fn set_session_cookies(cookies: &Cookies, jwt: &JwtConfig, access: &str, refresh: &str) {
    cookies.add(session_cookie(
        ACCESS_TOKEN_COOKIE,
        access.to_owned(),
        Duration::minutes(jwt.access_ttl_minutes),
    ));
    cookies.add(session_cookie(
        REFRESH_TOKEN_COOKIE,
        refresh.to_owned(),
        Duration::days(jwt.refresh_ttl_days),
    ));
}

/// Remove both session cookies, not just let them expire.
pub fn clear_session_cookies(cookies: &Cookies) {
    for name in [ACCESS_TOKEN_COOKIE, REFRESH_TOKEN_COOKIE] {
        let mut cookie = Cookie::new(name, "");
        cookie.set_path("/");
        cookie.set_http_only(true);
        cookie.set_secure(true);
        cookie.set_max_age(Duration::seconds(-1));
        cookies.remove(cookie);
    }
}
