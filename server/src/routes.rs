use std::collections::HashMap;

use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, State},
    http::{header, Method},
    routing::{get, patch, post},
    Json, Router,
};
use color_eyre::eyre::eyre;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tower_cookies::{CookieManagerLayer, Cookies};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::{
    auth::{self, AuthUser},
    errors::{ApiError, ApiResult},
    media,
    response::ApiResponse,
    state::AppState,
    tokens::TokenKind,
    user::{self, NewUser, SanitizedUser, User},
};

const MULTIPART_BODY_LIMIT: usize = 8 * 1024 * 1024;

/// Build the application router with all routes
pub fn routes(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(app_state.cors_origin.clone())
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PATCH])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .nest("/api/v1/users", user_routes())
        .layer(CookieManagerLayer::new())
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app_state)
}

fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/refresh-token", post(refresh_token))
        .route("/change-password", post(change_password))
        .route("/current-user", get(current_user))
        .route("/update-account", patch(update_account))
        .route("/avatar", patch(update_avatar))
        .route("/cover-image", patch(update_cover_image))
        .layer(DefaultBodyLimit::max(MULTIPART_BODY_LIMIT))
}

// ---------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------

async fn register(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<ApiResponse<SanitizedUser>> {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut avatar: Option<NamedTempFile> = None;
    let mut cover_image: Option<NamedTempFile> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        match name.as_str() {
            "avatar" => avatar = Some(stage_upload(field).await?),
            "coverImage" => cover_image = Some(stage_upload(field).await?),
            _ => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("malformed field {name}: {e}")))?;
                fields.insert(name, value);
            }
        }
    }

    let full_name = required(&fields, "fullname")?;
    let email = required(&fields, "email")?;
    let username = required(&fields, "username")?.to_lowercase();
    let password = required(&fields, "password")?;

    if User::exists_with_username_or_email(&state.db, &username, &email).await? {
        return Err(ApiError::Conflict(
            "User with the same username or email already exists".to_string(),
        ));
    }

    let Some(avatar_file) = avatar else {
        return Err(ApiError::BadRequest("Avatar file is required".to_string()));
    };

    let uploaded_avatar = state
        .media
        .upload(avatar_file.path())
        .await
        .ok_or_else(|| ApiError::BadRequest("Avatar upload failed".to_string()))?;
    let uploaded_cover = match &cover_image {
        Some(staged) => state.media.upload(staged.path()).await,
        None => None,
    };

    let created = User::create(
        &state.db,
        &NewUser {
            username,
            email,
            full_name,
            password_hash: user::hash_password(&password)?,
            avatar_url: uploaded_avatar.url,
            cover_image_url: uploaded_cover.map(|cover| cover.url),
        },
    )
    .await?;

    // Re-read with the secret columns excluded so the response is never
    // built from the row that carried the password hash.
    let created = User::get_sanitized(&state.db, created.id)
        .await?
        .ok_or_else(|| ApiError::Internal(eyre!("user {} missing after insert", created.id)))?;

    Ok(ApiResponse::created(created, "User registered successfully"))
}

fn required(fields: &HashMap<String, String>, name: &str) -> Result<String, ApiError> {
    match fields.get(name) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ApiError::BadRequest(format!("{name} is required"))),
    }
}

/// Write an uploaded field to a temp file. The file is unlinked when
/// the handle drops, on every exit path of the calling handler.
async fn stage_upload(field: Field<'_>) -> Result<NamedTempFile, ApiError> {
    let bytes = field
        .bytes()
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read uploaded file: {e}")))?;

    let staged = NamedTempFile::new().map_err(|e| ApiError::Internal(e.into()))?;
    tokio::fs::write(staged.path(), &bytes)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;

    Ok(staged)
}

async fn stage_named_file(
    multipart: &mut Multipart,
    name: &str,
) -> Result<Option<NamedTempFile>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        if field.name() == Some(name) {
            return Ok(Some(stage_upload(field).await?));
        }
    }

    Ok(None)
}

// ---------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LoginPayload {
    username: Option<String>,
    email: Option<String>,
    password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionBody {
    user: SanitizedUser,
    access_token: String,
    refresh_token: String,
}

async fn login(
    State(state): State<AppState>,
    cookies: Cookies,
    Json(payload): Json<LoginPayload>,
) -> ApiResult<ApiResponse<SessionBody>> {
    let identifier = payload
        .username
        .or(payload.email)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("username or email is required".to_string()))?;

    let user = User::find_by_identifier(&state.db, identifier.trim())
        .await?
        .ok_or_else(|| ApiError::NotFound("User does not exist".to_string()))?;

    if !user::verify_password(&payload.password, &user.password_hash) {
        return Err(ApiError::Unauthorized("Password is incorrect".to_string()));
    }

    let (access, refresh) = issue_session(&state, &user).await?;

    let sanitized = User::get_sanitized(&state.db, user.id)
        .await?
        .ok_or_else(|| ApiError::Internal(eyre!("user {} missing after login", user.id)))?;

    auth::set_session_cookies(&cookies, &state.jwt, &access, &refresh);
    info!(user_id = %user.id, "User logged in");

    Ok(ApiResponse::ok(
        SessionBody {
            user: sanitized,
            access_token: access,
            refresh_token: refresh,
        },
        "User logged in successfully",
    ))
}

/// Issue a fresh access/refresh pair and persist the refresh token as
/// the user's single active one, invalidating whatever came before.
async fn issue_session(state: &AppState, user: &User) -> Result<(String, String), ApiError> {
    let access = state.tokens.issue_access(user.id, &user.username)?;
    let refresh = state.tokens.issue_refresh(user.id, &user.username)?;

    User::set_refresh_token(&state.db, user.id, Some(&refresh)).await?;

    Ok((access, refresh))
}

async fn logout(
    State(state): State<AppState>,
    cookies: Cookies,
    AuthUser { user }: AuthUser,
) -> ApiResult<ApiResponse<serde_json::Value>> {
    User::set_refresh_token(&state.db, user.id, None).await?;
    auth::clear_session_cookies(&cookies);
    info!(user_id = %user.id, "User logged out");

    Ok(ApiResponse::ok(serde_json::json!({}), "User logged out"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshPayload {
    refresh_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenPairBody {
    access_token: String,
    refresh_token: String,
}

async fn refresh_token(
    State(state): State<AppState>,
    cookies: Cookies,
    payload: Option<Json<RefreshPayload>>,
) -> ApiResult<ApiResponse<TokenPairBody>> {
    let presented = cookies
        .get(auth::REFRESH_TOKEN_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .or_else(|| payload.and_then(|Json(body)| body.refresh_token))
        .ok_or_else(|| ApiError::Unauthorized("Refresh token is required".to_string()))?;

    let claims = state
        .tokens
        .verify(&presented, TokenKind::Refresh)
        .map_err(|_| ApiError::Unauthorized("Invalid refresh token".to_string()))?;
    let user_id = claims
        .sub
        .parse()
        .map_err(|_| ApiError::Unauthorized("Invalid refresh token".to_string()))?;

    let user = User::get_by_id(&state.db, user_id)
        .await
        .map_err(|err| ApiError::Unauthorized(err.to_string()))?
        .ok_or_else(|| ApiError::NotFound("User does not exist".to_string()))?;

    // Revocation check: a well-formed, unexpired token that no longer
    // matches the stored value has been rotated out or cleared by a
    // logout, and must not mint a new session.
    if user.refresh_token.as_deref() != Some(presented.as_str()) {
        return Err(ApiError::Unauthorized(
            "Refresh token is expired or already used".to_string(),
        ));
    }

    let (access, refresh) = issue_session(&state, &user).await.map_err(|err| match err {
        ApiError::Internal(report) => ApiError::Unauthorized(report.to_string()),
        other => other,
    })?;

    auth::set_session_cookies(&cookies, &state.jwt, &access, &refresh);
    info!(user_id = %user.id, "Rotated session tokens");

    Ok(ApiResponse::ok(
        TokenPairBody {
            access_token: access,
            refresh_token: refresh,
        },
        "Access token refreshed",
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordPayload {
    old_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<AppState>,
    AuthUser { user }: AuthUser,
    Json(payload): Json<ChangePasswordPayload>,
) -> ApiResult<ApiResponse<serde_json::Value>> {
    if payload.new_password.trim().is_empty() {
        return Err(ApiError::BadRequest("newPassword is required".to_string()));
    }

    if !user::verify_password(&payload.old_password, &user.password_hash) {
        return Err(ApiError::BadRequest("Invalid old password".to_string()));
    }

    let password_hash = user::hash_password(&payload.new_password)?;
    User::set_password_hash(&state.db, user.id, &password_hash).await?;

    Ok(ApiResponse::ok(
        serde_json::json!({}),
        "Password changed successfully",
    ))
}

// ---------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------

async fn current_user(AuthUser { user }: AuthUser) -> ApiResult<ApiResponse<SanitizedUser>> {
    Ok(ApiResponse::ok(
        SanitizedUser::from(user),
        "Current user fetched successfully",
    ))
}

#[derive(Debug, Deserialize)]
struct UpdateAccountPayload {
    fullname: Option<String>,
    email: Option<String>,
}

async fn update_account(
    State(state): State<AppState>,
    AuthUser { user }: AuthUser,
    Json(payload): Json<UpdateAccountPayload>,
) -> ApiResult<ApiResponse<SanitizedUser>> {
    let (full_name, email) = match (payload.fullname, payload.email) {
        (Some(full_name), Some(email))
            if !full_name.trim().is_empty() && !email.trim().is_empty() =>
        {
            (full_name, email)
        }
        _ => {
            return Err(ApiError::BadRequest(
                "fullname and email are required".to_string(),
            ))
        }
    };

    let updated = User::update_profile(&state.db, user.id, full_name.trim(), email.trim()).await?;

    Ok(ApiResponse::ok(
        SanitizedUser::from(updated),
        "Account details updated successfully",
    ))
}

async fn update_avatar(
    State(state): State<AppState>,
    AuthUser { user }: AuthUser,
    mut multipart: Multipart,
) -> ApiResult<ApiResponse<SanitizedUser>> {
    let staged = stage_named_file(&mut multipart, "avatar")
        .await?
        .ok_or_else(|| ApiError::BadRequest("Avatar file is required".to_string()))?;

    let uploaded = state
        .media
        .upload(staged.path())
        .await
        .ok_or_else(|| ApiError::BadRequest("Avatar upload failed".to_string()))?;
    if uploaded.url.is_empty() {
        return Err(ApiError::BadRequest(
            "Media host returned no URL for the avatar".to_string(),
        ));
    }

    // Drop the previous remote asset before committing the new URL. A
    // failed delete aborts the swap rather than leaking it silently.
    if let Some(public_id) = media::public_id_from_url(&user.avatar_url) {
        state.media.delete(&public_id).await?;
    }

    let updated = User::set_avatar_url(&state.db, user.id, &uploaded.url).await?;
    info!(user_id = %user.id, "Replaced avatar");

    Ok(ApiResponse::ok(
        SanitizedUser::from(updated),
        "Avatar updated successfully",
    ))
}

async fn update_cover_image(
    State(state): State<AppState>,
    AuthUser { user }: AuthUser,
    mut multipart: Multipart,
) -> ApiResult<ApiResponse<SanitizedUser>> {
    let staged = stage_named_file(&mut multipart, "coverImage")
        .await?
        .ok_or_else(|| ApiError::BadRequest("Cover image file is required".to_string()))?;

    let uploaded = state
        .media
        .upload(staged.path())
        .await
        .ok_or_else(|| ApiError::BadRequest("Cover image upload failed".to_string()))?;
    if uploaded.url.is_empty() {
        return Err(ApiError::BadRequest(
            "Media host returned no URL for the cover image".to_string(),
        ));
    }

    // Unlike the avatar path, the old cover image stays on the media
    // host. TODO: confirm whether old covers should be deleted too.
    let updated = User::set_cover_image_url(&state.db, user.id, &uploaded.url).await?;
    info!(user_id = %user.id, "Replaced cover image");

    Ok(ApiResponse::ok(
        SanitizedUser::from(updated),
        "Cover image updated successfully",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_rejects_blank_and_missing_fields() {
        let mut fields = HashMap::new();
        fields.insert("fullname".to_string(), "  ".to_string());
        fields.insert("email".to_string(), "ann@x.com".to_string());

        assert!(required(&fields, "fullname").is_err());
        assert!(required(&fields, "username").is_err());
        assert_eq!(required(&fields, "email").unwrap(), "ann@x.com");
    }

    #[test]
    fn required_trims_surrounding_whitespace() {
        let mut fields = HashMap::new();
        fields.insert("username".to_string(), " annlee ".to_string());

        assert_eq!(required(&fields, "username").unwrap(), "annlee");
    }
}
