use std::path::Path;

use color_eyre::eyre::{eyre, WrapErr as _};
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use tracing::{error, info};

use crate::state::MediaConfig;

/// A stored remote asset: the public URL clients see plus the
/// identifier the host accepts for deletion.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedMedia {
    #[serde(rename = "secure_url")]
    pub url: String,
    pub public_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteOutcome {
    pub result: String,
}

/// Client for the external media host (a Cloudinary-style upload API).
#[derive(Clone)]
pub struct MediaClient {
    http: reqwest::Client,
    config: MediaConfig,
}

impl MediaClient {
    pub fn new(config: MediaConfig) -> color_eyre::Result<Self> {
        let http = reqwest::ClientBuilder::new()
            .timeout(std::time::Duration::from_secs(30))
            .use_rustls_tls()
            .build()?;

        Ok(Self { http, config })
    }

    /// Upload a staged file. Failures degrade to `None`; callers decide
    /// whether the missing result is fatal.
    pub async fn upload(&self, path: &Path) -> Option<UploadedMedia> {
        match self.try_upload(path).await {
            Ok(media) => {
                info!(url = %media.url, "Uploaded media");
                Some(media)
            }
            Err(err) => {
                error!(error = ?err, "Media upload failed");
                None
            }
        }
    }

    async fn try_upload(&self, path: &Path) -> color_eyre::Result<UploadedMedia> {
        let bytes = tokio::fs::read(path)
            .await
            .wrap_err("failed to read staged upload")?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("upload")
            .to_string();

        let timestamp = chrono::Utc::now().timestamp().to_string();
        let folder = self.config.upload_folder.clone();
        let signature = sign(
            &self.config.api_secret,
            &[("folder", &folder), ("timestamp", &timestamp)],
        );

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            )
            .text("api_key", self.config.api_key.clone())
            .text("timestamp", timestamp)
            .text("folder", folder)
            .text("signature", signature);

        let response = self
            .http
            .post(self.endpoint("upload"))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json::<UploadedMedia>().await?)
    }

    /// Delete a previously uploaded asset. Unlike uploads this does not
    /// degrade: a refused delete is surfaced to the caller.
    pub async fn delete(&self, public_id: &str) -> color_eyre::Result<DeleteOutcome> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = sign(
            &self.config.api_secret,
            &[("public_id", public_id), ("timestamp", &timestamp)],
        );

        let params = [
            ("public_id", public_id),
            ("timestamp", &timestamp),
            ("api_key", &self.config.api_key),
            ("signature", &signature),
        ];

        let response = self
            .http
            .post(self.endpoint("destroy"))
            .form(&params)
            .send()
            .await?
            .error_for_status()?;

        let outcome = response.json::<DeleteOutcome>().await?;
        if outcome.result != "ok" && outcome.result != "not found" {
            return Err(eyre!("media host refused delete: {}", outcome.result));
        }

        info!(public_id, "Deleted media");
        Ok(outcome)
    }

    fn endpoint(&self, action: &str) -> String {
        format!(
            "{}/v1_1/{}/image/{action}",
            self.config.api_base, self.config.cloud_name
        )
    }
}

/// Request signature the host verifies: params sorted by key, joined
/// `k=v` with `&`, secret appended, hex-encoded SHA-256.
fn sign(secret: &str, params: &[(&str, &str)]) -> String {
    let joined = params
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive the deletable identifier from a hosted URL: the last folder
/// segment plus the file name with its extension stripped.
pub fn public_id_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let mut segments = path.rsplit('/');
    let file = segments.next()?;
    let folder = segments.next()?;

    if file.is_empty() || folder.is_empty() {
        return None;
    }

    let stem = file.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(file);
    Some(format!("{folder}/{stem}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_id_includes_folder_and_strips_extension() {
        let url = "https://media.example/v1_1/demo/image/upload/v17123/accounts/abc123.png";
        assert_eq!(public_id_from_url(url), Some("accounts/abc123".to_string()));
    }

    #[test]
    fn public_id_handles_missing_extension_and_query() {
        assert_eq!(
            public_id_from_url("https://media.example/upload/accounts/abc123"),
            Some("accounts/abc123".to_string())
        );
        assert_eq!(
            public_id_from_url("https://media.example/upload/accounts/abc123.png?v=2"),
            Some("accounts/abc123".to_string())
        );
    }

    #[test]
    fn public_id_rejects_unusable_urls() {
        assert_eq!(public_id_from_url(""), None);
        assert_eq!(public_id_from_url("https://media.example/abc/"), None);
    }

    #[test]
    fn signature_is_deterministic_and_keyed() {
        let a = sign("secret", &[("folder", "accounts"), ("timestamp", "1700000000")]);
        let b = sign("secret", &[("folder", "accounts"), ("timestamp", "1700000000")]);
        let c = sign("other-secret", &[("folder", "accounts"), ("timestamp", "1700000000")]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
