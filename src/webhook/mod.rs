//! Deployment webhook.
//!
//! GitHub calls back after CI; a successful workflow run on `main` triggers
//! the deploy script. The request body is authenticated with the shared
//! webhook secret before anything is parsed.

use std::path::PathBuf;
use std::process::Stdio;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hmac::{Hmac, Mac};
use log::{debug, error, info};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tokio::process::Command;

use crate::api::AppState;

/// Deployment webhook configuration.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Shared secret for `X-Hub-Signature-256` verification.
    pub secret: String,
    /// Script executed on a successful main-branch workflow run.
    pub deploy_script: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub workflow_run: WorkflowRun,
}

#[derive(Debug, Default, Deserialize)]
pub struct WorkflowRun {
    #[serde(default)]
    pub conclusion: String,
    #[serde(default)]
    pub head_branch: String,
}

/// POST /github-webhook
pub async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(signature) = headers
        .get("X-Hub-Signature-256")
        .and_then(|value| value.to_str().ok())
    else {
        debug!("missing signature in webhook request");
        return error_response(StatusCode::BAD_REQUEST, "Missing signature");
    };

    if !verify_signature(state.webhook.secret.as_bytes(), &body, signature) {
        debug!("invalid webhook signature");
        return error_response(StatusCode::FORBIDDEN, "Invalid signature");
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            debug!("invalid webhook payload: {err}");
            return error_response(StatusCode::BAD_REQUEST, "Invalid payload");
        }
    };

    if !should_deploy(&payload) {
        debug!(
            "skipping webhook: action={}, conclusion={}, branch={}",
            payload.action, payload.workflow_run.conclusion, payload.workflow_run.head_branch
        );
        return StatusCode::NO_CONTENT.into_response();
    }

    let script = state.webhook.deploy_script.clone();
    tokio::spawn(async move {
        if let Err(err) = run_deploy_script(&script).await {
            error!("deployment script failed: {err}");
        } else {
            info!("deployment script completed successfully");
        }
    });

    info!("deployment script triggered");
    (
        StatusCode::OK,
        Json(json!({ "message": "Deployment triggered" })),
    )
        .into_response()
}

/// Verify an `X-Hub-Signature-256` header against the raw body.
pub fn verify_signature(secret: &[u8], body: &[u8], header: &str) -> bool {
    let Some(hash) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hash) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Only completed, successful runs of the main branch deploy.
pub fn should_deploy(payload: &WebhookPayload) -> bool {
    payload.action == "completed"
        && payload.workflow_run.conclusion == "success"
        && payload.workflow_run.head_branch == "main"
}

async fn run_deploy_script(script: &PathBuf) -> anyhow::Result<()> {
    if !script.exists() {
        anyhow::bail!("deployment script not found: {}", script.display());
    }

    let output = Command::new(script)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if !line.is_empty() {
            info!("[DEPLOY-OUT] {line}");
        }
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        if !line.is_empty() {
            info!("[DEPLOY-ERR] {line}");
        }
    }

    if !output.status.success() {
        anyhow::bail!("deployment script exited with {}", output.status);
    }
    Ok(())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &[u8], body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_valid_signature() {
        let body = br#"{"action":"completed"}"#;
        let header = sign(b"secret", body);
        assert!(verify_signature(b"secret", body, &header));
    }

    #[test]
    fn rejects_bad_signatures() {
        let body = br#"{"action":"completed"}"#;
        let header = sign(b"secret", body);
        assert!(!verify_signature(b"other-secret", body, &header));
        assert!(!verify_signature(b"secret", b"tampered", &header));
        assert!(!verify_signature(b"secret", body, "sha256=zz"));
        assert!(!verify_signature(b"secret", body, "sha1=abcd"));
        assert!(!verify_signature(b"secret", body, ""));
    }

    fn payload(action: &str, conclusion: &str, branch: &str) -> WebhookPayload {
        WebhookPayload {
            action: action.to_string(),
            workflow_run: WorkflowRun {
                conclusion: conclusion.to_string(),
                head_branch: branch.to_string(),
            },
        }
    }

    #[test]
    fn deploys_only_successful_main_runs() {
        assert!(should_deploy(&payload("completed", "success", "main")));
        assert!(!should_deploy(&payload("requested", "success", "main")));
        assert!(!should_deploy(&payload("completed", "failure", "main")));
        assert!(!should_deploy(&payload("completed", "success", "develop")));
    }
}
