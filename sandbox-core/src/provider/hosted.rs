//! Hosted backend: wraps a remote serverless sandbox API.
//!
//! The remote service owns real isolation; this provider trusts only its
//! documented HTTP surface. Create/start/stop/terminate/snapshot/restore/exec
//! are thin JSON calls; log streaming is a server-sent byte stream.

use std::env;

use reqwest::Method;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::error::{Result, SandboxError};
use crate::http::{bearer_headers, build_url, send_json};
use crate::provider::{
    CreateInput, ExecOptions, ExecResult, GitState, ImageRef, LogStream, NetworkInfo, Provider,
    SandboxInfo, SandboxStatus, SyncStatus, TimeInfo,
};
use crate::util::http_client;

/// Hosted backend credentials. Fields fall back to the environment variables
/// of the same (upper-cased) names when not supplied via configuration.
#[derive(Clone, Debug)]
pub struct HostedConfig {
    pub token_id: String,
    pub token_secret: String,
    pub app_name: String,
    pub api_base_url: String,
}

impl HostedConfig {
    /// Resolve credentials from explicit values with environment fallbacks
    /// (`TOKEN_ID`, `TOKEN_SECRET`, `APP_NAME`, `API_BASE_URL`).
    pub fn resolve(
        token_id: Option<String>,
        token_secret: Option<String>,
        app_name: Option<String>,
        api_base_url: Option<String>,
    ) -> Result<Self> {
        let pick = |explicit: Option<String>, var: &str| -> Result<String> {
            explicit
                .or_else(|| env::var(var).ok())
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| {
                    SandboxError::Validation(format!("Missing hosted backend credential {var}"))
                })
        };
        Ok(Self {
            token_id: pick(token_id, "TOKEN_ID")?,
            token_secret: pick(token_secret, "TOKEN_SECRET")?,
            app_name: pick(app_name, "APP_NAME")?,
            api_base_url: pick(api_base_url, "API_BASE_URL")?,
        })
    }
}

pub struct HostedProvider {
    config: HostedConfig,
    /// Host part of the public URL scheme `https://{app}--{id}.{host}`.
    public_host: String,
}

/// Map a remote status string onto the sandbox lifecycle.
pub fn map_remote_status(status: &str) -> SandboxStatus {
    match status {
        "pending" | "starting" => SandboxStatus::Initializing,
        "running" => SandboxStatus::Running,
        "stopped" | "suspended" => SandboxStatus::Suspended,
        "terminated" | "failed" => SandboxStatus::Terminated,
        _ => SandboxStatus::Ready,
    }
}

fn map_remote_sync(status: &str) -> SyncStatus {
    match status {
        "syncing" => SyncStatus::Syncing,
        "synced" => SyncStatus::Synced,
        "error" => SyncStatus::Error,
        _ => SyncStatus::Pending,
    }
}

impl HostedProvider {
    pub fn new(config: HostedConfig) -> Result<Self> {
        let public_host = reqwest::Url::parse(&config.api_base_url)
            .ok()
            .and_then(|url| url.host_str().map(|h| h.to_string()))
            .ok_or_else(|| {
                SandboxError::Validation(format!(
                    "Invalid hosted API base URL '{}'",
                    config.api_base_url
                ))
            })?;
        Ok(Self {
            config,
            public_host,
        })
    }

    fn auth_token(&self) -> String {
        format!("{}:{}", self.config.token_id, self.config.token_secret)
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = build_url(&self.config.api_base_url, path)?;
        let headers = bearer_headers(&self.auth_token())?;
        let (_, text) = send_json(method, url, body, headers).await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|err| SandboxError::Http(format!("Invalid backend response JSON: {err}")))
    }

    pub fn public_url(&self, remote_id: &str) -> String {
        format!(
            "https://{}--{}.{}",
            self.config.app_name, remote_id, self.public_host
        )
    }

    fn parse_sandbox(&self, value: &Value) -> Result<SandboxInfo> {
        let obj = value
            .as_object()
            .ok_or_else(|| SandboxError::Http("Backend returned a non-object sandbox".into()))?;
        let str_of = |key: &str| -> String {
            obj.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let id = str_of("id");
        if id.is_empty() {
            return Err(SandboxError::Http("Backend sandbox missing id".into()));
        }

        let git = obj.get("git").cloned().unwrap_or(Value::Null);
        let image = obj.get("image").cloned().unwrap_or(Value::Null);
        let time = obj.get("time").cloned().unwrap_or(Value::Null);
        let u64_of = |v: &Value, key: &str| v.get(key).and_then(Value::as_u64).unwrap_or(0);

        Ok(SandboxInfo {
            id: id.clone(),
            project_id: str_of("project_id"),
            status: map_remote_status(obj.get("status").and_then(Value::as_str).unwrap_or("")),
            image: ImageRef {
                id: image.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                tag: image.get("tag").and_then(Value::as_str).unwrap_or_default().to_string(),
                digest: image
                    .get("digest")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                built_at: u64_of(&image, "built_at"),
            },
            git: GitState {
                repo: git.get("repo").and_then(Value::as_str).unwrap_or_default().to_string(),
                branch: git
                    .get("branch")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                commit: git
                    .get("commit")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                sync_status: map_remote_sync(
                    git.get("sync_status").and_then(Value::as_str).unwrap_or(""),
                ),
                synced_at: git.get("synced_at").and_then(Value::as_u64),
            },
            services: Vec::new(),
            network: NetworkInfo {
                internal_ip: obj
                    .get("network")
                    .and_then(|n| n.get("internal_ip"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                ports: Default::default(),
                public_url: Some(self.public_url(&id)),
            },
            snapshot: obj
                .get("snapshot")
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            time: TimeInfo {
                created: u64_of(&time, "created"),
                ready: time.get("ready").and_then(Value::as_u64),
                last_activity: u64_of(&time, "last_activity"),
            },
        })
    }
}

#[async_trait::async_trait]
impl Provider for HostedProvider {
    async fn create(&self, input: CreateInput) -> Result<SandboxInfo> {
        let body = json!({
            "project_id": input.project_id,
            "repo": input.repo,
            "branch": input.branch,
            "image_tag": input.image_tag,
            "env": input.env,
            "services": input.services,
        });
        let value = self.call(Method::POST, "/v1/sandboxes", Some(body)).await?;
        crate::metrics::metrics().record_sandbox_created();
        self.parse_sandbox(&value)
    }

    async fn get(&self, id: &str) -> Result<Option<SandboxInfo>> {
        match self.call(Method::GET, &format!("/v1/sandboxes/{id}"), None).await {
            Ok(value) => Ok(Some(self.parse_sandbox(&value)?)),
            Err(SandboxError::Backend { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list(&self, project_id: Option<&str>) -> Result<Vec<SandboxInfo>> {
        let path = match project_id {
            Some(project) => format!("/v1/sandboxes?project_id={project}"),
            None => "/v1/sandboxes".to_string(),
        };
        let value = self.call(Method::GET, &path, None).await?;
        let items = value
            .get("sandboxes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        items.iter().map(|v| self.parse_sandbox(v)).collect()
    }

    async fn start(&self, id: &str) -> Result<SandboxInfo> {
        let value = self
            .call(Method::POST, &format!("/v1/sandboxes/{id}/start"), None)
            .await?;
        self.parse_sandbox(&value)
    }

    async fn stop(&self, id: &str) -> Result<SandboxInfo> {
        let value = self
            .call(Method::POST, &format!("/v1/sandboxes/{id}/stop"), None)
            .await?;
        self.parse_sandbox(&value)
    }

    async fn terminate(&self, id: &str) -> Result<()> {
        match self
            .call(Method::DELETE, &format!("/v1/sandboxes/{id}"), None)
            .await
        {
            Ok(_) => {
                crate::metrics::metrics().record_sandbox_terminated();
                Ok(())
            }
            // Already gone — terminate is idempotent.
            Err(SandboxError::Backend { status: 404, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn snapshot(&self, id: &str) -> Result<String> {
        let value = self
            .call(Method::POST, &format!("/v1/sandboxes/{id}/snapshots"), None)
            .await?;
        value
            .get("snapshot_id")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| SandboxError::Http("Backend snapshot response missing snapshot_id".into()))
    }

    async fn restore(&self, snapshot_id: &str) -> Result<SandboxInfo> {
        let value = self
            .call(
                Method::POST,
                &format!("/v1/snapshots/{snapshot_id}/restore"),
                None,
            )
            .await?;
        crate::metrics::metrics().record_sandbox_created();
        let mut info = self.parse_sandbox(&value)?;
        // The snapshot's git state is advisory; a fresh sync is required
        // before the gate admits writes.
        info.git.sync_status = SyncStatus::Pending;
        info.git.synced_at = None;
        Ok(info)
    }

    async fn execute(&self, id: &str, argv: &[String], opts: ExecOptions) -> Result<ExecResult> {
        let body = json!({
            "argv": argv,
            "cwd": opts.cwd,
            "env": opts.env,
            "timeout_ms": opts.timeout.map(|t| t.as_millis() as u64),
        });
        let started = crate::util::now_ms();
        match self
            .call(Method::POST, &format!("/v1/sandboxes/{id}/exec"), Some(body))
            .await
        {
            Ok(value) => Ok(ExecResult {
                exit_code: value
                    .get("exit_code")
                    .and_then(Value::as_i64)
                    .unwrap_or(1) as i32,
                stdout: value
                    .get("stdout")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                stderr: value
                    .get("stderr")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                duration_ms: value
                    .get("duration_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or_else(|| crate::util::now_ms().saturating_sub(started)),
            }),
            // Backend/transport failures surface through the exec result.
            Err(err) => Ok(ExecResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: err.to_string(),
                duration_ms: crate::util::now_ms().saturating_sub(started),
            }),
        }
    }

    async fn stream_logs(&self, id: &str, service: &str) -> Result<LogStream> {
        let url = build_url(
            &self.config.api_base_url,
            &format!("/v1/sandboxes/{id}/logs/{service}"),
        )?;
        let headers = bearer_headers(&self.auth_token())?;
        let response = http_client()?
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|err| SandboxError::Http(format!("Log stream request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(SandboxError::Backend {
                status: response.status().as_u16(),
                body: format!("log stream for service '{service}' unavailable"),
            });
        }

        let (tx, rx) = mpsc::channel::<String>(16);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            use tokio_stream::StreamExt;
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        let text = String::from_utf8_lossy(&bytes).to_string();
                        if tx.send(text).await.is_err() {
                            debug!("log stream receiver dropped, cancelling");
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn sync_git(&self, id: &str) -> Result<GitState> {
        let value = self
            .call(Method::POST, &format!("/v1/sandboxes/{id}/git/sync"), None)
            .await?;
        let parsed = self.parse_git(&value);
        Ok(parsed)
    }

    async fn git_status(&self, id: &str) -> Result<GitState> {
        let value = self
            .call(Method::GET, &format!("/v1/sandboxes/{id}/git"), None)
            .await?;
        Ok(self.parse_git(&value))
    }
}

impl HostedProvider {
    fn parse_git(&self, value: &Value) -> GitState {
        GitState {
            repo: value
                .get("repo")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            branch: value
                .get("branch")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            commit: value
                .get("commit")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            sync_status: map_remote_sync(
                value.get("sync_status").and_then(Value::as_str).unwrap_or(""),
            ),
            synced_at: value.get("synced_at").and_then(Value::as_u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base: &str) -> HostedConfig {
        HostedConfig {
            token_id: "tid".into(),
            token_secret: "tsec".into(),
            app_name: "opencode".into(),
            api_base_url: base.to_string(),
        }
    }

    #[test]
    fn remote_status_mapping() {
        assert_eq!(map_remote_status("pending"), SandboxStatus::Initializing);
        assert_eq!(map_remote_status("starting"), SandboxStatus::Initializing);
        assert_eq!(map_remote_status("running"), SandboxStatus::Running);
        assert_eq!(map_remote_status("stopped"), SandboxStatus::Suspended);
        assert_eq!(map_remote_status("suspended"), SandboxStatus::Suspended);
        assert_eq!(map_remote_status("terminated"), SandboxStatus::Terminated);
        assert_eq!(map_remote_status("failed"), SandboxStatus::Terminated);
        assert_eq!(map_remote_status("anything-else"), SandboxStatus::Ready);
    }

    #[test]
    fn public_url_shape() {
        let provider = HostedProvider::new(config("https://api.sandboxes.example.com")).unwrap();
        assert_eq!(
            provider.public_url("sb-123"),
            "https://opencode--sb-123.api.sandboxes.example.com"
        );
    }

    #[test]
    fn resolve_prefers_explicit_over_env() {
        let resolved = HostedConfig::resolve(
            Some("explicit-id".into()),
            Some("explicit-secret".into()),
            Some("app".into()),
            Some("https://api.example.com".into()),
        )
        .unwrap();
        assert_eq!(resolved.token_id, "explicit-id");
    }

    #[tokio::test]
    async fn create_maps_remote_sandbox() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "sb-1",
                "project_id": "proj",
                "status": "pending",
                "git": {"repo": "acme/app", "branch": "main", "sync_status": "pending"},
            })))
            .mount(&server)
            .await;

        let provider = HostedProvider::new(config(&server.uri())).unwrap();
        let info = provider
            .create(CreateInput {
                project_id: "proj".into(),
                repo: "acme/app".into(),
                branch: "main".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(info.id, "sb-1");
        assert_eq!(info.status, SandboxStatus::Initializing);
        assert_eq!(info.git.sync_status, SyncStatus::Pending);
        assert!(info.network.public_url.as_deref().unwrap().starts_with("https://opencode--sb-1."));
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/sandboxes/sb-nope"))
            .respond_with(ResponseTemplate::new(404).set_body_string("{\"error\":\"not found\"}"))
            .mount(&server)
            .await;

        let provider = HostedProvider::new(config(&server.uri())).unwrap();
        assert!(provider.get("sb-nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminate_is_idempotent_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/sandboxes/sb-gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = HostedProvider::new(config(&server.uri())).unwrap();
        provider.terminate("sb-gone").await.unwrap();
    }

    #[tokio::test]
    async fn backend_error_preserves_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes"))
            .respond_with(ResponseTemplate::new(503).set_body_string("quota exceeded"))
            .mount(&server)
            .await;

        let provider = HostedProvider::new(config(&server.uri())).unwrap();
        let err = provider.create(CreateInput::default()).await.unwrap_err();
        match err {
            SandboxError::Backend { status, body } => {
                assert_eq!(status, 503);
                assert!(body.contains("quota exceeded"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn exec_transport_failure_is_exit_one() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/sandboxes/sb-1/exec"))
            .respond_with(ResponseTemplate::new(500).set_body_string("backend exploded"))
            .mount(&server)
            .await;

        let provider = HostedProvider::new(config(&server.uri())).unwrap();
        let result = provider
            .execute("sb-1", &["ls".into()], ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("backend exploded"));
    }

    #[tokio::test]
    async fn restore_requires_fresh_sync() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/snapshots/snap-9/restore"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "sb-2",
                "status": "ready",
                "git": {"repo": "acme/app", "branch": "main", "commit": "abc", "sync_status": "synced"},
            })))
            .mount(&server)
            .await;

        let provider = HostedProvider::new(config(&server.uri())).unwrap();
        let info = provider.restore("snap-9").await.unwrap();
        assert_eq!(info.git.sync_status, SyncStatus::Pending);
    }
}
