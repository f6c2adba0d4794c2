//! `Session` over the hypervisor's HTTPS REST API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};
use url::Url;

use super::{
    ContainerConfig, ContainerState, HostInfo, ImageUpload, MigrationSource, OperationHandle,
    OperationMetadata, OperationStatus, RemoteError, RemoteResult, Session, StateChange,
};
use crate::config::{DriverConfig, RetryPolicy};
use crate::profile::Profile;

/// Standard response wrapper for every `/1.0` endpoint.
#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    status_code: i64,
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error: String,
    #[serde(default)]
    operation: String,
    #[serde(default)]
    metadata: Value,
}

impl Envelope {
    fn into_operation(self) -> RemoteResult<OperationHandle> {
        if self.operation.is_empty() {
            return Err(RemoteError::Decode(format!(
                "expected an async response, got type {:?}",
                self.kind
            )));
        }
        Ok(OperationHandle::from_path(&self.operation, self.status_code))
    }

    fn into_metadata<T: DeserializeOwned>(self) -> RemoteResult<T> {
        serde_json::from_value(self.metadata).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

fn is_transient(err: &RemoteError) -> bool {
    match err {
        RemoteError::Transport(_) => true,
        RemoteError::Api { status, .. } => matches!(status, 502..=504),
        _ => false,
    }
}

fn last_segment(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

/// Ordinary calls are bounded by `request_timeout` (plus the server-side
/// wait for long-polls). Image uploads and exports move whole root
/// filesystems and only have a connect timeout.
#[derive(Clone)]
pub struct RestSession {
    client: Client,
    base: Url,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl RestSession {
    pub fn new(config: &DriverConfig) -> RemoteResult<Self> {
        let base = Url::parse(&config.endpoint).map_err(|e| {
            RemoteError::Transport(format!("invalid endpoint {}: {e}", config.endpoint))
        })?;
        let request_timeout = Duration::from_secs(config.request_timeout);
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base,
            retry: config.retry.clone(),
            request_timeout,
        })
    }

    fn url(&self, segments: &[&str]) -> RemoteResult<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                RemoteError::Transport(format!("endpoint {} cannot be a base URL", self.base))
            })?;
            path.pop_if_empty().push("1.0").extend(segments);
        }
        Ok(url)
    }

    async fn call(&self, method: Method, segments: &[&str], body: Option<Value>) -> RemoteResult<Envelope> {
        let url = self.url(segments)?;
        let resource = segments.join("/");
        // Only reads are replayed; a mutating call may already have taken effect.
        let idempotent = method == Method::GET;
        let mut attempt = 0;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .timeout(self.request_timeout);
            if let Some(body) = &body {
                request = request.json(body);
            }

            let result = match request.send().await {
                Ok(response) => decode(&resource, response).await,
                Err(e) => Err(RemoteError::Transport(e.to_string())),
            };

            match result {
                Err(e) if idempotent && is_transient(&e) && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    warn!(%url, attempt, ?delay, error = %e, "Transient hypervisor error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> RemoteResult<T> {
        self.call(Method::GET, segments, None).await?.into_metadata()
    }
}

async fn decode(resource: &str, response: Response) -> RemoteResult<Envelope> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(RemoteError::not_found(resource));
    }

    let envelope: Envelope = match response.json().await {
        Ok(envelope) => envelope,
        Err(e) if status.is_success() => return Err(RemoteError::Decode(e.to_string())),
        Err(_) => {
            return Err(RemoteError::Api {
                status: i64::from(status.as_u16()),
                message: status.to_string(),
            })
        }
    };

    if envelope.kind == "error" || !status.is_success() {
        if envelope.error_code == 404 {
            return Err(RemoteError::not_found(resource));
        }
        let code = if envelope.error_code != 0 {
            envelope.error_code
        } else {
            i64::from(status.as_u16())
        };
        return Err(RemoteError::Api {
            status: code,
            message: envelope.error,
        });
    }
    Ok(envelope)
}

#[async_trait]
impl Session for RestSession {
    async fn host_info(&self) -> RemoteResult<HostInfo> {
        self.get(&[]).await
    }

    async fn container_list(&self) -> RemoteResult<Vec<String>> {
        let paths: Vec<String> = self.get(&["containers"]).await?;
        Ok(paths.iter().map(|p| last_segment(p)).collect())
    }

    async fn container_state(&self, name: &str) -> RemoteResult<ContainerState> {
        self.get(&["containers", name, "state"]).await
    }

    #[instrument(skip(self, config), fields(name = %config.name))]
    async fn container_init(&self, config: &ContainerConfig) -> RemoteResult<OperationHandle> {
        let body = serde_json::to_value(config).map_err(|e| RemoteError::Decode(e.to_string()))?;
        self.call(Method::POST, &["containers"], Some(body))
            .await?
            .into_operation()
    }

    async fn container_update_state(
        &self,
        name: &str,
        change: &StateChange,
    ) -> RemoteResult<OperationHandle> {
        let body = serde_json::to_value(change).map_err(|e| RemoteError::Decode(e.to_string()))?;
        self.call(Method::PUT, &["containers", name, "state"], Some(body))
            .await?
            .into_operation()
    }

    async fn container_delete(&self, name: &str) -> RemoteResult<OperationHandle> {
        self.call(Method::DELETE, &["containers", name], None)
            .await?
            .into_operation()
    }

    async fn container_rename(&self, name: &str, new_name: &str) -> RemoteResult<OperationHandle> {
        self.call(Method::POST, &["containers", name], Some(json!({ "name": new_name })))
            .await?
            .into_operation()
    }

    async fn container_publish(&self, name: &str) -> RemoteResult<OperationHandle> {
        let body = json!({ "source": { "type": "container", "name": name } });
        self.call(Method::POST, &["images"], Some(body))
            .await?
            .into_operation()
    }

    async fn container_migration_source(&self, name: &str) -> RemoteResult<MigrationSource> {
        let envelope = self
            .call(Method::POST, &["containers", name], Some(json!({ "migration": true })))
            .await?;
        let operation = self
            .base
            .join(&envelope.operation)
            .map_err(|e| RemoteError::Decode(format!("bad operation path: {e}")))?;
        let record: OperationMetadata = envelope.into_metadata()?;
        let secrets: BTreeMap<String, String> = serde_json::from_value(record.metadata)
            .map_err(|e| RemoteError::Decode(format!("bad migration secrets: {e}")))?;

        Ok(MigrationSource {
            operation: operation.to_string(),
            secrets,
        })
    }

    async fn profile_get(&self, name: &str) -> RemoteResult<Profile> {
        self.get(&["profiles", name]).await
    }

    async fn profile_create(&self, profile: &Profile) -> RemoteResult<()> {
        let body = serde_json::to_value(profile).map_err(|e| RemoteError::Decode(e.to_string()))?;
        self.call(Method::POST, &["profiles"], Some(body)).await?;
        Ok(())
    }

    async fn profile_update(&self, profile: &Profile) -> RemoteResult<()> {
        let body = json!({ "config": profile.config, "devices": profile.devices });
        self.call(Method::PUT, &["profiles", profile.name.as_str()], Some(body))
            .await?;
        Ok(())
    }

    async fn profile_delete(&self, name: &str) -> RemoteResult<()> {
        self.call(Method::DELETE, &["profiles", name], None).await?;
        Ok(())
    }

    async fn image_alias_get(&self, alias: &str) -> RemoteResult<String> {
        #[derive(Deserialize)]
        struct Alias {
            target: String,
        }
        let alias: Alias = self.get(&["images", "aliases", alias]).await?;
        Ok(alias.target)
    }

    async fn image_alias_create(&self, alias: &str, fingerprint: &str) -> RemoteResult<()> {
        let body = json!({ "name": alias, "target": fingerprint, "description": "" });
        self.call(Method::POST, &["images", "aliases"], Some(body))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, upload), fields(fingerprint = %upload.fingerprint))]
    async fn image_upload(&self, upload: ImageUpload) -> RemoteResult<OperationHandle> {
        let url = self.url(&["images"])?;
        let form = Form::new()
            .part(
                "metadata",
                Part::bytes(upload.manifest).file_name("metadata.tar"),
            )
            .part("rootfs", Part::bytes(upload.rootfs).file_name("rootfs.tar"));

        debug!("Uploading split image");
        let response = self
            .client
            .post(url)
            .header("X-LXD-fingerprint", &upload.fingerprint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        decode("images", response).await?.into_operation()
    }

    async fn image_export(&self, fingerprint: &str) -> RemoteResult<Vec<u8>> {
        let resource = format!("images/{fingerprint}");
        let url = self.url(&["images", fingerprint, "export"])?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            // Error bodies still use the envelope; reuse its classification.
            decode(&resource, response).await?;
            return Err(RemoteError::Decode(format!(
                "export of {fingerprint} returned no data"
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn image_delete(&self, fingerprint: &str) -> RemoteResult<OperationHandle> {
        self.call(Method::DELETE, &["images", fingerprint], None)
            .await?
            .into_operation()
    }

    async fn operation_wait(&self, id: &str, timeout: Duration) -> RemoteResult<OperationStatus> {
        let mut url = self.url(&["operations", id, "wait"])?;
        // The server takes whole seconds; round up so a sub-second remainder
        // still blocks instead of returning immediately.
        let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        url.query_pairs_mut()
            .append_pair("timeout", &secs.to_string());

        let resource = format!("operations/{id}");
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout + Duration::from_secs(secs))
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let envelope = decode(&resource, response).await?;
        let status_code = envelope.status_code;
        let metadata: OperationMetadata = envelope.into_metadata()?;
        Ok(OperationStatus {
            status_code,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serve one HTTP request, answering with `body` after `delay`.
    async fn slow_server(delay: Duration, body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let _ = socket.read(&mut buf).await;
            tokio::time::sleep(delay).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });
        format!("http://{addr}")
    }

    fn short_timeout_session(endpoint: &str) -> RestSession {
        let config = DriverConfig {
            endpoint: endpoint.to_string(),
            request_timeout: 1,
            retry: RetryPolicy::none(),
            ..Default::default()
        };
        RestSession::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_ordinary_call_is_bounded_by_request_timeout() {
        let endpoint = slow_server(
            Duration::from_secs(3),
            r#"{"type":"sync","status_code":200,"metadata":{"status":"Running","status_code":103}}"#,
        )
        .await;
        let err = short_timeout_session(&endpoint)
            .container_state("instance-1")
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Transport(_)), "{err}");
    }

    #[tokio::test]
    async fn test_image_upload_outlives_request_timeout() {
        let endpoint = slow_server(
            Duration::from_secs(2),
            r#"{"type":"async","status_code":100,"operation":"/1.0/operations/op-1","metadata":{}}"#,
        )
        .await;
        let upload = ImageUpload {
            fingerprint: "abc".to_string(),
            manifest: b"manifest".to_vec(),
            rootfs: b"rootfs".to_vec(),
        };
        let handle = short_timeout_session(&endpoint)
            .image_upload(upload)
            .await
            .unwrap();
        assert_eq!(handle.id, "op-1");
    }

    fn session(endpoint: &str) -> RestSession {
        let config = DriverConfig {
            endpoint: endpoint.to_string(),
            ..Default::default()
        };
        RestSession::new(&config).unwrap()
    }

    #[test]
    fn test_url_escapes_segments() {
        let s = session("https://10.0.0.1:8443");
        let url = s.url(&["images", "aliases", "ubuntu/noble"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://10.0.0.1:8443/1.0/images/aliases/ubuntu%2Fnoble"
        );
    }

    #[test]
    fn test_root_url() {
        let s = session("https://10.0.0.1:8443/");
        assert_eq!(s.url(&[]).unwrap().as_str(), "https://10.0.0.1:8443/1.0");
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&RemoteError::Transport("reset".to_string())));
        assert!(is_transient(&RemoteError::Api {
            status: 503,
            message: "busy".to_string()
        }));
        assert!(!is_transient(&RemoteError::Api {
            status: 500,
            message: "boom".to_string()
        }));
        assert!(!is_transient(&RemoteError::not_found("containers/x")));
    }

    #[test]
    fn test_async_envelope_into_operation() {
        let envelope: Envelope = serde_json::from_value(json!({
            "type": "async",
            "status_code": 100,
            "operation": "/1.0/operations/abc-123",
            "metadata": {}
        }))
        .unwrap();
        let handle = envelope.into_operation().unwrap();
        assert_eq!(handle.id, "abc-123");
        assert_eq!(handle.status_code, 100);
    }

    #[test]
    fn test_sync_envelope_is_not_an_operation() {
        let envelope: Envelope =
            serde_json::from_value(json!({"type": "sync", "status_code": 200})).unwrap();
        assert!(matches!(
            envelope.into_operation(),
            Err(RemoteError::Decode(_))
        ));
    }

    #[test]
    fn test_list_paths_to_names() {
        assert_eq!(last_segment("/1.0/containers/instance-1"), "instance-1");
    }
}
