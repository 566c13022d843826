//! Storage array REST client.
//!
//! Authentication is two-step: the 1.x token endpoint trades username and
//! password for an API token, and the 2.x login endpoint trades that for a
//! session token returned in the `x-auth-token` response header. The
//! session is cached and renewed once when the array answers 401.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use drctl_core::config::{ArrayConfig, secret_from_env};
use drctl_core::{DrError, Result};

const AUTH_PATH: &str = "/api/1.17/auth/apitoken";
const API_PREFIX: &str = "/api/2.17";
const SESSION_HEADER: &str = "x-auth-token";

/// Volume as reported by the array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayVolume {
    pub name: String,
    #[serde(default)]
    pub serial: String,
    #[serde(default)]
    pub destroyed: bool,
    #[serde(default)]
    pub connection_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub name: String,
}

/// Point-in-time snapshot of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArraySnapshot {
    pub name: String,
    /// Creation time, milliseconds since the epoch.
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub source: Option<SourceRef>,
}

#[derive(Debug, Deserialize)]
struct Items<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Connection {
    lun: Option<i64>,
}

/// Operations drctl needs from a block storage array.
#[async_trait]
pub trait StorageArray: Send + Sync {
    /// Establish (or refresh) an authenticated session.
    async fn login(&self) -> Result<()>;

    /// Array identity and capacity, passed through untyped.
    async fn list_arrays(&self) -> Result<serde_json::Value>;

    /// Create `volume` as a copy of `snapshot`. Fails if `volume` exists.
    async fn create_volume_from_snapshot(&self, snapshot: &str, volume: &str)
    -> Result<ArrayVolume>;

    /// Connect `volume` to `host_group`, returning the assigned LUN.
    async fn connect_host_group(&self, volume: &str, host_group: &str) -> Result<i64>;

    /// Look up a volume by name. `None` when the array has no such volume.
    async fn get_volume(&self, name: &str) -> Result<Option<ArrayVolume>>;

    /// Snapshots whose names start with `prefix`.
    async fn list_snapshots(&self, prefix: &str) -> Result<Vec<ArraySnapshot>>;
}

/// REST client for one array.
pub struct FlashArrayClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password_env: String,
    timeout: Duration,
    session: Mutex<Option<String>>,
}

impl FlashArrayClient {
    pub fn new(config: &ArrayConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http = reqwest::Client::builder()
            .user_agent(concat!("drctl/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .danger_accept_invalid_certs(config.insecure_tls)
            .build()
            .map_err(|e| DrError::remote("client", None, e.to_string()))?;

        Ok(Self {
            http,
            base_url: format!("https://{}", config.address),
            username: config.username.clone(),
            password_env: config.password_env.clone(),
            timeout,
            session: Mutex::new(None),
        })
    }

    /// Point the client at a different origin (plain-HTTP test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn cached_session(&self) -> Option<String> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    fn store_session(&self, token: Option<String>) {
        if let Ok(mut slot) = self.session.lock() {
            *slot = token;
        }
    }

    fn transport_error(&self, endpoint: &str, e: reqwest::Error) -> DrError {
        if e.is_timeout() {
            DrError::TimedOut {
                operation: endpoint.to_string(),
                secs: self.timeout.as_secs(),
            }
        } else {
            DrError::remote(endpoint, e.status().map(|s| s.as_u16()), e.to_string())
        }
    }

    async fn send(&self, endpoint: &str, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(endpoint, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DrError::remote(
            endpoint,
            Some(status.as_u16()),
            if body.is_empty() {
                status.to_string()
            } else {
                body
            },
        ))
    }

    async fn json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| DrError::remote(endpoint, None, format!("unexpected response: {}", e)))
    }

    /// Two-step login, returning the session token.
    #[instrument(skip(self), fields(url = %self.base_url))]
    async fn open_session(&self) -> Result<String> {
        let password = secret_from_env(&self.password_env)?;

        let response = self
            .send(
                "auth/apitoken",
                self.http.post(self.url(AUTH_PATH)).json(&serde_json::json!({
                    "username": self.username,
                    "password": password,
                })),
            )
            .await?;
        let body: serde_json::Value = self.json("auth/apitoken", response).await?;
        let api_token = body["api_token"]
            .as_str()
            .ok_or_else(|| DrError::remote("auth/apitoken", None, "missing api_token in response"))?
            .to_string();

        let response = self
            .send(
                "login",
                self.http
                    .post(self.url(&format!("{}/login", API_PREFIX)))
                    .header("api-token", api_token),
            )
            .await?;
        let session = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| DrError::remote("login", None, "missing x-auth-token header"))?;

        info!("Array session established");
        self.store_session(Some(session.clone()));
        Ok(session)
    }

    async fn session(&self) -> Result<String> {
        match self.cached_session() {
            Some(token) => Ok(token),
            None => self.open_session().await,
        }
    }

    /// Authenticated call against the 2.x API. An expired session is
    /// renewed once.
    async fn call(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let url = self.url(&format!("{}/{}", API_PREFIX, endpoint));
        let mut renewed = false;
        loop {
            let token = self.session().await?;
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header(SESSION_HEADER, token)
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }
            debug!(%method, endpoint, "Array request");
            match self.send(endpoint, request).await {
                Err(DrError::RemoteApiFailure {
                    status: Some(401), ..
                }) if !renewed => {
                    debug!("Array session expired, logging in again");
                    self.store_session(None);
                    renewed = true;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl StorageArray for FlashArrayClient {
    async fn login(&self) -> Result<()> {
        self.open_session().await.map(|_| ())
    }

    async fn list_arrays(&self) -> Result<serde_json::Value> {
        let response = self.call(Method::GET, "arrays", &[], None).await?;
        self.json("arrays", response).await
    }

    #[instrument(skip(self))]
    async fn create_volume_from_snapshot(
        &self,
        snapshot: &str,
        volume: &str,
    ) -> Result<ArrayVolume> {
        let body = serde_json::json!({ "source": { "name": snapshot } });
        let response = self
            .call(
                Method::POST,
                "volumes",
                &[("names", volume), ("overwrite", "false")],
                Some(&body),
            )
            .await?;
        let created: Items<ArrayVolume> = self.json("volumes", response).await?;
        let created = created
            .items
            .into_iter()
            .next()
            .ok_or_else(|| DrError::remote("volumes", None, "no volume in create response"))?;
        if created.serial.is_empty() {
            return Err(DrError::remote("volumes", None, "created volume has no serial"));
        }
        info!(volume, serial = %created.serial, "Volume created from snapshot");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn connect_host_group(&self, volume: &str, host_group: &str) -> Result<i64> {
        let response = self
            .call(
                Method::POST,
                "connections",
                &[("volume_names", volume), ("host_group_names", host_group)],
                None,
            )
            .await?;
        let connections: Items<Connection> = self.json("connections", response).await?;
        connections
            .items
            .into_iter()
            .find_map(|c| c.lun)
            .ok_or_else(|| DrError::remote("connections", None, "no LUN in connection response"))
    }

    async fn get_volume(&self, name: &str) -> Result<Option<ArrayVolume>> {
        match self
            .call(Method::GET, "volumes", &[("names", name)], None)
            .await
        {
            Ok(response) => {
                let found: Items<ArrayVolume> = self.json("volumes", response).await?;
                Ok(found.items.into_iter().next())
            }
            // The array answers an unknown name with 400, not an empty list.
            Err(DrError::RemoteApiFailure {
                status: Some(400), ..
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_snapshots(&self, prefix: &str) -> Result<Vec<ArraySnapshot>> {
        let pattern = format!("{}*", prefix);
        let response = self
            .call(
                Method::GET,
                "volume-snapshots",
                &[("names", pattern.as_str())],
                None,
            )
            .await?;
        let found: Items<ArraySnapshot> = self.json("volume-snapshots", response).await?;
        Ok(found.items)
    }
}

/// In-memory array for workflow tests.
#[derive(Default)]
pub struct FakeArray {
    state: Mutex<FakeArrayState>,
}

#[derive(Default)]
struct FakeArrayState {
    snapshots: Vec<ArraySnapshot>,
    volumes: BTreeMap<String, ArrayVolume>,
    next_serial: u64,
    next_lun: i64,
    logins: usize,
}

impl FakeArray {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a snapshot of volume `source`.
    pub fn with_snapshot(self, name: &str, source: &str) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.snapshots.push(ArraySnapshot {
                name: name.to_string(),
                created: Some(1_700_000_000_000),
                source: Some(SourceRef {
                    name: source.to_string(),
                }),
            });
        }
        self
    }

    pub fn with_volume(self, volume: ArrayVolume) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.volumes.insert(volume.name.clone(), volume);
        }
        self
    }

    /// Change a volume as if done on the array behind drctl's back.
    pub fn update_volume(&self, name: &str, f: impl FnOnce(&mut ArrayVolume)) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(v) = state.volumes.get_mut(name) {
                f(v);
            }
        }
    }

    pub fn remove_volume(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.volumes.remove(name);
        }
    }

    pub fn volume(&self, name: &str) -> Option<ArrayVolume> {
        self.state.lock().ok()?.volumes.get(name).cloned()
    }

    pub fn login_count(&self) -> usize {
        self.state.lock().map(|s| s.logins).unwrap_or(0)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeArrayState) -> Result<T>) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| DrError::Internal("fake array lock poisoned".to_string()))?;
        f(&mut state)
    }
}

#[async_trait]
impl StorageArray for FakeArray {
    async fn login(&self) -> Result<()> {
        self.with_state(|s| {
            s.logins += 1;
            Ok(())
        })
    }

    async fn list_arrays(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!([{ "name": "fake-array", "os": "Purity//FA" }]))
    }

    async fn create_volume_from_snapshot(
        &self,
        snapshot: &str,
        volume: &str,
    ) -> Result<ArrayVolume> {
        self.with_state(|s| {
            if !s.snapshots.iter().any(|snap| snap.name == snapshot) {
                return Err(DrError::remote(
                    "volumes",
                    Some(400),
                    format!("snapshot {} does not exist", snapshot),
                ));
            }
            if s.volumes.contains_key(volume) {
                return Err(DrError::remote(
                    "volumes",
                    Some(400),
                    format!("volume {} already exists", volume),
                ));
            }
            s.next_serial += 1;
            let created = ArrayVolume {
                name: volume.to_string(),
                serial: format!("{:024X}", 0xF00D_0000_u64 + s.next_serial),
                destroyed: false,
                connection_count: 0,
            };
            s.volumes.insert(volume.to_string(), created.clone());
            Ok(created)
        })
    }

    async fn connect_host_group(&self, volume: &str, _host_group: &str) -> Result<i64> {
        self.with_state(|s| {
            s.next_lun += 1;
            let lun = s.next_lun;
            let v = s.volumes.get_mut(volume).ok_or_else(|| {
                DrError::remote(
                    "connections",
                    Some(400),
                    format!("volume {} does not exist", volume),
                )
            })?;
            v.connection_count += 1;
            Ok(lun)
        })
    }

    async fn get_volume(&self, name: &str) -> Result<Option<ArrayVolume>> {
        self.with_state(|s| Ok(s.volumes.get(name).cloned()))
    }

    async fn list_snapshots(&self, prefix: &str) -> Result<Vec<ArraySnapshot>> {
        self.with_state(|s| {
            Ok(s.snapshots
                .iter()
                .filter(|snap| snap.name.starts_with(prefix))
                .cloned()
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

    const PASSWORD_VAR: &str = "DRCTL_FLASHARRAY_TEST_PASSWORD";

    fn config() -> ArrayConfig {
        // SAFETY: tests in this module share one fixed value.
        unsafe { std::env::set_var(PASSWORD_VAR, "pureuser-pw") };
        ArrayConfig {
            address: "array01".to_string(),
            username: "pureuser".to_string(),
            password_env: PASSWORD_VAR.to_string(),
            host_group: "HG-DR".to_string(),
            timeout_secs: 5,
            insecure_tls: true,
        }
    }

    async fn mount_login(server: &MockServer) {
        Mock::given(matchers::method("POST"))
            .and(matchers::path(AUTH_PATH))
            .and(matchers::body_json(serde_json::json!({
                "username": "pureuser",
                "password": "pureuser-pw",
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "api_token": "api-123" })),
            )
            .mount(server)
            .await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/api/2.17/login"))
            .and(matchers::header("api-token", "api-123"))
            .respond_with(ResponseTemplate::new(200).insert_header(SESSION_HEADER, "session-1"))
            .mount(server)
            .await;
    }

    fn client(server: &MockServer) -> FlashArrayClient {
        FlashArrayClient::new(&config())
            .unwrap()
            .with_base_url(server.uri())
    }

    #[tokio::test]
    async fn test_login_exchanges_tokens() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        let c = client(&server);
        c.login().await.unwrap();
        assert_eq!(c.cached_session().as_deref(), Some("session-1"));
    }

    #[tokio::test]
    async fn test_login_without_session_header_fails() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path(AUTH_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "api_token": "api-123" })),
            )
            .mount(&server)
            .await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/api/2.17/login"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let err = client(&server).login().await.unwrap_err();
        assert_eq!(err.kind(), "remote_api_failure");
    }

    #[tokio::test]
    async fn test_create_volume_sends_source_and_query() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/api/2.17/volumes"))
            .and(matchers::query_param("names", "VOL-A-restore"))
            .and(matchers::query_param("overwrite", "false"))
            .and(matchers::header(SESSION_HEADER, "session-1"))
            .and(matchers::body_json(
                serde_json::json!({ "source": { "name": "pg1.snap-1.VOL-A" } }),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{ "name": "VOL-A-restore", "serial": "ABCD1234", "destroyed": false }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let vol = client(&server)
            .create_volume_from_snapshot("pg1.snap-1.VOL-A", "VOL-A-restore")
            .await
            .unwrap();
        assert_eq!(vol.serial, "ABCD1234");
    }

    #[tokio::test]
    async fn test_non_2xx_carries_status_and_body() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/api/2.17/connections"))
            .respond_with(ResponseTemplate::new(409).set_body_string("already connected"))
            .mount(&server)
            .await;

        let err = client(&server)
            .connect_host_group("VOL-A", "HG-DR")
            .await
            .unwrap_err();
        match err {
            DrError::RemoteApiFailure { status, reason, .. } => {
                assert_eq!(status, Some(409));
                assert_eq!(reason, "already connected");
            }
            other => panic!("expected RemoteApiFailure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_requires_lun() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/api/2.17/connections"))
            .and(matchers::query_param("host_group_names", "HG-DR"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "items": [{}] })),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .connect_host_group("VOL-A", "HG-DR")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "remote_api_failure");
    }

    #[tokio::test]
    async fn test_get_volume_unknown_is_none() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/api/2.17/volumes"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Volume does not exist."))
            .mount(&server)
            .await;

        assert_eq!(client(&server).get_volume("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_session_is_renewed_once() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/api/2.17/volume-snapshots"))
            .and(matchers::header(SESSION_HEADER, "stale"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/api/2.17/volume-snapshots"))
            .and(matchers::header(SESSION_HEADER, "session-1"))
            .and(matchers::query_param("names", "pg-prod*"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{ "name": "pg-prod.snap-1.VOL-A", "source": { "name": "VOL-A" } }]
            })))
            .mount(&server)
            .await;

        let c = client(&server);
        c.store_session(Some("stale".to_string()));
        let snaps = c.list_snapshots("pg-prod").await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].source.as_ref().unwrap().name, "VOL-A");
    }

    #[tokio::test]
    async fn test_fake_array_lifecycle() {
        let array = FakeArray::new().with_snapshot("pg1.snap-1.VOL-A", "VOL-A");
        let vol = array
            .create_volume_from_snapshot("pg1.snap-1.VOL-A", "VOL-A-r")
            .await
            .unwrap();
        assert_eq!(vol.serial.len(), 24);
        assert_eq!(array.connect_host_group("VOL-A-r", "HG").await.unwrap(), 1);
        assert_eq!(
            array.get_volume("VOL-A-r").await.unwrap().unwrap().connection_count,
            1
        );
        assert!(
            array
                .create_volume_from_snapshot("pg1.snap-1.VOL-A", "VOL-A-r")
                .await
                .is_err()
        );
        assert!(
            array
                .create_volume_from_snapshot("missing", "VOL-B")
                .await
                .is_err()
        );
        assert_eq!(array.list_snapshots("pg1").await.unwrap().len(), 1);
        assert!(array.list_snapshots("pg2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fake_array_reports_seeded_volume() {
        let array = FakeArray::new().with_volume(ArrayVolume {
            name: "VOL-OLD".to_string(),
            serial: "ABCDEF0123456789ABCDEF01".to_string(),
            destroyed: true,
            connection_count: 0,
        });
        let vol = array.get_volume("VOL-OLD").await.unwrap().unwrap();
        assert!(vol.destroyed);
        assert!(array.get_volume("VOL-NEW").await.unwrap().is_none());
    }
}
