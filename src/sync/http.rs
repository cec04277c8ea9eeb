//! Point-to-point fallback transport
//!
//! Used for forced flushes and session control while the live channel is
//! down. Bodies match the channel payloads; responses arrive in an envelope:
//!
//! ```text
//! POST {base}/sessions                  -> create
//! POST {base}/sessions/{id}/validate    -> validate
//! POST {base}/sessions/{id}/sync        -> sync
//! POST {base}/sessions/{id}/end         -> end
//! POST {base}/sessions/{id}/messages    -> save message
//!
//! { "success": bool, "data"?: ..., "error"?: "..." }
//! ```

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use super::backend::{ChatMessage, SessionBackend, SessionInfo, SyncAck, SyncRequest, Validation};
use super::session::Snapshot;
use crate::config::FallbackConfig;
use crate::error::{ChatlinkError, Result};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Session operations over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
}

impl HttpBackend {
    /// Create a backend rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// [`ChatlinkError::Config`] when the URL is not http(s) or does not parse,
    /// or the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url).map_err(|e| {
            ChatlinkError::Config(format!("invalid fallback url '{base_url}': {e}"))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ChatlinkError::Config(format!(
                "fallback url must be http or https, got '{}'",
                base.scheme()
            ))
            .into());
        }
        // Url::join replaces the last segment unless the path ends in '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatlinkError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, base })
    }

    /// Backend from configuration, or `None` when no base URL is set.
    pub fn from_config(config: &FallbackConfig) -> Result<Option<Self>> {
        config
            .base_url
            .as_deref()
            .map(|url| Self::new(url, Duration::from_millis(config.timeout_ms)))
            .transpose()
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.base.join(path).map_err(ChatlinkError::from)?;
        tracing::debug!(%url, "Fallback request");

        let response = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(ChatlinkError::from)?;
        let status = response.status();
        let text = response.text().await.map_err(ChatlinkError::from)?;

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(ChatlinkError::Remote(format!("HTTP {status} from {url}")).into())
            }
            Err(e) => return Err(ChatlinkError::Serialization(e).into()),
        };

        if !status.is_success() || !envelope.success {
            let reason = envelope
                .error
                .unwrap_or_else(|| format!("HTTP {status} from {url}"));
            return Err(ChatlinkError::Remote(reason).into());
        }

        Ok(serde_json::from_value(envelope.data.unwrap_or(Value::Null))
            .map_err(ChatlinkError::from)?)
    }
}

#[async_trait::async_trait]
impl SessionBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn create(&self, initial: &Snapshot) -> Result<SessionInfo> {
        self.post("sessions", &json!({ "snapshot": initial })).await
    }

    async fn validate(&self, session_id: &str) -> Result<Validation> {
        self.post(
            &format!("sessions/{session_id}/validate"),
            &json!({ "sessionId": session_id }),
        )
        .await
    }

    async fn sync(&self, request: &SyncRequest) -> Result<SyncAck> {
        let ack: Option<SyncAck> = self
            .post(&format!("sessions/{}/sync", request.session_id), request)
            .await?;
        Ok(ack.unwrap_or_default())
    }

    async fn end(&self, session_id: &str) -> Result<()> {
        let _: Value = self
            .post(
                &format!("sessions/{session_id}/end"),
                &json!({ "sessionId": session_id }),
            )
            .await?;
        Ok(())
    }

    async fn save_message(&self, session_id: &str, message: &ChatMessage) -> Result<()> {
        let _: Value = self
            .post(
                &format!("sessions/{session_id}/messages"),
                &json!({ "sessionId": session_id, "message": message }),
            )
            .await?;
        Ok(())
    }
}
