//! REST клиент комнат звонков Nextcloud Talk (OCS API).

use crate::error::{CallError, Result};
use crate::signaling::credentials::TokenProvider;
use crate::signaling::types::{
    CallInfo, CallResponse, EndCallResponse, OcsEnvelope, OutboundSignal,
};
use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const CALL_PATH: [&str; 7] = ["ocs", "v2.php", "apps", "spreed", "api", "v1", "call"];

/// Сервер комнат звонков
#[async_trait]
pub trait CallRoomApi: Send + Sync {
    /// `POST call/{userId}`
    async fn initiate_call(&self, user_id: &str) -> Result<CallResponse>;

    /// `GET call/{callId}`
    async fn get_call_info(&self, call_id: &str) -> Result<CallInfo>;

    /// `POST call/{callId}/end`
    async fn end_call(&self, call_id: &str) -> Result<EndCallResponse>;

    /// `POST call/{callId}/signaling`
    async fn send_signal(&self, call_id: &str, signal: &OutboundSignal) -> Result<()>;
}

pub struct NextcloudApi {
    http: reqwest::Client,
    base_url: Url,
    tokens: Arc<dyn TokenProvider>,
}

impl NextcloudApi {
    pub fn new(base_url: &str, timeout: Duration, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| CallError::Config(format!("invalid server url {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(CallError::Config(format!("server url {} cannot be a base", base_url)));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            tokens,
        })
    }

    /// `{base}/ocs/v2.php/apps/spreed/api/v1/call/{segments...}`
    fn call_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CallError::Config("server url cannot be a base".into()))?
            .pop_if_empty()
            .extend(CALL_PATH)
            .extend(segments);
        Ok(url)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&OutboundSignal>,
    ) -> Result<Option<T>> {
        let token = self.tokens.token().await?;
        debug!(%method, %url, "OCS request");

        let mut req = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header("OCS-APIRequest", "true")
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[("format", "json")]);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            // сервер часто кладёт причину в meta.message даже при ошибке
            let message = serde_json::from_str::<OcsEnvelope<serde_json::Value>>(&text)
                .ok()
                .and_then(|env| env.ocs.meta.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
            return Err(CallError::Server {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: OcsEnvelope<T> = serde_json::from_str(&text)?;
        if !envelope.ocs.meta.is_ok() {
            return Err(CallError::Server {
                status: envelope.ocs.meta.statuscode,
                message: envelope.ocs.meta.message.unwrap_or_default(),
            });
        }
        Ok(envelope.ocs.data)
    }

    async fn request_data<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&OutboundSignal>,
    ) -> Result<T> {
        self.request(method, url, body)
            .await?
            .ok_or_else(|| CallError::Protocol("OCS response without data".into()))
    }
}

#[async_trait]
impl CallRoomApi for NextcloudApi {
    async fn initiate_call(&self, user_id: &str) -> Result<CallResponse> {
        let url = self.call_url(&[user_id])?;
        self.request_data(Method::POST, url, None).await
    }

    async fn get_call_info(&self, call_id: &str) -> Result<CallInfo> {
        let url = self.call_url(&[call_id])?;
        self.request_data(Method::GET, url, None).await
    }

    async fn end_call(&self, call_id: &str) -> Result<EndCallResponse> {
        let url = self.call_url(&[call_id, "end"])?;
        self.request_data(Method::POST, url, None).await
    }

    async fn send_signal(&self, call_id: &str, signal: &OutboundSignal) -> Result<()> {
        let url = self.call_url(&[call_id, "signaling"])?;
        self.request::<serde_json::Value>(Method::POST, url, Some(signal))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::credentials::StaticTokenProvider;

    fn api(base: &str) -> NextcloudApi {
        NextcloudApi::new(
            base,
            Duration::from_secs(1),
            Arc::new(StaticTokenProvider::new("t")),
        )
        .unwrap()
    }

    #[test]
    fn builds_call_urls_with_and_without_trailing_slash() {
        let with_slash = api("https://cloud.example.org/nc/");
        assert_eq!(
            with_slash.call_url(&["room42", "end"]).unwrap().as_str(),
            "https://cloud.example.org/nc/ocs/v2.php/apps/spreed/api/v1/call/room42/end"
        );
        let bare = api("https://cloud.example.org");
        assert_eq!(
            bare.call_url(&["user b"]).unwrap().as_str(),
            "https://cloud.example.org/ocs/v2.php/apps/spreed/api/v1/call/user%20b"
        );
    }

    #[test]
    fn rejects_bad_base_url() {
        let result = NextcloudApi::new(
            "not a url",
            Duration::from_secs(1),
            Arc::new(StaticTokenProvider::new("t")),
        );
        assert!(matches!(result, Err(CallError::Config(_))));
    }
}
