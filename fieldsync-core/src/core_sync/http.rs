/*
    http.rs - RemoteApi over HTTP/JSON

    Every request carries a bearer token from the CredentialProvider; with
    no token available the call fails as Unauthorized without touching the
    network. Status mapping:
    - 2xx: success
    - 401: Unauthorized
    - 404 on DELETE: already gone, success
    - 5xx: Server (transient)
    - other: Rejected
*/

use super::remote::{
    decode_records, extract_items, CredentialProvider, RemoteApi, RemoteError, RemoteResult,
    WireRecord,
};
use crate::core_store::model::{EntityKind, ReferenceKind, Timestamp};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

pub struct HttpRemote {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpRemote {
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        credentials: Arc<dyn CredentialProvider>,
    ) -> RemoteResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(HttpRemote {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn url(&self, collection: &str) -> String {
        format!("{}/{}", self.base_url, collection)
    }

    fn item_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}/{}", self.base_url, collection, id)
    }

    async fn send(&self, request: RequestBuilder) -> RemoteResult<Response> {
        let token = self
            .credentials
            .bearer_token()
            .ok_or_else(|| RemoteError::Unauthorized("no credential available".to_string()))?;
        request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))
    }

    async fn check(response: Response) -> RemoteResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::from_status(status.as_u16(), body))
    }

    async fn json_body(response: Response) -> RemoteResult<Option<Value>> {
        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }
}

/// Unwrap `{"result": {...}}` around a single object
fn decode_single(body: Value) -> RemoteResult<WireRecord> {
    let body = match body {
        Value::Object(mut map) if map.get("result").map_or(false, Value::is_object) => {
            map.remove("result").unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(body).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn create_batch(
        &self,
        entity: EntityKind,
        records: &[WireRecord],
    ) -> RemoteResult<Vec<WireRecord>> {
        debug!(entity = %entity, count = records.len(), "POST batch");
        let response = self
            .send(self.client.post(self.url(entity.collection())).json(records))
            .await?;
        match Self::json_body(Self::check(response).await?).await? {
            Some(body) => decode_records(body),
            None => Ok(Vec::new()),
        }
    }

    async fn update(
        &self,
        entity: EntityKind,
        id: &str,
        record: &WireRecord,
    ) -> RemoteResult<Option<WireRecord>> {
        debug!(entity = %entity, id, "PUT");
        let response = self
            .send(self.client.put(self.item_url(entity.collection(), id)).json(record))
            .await?;
        Self::json_body(Self::check(response).await?)
            .await?
            .map(decode_single)
            .transpose()
    }

    async fn delete(&self, entity: EntityKind, id: &str) -> RemoteResult<()> {
        debug!(entity = %entity, id, "DELETE");
        let response = self
            .send(self.client.delete(self.item_url(entity.collection(), id)))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            trace!(id, "Delete target already gone");
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn changed_since(
        &self,
        entity: EntityKind,
        since: Option<Timestamp>,
    ) -> RemoteResult<Vec<WireRecord>> {
        let mut request = self.client.get(self.url(entity.collection()));
        if let Some(since) = since {
            request = request.query(&[("changedSince", since.to_rfc3339())]);
        }
        let response = self.send(request).await?;
        match Self::json_body(Self::check(response).await?).await? {
            Some(body) => decode_records(body),
            None => Ok(Vec::new()),
        }
    }

    async fn fetch_reference(
        &self,
        kind: ReferenceKind,
        page_size: usize,
    ) -> RemoteResult<Vec<Value>> {
        let request = self
            .client
            .get(self.url(kind.collection()))
            .query(&[("pageSize", page_size)]);
        let response = self.send(request).await?;
        match Self::json_body(Self::check(response).await?).await? {
            Some(body) => extract_items(body),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_sync::remote::StaticToken;
    use serde_json::json;

    struct NoToken;

    impl CredentialProvider for NoToken {
        fn bearer_token(&self) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_urls() {
        let remote = HttpRemote::new(
            "https://field.example.org/brapi/v2/",
            Duration::from_secs(5),
            Arc::new(StaticToken("t".into())),
        )
        .unwrap();
        assert_eq!(
            remote.url(EntityKind::Observation.collection()),
            "https://field.example.org/brapi/v2/observations"
        );
        assert_eq!(
            remote.item_url(EntityKind::Trial.collection(), "42"),
            "https://field.example.org/brapi/v2/trials/42"
        );
    }

    #[tokio::test]
    async fn test_missing_token_fails_before_request() {
        // nothing listens here; reaching the network would be a Transport error
        let remote =
            HttpRemote::new("http://127.0.0.1:9", Duration::from_millis(200), Arc::new(NoToken))
                .unwrap();
        let err = remote.delete(EntityKind::Observation, "42").await.unwrap_err();
        assert!(err.is_auth());
    }

    #[test]
    fn test_decode_single_envelope() {
        let record = decode_single(json!({"result": {"serverId": 42, "uuid": "abc"}})).unwrap();
        assert_eq!(record.server_id.as_deref(), Some("42"));
        let bare = decode_single(json!({"serverId": "7"})).unwrap();
        assert_eq!(bare.server_id.as_deref(), Some("7"));
    }
}
