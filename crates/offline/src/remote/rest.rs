//! HTTP client for a PostgREST-style backend (`{api_url}/rest/v1/{table}`).

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;

use stockpro_core::{EntityKind, RecordId};

use super::{RemoteError, RemoteQuery, RemoteResult, RemoteService};
use crate::config::SyncConfig;

#[derive(Debug, Clone)]
pub struct RestRemoteService {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl RestRemoteService {
    pub fn new(
        api_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> RemoteResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key,
            timeout,
        })
    }

    pub fn from_config(config: &SyncConfig) -> RemoteResult<Self> {
        Self::new(
            config.api_url.clone(),
            config.api_key.clone(),
            config.remote_timeout,
        )
    }

    fn table_url(&self, kind: EntityKind) -> String {
        format!("{}/rest/v1/{}", self.api_url, kind.table_name())
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut req = self.client.request(method, url);
        if let Some(key) = &self.api_key {
            req = req.header("apikey", key).bearer_auth(key);
        }
        req
    }

    async fn send(&self, req: RequestBuilder) -> RemoteResult<Response> {
        let resp = req.send().await.map_err(|e| self.map_reqwest(e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status.as_u16(), &body));
        }
        Ok(resp)
    }

    async fn rows(&self, req: RequestBuilder) -> RemoteResult<Vec<Value>> {
        let resp = self.send(req).await?;
        resp.json::<Vec<Value>>().await.map_err(|e| self.map_reqwest(e))
    }

    /// First row of a `return=representation` response.
    async fn single(&self, req: RequestBuilder, what: &str) -> RemoteResult<Value> {
        self.rows(req.header("Prefer", "return=representation"))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::permanent(format!("{what}: empty response")).with_code("empty"))
    }

    fn map_reqwest(&self, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::timeout(self.timeout)
        } else if err.is_decode() {
            RemoteError::permanent(format!("invalid response body: {err}")).with_code("decode")
        } else {
            RemoteError::network(err.to_string())
        }
    }
}

fn query_params(query: &RemoteQuery) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    match query {
        RemoteQuery::All => {}
        RemoteQuery::Between { column, from, to } => {
            params.push((column.clone(), format!("gte.{from}")));
            params.push((column.clone(), format!("lte.{to}")));
        }
        RemoteQuery::Since { column, from } => {
            params.push((column.clone(), format!("gte.{from}")));
        }
    }
    params
}

fn id_filter(id: &RecordId) -> [(&'static str, String); 1] {
    [("id", format!("eq.{id}"))]
}

#[async_trait::async_trait]
impl RemoteService for RestRemoteService {
    async fn fetch_all(&self, kind: EntityKind, query: &RemoteQuery) -> RemoteResult<Vec<Value>> {
        let url = self.table_url(kind);
        let req = self.request(Method::GET, &url).query(&query_params(query));
        self.rows(req).await
    }

    async fn fetch_by_id(&self, kind: EntityKind, id: &RecordId) -> RemoteResult<Option<Value>> {
        let url = self.table_url(kind);
        let req = self
            .request(Method::GET, &url)
            .query(&[("select", "*")])
            .query(&id_filter(id));
        Ok(self.rows(req).await?.into_iter().next())
    }

    async fn create(&self, kind: EntityKind, body: &Value) -> RemoteResult<Value> {
        let url = self.table_url(kind);
        let req = self.request(Method::POST, &url).json(body);
        self.single(req, &format!("create {kind}")).await
    }

    async fn update(&self, kind: EntityKind, id: &RecordId, patch: &Value) -> RemoteResult<Value> {
        let url = self.table_url(kind);
        let req = self
            .request(Method::PATCH, &url)
            .query(&id_filter(id))
            .json(patch);
        // PostgREST answers an update of a missing row with an empty array.
        self.single(req, &format!("update {kind} {id}"))
            .await
            .map_err(|e| match e.code.as_deref() {
                Some("empty") => RemoteError::permanent(format!("{kind} {id} not found on server"))
                    .with_code("not_found"),
                _ => e,
            })
    }

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> RemoteResult<()> {
        let url = self.table_url(kind);
        let req = self.request(Method::DELETE, &url).query(&id_filter(id));
        self.send(req).await?;
        Ok(())
    }

    async fn ping(&self) -> RemoteResult<()> {
        let url = format!("{}/rest/v1/", self.api_url);
        let resp = self
            .request(Method::GET, &url)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;
        // Any answer short of a server error means the backend is reachable.
        if resp.status().is_server_error() {
            return Err(RemoteError::from_status(resp.status().as_u16(), ""));
        }
        Ok(())
    }
}
