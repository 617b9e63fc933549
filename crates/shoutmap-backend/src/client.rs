//! REST client for the backend's table, RPC and storage endpoints.

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{Backend, BackendConfig, BackendError, Query, Row};

/// Give up retrying transient read failures after this long.
const MAX_RETRY_ELAPSED: Duration = Duration::from_secs(10);

/// Error body returned by the REST layer.
#[derive(Debug, Deserialize)]
struct RestErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for the backend's REST endpoints.
pub struct RestClient {
    http: Client,
    config: BackendConfig,
}

impl RestClient {
    /// Create a new client for the given project.
    pub fn new(config: BackendConfig) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .expect("failed to build HTTP client");

        Self { http, config }
    }

    /// Get the project base URL.
    pub fn base_url(&self) -> &str {
        &self.config.url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.url, table)
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.config.url, function)
    }

    fn object_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.config.url, bucket, path)
    }

    /// Public URL for an uploaded object.
    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.config.url, bucket, path
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.config.anon_key)
            .bearer_auth(self.config.bearer_token())
    }

    /// Turn a non-success response into a typed error.
    async fn check(response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(BackendError::RateLimited { retry_after_secs });
        }

        let text = response.text().await.unwrap_or_default();
        let body: Option<RestErrorBody> = serde_json::from_str(&text).ok();
        let message = body
            .as_ref()
            .and_then(|b| b.message.clone().or_else(|| b.error.clone()))
            .unwrap_or_else(|| text.clone());

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(BackendError::Auth(message)),
            StatusCode::NOT_FOUND => Err(BackendError::NotFound(message)),
            _ => Err(BackendError::Rest {
                status: status.as_u16(),
                code: body.and_then(|b| b.code),
                message,
            }),
        }
    }

    async fn send_rows(&self, request: RequestBuilder) -> Result<Vec<Row>, BackendError> {
        let response = Self::check(self.authorize(request).send().await?).await?;
        Ok(response.json().await?)
    }

    /// Retry idempotent reads on transient failures.
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, BackendError>>,
    {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(MAX_RETRY_ELAPSED),
            ..Default::default()
        };

        backoff::future::retry(policy, || {
            let fut = op();
            async move {
                fut.await.map_err(|e| {
                    if e.is_transient() {
                        warn!(operation, error = %e, "transient backend error, retrying");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }
}

#[async_trait]
impl Backend for RestClient {
    async fn select(&self, query: &Query) -> Result<Vec<Row>, BackendError> {
        let url = self.table_url(&query.table);
        let params = query.to_params();
        self.with_retry("select", || {
            self.send_rows(self.http.get(&url).query(&[("select", "*")]).query(&params))
        })
        .await
    }

    async fn insert(&self, table: &str, row: Row) -> Result<Row, BackendError> {
        let request = self
            .http
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(&Value::Object(row));

        let mut rows = self.send_rows(request).await?;
        debug!(table, returned = rows.len(), "inserted row");
        if rows.is_empty() {
            return Err(BackendError::InvalidResponse(format!(
                "insert into {} returned no rows",
                table
            )));
        }
        Ok(rows.swap_remove(0))
    }

    async fn update(&self, query: &Query, patch: Row) -> Result<Vec<Row>, BackendError> {
        let request = self
            .http
            .patch(self.table_url(&query.table))
            .query(&query.to_params())
            .header("Prefer", "return=representation")
            .json(&Value::Object(patch));
        self.send_rows(request).await
    }

    async fn delete(&self, query: &Query) -> Result<Vec<Row>, BackendError> {
        let request = self
            .http
            .delete(self.table_url(&query.table))
            .query(&query.to_params())
            .header("Prefer", "return=representation");
        self.send_rows(request).await
    }

    async fn rpc(&self, function: &str, args: Value) -> Result<Value, BackendError> {
        let url = self.rpc_url(function);
        self.with_retry(function, || {
            let request = self.authorize(self.http.post(&url).json(&args));
            async move {
                let response = Self::check(request.send().await?).await?;
                Ok::<_, BackendError>(response.json::<Value>().await?)
            }
        })
        .await
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BackendError> {
        let request = self
            .http
            .post(self.object_url(bucket, path))
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(bytes);

        Self::check(self.authorize(request).send().await?)
            .await
            .map_err(|e| match e {
                BackendError::Rest { message, .. } => BackendError::Storage(message),
                other => other,
            })?;

        debug!(bucket, path, "uploaded object");
        Ok(self.public_url(bucket, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(uri: String) -> RestClient {
        RestClient::new(BackendConfig::new(uri, "anon-key").with_access_token("user-jwt"))
    }

    #[test]
    fn test_urls() {
        let client = client("https://abc.example.co".to_string());
        assert_eq!(
            client.table_url("shout_likes"),
            "https://abc.example.co/rest/v1/shout_likes"
        );
        assert_eq!(
            client.rpc_url("get_unread_message_count"),
            "https://abc.example.co/rest/v1/rpc/get_unread_message_count"
        );
        assert_eq!(
            client.public_url("shout-media", "u1/pic.jpg"),
            "https://abc.example.co/storage/v1/object/public/shout-media/u1/pic.jpg"
        );
    }

    #[tokio::test]
    async fn test_select_sends_filters_and_auth() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/shout_likes"))
            .and(query_param("shout_id", "eq.s1"))
            .and(header("apikey", "anon-key"))
            .and(header("authorization", "Bearer user-jwt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "l1", "shout_id": "s1", "user_id": "u1"},
                {"id": "l2", "shout_id": "s1", "user_id": "u2"}
            ])))
            .mount(&mock_server)
            .await;

        let client = client(mock_server.uri());
        let rows = client
            .select(&Query::table("shout_likes").eq("shout_id", "s1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["user_id"], "u2");
    }

    #[tokio::test]
    async fn test_insert_returns_representation() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/shout_likes"))
            .and(header("prefer", "return=representation"))
            .and(body_json(json!({"shout_id": "s1", "user_id": "u1"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([
                {"id": "l1", "shout_id": "s1", "user_id": "u1"}
            ])))
            .mount(&mock_server)
            .await;

        let client = client(mock_server.uri());
        let row = json!({"shout_id": "s1", "user_id": "u1"});
        let inserted = client
            .insert("shout_likes", row.as_object().unwrap().clone())
            .await
            .unwrap();
        assert_eq!(inserted["id"], "l1");
    }

    #[tokio::test]
    async fn test_conflict_maps_to_rest_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/shout_likes"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "code": "23505",
                "message": "duplicate key value violates unique constraint"
            })))
            .mount(&mock_server)
            .await;

        let client = client(mock_server.uri());
        let err = client.insert("shout_likes", Row::new()).await.unwrap_err();
        match err {
            BackendError::Rest { status, code, .. } => {
                assert_eq!(status, 409);
                assert_eq!(code.as_deref(), Some("23505"));
            }
            other => panic!("expected Rest error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_auth_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/rest/v1/shout_likes"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({"message": "JWT expired"})),
            )
            .mount(&mock_server)
            .await;

        let client = client(mock_server.uri());
        let err = client
            .delete(&Query::table("shout_likes").eq("id", "l1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Auth(ref m) if m == "JWT expired"));
    }

    #[tokio::test]
    async fn test_rpc_retries_transient_failure() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/get_unread_message_count"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/get_unread_message_count"))
            .and(body_json(json!({"p_user_id": "u1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(5)))
            .mount(&mock_server)
            .await;

        let client = client(mock_server.uri());
        let value = client
            .rpc("get_unread_message_count", json!({"p_user_id": "u1"}))
            .await
            .unwrap();
        assert_eq!(value, json!(5));
    }

    #[tokio::test]
    async fn test_rate_limit_reads_retry_after() {
        let err = {
            let mock_server = MockServer::start().await;
            Mock::given(method("PATCH"))
                .and(path("/rest/v1/notifications"))
                .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
                .mount(&mock_server)
                .await;

            let client = client(mock_server.uri());
            client
                .update(&Query::table("notifications").eq("id", "n1"), Row::new())
                .await
                .unwrap_err()
        };
        assert!(matches!(
            err,
            BackendError::RateLimited {
                retry_after_secs: Some(7)
            }
        ));
    }

    #[tokio::test]
    async fn test_upload_returns_public_url() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/storage/v1/object/shout-media/u1/pic.jpg"))
            .and(header("content-type", "image/jpeg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Key": "x"})))
            .mount(&mock_server)
            .await;

        let client = client(mock_server.uri());
        let url = client
            .upload("shout-media", "u1/pic.jpg", vec![1, 2, 3], "image/jpeg")
            .await
            .unwrap();
        assert_eq!(
            url,
            format!(
                "{}/storage/v1/object/public/shout-media/u1/pic.jpg",
                mock_server.uri()
            )
        );
    }
}
