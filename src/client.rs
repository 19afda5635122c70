use std::io::Write;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::MedStoreError;

const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// GraphQL transport for the MedStore API.
///
/// Owns endpoint normalization, the API-key header pair, the gzip+base64
/// request envelope and transient-failure retries. Typed operations live in
/// [`crate::ops`].
pub struct GraphQlClient {
    http: reqwest::Client,
    endpoint: String,
    content_base: String,
    config: ClientConfig,
}

impl GraphQlClient {
    pub fn new(config: ClientConfig) -> Result<Self, MedStoreError> {
        let (endpoint, content_base) = normalize_url(&config.url);
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;
        Ok(GraphQlClient {
            http,
            endpoint,
            content_base,
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Headers carrying only the API-key pair, for signed-content endpoints.
    pub fn auth_headers(&self) -> Result<HeaderMap, MedStoreError> {
        let mut headers = HeaderMap::new();
        let mut api_key = header_value(&format!(
            "{}:{}",
            self.config.api_key, self.config.secret_key
        ))?;
        api_key.set_sensitive(true);
        headers.insert("ApiKey", api_key);
        Ok(headers)
    }

    /// Resolve a `medstore://` content URL against the configured host.
    pub fn resolve_content_url(&self, url: &str) -> String {
        if let Some(path) = url.strip_prefix("medstore:///") {
            format!("{}/{}", self.content_base, path)
        } else if let Some(rest) = url.strip_prefix("medstore://") {
            format!("https://{rest}")
        } else {
            url.to_string()
        }
    }

    /// Execute a GraphQL operation and return its `data` object.
    ///
    /// Transient failures (connection errors, 5xx) are retried with the
    /// configured backoff; auth rejections, 413 and application errors in
    /// the `errors` array abort immediately.
    pub async fn execute(&self, query: &str, variables: Value) -> Result<Value, MedStoreError> {
        let payload = self.prepare_query(query, variables)?;
        debug!(
            "executing: {}",
            query.trim().lines().next().unwrap_or_default()
        );
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.execute_once(payload.clone()).await {
                Ok(data) => return Ok(data),
                Err(err) if err.is_fatal() || attempt >= self.config.retry.max_attempts => {
                    return Err(err)
                }
                Err(err) => {
                    debug!("transient graphql failure (attempt {attempt}): {err}");
                    tokio::time::sleep(self.config.retry.delay(attempt)).await;
                }
            }
        }
    }

    async fn execute_once(&self, payload: String) -> Result<Value, MedStoreError> {
        let start = Instant::now();
        let response = self
            .http
            .post(&self.endpoint)
            .headers(self.request_headers()?)
            .body(payload)
            .send()
            .await?;
        let status = response.status().as_u16();
        debug!("response status {status} after {:?}", start.elapsed());
        match status {
            401 | 403 => Err(MedStoreError::Auth(status)),
            413 => Err(MedStoreError::PayloadTooLarge),
            s if s >= 500 => Err(MedStoreError::Status(s)),
            s => {
                let body: Value = match response.json().await {
                    Ok(body) => body,
                    Err(_) if !(200..300).contains(&s) => return Err(MedStoreError::Status(s)),
                    Err(err) => return Err(err.into()),
                };
                if let Some(errors) = body
                    .get("errors")
                    .and_then(Value::as_array)
                    .filter(|errors| !errors.is_empty())
                {
                    let message = errors
                        .iter()
                        .filter_map(|err| err.get("message").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join("; ");
                    return Err(MedStoreError::Api(if message.is_empty() {
                        "unknown api error".into()
                    } else {
                        message
                    }));
                }
                Ok(body.get("data").cloned().unwrap_or(Value::Null))
            }
        }
    }

    fn request_headers(&self) -> Result<HeaderMap, MedStoreError> {
        let mut headers = self.auth_headers()?;
        headers.insert("MS-SDK-Version", header_value(SDK_VERSION)?);
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert("Content-Encoding-MS", HeaderValue::from_static("gzip"));
        headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static("br, gzip"),
        );
        Ok(headers)
    }

    /// The request envelope is the gzipped operation JSON, base64-encoded.
    fn prepare_query(&self, query: &str, variables: Value) -> Result<String, MedStoreError> {
        let body = serde_json::to_vec(&json!({ "query": query, "variables": variables }))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body)?;
        Ok(BASE64.encode(encoder.finish()?))
    }
}

fn header_value(value: &str) -> Result<HeaderValue, MedStoreError> {
    HeaderValue::from_str(value)
        .map_err(|err| MedStoreError::Config(format!("invalid header value: {err}")))
}

/// Coerce a configured URL into the GraphQL endpoint and the content base.
///
/// Remote hosts are forced to `https://<host>/api`; localhost and AWS URLs
/// are left untouched so mock servers and presigned hosts work unchanged.
fn normalize_url(url: &str) -> (String, String) {
    let url = url.trim().trim_end_matches('/').to_lowercase();
    let exempt = url.contains("amazonaws.com") || url.contains("localhost") || url.contains("127.0.0.1");
    if exempt {
        return (format!("{url}/graphql/"), url);
    }
    let stripped = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(&url);
    let host = stripped.split('/').next().unwrap_or(stripped);
    (
        format!("https://{host}/api/graphql/"),
        format!("https://{host}"),
    )
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    #[test]
    fn normalizes_remote_urls() {
        let (endpoint, base) = normalize_url("https://app.medstore.io/some/path/");
        assert_eq!(endpoint, "https://app.medstore.io/api/graphql/");
        assert_eq!(base, "https://app.medstore.io");

        let (endpoint, _) = normalize_url("app.medstore.io");
        assert_eq!(endpoint, "https://app.medstore.io/api/graphql/");
    }

    #[test]
    fn leaves_local_urls_alone() {
        let (endpoint, base) = normalize_url("http://127.0.0.1:9182");
        assert_eq!(endpoint, "http://127.0.0.1:9182/graphql/");
        assert_eq!(base, "http://127.0.0.1:9182");
    }

    #[test]
    fn resolves_content_urls() {
        let config = ClientConfig::new("key", "secret", "https://app.medstore.io").unwrap();
        let client = GraphQlClient::new(config).unwrap();
        assert_eq!(
            client.resolve_content_url("medstore:///content/abc"),
            "https://app.medstore.io/content/abc"
        );
        assert_eq!(
            client.resolve_content_url("medstore://cdn.medstore.io/x"),
            "https://cdn.medstore.io/x"
        );
        assert_eq!(
            client.resolve_content_url("https://elsewhere/x"),
            "https://elsewhere/x"
        );
    }

    #[test]
    fn envelope_round_trips() {
        let config = ClientConfig::new("key", "secret", "https://app.medstore.io").unwrap();
        let client = GraphQlClient::new(config).unwrap();
        let payload = client
            .prepare_query("query q { x }", json!({ "a": 1 }))
            .unwrap();
        let compressed = BASE64.decode(payload).unwrap();
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut raw = String::new();
        decoder.read_to_string(&mut raw).unwrap();
        let body: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(body["query"], "query q { x }");
        assert_eq!(body["variables"]["a"], 1);
    }
}
