use std::io::Read;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use medstore_rs::{ClientConfig, RetryPolicy};
use serde_json::Value;
use wiremock::{Match, Request};

/// Client configuration pointed at a mock server, with millisecond backoff
/// so retry paths stay fast.
pub fn test_config(url: &str) -> ClientConfig {
    ClientConfig::new("testkey", "testsecret", url)
        .unwrap()
        .with_retry(RetryPolicy {
            max_attempts: 3,
            min_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        })
}

/// Decode the gzip+base64 request envelope back into the operation JSON.
pub fn decode_envelope(request: &Request) -> Option<Value> {
    let text = std::str::from_utf8(&request.body).ok()?;
    let compressed = BASE64.decode(text.trim()).ok()?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut raw = String::new();
    decoder.read_to_string(&mut raw).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Matches a GraphQL request whose query mentions the operation name.
pub struct GraphQlOperation(pub &'static str);

impl Match for GraphQlOperation {
    fn matches(&self, request: &Request) -> bool {
        decode_envelope(request)
            .and_then(|body| body["query"].as_str().map(|query| query.contains(self.0)))
            .unwrap_or(false)
    }
}

/// Matches an `importFiles` request carrying exactly this many file
/// descriptors.
pub struct ImportFilesWith(pub usize);

impl Match for ImportFilesWith {
    fn matches(&self, request: &Request) -> bool {
        let Some(body) = decode_envelope(request) else {
            return false;
        };
        let is_import = body["query"]
            .as_str()
            .map_or(false, |query| query.contains("importFiles"));
        let count = body["variables"]["files"]
            .as_array()
            .map_or(usize::MAX, Vec::len);
        is_import && count == self.0
    }
}
