use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use indicatif::ProgressBar;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use tracing::{debug, warn};

use crate::concurrency::gather_with_concurrency;
use crate::config::ClientConfig;
use crate::error::MedStoreError;
use crate::files::{self, DICOM_MIME};

/// Bounded random-exponential backoff schedule for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: crate::config::MAX_RETRY_ATTEMPTS,
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Jittered wait before the next attempt (`attempt` counts from 1).
    /// An inverted min/max configuration degrades to the minimum delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        let min = self.min_delay.as_secs_f64();
        let cap = self.max_delay.as_secs_f64();
        let high = (min * 2f64.powi(attempt.saturating_sub(1) as i32))
            .min(cap)
            .max(min);
        let secs = rand::thread_rng().gen_range(min..=high);
        Duration::from_secs_f64(secs)
    }
}

/// One (local file, presigned URL, MIME type) upload unit.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub path: PathBuf,
    pub url: String,
    pub mime: String,
}

/// Per-file HTTP transfer primitive with gzip negotiation and retries.
///
/// Both pipelines funnel their presigned PUTs and GETs through this type;
/// per-file failures are isolated here so a batch can keep going.
pub struct TransferClient {
    http: reqwest::Client,
    policy: RetryPolicy,
}

impl TransferClient {
    pub fn new(config: &ClientConfig) -> Result<Self, MedStoreError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;
        Ok(TransferClient {
            http,
            policy: config.retry.clone(),
        })
    }

    /// Upload one file to a presigned URL. Success is exactly HTTP 200.
    ///
    /// Bodies are gzip-compressed unless the payload already carries the
    /// gzip magic or the MIME type is the raw DICOM octet stream.
    pub async fn upload_file(
        &self,
        path: &Path,
        url: &str,
        mime: &str,
    ) -> Result<(), MedStoreError> {
        let mut data = fs::read(path)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(mime)
                .map_err(|err| MedStoreError::Config(format!("invalid mime type: {err}")))?,
        );
        if !files::is_gzipped_data(&data) && mime != DICOM_MIME {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            data = gzip(&data)?;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = async {
                let response = self
                    .http
                    .put(url)
                    .headers(headers.clone())
                    .body(data.clone())
                    .send()
                    .await?;
                match response.status().as_u16() {
                    200 => Ok(()),
                    401 | 403 => Err(MedStoreError::Auth(response.status().as_u16())),
                    status => Err(MedStoreError::Status(status)),
                }
            }
            .await;
            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) if attempt >= self.policy.max_attempts => {
                    return Err(MedStoreError::Transfer {
                        path: path.display().to_string(),
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    debug!("retrying upload of {} after: {err}", path.display());
                    tokio::time::sleep(self.policy.delay(attempt)).await;
                }
            }
        }
    }

    /// Upload a batch with bounded concurrency, one success flag per file in
    /// submission order. A failed file logs a warning and yields `false`
    /// without disturbing its neighbours. `overall` is ticked once per
    /// successful upload, on top of the runner's own batch bar.
    pub async fn upload_files(
        &self,
        uploads: &[FileUpload],
        concurrency: usize,
        progress_bar_name: Option<&str>,
        overall: Option<&ProgressBar>,
    ) -> Vec<bool> {
        let tasks = uploads
            .iter()
            .map(|upload| async move {
                match self.upload_file(&upload.path, &upload.url, &upload.mime).await {
                    Ok(()) => {
                        if let Some(bar) = overall {
                            bar.inc(1);
                        }
                        true
                    }
                    Err(err) => {
                        warn!("upload of {} failed: {err}", upload.path.display());
                        false
                    }
                }
            })
            .collect::<Vec<_>>();
        gather_with_concurrency(concurrency.max(1), tasks, progress_bar_name, false).await
    }

    /// Fetch raw bytes (frame payloads, metadata documents) with retries.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        headers: Option<HeaderMap>,
    ) -> Result<Bytes, MedStoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = async {
                let mut request = self.http.get(url);
                if let Some(headers) = headers.clone() {
                    request = request.headers(headers);
                }
                let response = request.send().await?;
                match response.status().as_u16() {
                    200 => Ok(response.bytes().await?),
                    401 | 403 => Err(MedStoreError::Auth(response.status().as_u16())),
                    status => Err(MedStoreError::Status(status)),
                }
            }
            .await;
            match result {
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) if attempt >= self.policy.max_attempts => {
                    return Err(MedStoreError::Transfer {
                        path: url.to_string(),
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    debug!("retrying fetch of {url} after: {err}");
                    tokio::time::sleep(self.policy.delay(attempt)).await;
                }
            }
        }
    }

    /// Download a URL to a local path.
    ///
    /// `None` inputs and empty bodies resolve to `Ok(None)`; the caller
    /// decides whether that is fatal. Without `overwrite`, an existing path
    /// is returned untouched and fresh writes are uniquified. With
    /// `keep_compressed`, payloads stay (or become) gzip and get a `.gz`
    /// suffix; otherwise gzip-encoded responses are decompressed.
    pub async fn download_file(
        &self,
        url: Option<&str>,
        path: Option<&Path>,
        overwrite: bool,
        keep_compressed: bool,
    ) -> Result<Option<PathBuf>, MedStoreError> {
        let (Some(url), Some(path)) = (url, path) else {
            debug!("skipping empty download request");
            return Ok(None);
        };
        if !overwrite && path.is_file() {
            return Ok(Some(path.to_path_buf()));
        }

        let data = self.fetch_bytes(url, None).await?;
        if data.is_empty() {
            debug!("received empty data from {url}");
            return Ok(None);
        }

        let mut data = data.to_vec();
        let gzipped = files::is_gzipped_data(&data);
        if !keep_compressed && gzipped {
            // best effort: servers sometimes mislabel plain payloads
            if let Ok(plain) = gunzip(&data) {
                data = plain;
            }
        } else if keep_compressed && !gzipped {
            data = gzip(&data)?;
        }

        let mut target = path.to_path_buf();
        if keep_compressed && !target.extension().map_or(false, |ext| ext.eq_ignore_ascii_case("gz")) {
            target = PathBuf::from(format!("{}.gz", target.display()));
        }
        if !overwrite {
            target = files::uniquify_path(&target);
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, data)?;
        Ok(Some(target))
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, MedStoreError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, MedStoreError> {
    let mut decoder = GzDecoder::new(data);
    let mut plain = Vec::new();
    decoder.read_to_end(&mut plain)?;
    Ok(plain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
        };
        for attempt in 1..=6 {
            let delay = policy.delay(attempt);
            assert!(delay >= policy.min_delay);
            assert!(delay <= policy.max_delay);
        }
    }

    #[test]
    fn inverted_delay_bounds_do_not_panic() {
        let policy = RetryPolicy {
            max_attempts: 3,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(100),
        };
        for attempt in 1..=4 {
            assert_eq!(policy.delay(attempt), policy.min_delay);
        }
    }

    #[test]
    fn gzip_round_trips() {
        let data = b"not compressed yet".to_vec();
        let compressed = gzip(&data).unwrap();
        assert!(files::is_gzipped_data(&compressed));
        assert_eq!(gunzip(&compressed).unwrap(), data);
    }
}
