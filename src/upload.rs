use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use indicatif::ProgressBar;
use rand::Rng;
use tracing::{info, warn};

use crate::client::GraphQlClient;
use crate::config::{MAX_FILE_BATCH_SIZE, MAX_UPLOAD_CONCURRENCY};
use crate::error::MedStoreError;
use crate::files;
use crate::ops::{self, ImportFileInput};
use crate::transfer::{FileUpload, TransferClient};

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Human-readable import label; generated when neither name nor id is
    /// supplied.
    pub import_name: Option<String>,
    /// Reuse an existing import id instead of registering a new one.
    pub import_id: Option<String>,
    /// Simultaneous file transfers per batch.
    pub concurrency: usize,
    /// Files per presigned-URL request.
    pub batch_size: usize,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            import_name: None,
            import_id: None,
            concurrency: MAX_UPLOAD_CONCURRENCY,
            batch_size: MAX_FILE_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadReport {
    pub import_id: String,
    pub total_files: usize,
    pub uploaded: usize,
    /// False when at least one file exhausted its retries. The import is
    /// still finalized with the nominal total (best-effort semantics); the
    /// server reports a partial creation status for the missing files.
    pub all_succeeded: bool,
}

/// Bulk-import pipeline: enumerate local DICOM files, register an import,
/// request presigned URLs in batches and upload them concurrently, then
/// finalize the import.
pub struct UploadPipeline<'a> {
    client: &'a GraphQlClient,
    transfer: TransferClient,
    org_id: String,
    dataset: String,
}

impl<'a> UploadPipeline<'a> {
    pub fn new(
        client: &'a GraphQlClient,
        org_id: impl Into<String>,
        dataset: impl Into<String>,
    ) -> Result<Self, MedStoreError> {
        Ok(UploadPipeline {
            transfer: TransferClient::new(client.config())?,
            client,
            org_id: org_id.into(),
            dataset: dataset.into(),
        })
    }

    pub async fn run(
        &self,
        path: &Path,
        options: &UploadOptions,
    ) -> Result<UploadReport, MedStoreError> {
        let files = self.enumerate(path)?;
        if files.is_empty() {
            warn!("no supported files found under {}", path.display());
            return Err(MedStoreError::Precondition(format!(
                "no supported files to upload under {}",
                path.display()
            )));
        }

        // a label is only minted when the caller supplied neither a name
        // nor an existing import id
        let import_name = match (&options.import_name, &options.import_id) {
            (Some(name), _) => Some(name.clone()),
            (None, Some(_)) => None,
            (None, None) => Some(generate_import_label()),
        };
        let (import_id, _) = ops::register_import(
            self.client,
            &self.org_id,
            &self.dataset,
            import_name.as_deref(),
            options.import_id.as_deref(),
            &[],
        )
        .await?;
        if import_id.is_empty() {
            return Err(MedStoreError::Precondition(
                "server did not assign an import id".into(),
            ));
        }
        info!("registered import {import_id} with {} files", files.len());

        let overall = ProgressBar::new(files.len() as u64);
        overall.set_message("Uploading all files");
        let mut uploaded = 0usize;
        let mut all_succeeded = true;

        for batch in files.chunks(options.batch_size.max(1)) {
            let inputs = batch
                .iter()
                .map(|file| {
                    Ok(ImportFileInput {
                        file_path: file_name(file),
                        file_type: files::file_mime(file)?.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, MedStoreError>>()?;
            let (_, urls) = ops::register_import(
                self.client,
                &self.org_id,
                &self.dataset,
                import_name.as_deref(),
                Some(&import_id),
                &inputs,
            )
            .await?;
            if urls.len() != batch.len() {
                return Err(MedStoreError::Precondition(format!(
                    "server issued {} presigned urls for a batch of {} files",
                    urls.len(),
                    batch.len()
                )));
            }

            let uploads = batch
                .iter()
                .zip(&urls)
                .zip(&inputs)
                .map(|((file, url), input)| FileUpload {
                    path: file.clone(),
                    url: url.clone(),
                    mime: input.file_type.clone(),
                })
                .collect::<Vec<_>>();
            let results = self
                .transfer
                .upload_files(
                    &uploads,
                    options.concurrency,
                    Some("Batch progress"),
                    Some(&overall),
                )
                .await;
            uploaded += results.iter().filter(|ok| **ok).count();
            if results.iter().any(|ok| !ok) {
                all_succeeded = false;
                warn!("some files in this batch failed to upload");
            }
        }
        overall.finish_and_clear();

        // finalize with the nominal count even after partial failures; the
        // report carries the aggregate flag
        let finalized = ops::process_import(
            self.client,
            &self.org_id,
            &self.dataset,
            &import_id,
            files.len(),
        )
        .await?;
        if !finalized {
            return Err(MedStoreError::Precondition(
                "import finalization was rejected by the server".into(),
            ));
        }

        Ok(UploadReport {
            import_id,
            total_files: files.len(),
            uploaded,
            all_succeeded,
        })
    }

    /// A directory is walked for candidates; a single file must pass both
    /// the extension and the `DICM` magic check.
    fn enumerate(&self, path: &Path) -> Result<Vec<PathBuf>, MedStoreError> {
        if path.is_dir() {
            Ok(files::find_dicom_files(path))
        } else {
            files::file_mime(path)?;
            if !files::is_dicom_file(path)? {
                return Err(MedStoreError::UnsupportedFile(path.to_path_buf()));
            }
            Ok(vec![path.to_path_buf()])
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Import label used when the caller supplies neither a name nor an id.
pub fn generate_import_label() -> String {
    let mut rng = rand::thread_rng();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!(
        "CLI - {} - {} - {} - {} - {}",
        random_word(&mut rng),
        random_word(&mut rng),
        random_word(&mut rng),
        random_word(&mut rng),
        nanos
    )
}

fn random_word(rng: &mut impl Rng) -> String {
    let length = rng.gen_range(5..=10);
    (0..length)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_label_shape() {
        let label = generate_import_label();
        let parts = label.split(" - ").collect::<Vec<_>>();
        assert_eq!(parts.len(), 6);
        assert_eq!(parts[0], "CLI");
        for word in &parts[1..5] {
            assert!((5..=10).contains(&word.len()));
            assert!(word.bytes().all(|b| b.is_ascii_lowercase()));
        }
        assert!(parts[5].parse::<u128>().is_ok());
    }
}
