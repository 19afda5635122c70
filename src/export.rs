use std::collections::HashMap;
use std::fs;
use std::path::Path;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::assemble;
use crate::client::GraphQlClient;
use crate::concurrency::{gather_with_concurrency, try_gather_with_concurrency};
use crate::config::{EXPORT_PAGE_SIZE, MAX_CONCURRENCY};
use crate::error::MedStoreError;
use crate::manifest::{manifest_path, ExportManifest, SeriesRecord};
use crate::ops::{self, SeriesImport};
use crate::pagination::PaginationIterator;
use crate::transfer::TransferClient;

#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Listing page size, which is also the manifest checkpoint interval.
    pub page_size: usize,
    /// Simultaneous transfers (series per batch, frames per instance).
    pub concurrency: usize,
    /// Server-side search filter on the series listing.
    pub search: Option<String>,
    /// Stop after this many series, across pages.
    pub limit: Option<usize>,
    /// Ignore the local manifest and re-export everything.
    pub clear_cache: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions {
            page_size: EXPORT_PAGE_SIZE,
            concurrency: MAX_CONCURRENCY,
            search: None,
            limit: None,
            clear_cache: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportReport {
    pub listed: usize,
    pub exported: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Incremental series export: page through the dataset's series listing,
/// download and reassemble the series missing locally, and checkpoint the
/// manifest after every page.
pub struct ExportPipeline<'a> {
    client: &'a GraphQlClient,
    transfer: TransferClient,
    org_id: String,
    dataset: String,
}

impl<'a> ExportPipeline<'a> {
    pub fn new(
        client: &'a GraphQlClient,
        org_id: impl Into<String>,
        dataset: impl Into<String>,
    ) -> Result<Self, MedStoreError> {
        Ok(ExportPipeline {
            transfer: TransferClient::new(client.config())?,
            client,
            org_id: org_id.into(),
            dataset: dataset.into(),
        })
    }

    pub async fn run(
        &self,
        root: &Path,
        options: &ExportOptions,
    ) -> Result<ExportReport, MedStoreError> {
        let dataset_root = root.join(&self.dataset);
        let mut manifest = if options.clear_cache {
            ExportManifest::empty(manifest_path(&dataset_root))
        } else {
            ExportManifest::load(manifest_path(&dataset_root))
        };

        let client = self.client;
        let org_id = self.org_id.clone();
        let dataset = self.dataset.clone();
        let search = options.search.clone();
        let mut pages = PaginationIterator::new(
            move |first, cursor| {
                let org_id = org_id.clone();
                let dataset = dataset.clone();
                let search = search.clone();
                async move {
                    ops::list_series_imports(client, &org_id, &dataset, search, first, cursor)
                        .await
                }
            },
            options.page_size,
        )
        .with_limit(options.limit);

        let mut report = ExportReport::default();
        let batch_size = options.page_size.max(1);
        loop {
            let mut batch = Vec::new();
            while batch.len() < batch_size {
                match pages.next_entry().await? {
                    Some(entry) => batch.push(entry),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }
            report.listed += batch.len();
            self.process_batch(&batch, &dataset_root, options, &mut manifest, &mut report)
                .await;
            manifest.save()?;
            if batch.len() < batch_size {
                break;
            }
        }

        info!(
            "export finished: {} exported, {} up to date, {} failed",
            report.exported, report.skipped, report.failed
        );
        Ok(report)
    }

    async fn process_batch(
        &self,
        batch: &[SeriesImport],
        dataset_root: &Path,
        options: &ExportOptions,
        manifest: &mut ExportManifest,
        report: &mut ExportReport,
    ) {
        let mut pending = Vec::new();
        for series in batch {
            if !options.clear_cache
                && manifest.get(&self.dataset, &series.series_id).is_some()
                && dataset_root.join(&series.series_id).is_dir()
            {
                debug!("series {} already exported", series.series_id);
                report.skipped += 1;
                continue;
            }
            pending.push(series);
        }
        if pending.is_empty() {
            return;
        }

        let tasks = pending
            .iter()
            .map(|series| async move {
                let outcome = self
                    .export_series(series, dataset_root, options.concurrency)
                    .await;
                (*series, outcome)
            })
            .collect::<Vec<_>>();
        let outcomes =
            gather_with_concurrency(options.concurrency, tasks, Some("Exporting series"), false)
                .await;

        for (series, outcome) in outcomes {
            match outcome {
                Ok(items) => {
                    manifest.upsert(SeriesRecord {
                        dataset: self.dataset.clone(),
                        series_id: series.series_id.clone(),
                        import_id: series.import_id.clone(),
                        created_at: series.created_at.clone(),
                        created_by: series.created_by.clone(),
                        items,
                    });
                    report.exported += 1;
                }
                Err(err) => {
                    // a prior manifest record for this series stays untouched
                    warn!("failed to export series {}: {err}", series.series_id);
                    report.failed += 1;
                }
            }
        }
    }

    /// Download, reassemble and write one series. Returns the written file
    /// paths relative to the dataset root.
    async fn export_series(
        &self,
        series: &SeriesImport,
        dataset_root: &Path,
        concurrency: usize,
    ) -> Result<Vec<String>, MedStoreError> {
        let doc = ops::fetch_series_metadata(self.client, &self.transfer, &series.url).await?;
        let frame_urls = doc
            .image_frames
            .iter()
            .map(|frame| (frame.id.as_str(), frame.path.as_str()))
            .collect::<HashMap<_, _>>();
        let headers = self.client.auth_headers()?;

        let series_dir = dataset_root.join(&series.series_id);
        if series_dir.exists() {
            fs::remove_dir_all(&series_dir)?;
        }
        fs::create_dir_all(&series_dir)?;

        let mut items = Vec::new();
        for (at, instance) in doc.meta_data.instances.iter().enumerate() {
            let transfer_syntax = instance
                .frames
                .first()
                .and_then(|frame| assemble::frame_transfer_syntax(&frame.meta_data))
                .ok_or_else(|| {
                    MedStoreError::Assemble(format!(
                        "series {} instance {at} carries no transfer syntax",
                        series.series_id
                    ))
                })?;

            let fetches = instance
                .frames
                .iter()
                .map(|frame| {
                    let url = frame_urls.get(frame.id.as_str()).copied().ok_or_else(|| {
                        MedStoreError::Assemble(format!(
                            "series {} has no content entry for frame {}",
                            series.series_id, frame.id
                        ))
                    });
                    let headers = headers.clone();
                    async move {
                        let resolved = self.client.resolve_content_url(url?);
                        self.transfer.fetch_bytes(&resolved, Some(headers)).await
                    }
                })
                .collect::<Vec<_>>();
            let frames: Vec<Bytes> =
                try_gather_with_concurrency(concurrency, fetches, None, false).await?;

            let object = assemble::assemble_instance(&instance.meta_data, &transfer_syntax, frames)?;
            let file_name = instance_file_name(&series.series_id, instance.frames.first(), at);
            let path = series_dir.join(&file_name);
            write_object(&object, &path)?;
            items.push(format!("{}/{}", series.series_id, file_name));
        }
        Ok(items)
    }
}

fn instance_file_name(
    series_id: &str,
    first_frame: Option<&ops::FrameRef>,
    at: usize,
) -> String {
    match first_frame {
        Some(frame) => format!("{series_id}-{}.dcm", frame.id),
        None => format!("{series_id}-instance-{at}.dcm"),
    }
}

fn write_object(
    object: &dicom::object::FileDicomObject<dicom::object::InMemDicomObject>,
    path: &Path,
) -> Result<(), MedStoreError> {
    object
        .write_to_file(path)
        .map_err(|err| MedStoreError::Assemble(err.to_string()))
}
