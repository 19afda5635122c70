//! # medstore_rs
//! ## Before you begin
//! This library talks to the MedStore API. You need an API key pair
//! (key and secret) for an organization, either exported as the
//! `MEDSTORE_API_KEY` / `MEDSTORE_SECRET_KEY` environment variables or stored
//! in a profile of the `~/.medstore/credentials` file written by the CLI.
//!
//! ## Description
//! **medstore_rs** is a client library in Rust for the MedStore medical
//! imaging data platform. It imports Digital Imaging and Communications in
//! Medicine (DICOM) files into remote datasets and exports stored series back
//! to disk as standard Part-10 files, moving many files at once without
//! overwhelming either end of the connection.
//!
//! The two main entry points are:
//!
//! 1. [`UploadPipeline`], which registers an import, requests presigned URLs
//!    in batches and uploads files concurrently before finalizing.
//! 2. [`ExportPipeline`], which pages through a dataset's series listing,
//!    downloads the frames of each missing series concurrently and
//!    reassembles them into DICOM files, tracked by a local manifest so
//!    re-runs only fetch what changed.
//!
//! Supporting building blocks are exposed for direct use:
//!
//! * [`ClientConfig`] and [`GraphQlClient`] for the authenticated transport.
//! * [`PaginationIterator`] for lazy cursor pagination over any listing.
//! * [`concurrency::gather_with_concurrency`] for order-preserving bounded
//!   fan-out.
//! * [`TransferClient`] and [`RetryPolicy`] for retried per-file transfers.
//!
//! ## Example
//! Import a directory of DICOM files into a dataset:
//! ```rust no_run
//! use std::path::Path;
//!
//! use medstore_rs::{ClientConfig, GraphQlClient, UploadOptions, UploadPipeline};
//!
//! #[tokio::main]
//! pub async fn main() {
//!     let config = ClientConfig::from_env().unwrap();
//!     let client = GraphQlClient::new(config).unwrap();
//!
//!     let pipeline = UploadPipeline::new(&client, "org-uuid", "brain-study").unwrap();
//!     let report = pipeline
//!         .run(Path::new("./scans"), &UploadOptions::default())
//!         .await
//!         .unwrap();
//!
//!     println!(
//!         "import {}: {}/{} files uploaded",
//!         report.import_id, report.uploaded, report.total_files
//!     );
//! }
//! ```

pub mod assemble;
pub mod client;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod export;
pub mod files;
pub mod manifest;
pub mod ops;
pub mod pagination;
pub mod transfer;
pub mod upload;

pub use client::GraphQlClient;
pub use config::{ClientConfig, CredentialsFile, Profile};
pub use error::MedStoreError;
pub use export::{ExportOptions, ExportPipeline, ExportReport};
pub use manifest::{ExportManifest, SeriesRecord};
pub use pagination::PaginationIterator;
pub use transfer::{FileUpload, RetryPolicy, TransferClient};
pub use upload::{UploadOptions, UploadPipeline, UploadReport};
