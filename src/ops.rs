use serde::Deserialize;
use serde_json::{json, Value};

use crate::client::GraphQlClient;
use crate::error::MedStoreError;

/// One (organization, dataset, import, series) listing entry, created
/// server-side at ingest time and read-only from here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeriesImport {
    pub series_id: String,
    pub import_id: String,
    pub created_at: String,
    pub created_by: String,
    pub num_files: u64,
    /// Content URL of the series metadata document (signed or `medstore://`).
    pub url: String,
}

/// A dataset ("data store") owned by an organization.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// One file descriptor sent with the `importFiles` mutation.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportFileInput {
    pub file_path: String,
    pub file_type: String,
}

/// The series content document: frame locations plus per-instance metadata.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesMetadataDoc {
    #[serde(default)]
    pub image_frames: Vec<ImageFrame>,
    pub meta_data: SeriesMetaData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageFrame {
    pub id: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeriesMetaData {
    #[serde(default)]
    pub instances: Vec<InstanceMetaData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMetaData {
    /// DICOM-JSON tag map for the instance.
    #[serde(default)]
    pub meta_data: Value,
    #[serde(default)]
    pub frames: Vec<FrameRef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameRef {
    pub id: String,
    /// Frame-level DICOM-JSON tags (carries the transfer syntax).
    #[serde(default)]
    pub meta_data: Value,
}

const IMPORT_FILES: &str = "
    mutation importFiles($orgId: UUID!, $dataStore: String!, $files: [ImportJobFileInput!]!, $importName: String, $importId: UUID) {
        importFiles(orgId: $orgId, dataStore: $dataStore, files: $files, importName: $importName, importId: $importId) {
            dataStoreImport {
                importId
            }
            urls
        }
    }
";

const PROCESS_IMPORT: &str = "
    mutation processImport($orgId: UUID!, $dataStore: String!, $importId: UUID!, $totalFiles: Int) {
        processImport(orgId: $orgId, dataStore: $dataStore, importId: $importId, totalFiles: $totalFiles) {
            ok
            message
        }
    }
";

const DATA_STORE_IMPORT_SERIES: &str = "
    query dataStoreImportSeries($orgId: UUID!, $dataStore: String!, $first: Int, $after: String, $search: String) {
        dataStoreImportSeries(orgId: $orgId, dataStore: $dataStore, first: $first, after: $after, search: $search) {
            entries {
                importId
                seriesId
                createdAt
                createdBy
                numFiles
                url
            }
            cursor
        }
    }
";

const DATA_STORES: &str = "
    query sdkDataStores($orgId: UUID!) {
        dataStores(orgId: $orgId) {
            name
            displayName
            status
            createdAt
            updatedAt
        }
    }
";

const CREATE_DATA_STORE: &str = "
    mutation sdkCreateDataStore($orgId: UUID!, $dataStore: String!, $displayName: String!) {
        createDatastore(orgId: $orgId, dataStore: $dataStore, displayName: $displayName) {
            name
            displayName
            status
            createdAt
            updatedAt
        }
    }
";

/// Register an import job and/or request presigned upload URLs.
///
/// With an empty `files` list this registers the import and returns its id;
/// with files it returns one presigned URL per file, positionally matched.
pub async fn register_import(
    client: &GraphQlClient,
    org_id: &str,
    dataset: &str,
    import_name: Option<&str>,
    import_id: Option<&str>,
    files: &[ImportFileInput],
) -> Result<(String, Vec<String>), MedStoreError> {
    if import_name.is_none() && import_id.is_none() {
        return Err(MedStoreError::Precondition(
            "either an import name or an import id is required".into(),
        ));
    }
    let data = client
        .execute(
            IMPORT_FILES,
            json!({
                "orgId": org_id,
                "dataStore": dataset,
                "files": files,
                "importName": import_name,
                "importId": import_id,
            }),
        )
        .await?;
    let import = &data["importFiles"];
    let import_id = import["dataStoreImport"]["importId"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let urls = import["urls"]
        .as_array()
        .map(|urls| {
            urls.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    Ok((import_id, urls))
}

/// Finalize an import; the server materializes it asynchronously.
pub async fn process_import(
    client: &GraphQlClient,
    org_id: &str,
    dataset: &str,
    import_id: &str,
    total_files: usize,
) -> Result<bool, MedStoreError> {
    let data = client
        .execute(
            PROCESS_IMPORT,
            json!({
                "orgId": org_id,
                "dataStore": dataset,
                "importId": import_id,
                "totalFiles": total_files,
            }),
        )
        .await?;
    Ok(data["processImport"]["ok"].as_bool().unwrap_or(false))
}

/// One page of the series-import listing.
pub async fn list_series_imports(
    client: &GraphQlClient,
    org_id: &str,
    dataset: &str,
    search: Option<String>,
    first: usize,
    cursor: Option<String>,
) -> Result<(Vec<SeriesImport>, Option<String>), MedStoreError> {
    let data = client
        .execute(
            DATA_STORE_IMPORT_SERIES,
            json!({
                "orgId": org_id,
                "dataStore": dataset,
                "first": first,
                "after": cursor,
                "search": search,
            }),
        )
        .await?;
    let listing = &data["dataStoreImportSeries"];
    let entries =
        serde_json::from_value(listing["entries"].clone()).map_err(MedStoreError::from)?;
    let cursor = listing["cursor"].as_str().map(String::from);
    Ok((entries, cursor))
}

pub async fn list_datasets(
    client: &GraphQlClient,
    org_id: &str,
) -> Result<Vec<Dataset>, MedStoreError> {
    let data = client
        .execute(DATA_STORES, json!({ "orgId": org_id }))
        .await?;
    serde_json::from_value(data["dataStores"].clone()).map_err(MedStoreError::from)
}

pub async fn create_dataset(
    client: &GraphQlClient,
    org_id: &str,
    name: &str,
) -> Result<Dataset, MedStoreError> {
    let data = client
        .execute(
            CREATE_DATA_STORE,
            json!({
                "orgId": org_id,
                "dataStore": name,
                "displayName": name,
            }),
        )
        .await?;
    serde_json::from_value(data["createDatastore"].clone()).map_err(MedStoreError::from)
}

/// Fetch and parse the series content document, signed or unsigned.
pub async fn fetch_series_metadata(
    client: &GraphQlClient,
    transfer: &crate::transfer::TransferClient,
    url: &str,
) -> Result<SeriesMetadataDoc, MedStoreError> {
    let resolved = client.resolve_content_url(url);
    let bytes = transfer
        .fetch_bytes(&resolved, Some(client.auth_headers()?))
        .await?;
    serde_json::from_slice(&bytes).map_err(MedStoreError::from)
}
