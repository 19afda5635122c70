use std::{env, path::PathBuf, process};

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use medstore_rs::config::{
    CredentialsFile, Profile, EXPORT_PAGE_SIZE, MAX_CONCURRENCY, MAX_FILE_BATCH_SIZE,
    MAX_UPLOAD_CONCURRENCY,
};
use medstore_rs::{
    ClientConfig, ExportOptions, ExportPipeline, GraphQlClient, MedStoreError, PaginationIterator,
    UploadOptions, UploadPipeline,
};
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing::{error, warn};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
    /// Credentials profile to use
    #[clap(short, long, default_value = "default", global = true)]
    profile: String,
    /// Set the log level
    #[arg(value_enum)]
    #[clap(short = 'L', long, default_value = "info", global = true)]
    log_level: LogLevel,
    /// Display timestamps with log messages
    #[clap(short = 'T', long, global = true)]
    timestamp: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store an API key pair in the credentials file, or show the stored
    /// profiles when called without keys
    Config {
        /// API key of the key pair
        #[clap(long, requires = "secret_key", requires = "org")]
        api_key: Option<String>,
        /// Secret key of the key pair
        #[clap(long)]
        secret_key: Option<String>,
        /// Organization the key pair belongs to
        #[clap(long)]
        org: Option<String>,
        /// Override the default API URL for this profile
        #[clap(long)]
        url: Option<String>,
    },
    /// List the organization's datasets
    List,
    /// Create a new dataset
    Create {
        /// Name of the dataset to create
        dataset: String,
    },
    /// List the series stored in a dataset
    Query {
        /// Dataset to query
        dataset: String,
        /// Server-side search filter
        #[clap(short, long)]
        search: Option<String>,
        /// Stop after this many series
        #[clap(short, long)]
        number: Option<usize>,
        /// Listing page size
        #[clap(long, default_value_t = EXPORT_PAGE_SIZE)]
        page_size: usize,
    },
    /// Import DICOM files into a dataset
    Upload {
        /// Dataset to import into
        dataset: String,
        /// File or directory to import
        path: PathBuf,
        /// Label for the new import
        #[clap(long)]
        name: Option<String>,
        /// Append to an existing import instead of creating one
        #[clap(long)]
        import_id: Option<String>,
        /// Simultaneous file uploads
        #[clap(short, long, default_value_t = MAX_UPLOAD_CONCURRENCY)]
        concurrency: usize,
        /// Files per presigned-URL request
        #[clap(short, long, default_value_t = MAX_FILE_BATCH_SIZE)]
        batch_size: usize,
    },
    /// Export a dataset's series as DICOM files
    Export {
        /// Dataset to export
        dataset: String,
        /// Directory the dataset folder is created in
        #[clap(short, long, default_value = ".")]
        destination: PathBuf,
        /// Listing page size (also the manifest checkpoint interval)
        #[clap(long, default_value_t = EXPORT_PAGE_SIZE)]
        page_size: usize,
        /// Simultaneous series exports
        #[clap(short, long, default_value_t = MAX_CONCURRENCY)]
        concurrency: usize,
        /// Server-side search filter
        #[clap(short, long)]
        search: Option<String>,
        /// Stop after this many series
        #[clap(short, long)]
        number: Option<usize>,
        /// Ignore the local manifest and re-export everything
        #[clap(long)]
        clear_cache: bool,
    },
}

#[derive(Copy, Clone, ValueEnum, Debug)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Quiet,
}

#[derive(Tabled)]
struct DatasetRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "DISPLAY NAME")]
    display_name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "CREATED")]
    created_at: String,
}

#[derive(Tabled)]
struct ProfileRow {
    #[tabled(rename = "PROFILE")]
    profile: String,
    #[tabled(rename = "ORG")]
    org_id: String,
    #[tabled(rename = "URL")]
    url: String,
    #[tabled(rename = "API KEY")]
    api_key: String,
}

#[derive(Tabled)]
struct SeriesRow {
    #[tabled(rename = "SERIES")]
    series_id: String,
    #[tabled(rename = "IMPORT")]
    import_id: String,
    #[tabled(rename = "FILES")]
    num_files: u64,
    #[tabled(rename = "CREATED")]
    created_at: String,
    #[tabled(rename = "CREATED BY")]
    created_by: String,
}

#[tokio::main]
pub async fn main() {
    let args = Args::parse();

    tracing_subscriber_handler(&args);

    if let Err(e) = run(&args).await {
        error!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(args: &Args) -> Result<(), MedStoreError> {
    match &args.command {
        Command::Config {
            api_key,
            secret_key,
            org,
            url,
        } => match (api_key, secret_key, org) {
            (Some(api_key), Some(secret_key), Some(org)) => {
                save_profile(&args.profile, api_key, secret_key, org, url.as_deref())
            }
            _ => show_profiles(),
        },
        Command::List => list_datasets(&args.profile).await,
        Command::Create { dataset } => create_dataset(&args.profile, dataset).await,
        Command::Query {
            dataset,
            search,
            number,
            page_size,
        } => query_series(&args.profile, dataset, search.clone(), *number, *page_size).await,
        Command::Upload {
            dataset,
            path,
            name,
            import_id,
            concurrency,
            batch_size,
        } => {
            let options = UploadOptions {
                import_name: name.clone(),
                import_id: import_id.clone(),
                concurrency: *concurrency,
                batch_size: *batch_size,
            };
            upload(&args.profile, dataset, path, &options).await
        }
        Command::Export {
            dataset,
            destination,
            page_size,
            concurrency,
            search,
            number,
            clear_cache,
        } => {
            let options = ExportOptions {
                page_size: *page_size,
                concurrency: *concurrency,
                search: search.clone(),
                limit: *number,
                clear_cache: *clear_cache,
            };
            export(&args.profile, dataset, destination, &options).await
        }
    }
}

fn save_profile(
    profile: &str,
    api_key: &str,
    secret_key: &str,
    org: &str,
    url: Option<&str>,
) -> Result<(), MedStoreError> {
    // validate before persisting
    ClientConfig::new(api_key, secret_key, url.unwrap_or_default())?;
    let path = CredentialsFile::default_path()?;
    let mut file = CredentialsFile::load(&path)?;
    file.profiles.insert(
        profile.to_string(),
        Profile {
            api_key: api_key.to_string(),
            secret_key: secret_key.to_string(),
            org_id: org.to_string(),
            url: url.map(String::from),
        },
    );
    file.save(&path)?;
    println!(
        "{} profile {} saved to {}",
        "✔".green(),
        profile.bold(),
        path.display()
    );
    Ok(())
}

fn show_profiles() -> Result<(), MedStoreError> {
    let path = CredentialsFile::default_path()?;
    let file = CredentialsFile::load(&path)?;
    if file.profiles.is_empty() {
        println!("No profiles stored in {}.", path.display());
        return Ok(());
    }
    let rows = file
        .profiles
        .iter()
        .map(|(name, profile)| ProfileRow {
            profile: name.clone(),
            org_id: profile.org_id.clone(),
            url: profile.url.clone().unwrap_or_else(|| "(default)".into()),
            api_key: mask_key(&profile.api_key),
        })
        .collect::<Vec<_>>();
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}

/// Keep only the first few characters of a key for display.
fn mask_key(key: &str) -> String {
    let head = key.chars().take(4).collect::<String>();
    format!("{head}***")
}

/// Resolve credentials for a command, the environment taking precedence over
/// the credentials file.
fn resolve_credentials(profile: &str) -> Result<(ClientConfig, String), MedStoreError> {
    if env::var("MEDSTORE_API_KEY").is_ok() {
        let config = ClientConfig::from_env()?;
        let org_id = env::var("MEDSTORE_ORG_ID")
            .map_err(|_| MedStoreError::Config("MEDSTORE_ORG_ID is not set".into()))?;
        return Ok((config, org_id));
    }
    let path = CredentialsFile::default_path()?;
    let file = CredentialsFile::load(&path)?;
    let profile = file.profile(profile).ok_or_else(|| {
        MedStoreError::Config(format!(
            "no credentials profile named \"{profile}\", run the config command first"
        ))
    })?;
    let config = ClientConfig::new(
        profile.api_key.clone(),
        profile.secret_key.clone(),
        profile.url.clone().unwrap_or_default(),
    )?;
    Ok((config, profile.org_id.clone()))
}

async fn list_datasets(profile: &str) -> Result<(), MedStoreError> {
    let (config, org_id) = resolve_credentials(profile)?;
    let client = GraphQlClient::new(config)?;
    let datasets = medstore_rs::ops::list_datasets(&client, &org_id).await?;
    if datasets.is_empty() {
        println!("No datasets in this organization yet.");
        return Ok(());
    }
    let rows = datasets
        .into_iter()
        .map(|dataset| DatasetRow {
            name: dataset.name,
            display_name: dataset.display_name,
            status: dataset.status,
            created_at: dataset.created_at,
        })
        .collect::<Vec<_>>();
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}

async fn create_dataset(profile: &str, dataset: &str) -> Result<(), MedStoreError> {
    let (config, org_id) = resolve_credentials(profile)?;
    let client = GraphQlClient::new(config)?;
    let created = medstore_rs::ops::create_dataset(&client, &org_id, dataset).await?;
    println!(
        "{} dataset {} created ({})",
        "✔".green(),
        created.name.bold(),
        created.status
    );
    Ok(())
}

async fn query_series(
    profile: &str,
    dataset: &str,
    search: Option<String>,
    number: Option<usize>,
    page_size: usize,
) -> Result<(), MedStoreError> {
    let (config, org_id) = resolve_credentials(profile)?;
    let client = GraphQlClient::new(config)?;
    let client_ref = &client;
    let dataset_owned = dataset.to_string();
    let mut pages = PaginationIterator::new(
        move |first, cursor| {
            let org_id = org_id.clone();
            let dataset = dataset_owned.clone();
            let search = search.clone();
            async move {
                medstore_rs::ops::list_series_imports(
                    client_ref, &org_id, &dataset, search, first, cursor,
                )
                .await
            }
        },
        page_size,
    )
    .with_limit(number);

    let mut rows = Vec::new();
    while let Some(series) = pages.next_entry().await? {
        rows.push(SeriesRow {
            series_id: series.series_id,
            import_id: series.import_id,
            num_files: series.num_files,
            created_at: series.created_at,
            created_by: series.created_by,
        });
    }
    if rows.is_empty() {
        println!("No series in dataset {}.", dataset.bold());
        return Ok(());
    }
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}

async fn upload(
    profile: &str,
    dataset: &str,
    path: &PathBuf,
    options: &UploadOptions,
) -> Result<(), MedStoreError> {
    let (config, org_id) = resolve_credentials(profile)?;
    let client = GraphQlClient::new(config)?;
    let pipeline = UploadPipeline::new(&client, org_id, dataset)?;
    let report = pipeline.run(path, options).await?;
    if report.all_succeeded {
        println!(
            "{} import {}: {} files uploaded",
            "✔".green(),
            report.import_id.bold(),
            report.total_files
        );
    } else {
        // partial failure is reported but is not a process failure
        warn!(
            "import {}: only {} of {} files uploaded",
            report.import_id, report.uploaded, report.total_files
        );
        println!(
            "{} import {}: {} of {} files uploaded",
            "!".yellow(),
            report.import_id.bold(),
            report.uploaded,
            report.total_files
        );
    }
    Ok(())
}

async fn export(
    profile: &str,
    dataset: &str,
    destination: &PathBuf,
    options: &ExportOptions,
) -> Result<(), MedStoreError> {
    let (config, org_id) = resolve_credentials(profile)?;
    let client = GraphQlClient::new(config)?;
    let pipeline = ExportPipeline::new(&client, org_id, dataset)?;
    let report = pipeline.run(destination, options).await?;
    let status = if report.failed == 0 {
        "✔".green()
    } else {
        "!".yellow()
    };
    println!(
        "{} dataset {}: {} series exported, {} already up to date, {} failed",
        status,
        dataset.bold(),
        report.exported,
        report.skipped,
        report.failed
    );
    Ok(())
}

fn tracing_subscriber_handler(args: &Args) {
    let env_filter = match args.log_level {
        LogLevel::Debug => "medstore_rs=debug",
        LogLevel::Info => "medstore_rs=info",
        LogLevel::Warn => "medstore_rs=warn",
        LogLevel::Error => "medstore_rs=error",
        LogLevel::Quiet => "medstore_rs=off",
    };

    // "if" because the subscriber doesn't yield the same type with or without time wich prevents
    // using a match statement.
    if args.timestamp {
        let sub = tracing_subscriber::fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .finish();
        tracing::subscriber::set_global_default(sub)
            .expect("Error while setting subscriber for tracing.");
    } else {
        let sub = tracing_subscriber::fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .without_time()
            .finish();
        tracing::subscriber::set_global_default(sub)
            .expect("Error while setting subscriber for tracing.");
    };
}
