//! MPU Ingest - Mixpanel to CleverTap upload tool

use anyhow::Result;
use clap::{Parser, Subcommand};
use mpu_common::logging::{init_logging, LogConfig, LogLevel};
use mpu_ingest::config::DEFAULT_BATCH_SIZE;
use mpu_ingest::{
    CancelReason, EventExport, HttpUploader, LoggingUploader, Pipeline, PipelineConfig,
    PipelineReport, ProfileExport, RecordNormalizer, RecordSource, SourceConfig, UploadConfig,
    Uploader,
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mpu-ingest")]
#[command(author, version, about = "Upload Mixpanel profiles and events to CleverTap")]
struct Cli {
    /// Data to upload
    #[command(subcommand)]
    source: Source,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Mixpanel project API secret
    #[arg(long, env = "MIXPANEL_SECRET", hide_env_values = true, global = true)]
    secret: Option<String>,

    /// CleverTap account id
    #[arg(long, env = "CLEVERTAP_ACCOUNT_ID", global = true)]
    account_id: Option<String>,

    /// CleverTap account passcode
    #[arg(long, env = "CLEVERTAP_PASSCODE", hide_env_values = true, global = true)]
    passcode: Option<String>,

    /// Records per upload batch
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, global = true)]
    batch_size: usize,

    /// Log batches instead of uploading them
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand, Debug)]
enum Source {
    /// Upload every user profile
    Profiles,

    /// Upload events, one day at a time
    Events {
        /// First day to export (YYYY-MM-DD)
        #[arg(long, env = "MIXPANEL_START_DATE")]
        start_date: Option<String>,

        /// Last day to export (YYYY-MM-DD), defaults to today
        #[arg(long, env = "MIXPANEL_END_DATE")]
        end_date: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flags
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("mpu-ingest")
        .filter_directives("hyper=warn,reqwest=warn")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let mut source_config = SourceConfig::from_env()?;
    if let Some(secret) = cli.secret {
        source_config.secret = secret;
    }

    let uploader: Arc<dyn Uploader> = if cli.dry_run {
        info!("Dry run, nothing will be uploaded");
        Arc::new(LoggingUploader)
    } else {
        let mut upload_config = UploadConfig::from_env()?;
        if let Some(account_id) = cli.account_id {
            upload_config.account_id = account_id;
        }
        if let Some(passcode) = cli.passcode {
            upload_config.passcode = passcode;
        }
        Arc::new(HttpUploader::new(upload_config)?)
    };

    let pipeline_config = PipelineConfig {
        batch_size: cli.batch_size,
        ..Default::default()
    };

    let report = match cli.source {
        Source::Profiles => {
            info!("Uploading profiles");
            let source = ProfileExport::new(&source_config)?;
            run(source, uploader, pipeline_config).await?
        },
        Source::Events {
            start_date,
            end_date,
        } => {
            if start_date.is_some() {
                source_config.start_date = start_date;
            }
            if end_date.is_some() {
                source_config.end_date = end_date;
            }

            info!("Uploading events");
            let today = chrono::Local::now().date_naive();
            let source = EventExport::new(&source_config, today)?;
            run(source, uploader, pipeline_config).await?
        },
    };

    info!(
        uploaded = report.records_uploaded(),
        failed_batches = report.batches.batches_failed,
        "Upload complete"
    );
    Ok(())
}

async fn run<S: RecordSource>(
    source: S,
    uploader: Arc<dyn Uploader>,
    config: PipelineConfig,
) -> Result<PipelineReport> {
    let pipeline = Pipeline::new(source, RecordNormalizer::default(), uploader, config)?;

    let bus = pipeline.bus();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, shutting down");
            bus.request(CancelReason::External);
        }
    });

    Ok(pipeline.run().await?)
}
