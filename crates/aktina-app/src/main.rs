use std::process;
use std::sync::Arc;
use std::time::Duration;

use aktina_app::archive::{ArchiveClient, DicomWebClient};
use aktina_app::cli::{Cli, Commands, FetchArgs, IngestArgs, SearchArgs};
use aktina_app::config::{self, AppConfig};
use aktina_app::engine::{ElasticEngine, SearchEngine};
use aktina_app::error::AppError;
use aktina_app::fetch::{fetch, FetchEvent, FetchScope};
use aktina_app::jobs::JobRunner;
use aktina_app::pipeline::{IngestEvent, IngestionPipeline};
use aktina_app::search::SearchService;
use aktina_app::thumbs::ThumbnailResolver;
use aktina_server::{ServerConfig, StudySearchProvider, StudySearchQuery};
use futures_util::{pin_mut, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(err) = run(cli).await {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let cfg = config::load()?;
    match cli.command {
        Commands::Serve => serve(cfg).await,
        Commands::Ingest(args) => ingest(cfg, args).await,
        Commands::Search(args) => search(cfg, args).await,
        Commands::Fetch(args) => fetch_metadata(cfg, args).await,
    }
}

fn archive_client(cfg: &AppConfig) -> Result<Arc<dyn ArchiveClient>, AppError> {
    let client = DicomWebClient::new(
        &cfg.archive.base_url,
        Duration::from_secs(cfg.archive.timeout_secs),
    )?;
    Ok(Arc::new(client))
}

fn engine_client(cfg: &AppConfig) -> Result<Arc<dyn SearchEngine>, AppError> {
    let engine = ElasticEngine::new(
        &cfg.engine.base_url,
        Duration::from_secs(cfg.engine.timeout_secs),
    )?;
    Ok(Arc::new(engine))
}

fn build_pipeline(cfg: &AppConfig) -> Result<IngestionPipeline, AppError> {
    Ok(IngestionPipeline::new(
        archive_client(cfg)?,
        engine_client(cfg)?,
        cfg.engine.index.clone(),
        cfg.ingest.trickle(),
    ))
}

async fn serve(cfg: AppConfig) -> Result<(), AppError> {
    let archive = archive_client(&cfg)?;
    let engine = engine_client(&cfg)?;
    let pipeline = IngestionPipeline::new(
        Arc::clone(&archive),
        Arc::clone(&engine),
        cfg.engine.index.clone(),
        cfg.ingest.trickle(),
    );
    let runner = Arc::new(JobRunner::new(pipeline, cfg.ingest.max_concurrent_jobs));
    let thumbnails = ThumbnailResolver::new(archive, cfg.thumbnails.dir.clone());
    let search = Arc::new(SearchService::new(
        engine,
        thumbnails,
        cfg.engine.index.clone(),
    ));
    let server_cfg = ServerConfig {
        listen_addr: cfg.server.listen_addr.clone(),
        subscribe_idle_secs: cfg.server.subscribe_idle_secs,
    };
    aktina_server::serve(server_cfg, search, runner).await?;
    Ok(())
}

fn progress_bar() -> ProgressBar {
    let style = ProgressStyle::with_template("{bar:40} {percent:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    ProgressBar::new(100).with_style(style)
}

async fn ingest(cfg: AppConfig, args: IngestArgs) -> Result<(), AppError> {
    let pipeline = build_pipeline(&cfg)?;
    let bar = progress_bar();
    let events = pipeline.run(args.files, CancellationToken::new());
    pin_mut!(events);
    while let Some(event) = events.next().await {
        match event? {
            IngestEvent::Uploading => bar.set_message("uploading"),
            IngestEvent::Progress { fraction, .. } => {
                bar.set_position((fraction * 100.0).round() as u64);
            }
            IngestEvent::Indexing { study_uid } => {
                bar.set_message(format!("indexing {study_uid}"));
            }
            IngestEvent::Done { study_uids } => {
                bar.finish_with_message(format!("{} studies indexed", study_uids.len()));
                for study_uid in study_uids {
                    println!("{study_uid}");
                }
            }
        }
    }
    Ok(())
}

async fn search(cfg: AppConfig, args: SearchArgs) -> Result<(), AppError> {
    let engine = engine_client(&cfg)?;
    let thumbnails = ThumbnailResolver::new(archive_client(&cfg)?, cfg.thumbnails.dir.clone());
    let service = SearchService::new(engine, thumbnails, cfg.engine.index.clone());
    let query = StudySearchQuery {
        search: args.search,
        modality: args.modality,
        patient_id: args.patient_id,
        patient_name: args.patient_name,
        from_date: args.from_date,
        to_date: args.to_date,
        gender: args.gender,
        category: args.category,
        limit: args.limit,
        offset: args.offset,
    };
    let result = service
        .search(query)
        .await
        .map_err(|err| AppError::Search(err.to_string()))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn fetch_metadata(cfg: AppConfig, args: FetchArgs) -> Result<(), AppError> {
    let scope = match (args.series_uid, args.instance_uid) {
        (Some(series_uid), Some(instance_uid)) => FetchScope::Instance {
            study_uid: args.study_uid,
            series_uid,
            instance_uid,
        },
        (Some(series_uid), None) => FetchScope::Series {
            study_uid: args.study_uid,
            series_uid,
        },
        _ => FetchScope::Study {
            study_uid: args.study_uid,
        },
    };
    let bar = progress_bar();
    let events = fetch(archive_client(&cfg)?, scope);
    pin_mut!(events);
    while let Some(event) = events.next().await {
        match event? {
            FetchEvent::Progress { fraction, .. } => {
                bar.set_position((fraction * 100.0).round() as u64);
            }
            FetchEvent::Study(document) => {
                bar.finish_and_clear();
                println!("{}", serde_json::to_string_pretty(&document)?);
            }
            FetchEvent::Series(document) => {
                bar.finish_and_clear();
                println!("{}", serde_json::to_string_pretty(&document)?);
            }
            FetchEvent::Instance(document) => {
                bar.finish_and_clear();
                println!("{}", serde_json::to_string_pretty(&document)?);
            }
        }
    }
    Ok(())
}
