use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use conveyor::utils::{format_bytes, format_speed};
use conveyor::{
    EngineConfig, FileSourceReader, HttpChunkTransport, JsonResumeStore, UploadEngine, UploadEvent,
    UploadOptions,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor=info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let endpoint = args
        .next()
        .context("usage: conveyor <endpoint> <file> [file...]")?;
    let files: Vec<String> = args.collect();
    if files.is_empty() {
        anyhow::bail!("usage: conveyor <endpoint> <file> [file...]");
    }

    let config = if Path::new("config.toml").exists() {
        EngineConfig::from_path(Path::new("config.toml"))?
    } else {
        EngineConfig::default()
    };

    let mut builder = UploadEngine::builder()
        .transport(Arc::new(HttpChunkTransport::new(&endpoint)?));
    if let Some(dir) = &config.resume_dir {
        builder = builder.resume_store(Arc::new(JsonResumeStore::open(dir.clone()).await?));
    }
    let engine = builder.config(config).build()?;

    let mut events = engine.subscribe();
    let mut remaining = 0usize;
    for file in &files {
        let reader = FileSourceReader::open(file).await?;
        let descriptor = reader.descriptor("application/octet-stream");
        let upload_id = engine
            .enqueue(descriptor, Arc::new(reader), UploadOptions::default())
            .await?;
        info!(%upload_id, %file, "queued");
        remaining += 1;
    }

    while remaining > 0 {
        match events.recv().await {
            Ok(UploadEvent::Completed {
                upload_id,
                bytes_uploaded,
            }) => {
                info!(%upload_id, bytes = bytes_uploaded, "completed");
                remaining -= 1;
            }
            Ok(UploadEvent::Failed { upload_id, error }) => {
                info!(%upload_id, %error, "failed");
                remaining -= 1;
            }
            Ok(UploadEvent::Cancelled { upload_id }) => {
                info!(%upload_id, "cancelled");
                remaining -= 1;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    let analytics = engine.analytics();
    info!(
        completed = analytics.completed_uploads,
        failed = analytics.failed_uploads,
        transferred = %format_bytes(analytics.total_bytes),
        speed = %format_speed(analytics.average_speed),
        "all uploads settled"
    );

    engine.shutdown().await?;
    Ok(())
}
