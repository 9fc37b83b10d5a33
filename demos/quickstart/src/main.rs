//! Quickstart: run a session-bound workflow and a routed task end to end.
//!
//! Usage: `taskflow-quickstart [config.toml]`

use std::{collections::BTreeMap, path::Path, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use taskflow_engine::{
    Engine, SessionOptions, Task, TaskKind, TaskOptions, load_config, telemetry::init_tracing,
};
use taskflow_workflow::{AnalysisReport, AnalysisRequest, BackendError, QualityMetrics};

/// Toy quality backend: size statistics for the files directly under the
/// target directory.
struct FileStats;

#[async_trait]
impl QualityMetrics for FileStats {
    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisReport, BackendError> {
        let mut entries = tokio::fs::read_dir(&request.target)
            .await
            .map_err(|e| BackendError::Failed(e.to_string()))?;

        let (mut files, mut bytes) = (0_u32, 0_u64);
        let mut issues = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackendError::Failed(e.to_string()))?
        {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_file() {
                files += 1;
                bytes += meta.len();
                if meta.len() > 64 * 1024 {
                    issues.push(format!("{} is larger than 64 KiB", entry.path().display()));
                }
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let bytes = bytes as f64;
        Ok(AnalysisReport {
            issues,
            metrics: BTreeMap::from([
                ("files".to_string(), f64::from(files)),
                ("bytes".to_string(), bytes),
            ]),
            suggestions: Vec::new(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref().map(Path::new))?;

    let engine = Engine::builder(config)
        .with_quality_metrics(Arc::new(FileStats))
        .build()
        .await
        .context("Failed to start engine")?;

    let session = engine
        .create_session(SessionOptions::named("quickstart").with_description("Demo session"))
        .await?;
    tracing::info!(session_id = %session.id, "session created");

    let started = engine.execute_workflow("code_analysis", Some(session.id)).await?;
    let finished = engine.wait_for_workflow(started.id).await?;
    tracing::info!(
        workflow_id = %finished.id,
        status = %finished.status,
        steps = finished.steps.len(),
        "workflow finished"
    );
    if let Some(error) = &finished.error {
        tracing::warn!("workflow failed: {}", error.message);
    }

    let reply = engine
        .execute_hybrid_task(&Task::new(TaskKind::Greeting), &TaskOptions::default())
        .await?;
    tracing::info!(provider = %reply.provider, output = %reply.output, "hybrid task answered");

    let checkpoint = engine.create_checkpoint(session.id, "After analysis").await?;
    tracing::info!(checkpoint_id = %checkpoint.id, keys = checkpoint.memory_snapshot.len(), "checkpoint created");

    engine.end_session(session.id).await?;

    let status = engine.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);

    engine.shutdown().await?;
    Ok(())
}
