//! End-to-end pipeline demo over in-memory stores.
//!
//! Seeds two small expression matrices, submits a filter request, drives
//! the pipeline to completion, and prints the outcome. Useful as a smoke
//! test and as a reading guide to the wiring in
//! [`tessera_flow::service::PipelineService`].

use std::sync::Arc;

use anyhow::Context;

use tessera_core::matrix::Row;
use tessera_core::{LogFormat, MatrixId, MemoryBackend, StoredMatrixStore, init_logging};
use tessera_flow::config::FlowConfig;
use tessera_flow::predicate::PredicateSpec;
use tessera_flow::service::PipelineService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(LogFormat::Pretty);

    let blob = Arc::new(MemoryBackend::new());
    let matrices = StoredMatrixStore::new(blob.clone());

    seed_matrix(&matrices, "tissue-a", 5).await?;
    seed_matrix(&matrices, "tissue-b", 3).await?;

    let config = FlowConfig::default().with_target_chunk_rows(2);
    let service = PipelineService::in_memory(Arc::new(matrices), blob, config);

    let request_id = service
        .submit(
            vec![MatrixId::new("tissue-a")?, MatrixId::new("tissue-b")?],
            PredicateSpec::ColumnAtLeast {
                column: "GENE_A".into(),
                threshold: 1.0,
            },
        )
        .await
        .context("submit failed")?;
    tracing::info!(%request_id, "request accepted");

    let status = service
        .run_until_settled(&request_id)
        .await
        .context("pipeline failed to settle")?;

    println!("request {request_id}: {}", status.state);
    if let Some(location) = status.result_location {
        println!("merged matrix at: {location}");
    }
    if let Some(reason) = status.failure_reason {
        println!("failure: {reason}");
    }
    println!("events emitted: {}", service.events().len());

    Ok(())
}

/// Writes a toy matrix with `rows` rows of two gene columns.
async fn seed_matrix(
    matrices: &StoredMatrixStore,
    name: &str,
    rows: u64,
) -> anyhow::Result<()> {
    let id = MatrixId::new(name)?;
    let rows: Vec<Row> = (0..rows)
        .map(|i| Row::new(format!("{name}-cell-{i}"), vec![i as f64, (i % 2) as f64]))
        .collect();
    matrices
        .write_matrix(&id, vec!["GENE_A".into(), "GENE_B".into()], &rows, 2)
        .await
        .with_context(|| format!("seeding matrix '{name}'"))?;
    Ok(())
}
