use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classifier::{score_accounts, ModelStore};
use crate::db;
use crate::decision::{active_or_default, decide};
use crate::features::compute_features;
use crate::models::{QueueItem, ScoredAccount, Stage};
use crate::normalize::{normalize, read_table};

/// What a finished stage hands back for dispatch: the next stage and
/// any data produced for it.
pub struct Dispatch {
    pub stage: Stage,
    pub scores: Option<Vec<ScoredAccount>>,
}

/// Creates a job for a source file and queues its ingestion.
pub async fn submit(pool: &PgPool, file_uri: &str) -> Result<Uuid> {
    let job_id = db::create_job(pool, file_uri).await?;
    db::enqueue_stage(pool, job_id, Stage::Ingest, None).await?;
    info!(job = %job_id, file = file_uri, "queued ingestion job");
    Ok(job_id)
}

/// Runs one stage for a job and reports what to dispatch next.
///
/// The job status moves to the stage's running status before any work
/// happens, so a crash mid-stage leaves the job visibly parked there.
/// Stage errors bubble up to the caller; deciding what a failure means
/// for the job is the runner's call, not the stage's.
pub async fn run_stage(
    pool: &PgPool,
    store: &dyn ModelStore,
    job_id: Uuid,
    stage: Stage,
    payload: Option<Value>,
) -> Result<Option<Dispatch>> {
    db::set_job_status(pool, job_id, stage.running_status()).await?;

    let mut scores_out: Option<Vec<ScoredAccount>> = None;
    match stage {
        Stage::Ingest => {
            let job = db::fetch_job(pool, job_id)
                .await?
                .with_context(|| format!("job {job_id} not found"))?;
            let path = PathBuf::from(&job.file_uri);
            let table = read_table(&path)?;
            let records = normalize(&table)?;
            let source_file = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(&job.file_uri)
                .to_string();
            let rows = db::upsert_staged(pool, &records, &source_file).await?;
            info!(job = %job_id, rows, "staged consumption records");
        }
        Stage::Mcurvas => {
            let consumption = db::fetch_consumption(pool).await?;
            let features = compute_features(&consumption);
            let rows = db::upsert_features(pool, &features).await?;
            info!(job = %job_id, rows, "computed curve features");
        }
        Stage::Msupervisado => {
            let accounts = db::fetch_features(pool).await?;
            let scores = if accounts.is_empty() {
                Vec::new()
            } else {
                let labeled = db::fetch_labeled_samples(pool).await?;
                score_accounts(store, &accounts, &labeled)
            };
            info!(job = %job_id, scored = scores.len(), "supervised scoring finished");
            scores_out = Some(scores);
        }
        Stage::Hibridacion => {
            let scores: Vec<ScoredAccount> = match payload {
                Some(value) => {
                    serde_json::from_value(value).context("decode supervised scores payload")?
                }
                None => Vec::new(),
            };
            let model = active_or_default(db::fetch_active_model(pool).await?);
            let results = decide(&scores, &model);
            let rows = db::upsert_results(pool, job_id, &results).await?;
            info!(
                job = %job_id,
                rows,
                threshold = model.threshold,
                model = %model.model_name,
                "wrote hybrid decisions"
            );
        }
        Stage::Publish => {
            info!(job = %job_id, "job complete");
        }
    }

    Ok(stage.next().map(|next| Dispatch {
        stage: next,
        scores: scores_out,
    }))
}

/// Claims and runs queue items until the process is stopped. Stage
/// failures mark the job failed and the loop moves on; infrastructure
/// errors (store unreachable) end the loop.
pub async fn worker_loop(
    pool: &PgPool,
    store: &dyn ModelStore,
    poll_interval: Duration,
) -> Result<()> {
    info!("worker started");
    loop {
        match db::claim_next_stage(pool).await? {
            Some(item) => process_item(pool, store, item).await?,
            None => tokio::time::sleep(poll_interval).await,
        }
    }
}

async fn process_item(pool: &PgPool, store: &dyn ModelStore, item: QueueItem) -> Result<()> {
    info!(job = %item.job_id, stage = %item.stage, "running stage");
    match run_stage(pool, store, item.job_id, item.stage, item.payload).await {
        Ok(Some(dispatch)) => {
            let payload = score_payload(dispatch.scores)?;
            db::enqueue_stage(pool, item.job_id, dispatch.stage, payload).await?;
        }
        Ok(None) => {}
        Err(error) => {
            let reason = format!("{error:#}");
            warn!(job = %item.job_id, stage = %item.stage, error = %reason, "stage failed");
            db::set_job_failed(pool, item.job_id, &reason).await?;
        }
    }
    db::finish_stage(pool, item.id).await
}

/// Drives a job's stages inline, without the queue, starting from the
/// given stage. Used for synchronous re-runs of an already staged job;
/// an unknown job id errors here, before any stage runs.
pub async fn run_chain(
    pool: &PgPool,
    store: &dyn ModelStore,
    job_id: Uuid,
    from: Stage,
) -> Result<()> {
    db::fetch_job(pool, job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;

    let mut stage = from;
    let mut payload: Option<Value> = None;
    loop {
        match run_stage(pool, store, job_id, stage, payload.take()).await {
            Ok(Some(dispatch)) => {
                payload = score_payload(dispatch.scores)?;
                stage = dispatch.stage;
            }
            Ok(None) => return Ok(()),
            Err(error) => {
                db::set_job_failed(pool, job_id, &format!("{error:#}")).await?;
                return Err(error);
            }
        }
    }
}

fn score_payload(scores: Option<Vec<ScoredAccount>>) -> Result<Option<Value>> {
    match scores {
        Some(scores) => Ok(Some(
            serde_json::to_value(scores).context("encode supervised scores payload")?,
        )),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::classifier::LogisticModel;
    use crate::models::{ConsumptionRow, LabeledSample};
    use crate::normalize::RawTable;

    #[test]
    fn score_payload_uses_plain_field_names() {
        let value = score_payload(Some(vec![ScoredAccount {
            cuenta: "A-1".to_string(),
            score: 0.73,
        }]))
        .unwrap()
        .unwrap();
        assert_eq!(value, serde_json::json!([{"cuenta": "A-1", "score": 0.73}]));
        assert!(score_payload(None).unwrap().is_none());
    }

    #[test]
    fn foreign_payloads_decode_into_scores() {
        let raw = serde_json::json!([
            {"cuenta": "A-1", "score": 0.9},
            {"cuenta": "A-2", "score": 0.1}
        ]);
        let scores: Vec<ScoredAccount> = serde_json::from_value(raw).unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].cuenta, "A-1");
    }

    struct NullStore;

    impl ModelStore for NullStore {
        fn load(&self) -> Option<LogisticModel> {
            None
        }

        fn save(&self, _model: &LogisticModel) -> Result<()> {
            Ok(())
        }
    }

    /// Full pure path: a wide yearly source through normalization,
    /// feature computation, supervised scoring with enough labels to
    /// train, and decision, with only the store swapped out.
    #[test]
    fn wide_source_flows_to_consistent_decisions() {
        let mut headers = vec!["CUENTA".to_string()];
        for month in 1..=12u32 {
            headers.push(format!("2023-{month:02}"));
        }
        let mut rows = Vec::new();
        for account in 0..30u32 {
            let mut row = vec![format!("A-{account:02}")];
            for month in 1..=12u32 {
                // Odd accounts oscillate hard, even ones stay flat.
                let kwh = if account % 2 == 1 {
                    if month % 2 == 0 {
                        15.0
                    } else {
                        420.0 + f64::from(account)
                    }
                } else {
                    200.0 + f64::from(account) + f64::from(month)
                };
                row.push(format!("{kwh}"));
            }
            rows.push(row);
        }
        let table = RawTable::new(headers, rows);

        let staged = normalize(&table).unwrap();
        assert_eq!(staged.len(), 30 * 12);

        let consumption: Vec<ConsumptionRow> = staged
            .iter()
            .map(|r| ConsumptionRow {
                cuenta: r.cuenta.clone(),
                periodo: r.periodo,
                kwh: r.kwh,
            })
            .collect();
        let features = compute_features(&consumption);
        assert_eq!(features.len(), 30);

        let labeled: Vec<LabeledSample> = features
            .iter()
            .map(|f| {
                let index: u32 = f.cuenta[2..].parse().unwrap();
                LabeledSample {
                    vector: f.vector(),
                    fraud: index % 2 == 1,
                }
            })
            .collect();

        let scores = score_accounts(&NullStore, &features, &labeled);
        assert_eq!(scores.len(), 30);

        let model = active_or_default(None);
        let results = decide(&scores, &model);
        assert_eq!(results.len(), 30);
        for row in &results {
            assert!((0.0..=1.0).contains(&row.score_supervisado));
            assert_eq!(row.umbral_aplicado, 0.60);
            assert_eq!(row.decision, row.score_hibrido >= 0.60);
            assert_eq!(row.score_curvas, None);
        }
    }
}
