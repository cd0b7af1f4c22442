use anyhow::Context;
use chrono::NaiveDate;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{
    AccountFeatures, ActiveModel, ConsumptionRow, FraudLabel, Job, JobStatus, LabeledSample,
    NormalizedRecord, QueueItem, ResultRow, Stage,
};
use crate::normalize::{parse_flag, read_table};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO active_models (model_name, model_version, threshold, is_active)
        VALUES ($1, $2, $3, true)
        ON CONFLICT (model_name, model_version) DO UPDATE
        SET threshold = EXCLUDED.threshold, is_active = EXCLUDED.is_active
        "#,
    )
    .bind("curvas_logreg")
    .bind("0.1.0")
    .bind(0.55)
    .execute(pool)
    .await?;

    let accounts = vec![
        (
            "100045",
            "residencial",
            "3",
            vec![210.0, 205.5, 198.0, 220.4, 215.0, 208.3],
        ),
        (
            "100102",
            "comercial",
            "4",
            vec![95.0, 91.2, 99.8, 88.5, 102.3, 97.1],
        ),
        (
            "100233",
            "residencial",
            "2",
            vec![410.0, 15.2, 402.7, 12.9, 395.4, 18.8],
        ),
    ];

    let mut records = Vec::new();
    for (cuenta, tipo_usuario, estrato, series) in accounts {
        for (offset, kwh) in series.into_iter().enumerate() {
            let periodo = NaiveDate::from_ymd_opt(2024, offset as u32 + 1, 1)
                .context("invalid seed period")?;
            records.push(NormalizedRecord {
                cuenta: cuenta.to_string(),
                periodo,
                kwh,
                tipo_usuario: Some(tipo_usuario.to_string()),
                estrato: Some(estrato.to_string()),
                ..NormalizedRecord::default()
            });
        }
    }
    upsert_staged(pool, &records, "seed").await?;

    let labels = vec![
        FraudLabel {
            cuenta: "100045".to_string(),
            efectiva: false,
        },
        FraudLabel {
            cuenta: "100233".to_string(),
            efectiva: true,
        },
    ];
    upsert_labels(pool, &labels).await?;

    Ok(())
}

pub async fn create_job(pool: &PgPool, file_uri: &str) -> anyhow::Result<Uuid> {
    let job_id = Uuid::new_v4();
    sqlx::query("INSERT INTO jobs (job_id, status, file_uri) VALUES ($1, $2, $3)")
        .bind(job_id)
        .bind(JobStatus::Queued.as_str())
        .bind(file_uri)
        .execute(pool)
        .await?;
    Ok(job_id)
}

pub async fn fetch_job(pool: &PgPool, job_id: Uuid) -> anyhow::Result<Option<Job>> {
    let row = sqlx::query(
        "SELECT job_id, status, file_uri, failure_reason, created_at, updated_at \
         FROM jobs WHERE job_id = $1",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;
    row.map(job_from_row).transpose()
}

pub async fn list_jobs(pool: &PgPool, limit: i64) -> anyhow::Result<Vec<Job>> {
    let rows = sqlx::query(
        "SELECT job_id, status, file_uri, failure_reason, created_at, updated_at \
         FROM jobs ORDER BY created_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(job_from_row).collect()
}

fn job_from_row(row: sqlx::postgres::PgRow) -> anyhow::Result<Job> {
    let status_raw: String = row.get("status");
    let status = JobStatus::parse(&status_raw)
        .with_context(|| format!("unknown job status {status_raw:?}"))?;
    Ok(Job {
        job_id: row.get("job_id"),
        status,
        file_uri: row.get("file_uri"),
        failure_reason: row.get("failure_reason"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub async fn set_job_status(pool: &PgPool, job_id: Uuid, status: JobStatus) -> anyhow::Result<()> {
    sqlx::query("UPDATE jobs SET status = $2, updated_at = now() WHERE job_id = $1")
        .bind(job_id)
        .bind(status.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_job_failed(pool: &PgPool, job_id: Uuid, reason: &str) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE jobs SET status = $2, failure_reason = $3, updated_at = now() WHERE job_id = $1",
    )
    .bind(job_id)
    .bind(JobStatus::Failed.as_str())
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(())
}

/// Stages normalized records. Quantity is last-write-wins per
/// (account, period); attributes only fill in when the incoming value
/// is present; the provenance file is kept from the first load.
pub async fn upsert_staged(
    pool: &PgPool,
    records: &[NormalizedRecord],
    source_file: &str,
) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await?;
    for record in records {
        sqlx::query(
            r#"
            INSERT INTO stg_consumo
              (cuenta, periodo, kwh, latitud, longitud, tipo_usuario, estrato,
               tipo_poblacion, fpas, trafo, source_file)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (cuenta, periodo) DO UPDATE
            SET kwh = EXCLUDED.kwh,
                latitud = COALESCE(EXCLUDED.latitud, stg_consumo.latitud),
                longitud = COALESCE(EXCLUDED.longitud, stg_consumo.longitud),
                tipo_usuario = COALESCE(EXCLUDED.tipo_usuario, stg_consumo.tipo_usuario),
                estrato = COALESCE(EXCLUDED.estrato, stg_consumo.estrato),
                tipo_poblacion = COALESCE(EXCLUDED.tipo_poblacion, stg_consumo.tipo_poblacion),
                fpas = COALESCE(EXCLUDED.fpas, stg_consumo.fpas),
                trafo = COALESCE(EXCLUDED.trafo, stg_consumo.trafo)
            "#,
        )
        .bind(&record.cuenta)
        .bind(record.periodo)
        .bind(record.kwh)
        .bind(record.latitud)
        .bind(record.longitud)
        .bind(&record.tipo_usuario)
        .bind(&record.estrato)
        .bind(&record.tipo_poblacion)
        .bind(&record.fpas)
        .bind(&record.trafo)
        .bind(source_file)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(records.len())
}

pub async fn fetch_consumption(pool: &PgPool) -> anyhow::Result<Vec<ConsumptionRow>> {
    let rows = sqlx::query("SELECT cuenta, periodo, kwh FROM stg_consumo ORDER BY cuenta, periodo")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| ConsumptionRow {
            cuenta: row.get("cuenta"),
            periodo: row.get("periodo"),
            kwh: row.get("kwh"),
        })
        .collect())
}

pub async fn upsert_features(pool: &PgPool, features: &[AccountFeatures]) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await?;
    for feature in features {
        sqlx::query(
            r#"
            INSERT INTO features_curvas (cuenta, prom_6, std_12, cv, benford_pval)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (cuenta) DO UPDATE
            SET prom_6 = EXCLUDED.prom_6,
                std_12 = EXCLUDED.std_12,
                cv = EXCLUDED.cv,
                benford_pval = EXCLUDED.benford_pval,
                computed_at = now()
            "#,
        )
        .bind(&feature.cuenta)
        .bind(feature.avg_recent)
        .bind(feature.std_window)
        .bind(feature.cv)
        .bind(feature.benford_pvalue)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(features.len())
}

pub async fn fetch_features(pool: &PgPool) -> anyhow::Result<Vec<AccountFeatures>> {
    let rows = sqlx::query(
        "SELECT cuenta, prom_6, std_12, cv, benford_pval FROM features_curvas ORDER BY cuenta",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(features_from_row).collect())
}

pub async fn fetch_labeled_samples(pool: &PgPool) -> anyhow::Result<Vec<LabeledSample>> {
    let rows = sqlx::query(
        r#"
        SELECT f.cuenta, f.prom_6, f.std_12, f.cv, f.benford_pval, m.efectiva
        FROM features_curvas f
        JOIN meta_fraude m USING (cuenta)
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let efectiva: bool = row.get("efectiva");
            LabeledSample {
                vector: features_from_row(row).vector(),
                fraud: efectiva,
            }
        })
        .collect())
}

fn features_from_row(row: sqlx::postgres::PgRow) -> AccountFeatures {
    AccountFeatures {
        cuenta: row.get("cuenta"),
        avg_recent: row.get("prom_6"),
        std_window: row.get("std_12"),
        cv: row.get("cv"),
        benford_pvalue: row.get("benford_pval"),
    }
}

pub async fn fetch_active_model(pool: &PgPool) -> anyhow::Result<Option<ActiveModel>> {
    let row =
        sqlx::query("SELECT model_name, model_version, threshold FROM vw_active_models LIMIT 1")
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|row| ActiveModel {
        model_name: row.get("model_name"),
        model_version: row.get("model_version"),
        threshold: row.get("threshold"),
    }))
}

pub async fn upsert_results(
    pool: &PgPool,
    job_id: Uuid,
    results: &[ResultRow],
) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await?;
    for result in results {
        sqlx::query(
            r#"
            INSERT INTO resultados
              (job_id, cuenta, score_supervisado, score_curvas, score_hibrido,
               umbral_aplicado, decision, model_name, model_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (job_id, cuenta) DO UPDATE
            SET score_supervisado = EXCLUDED.score_supervisado,
                score_curvas = EXCLUDED.score_curvas,
                score_hibrido = EXCLUDED.score_hibrido,
                umbral_aplicado = EXCLUDED.umbral_aplicado,
                decision = EXCLUDED.decision,
                model_name = EXCLUDED.model_name,
                model_version = EXCLUDED.model_version
            "#,
        )
        .bind(job_id)
        .bind(&result.cuenta)
        .bind(result.score_supervisado)
        .bind(result.score_curvas)
        .bind(result.score_hibrido)
        .bind(result.umbral_aplicado)
        .bind(result.decision)
        .bind(&result.model_name)
        .bind(&result.model_version)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(results.len())
}

pub async fn fetch_results(
    pool: &PgPool,
    job_id: Uuid,
    limit: i64,
) -> anyhow::Result<Vec<ResultRow>> {
    let rows = sqlx::query(
        r#"
        SELECT cuenta, score_supervisado, score_curvas, score_hibrido,
               umbral_aplicado, decision, model_name, model_version
        FROM resultados
        WHERE job_id = $1
        ORDER BY score_hibrido DESC, cuenta
        LIMIT $2
        "#,
    )
    .bind(job_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| ResultRow {
            cuenta: row.get("cuenta"),
            score_supervisado: row.get("score_supervisado"),
            score_curvas: row.get("score_curvas"),
            score_hibrido: row.get("score_hibrido"),
            umbral_aplicado: row.get("umbral_aplicado"),
            decision: row.get("decision"),
            model_name: row.get("model_name"),
            model_version: row.get("model_version"),
        })
        .collect())
}

/// Imports ground-truth labels from a tabular source with `CUENTA` and
/// `EFECTIVA` columns. Rows with an empty account or an empty label
/// cell are skipped.
pub async fn import_labels(pool: &PgPool, path: &std::path::Path) -> anyhow::Result<usize> {
    let table = read_table(path)?;
    let column = |name: &str| table.headers.iter().position(|h| h == name);
    let (Some(cuenta_col), Some(efectiva_col)) = (column("CUENTA"), column("EFECTIVA")) else {
        anyhow::bail!("labels source must contain CUENTA and EFECTIVA columns");
    };

    let mut labels = Vec::new();
    for row in &table.rows {
        let cuenta = row.get(cuenta_col).map_or("", String::as_str).trim();
        if cuenta.is_empty() {
            continue;
        }
        let raw_flag = row.get(efectiva_col).map_or("", String::as_str);
        let Some(efectiva) = parse_flag(raw_flag) else {
            continue;
        };
        labels.push(FraudLabel {
            cuenta: cuenta.to_string(),
            efectiva,
        });
    }

    upsert_labels(pool, &labels).await
}

pub async fn upsert_labels(pool: &PgPool, labels: &[FraudLabel]) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await?;
    for label in labels {
        sqlx::query(
            r#"
            INSERT INTO meta_fraude (cuenta, efectiva)
            VALUES ($1, $2)
            ON CONFLICT (cuenta) DO UPDATE
            SET efectiva = EXCLUDED.efectiva, updated_at = now()
            "#,
        )
        .bind(&label.cuenta)
        .bind(label.efectiva)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(labels.len())
}

pub async fn enqueue_stage(
    pool: &PgPool,
    job_id: Uuid,
    stage: Stage,
    payload: Option<serde_json::Value>,
) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO stage_queue (job_id, stage, payload) VALUES ($1, $2, $3)")
        .bind(job_id)
        .bind(stage.as_str())
        .bind(payload)
        .execute(pool)
        .await?;
    Ok(())
}

/// Claims the oldest unstarted queue item, if any. The row is marked
/// started inside the claiming transaction so concurrent workers skip
/// it rather than block on it.
pub async fn claim_next_stage(pool: &PgPool) -> anyhow::Result<Option<QueueItem>> {
    let mut tx = pool.begin().await?;
    let Some(row) = sqlx::query(
        r#"
        SELECT id, job_id, stage, payload
        FROM stage_queue
        WHERE started_at IS NULL
        ORDER BY id
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .fetch_optional(&mut *tx)
    .await?
    else {
        return Ok(None);
    };

    let id: i64 = row.get("id");
    sqlx::query("UPDATE stage_queue SET started_at = now() WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    let stage_raw: String = row.get("stage");
    let stage = Stage::parse(&stage_raw)
        .with_context(|| format!("unknown stage {stage_raw:?} on queue item {id}"))?;
    Ok(Some(QueueItem {
        id,
        job_id: row.get("job_id"),
        stage,
        payload: row.get("payload"),
    }))
}

pub async fn finish_stage(pool: &PgPool, item_id: i64) -> anyhow::Result<()> {
    sqlx::query("UPDATE stage_queue SET finished_at = now() WHERE id = $1")
        .bind(item_id)
        .execute(pool)
        .await?;
    Ok(())
}
