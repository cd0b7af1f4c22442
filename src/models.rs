use std::fmt::{self, Write};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a submission as it moves through the stage chain.
///
/// The string forms are the externally observable contract: pollers and
/// the reporting tools match on them, so they never change spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Ingesting,
    Mcurvas,
    Msupervisado,
    Hibridacion,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Ingesting => "ingesting",
            JobStatus::Mcurvas => "mcurvas",
            JobStatus::Msupervisado => "msupervisado",
            JobStatus::Hibridacion => "hibridacion",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(JobStatus::Queued),
            "ingesting" => Some(JobStatus::Ingesting),
            "mcurvas" => Some(JobStatus::Mcurvas),
            "msupervisado" => Some(JobStatus::Msupervisado),
            "hibridacion" => Some(JobStatus::Hibridacion),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of pipeline work. Stages run in `next()` order; each sets
/// its `running_status` on the job before doing anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Ingest,
    Mcurvas,
    Msupervisado,
    Hibridacion,
    Publish,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Mcurvas => "mcurvas",
            Stage::Msupervisado => "msupervisado",
            Stage::Hibridacion => "hibridacion",
            Stage::Publish => "publish",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ingest" => Some(Stage::Ingest),
            "mcurvas" => Some(Stage::Mcurvas),
            "msupervisado" => Some(Stage::Msupervisado),
            "hibridacion" => Some(Stage::Hibridacion),
            "publish" => Some(Stage::Publish),
            _ => None,
        }
    }

    /// The status a job shows while this stage runs. Publish has no
    /// work of its own beyond closing the job, so its status is `done`.
    pub fn running_status(self) -> JobStatus {
        match self {
            Stage::Ingest => JobStatus::Ingesting,
            Stage::Mcurvas => JobStatus::Mcurvas,
            Stage::Msupervisado => JobStatus::Msupervisado,
            Stage::Hibridacion => JobStatus::Hibridacion,
            Stage::Publish => JobStatus::Done,
        }
    }

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Ingest => Some(Stage::Mcurvas),
            Stage::Mcurvas => Some(Stage::Msupervisado),
            Stage::Msupervisado => Some(Stage::Hibridacion),
            Stage::Hibridacion => Some(Stage::Publish),
            Stage::Publish => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub file_uri: String,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Human-readable status block. The update timestamp is what tells
    /// an operator how long a job has been parked in its status.
    pub fn summary(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(
            output,
            "Job {} is {} ({}).",
            self.job_id, self.status, self.file_uri
        );
        let _ = writeln!(output, "Updated {}.", self.updated_at.format("%Y-%m-%d %H:%M"));
        if let Some(reason) = &self.failure_reason {
            let _ = writeln!(output, "Failure reason: {reason}");
        }
        output
    }
}

/// One normalized (account, period) observation, ready for staging.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizedRecord {
    pub cuenta: String,
    pub periodo: NaiveDate,
    pub kwh: f64,
    pub latitud: Option<f64>,
    pub longitud: Option<f64>,
    pub tipo_usuario: Option<String>,
    pub estrato: Option<String>,
    pub tipo_poblacion: Option<String>,
    pub fpas: Option<String>,
    pub trafo: Option<String>,
}

/// Staged observation as the feature engine reads it back.
#[derive(Debug, Clone)]
pub struct ConsumptionRow {
    pub cuenta: String,
    pub periodo: NaiveDate,
    pub kwh: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountFeatures {
    pub cuenta: String,
    pub avg_recent: f64,
    pub std_window: f64,
    pub cv: f64,
    pub benford_pvalue: f64,
}

impl AccountFeatures {
    /// Feature vector in training order, non-finite values filled with 0.0.
    pub fn vector(&self) -> [f64; 4] {
        fn fill(v: f64) -> f64 {
            if v.is_finite() {
                v
            } else {
                0.0
            }
        }
        [
            fill(self.avg_recent),
            fill(self.std_window),
            fill(self.cv),
            fill(self.benford_pvalue),
        ]
    }
}

/// A feature vector joined to its confirmed-fraud label.
#[derive(Debug, Clone)]
pub struct LabeledSample {
    pub vector: [f64; 4],
    pub fraud: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FraudLabel {
    pub cuenta: String,
    pub efectiva: bool,
}

/// Supervised score for one account; travels as the queue payload of
/// the scoring-to-decision handoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredAccount {
    pub cuenta: String,
    pub score: f64,
}

/// The externally managed model configuration the decision stage reads.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveModel {
    pub model_name: String,
    pub model_version: String,
    pub threshold: f64,
}

/// One published row of `resultados` for a (job, account) pair.
/// Field names mirror the warehouse columns because those are the
/// names downstream consumers know.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub cuenta: String,
    pub score_supervisado: f64,
    /// Reserved for a future curve-based score; always absent today.
    pub score_curvas: Option<f64>,
    pub score_hibrido: f64,
    pub umbral_aplicado: f64,
    pub decision: bool,
    pub model_name: String,
    pub model_version: String,
}

/// Claimed queue row, payload still raw; the stage runner interprets it.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub job_id: Uuid,
    pub stage: Stage,
    pub payload: Option<serde_json::Value>,
}
