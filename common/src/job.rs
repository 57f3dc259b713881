use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use crate::call::{Fault, Value};
use crate::graph::{Graph, UnitKey};

pub type JobId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,

    /// Grafo lógico sin particionar
    pub graph: Graph,

    /// Cantidad de particiones con las que se compila el grafo
    pub partitions: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Accepted,
    Running,
    Failed,
    Succeeded,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Succeeded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub partitions: u32,

    /// -------- Métricas del job --------
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_units: u32,
    pub total_deployments: u32,
    pub completed_deployments: u32,

    /// Faults reportados por las unidades del job
    #[serde(default)]
    pub faults: Vec<Fault>,

    /// Lo que juntaron los sinks `collect`
    #[serde(default)]
    pub outputs: Vec<UnitOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutput {
    pub unit: UnitKey,
    pub values: Vec<Value>,
}
