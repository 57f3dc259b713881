use serde::{Deserialize, Serialize};

use crate::bush::UnitState;
use crate::call::{Fault, Value};
use crate::job::JobId;
use crate::graph::UnitKey;
use crate::task::{Deployment, DeploymentId};

pub type WorkerId = String;

/* --------- Registro y heartbeat --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterRequest {
    pub hostname: String,
    /// URL base donde el worker atiende llamadas a sus unidades
    pub address: String,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterResponse {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatRequest {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub cpu_percent: f32,
    #[serde(default)]
    pub mem_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatResponse {
    pub ok: bool,
}

/* --------- Despliegues --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResponse {
    pub deployment: Option<Deployment>,
}

/// Resultado final de una unidad tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitReport {
    pub unit: UnitKey,
    pub state: UnitState,
    #[serde(default)]
    pub fault: Option<Fault>,
    /// Elementos juntados si el sink es un `collect`
    #[serde(default)]
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentCompleteRequest {
    pub deployment_id: DeploymentId,
    pub outcomes: Vec<UnitReport>,
}

impl DeploymentCompleteRequest {
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.fault.is_none())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentCompleteResponse {
    pub ok: bool,
}

/* --------- Ubicación de unidades --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitRegisterRequest {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub units: Vec<UnitKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitRegisterResponse {
    pub registered: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitLocation {
    pub unit: UnitKey,
    pub worker_id: WorkerId,
    pub address: String,
}

/// Llamada textual a una unidad que vive en otro worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitCallRequest {
    pub job_id: JobId,
    pub unit: UnitKey,
    pub request: String,
}

/* --------- Métricas --------- */

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub address: String,
    pub dead: bool,
    pub max_concurrency: u32,
    pub last_heartbeat_secs_ago: u64,
    pub cpu_percent: f32,
    pub mem_bytes: u64,
    pub active_deployments: u32,
    pub deployments_started: u64,
    pub deployments_succeeded: u64,
    pub deployments_failed: u64,
    pub hosted_units: u32,
}
