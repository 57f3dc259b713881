// master/src/state.rs

use common::{
    Deployment, DeploymentId, JobId, JobInfo, TransformRegistry, UnitKey, WorkerId,
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::SystemTime,
};

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<Mutex<HashMap<JobId, JobInfo>>>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    // despliegues pendientes, cada uno ya tiene worker asignado
    pub deployments_queue: Arc<Mutex<VecDeque<Deployment>>>,
    // despliegues entregados pero no completados
    pub in_flight: Arc<Mutex<HashMap<DeploymentId, InFlight>>>,
    // orden de registro, para repartir particiones de forma estable
    pub worker_order: Arc<Mutex<Vec<WorkerId>>>,
    // dónde corre cada unidad de cada job
    pub unit_locations: Arc<Mutex<HashMap<(JobId, UnitKey), WorkerId>>>,
    // capacidades contra las que se compilan los grafos
    pub registry: Arc<TransformRegistry>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            deployments_queue: Arc::new(Mutex::new(VecDeque::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),

            worker_order: Arc::new(Mutex::new(Vec::new())),
            unit_locations: Arc::new(Mutex::new(HashMap::new())),
            registry: Arc::new(TransformRegistry::with_builtins()),
        }
    }

    /// Workers vivos en orden de registro.
    pub fn live_workers(&self) -> Vec<WorkerId> {
        let order = self.worker_order.lock().clone();
        let workers = self.workers.lock();
        order
            .into_iter()
            .filter(|id| workers.get(id).map(|m| !m.dead).unwrap_or(false))
            .collect()
    }

    /// ¿Queda algún despliegue del job en cola o en vuelo?
    pub fn job_has_pending(&self, job_id: &str) -> bool {
        let queued = self
            .deployments_queue
            .lock()
            .iter()
            .any(|d| d.job_id == job_id);
        queued
            || self
                .in_flight
                .lock()
                .values()
                .any(|f| f.deployment.job_id == job_id)
    }

    /// Saca de la cola los despliegues que todavía no se entregaron de un job.
    pub fn drop_queued(&self, job_id: &str) -> usize {
        let mut queue = self.deployments_queue.lock();
        let before = queue.len();
        queue.retain(|d| d.job_id != job_id);
        before - queue.len()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub address: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,

    // Métricas
    pub deployments_started: u64,
    pub deployments_succeeded: u64,
    pub deployments_failed: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub deployment: Deployment,
    pub started_at: SystemTime,
}
