use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use common::{
    compile, planner, Deployment, DeploymentCompleteRequest, DeploymentCompleteResponse,
    DeploymentRequest, DeploymentResponse, JobInfo, JobRequest, JobStatus, UnitKey,
    UnitLocation, UnitOutput, UnitRegisterRequest, UnitRegisterResponse,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
use std::collections::HashMap;
use std::time::SystemTime;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};

use crate::state::{AppState, InFlight, WorkerMeta};

pub fn build_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/units/:key", get(locate_unit))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/tasks/next", post(assign_deployment))
        .route("/api/v1/tasks/complete", post(complete_deployment))
        .route("/api/v1/units/register", post(register_units))
        .layer(trace_layer)
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Compila el grafo y arma un despliegue por worker vivo que reciba unidades
async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<JobRequest>,
) -> Result<Json<JobInfo>, (StatusCode, String)> {
    let descriptors = compile(&req.graph, req.partitions, state.registry.as_ref())
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let hosts = state.live_workers();
    if hosts.is_empty() {
        warn!("job {:?} rechazado: no hay workers vivos", req.name);
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "no hay workers vivos".to_string(),
        ));
    }

    let placed = planner::plan(&descriptors, &hosts)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let job_id = uuid::Uuid::new_v4().to_string();
    let deployments: Vec<Deployment> = placed
        .into_iter()
        .map(|(worker_id, units)| Deployment {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.clone(),
            worker_id,
            descriptors: units,
        })
        .collect();

    let job_info = JobInfo {
        id: job_id.clone(),
        name: req.name,
        status: JobStatus::Accepted,
        partitions: req.partitions,

        submitted_at: Utc::now(),
        started_at: None,
        finished_at: None,
        total_units: descriptors.len() as u32,
        total_deployments: deployments.len() as u32,
        completed_deployments: 0,
        faults: Vec::new(),
        outputs: Vec::new(),
    };

    info!(
        "job {} creado: {} unidades en {} despliegues",
        job_id,
        descriptors.len(),
        deployments.len()
    );

    state.jobs.lock().insert(job_id, job_info.clone());
    state.deployments_queue.lock().extend(deployments);

    Ok(Json(job_info))
}

// Devuelve info de un job
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, StatusCode> {
    let jobs = state.jobs.lock();

    if let Some(job) = jobs.get(&id) {
        Ok(Json(job.clone()))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

// Registra un worker nuevo
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    let worker_id = uuid::Uuid::new_v4().to_string();

    state.workers.lock().insert(
        worker_id.clone(),
        WorkerMeta {
            hostname: req.hostname,
            address: req.address.clone(),
            last_heartbeat: SystemTime::now(),
            dead: false,
            max_concurrency: req.max_concurrency,

            deployments_started: 0,
            deployments_succeeded: 0,
            deployments_failed: 0,

            last_cpu_percent: None,
            last_mem_bytes: None,
        },
    );
    state.worker_order.lock().push(worker_id.clone());

    info!(
        "worker registrado: {} en {} (max_concurrency={})",
        worker_id, req.address, req.max_concurrency
    );
    Json(WorkerRegisterResponse { worker_id })
}

// Heartbeat de worker
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, StatusCode> {
    let mut workers = state.workers.lock();
    if let Some(meta) = workers.get_mut(&req.worker_id) {
        meta.last_heartbeat = SystemTime::now();
        meta.last_cpu_percent = Some(req.cpu_percent);
        meta.last_mem_bytes = Some(req.mem_bytes);
        Ok(Json(WorkerHeartbeatResponse { ok: true }))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

// Entrega el siguiente despliegue que le toca a este worker (si hay)
async fn assign_deployment(
    State(state): State<AppState>,
    Json(req): Json<DeploymentRequest>,
) -> Json<DeploymentResponse> {
    // 1) Cuántos despliegues tiene ya este worker en vuelo
    let active_for_worker = state
        .in_flight
        .lock()
        .values()
        .filter(|f| f.deployment.worker_id == req.worker_id)
        .count() as u32;

    // 2) Capacidad máxima de este worker
    let max_for_worker = state
        .workers
        .lock()
        .get(&req.worker_id)
        .map(|m| m.max_concurrency)
        .unwrap_or(1);

    if active_for_worker >= max_for_worker {
        info!(
            "worker {} pidió despliegue pero ya tiene {}/{} en vuelo",
            req.worker_id, active_for_worker, max_for_worker
        );
        return Json(DeploymentResponse { deployment: None });
    }

    // 3) Sacar el primero de la cola que sea de este worker
    let next = {
        let mut queue = state.deployments_queue.lock();
        queue
            .iter()
            .position(|d| d.worker_id == req.worker_id)
            .and_then(|i| queue.remove(i))
    };

    let Some(deployment) = next else {
        return Json(DeploymentResponse { deployment: None });
    };

    info!(
        "asignando despliegue {} (job={}, {} unidades) al worker {} ({}/{} en vuelo -> +1)",
        deployment.id,
        deployment.job_id,
        deployment.descriptors.len(),
        req.worker_id,
        active_for_worker,
        max_for_worker,
    );

    state.in_flight.lock().insert(
        deployment.id.clone(),
        InFlight {
            deployment: deployment.clone(),
            started_at: SystemTime::now(),
        },
    );

    // Marcar el job como Running la primera vez
    {
        let mut jobs = state.jobs.lock();
        if let Some(job) = jobs.get_mut(&deployment.job_id) {
            if job.status == JobStatus::Accepted {
                job.status = JobStatus::Running;
                job.started_at.get_or_insert_with(Utc::now);
            }
        }
    }

    if let Some(meta) = state.workers.lock().get_mut(&req.worker_id) {
        meta.deployments_started += 1;
    }

    Json(DeploymentResponse {
        deployment: Some(deployment),
    })
}

// Worker reporta cómo terminaron las unidades tick de un despliegue
async fn complete_deployment(
    State(state): State<AppState>,
    Json(req): Json<DeploymentCompleteRequest>,
) -> Result<Json<DeploymentCompleteResponse>, StatusCode> {
    let inflight = state
        .in_flight
        .lock()
        .remove(&req.deployment_id)
        .ok_or(StatusCode::NOT_FOUND)?;

    let job_id = inflight.deployment.job_id.clone();
    let succeeded = req.succeeded();
    let elapsed_ms = inflight
        .started_at
        .elapsed()
        .map(|d| d.as_millis())
        .unwrap_or(0);

    if let Some(meta) = state.workers.lock().get_mut(&inflight.deployment.worker_id) {
        if succeeded {
            meta.deployments_succeeded += 1;
        } else {
            meta.deployments_failed += 1;
        }
    }

    info!(
        "despliegue {} del job {} terminó en {} ms (ok={})",
        req.deployment_id, job_id, elapsed_ms, succeeded
    );

    let pending = state.job_has_pending(&job_id);
    let finished = {
        let mut jobs = state.jobs.lock();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(Json(DeploymentCompleteResponse { ok: true }));
        };

        job.completed_deployments += 1;
        for report in req.outcomes {
            if let Some(fault) = report.fault {
                warn!("job {}: unidad {} falló: {}", job_id, report.unit, fault);
                job.faults.push(fault);
            }
            if !report.values.is_empty() {
                job.outputs.push(UnitOutput {
                    unit: report.unit,
                    values: report.values,
                });
            }
        }

        if job.status.is_terminal() {
            None
        } else if !succeeded {
            job.status = JobStatus::Failed;
            job.finished_at = Some(Utc::now());
            Some(JobStatus::Failed)
        } else if !pending {
            job.status = JobStatus::Succeeded;
            job.finished_at = Some(Utc::now());
            Some(JobStatus::Succeeded)
        } else {
            None
        }
    };

    if let Some(status) = finished {
        let dropped = state.drop_queued(&job_id);
        state.unit_locations.lock().retain(|(job, _), _| job != &job_id);
        info!(
            "job {} terminado: {:?} ({} despliegues sin entregar descartados)",
            job_id, status, dropped
        );
    }

    Ok(Json(DeploymentCompleteResponse { ok: true }))
}

// Worker anuncia qué unidades de un job atiende
async fn register_units(
    State(state): State<AppState>,
    Json(req): Json<UnitRegisterRequest>,
) -> Result<Json<UnitRegisterResponse>, StatusCode> {
    if !state.workers.lock().contains_key(&req.worker_id) {
        return Err(StatusCode::NOT_FOUND);
    }

    let mut locations = state.unit_locations.lock();
    for unit in &req.units {
        locations.insert((req.job_id.clone(), *unit), req.worker_id.clone());
    }

    info!(
        "worker {} atiende {} unidades del job {}",
        req.worker_id,
        req.units.len(),
        req.job_id
    );
    Ok(Json(UnitRegisterResponse {
        registered: req.units.len(),
    }))
}

// Dirección del worker que atiende una unidad de un job
async fn locate_unit(
    State(state): State<AppState>,
    Path((job_id, key)): Path<(String, String)>,
) -> Result<Json<UnitLocation>, StatusCode> {
    let unit: UnitKey = key.parse().map_err(|_| StatusCode::BAD_REQUEST)?;

    let worker_id = state
        .unit_locations
        .lock()
        .get(&(job_id, unit))
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)?;

    let workers = state.workers.lock();
    let meta = workers.get(&worker_id).ok_or(StatusCode::NOT_FOUND)?;
    if meta.dead {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(UnitLocation {
        unit,
        worker_id: worker_id.clone(),
        address: meta.address.clone(),
    }))
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    let now = SystemTime::now();

    // Despliegues activos por worker (desde in_flight)
    let mut active_by_worker: HashMap<WorkerId, u32> = HashMap::new();
    for inf in state.in_flight.lock().values() {
        *active_by_worker
            .entry(inf.deployment.worker_id.clone())
            .or_insert(0) += 1;
    }

    let mut units_by_worker: HashMap<WorkerId, u32> = HashMap::new();
    for worker_id in state.unit_locations.lock().values() {
        *units_by_worker.entry(worker_id.clone()).or_insert(0) += 1;
    }

    let order = state.worker_order.lock().clone();
    let workers = state.workers.lock();
    let mut out = Vec::new();

    for wid in order {
        let Some(meta) = workers.get(&wid) else {
            continue;
        };
        let age_secs = now
            .duration_since(meta.last_heartbeat)
            .unwrap_or_default()
            .as_secs();

        out.push(WorkerMetrics {
            worker_id: wid.clone(),
            hostname: meta.hostname.clone(),
            address: meta.address.clone(),
            dead: meta.dead,
            max_concurrency: meta.max_concurrency,
            last_heartbeat_secs_ago: age_secs,
            cpu_percent: meta.last_cpu_percent.unwrap_or(0.0),
            mem_bytes: meta.last_mem_bytes.unwrap_or(0),
            active_deployments: active_by_worker.get(&wid).copied().unwrap_or(0),
            deployments_started: meta.deployments_started,
            deployments_succeeded: meta.deployments_succeeded,
            deployments_failed: meta.deployments_failed,
            hosted_units: units_by_worker.get(&wid).copied().unwrap_or(0),
        });
    }

    Json(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use common::{Fault, Graph, LinkRef, NodeRef, UnitReport, UnitState, Value};
    use http_body_util::BodyExt;
    use serde::de::DeserializeOwned;
    use serde_json::json;
    use tower::ServiceExt;

    async fn send(app: &Router, method: &str, uri: &str, body: serde_json::Value) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(if method == "GET" {
                Body::empty()
            } else {
                Body::from(body.to_string())
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, bytes.to_vec())
    }

    async fn send_json<T: DeserializeOwned>(
        app: &Router,
        method: &str,
        uri: &str,
        body: serde_json::Value,
    ) -> T {
        let (status, bytes) = send(app, method, uri, body).await;
        assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&bytes));
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn register(app: &Router, host: &str) -> WorkerId {
        let resp: WorkerRegisterResponse = send_json(
            app,
            "POST",
            "/api/v1/workers/register",
            json!({ "hostname": host, "address": format!("http://{host}:8081"), "max_concurrency": 2 }),
        )
        .await;
        resp.worker_id
    }

    fn pipeline() -> Graph {
        Graph::new(
            vec![
                NodeRef::new(1, "range").with_param("count", 8),
                NodeRef::new(2, "scale").with_param("factor", 2),
                NodeRef::new(3, "collect"),
            ],
            vec![LinkRef::new(1, 2), LinkRef::new(2, 3)],
        )
    }

    fn job_request(partitions: u32) -> serde_json::Value {
        serde_json::to_value(JobRequest {
            name: "doble".to_string(),
            graph: pipeline(),
            partitions,
        })
        .unwrap()
    }

    async fn next(app: &Router, worker_id: &str) -> Option<Deployment> {
        let resp: DeploymentResponse = send_json(
            app,
            "POST",
            "/api/v1/tasks/next",
            json!({ "worker_id": worker_id }),
        )
        .await;
        resp.deployment
    }

    fn report(deployment: &Deployment, fault: Option<Fault>, values: Vec<Value>) -> serde_json::Value {
        let outcomes: Vec<UnitReport> = deployment
            .descriptors
            .iter()
            .filter(|d| d.is_tick())
            .map(|d| UnitReport {
                unit: d.key,
                state: if fault.is_some() {
                    UnitState::Failed
                } else {
                    UnitState::Finished
                },
                fault: fault.clone(),
                values: values.clone(),
            })
            .collect();
        serde_json::to_value(DeploymentCompleteRequest {
            deployment_id: deployment.id.clone(),
            outcomes,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn health_responde_ok() {
        let app = build_router(AppState::new());
        let (status, body) = send(&app, "GET", "/health", json!(null)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn job_sin_workers_es_rechazado() {
        let app = build_router(AppState::new());
        let (status, _) = send(&app, "POST", "/api/v1/jobs", job_request(2)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn grafo_invalido_es_bad_request() {
        let app = build_router(AppState::new());
        register(&app, "w1").await;
        let (status, body) = send(&app, "POST", "/api/v1/jobs", job_request(0)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.is_empty());
    }

    #[tokio::test]
    async fn job_completo_con_dos_workers() {
        let app = build_router(AppState::new());
        let w1 = register(&app, "w1").await;
        let w2 = register(&app, "w2").await;

        let job: JobInfo = send_json(&app, "POST", "/api/v1/jobs", job_request(2)).await;
        assert_eq!(job.status, JobStatus::Accepted);
        assert_eq!(job.total_deployments, 2);

        let d1 = next(&app, &w1).await.expect("despliegue para w1");
        assert_eq!(d1.worker_id, w1);
        assert!(d1.descriptors.iter().all(|d| d.key.partition == 0));
        // el otro despliegue es de w2
        assert!(next(&app, &w1).await.is_none());
        let d2 = next(&app, &w2).await.expect("despliegue para w2");

        let running: JobInfo = send_json(&app, "GET", &format!("/api/v1/jobs/{}", job.id), json!(null)).await;
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());

        let collected: Vec<Value> = (0..8).map(|v| Value::Int64(v * 2)).collect();
        let _: DeploymentCompleteResponse =
            send_json(&app, "POST", "/api/v1/tasks/complete", report(&d1, None, collected.clone())).await;
        let half: JobInfo = send_json(&app, "GET", &format!("/api/v1/jobs/{}", job.id), json!(null)).await;
        assert_eq!(half.status, JobStatus::Running);

        let _: DeploymentCompleteResponse =
            send_json(&app, "POST", "/api/v1/tasks/complete", report(&d2, None, Vec::new())).await;
        let done: JobInfo = send_json(&app, "GET", &format!("/api/v1/jobs/{}", job.id), json!(null)).await;
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.completed_deployments, 2);
        assert!(done.finished_at.is_some());
        assert_eq!(done.outputs.len(), 1);
        assert_eq!(done.outputs[0].values, collected);

        // completar dos veces el mismo despliegue
        let (status, _) = send(&app, "POST", "/api/v1/tasks/complete", report(&d2, None, Vec::new())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fault_de_una_unidad_falla_el_job() {
        let state = AppState::new();
        let app = build_router(state.clone());
        let w1 = register(&app, "w1").await;
        let w2 = register(&app, "w2").await;

        let job: JobInfo = send_json(&app, "POST", "/api/v1/jobs", job_request(2)).await;
        let d1 = next(&app, &w1).await.unwrap();
        assert!(!d1.descriptors.is_empty());

        let fault = Fault::new("PodError", "fuente rota");
        let _: DeploymentCompleteResponse =
            send_json(&app, "POST", "/api/v1/tasks/complete", report(&d1, Some(fault), Vec::new())).await;

        let failed: JobInfo = send_json(&app, "GET", &format!("/api/v1/jobs/{}", job.id), json!(null)).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.faults.iter().all(|f| f.class == "PodError"));
        // el despliegue de w2 ya no se entrega
        assert!(next(&app, &w2).await.is_none());
        assert!(!state.job_has_pending(&job.id));
    }

    #[tokio::test]
    async fn ubicacion_de_unidades_por_job() {
        let app = build_router(AppState::new());
        let w1 = register(&app, "w1").await;

        let resp: UnitRegisterResponse = send_json(
            &app,
            "POST",
            "/api/v1/units/register",
            serde_json::to_value(UnitRegisterRequest {
                job_id: "j1".to_string(),
                worker_id: w1.clone(),
                units: vec![UnitKey::new(3, 0), UnitKey::new(3, 1)],
            })
            .unwrap(),
        )
        .await;
        assert_eq!(resp.registered, 2);

        let location: UnitLocation =
            send_json(&app, "GET", "/api/v1/jobs/j1/units/3@1", json!(null)).await;
        assert_eq!(location.unit, UnitKey::new(3, 1));
        assert_eq!(location.worker_id, w1);
        assert_eq!(location.address, "http://w1:8081");

        let (status, _) = send(&app, "GET", "/api/v1/jobs/j2/units/3@1", json!(null)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "GET", "/api/v1/jobs/j1/units/tres", json!(null)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn heartbeat_actualiza_metricas() {
        let app = build_router(AppState::new());
        let w1 = register(&app, "w1").await;

        let _: WorkerHeartbeatResponse = send_json(
            &app,
            "POST",
            "/api/v1/workers/heartbeat",
            json!({ "worker_id": w1, "cpu_percent": 12.5, "mem_bytes": 2048 }),
        )
        .await;
        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/workers/heartbeat",
            json!({ "worker_id": "nadie" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let workers: Vec<WorkerMetrics> = send_json(&app, "GET", "/api/v1/workers", json!(null)).await;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].cpu_percent, 12.5);
        assert_eq!(workers[0].mem_bytes, 2048);
        assert!(!workers[0].dead);
    }
}
