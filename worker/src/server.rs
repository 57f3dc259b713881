use axum::{extract::State, routing::{get, post}, Json, Router};
use common::{Bush, CallError, CallResponse, Fault, JobId, UnitCallRequest};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

/// Bush de cada job que este worker está atendiendo.
pub type HostedJobs = Arc<RwLock<HashMap<JobId, Arc<Bush>>>>;

pub fn build_router(hosted: HostedJobs) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/units/call", post(call_unit))
        .with_state(hosted)
}

async fn health() -> &'static str {
    "ok"
}

// Llamada remota de un proxy a una unidad local.
// Siempre responde 200: los errores viajan como fault.
async fn call_unit(
    State(hosted): State<HostedJobs>,
    Json(req): Json<UnitCallRequest>,
) -> Json<CallResponse> {
    let unit = req.unit;
    let bush = hosted.read().get(&req.job_id).cloned();
    let Some(bush) = bush else {
        return Json(
            Fault::from_error(&CallError::UnitNotFound(unit).into())
                .with_frame(format!("worker job {}", req.job_id))
                .into(),
        );
    };

    debug!("llamada remota a {}: {}", unit, req.request);
    // read_next puede bloquear tirando de la fuente
    let response = tokio::task::spawn_blocking(move || bush.call(unit, &req.request))
        .await
        .unwrap_or_else(|e| {
            Fault::new("Panic", e.to_string())
                .with_frame(format!("worker {unit}"))
                .into()
        });
    Json(response)
}
