use crate::state::AppState;
use crate::{MONITOR_INTERVAL, WORKER_DEAD_TIMEOUT};
use chrono::Utc;
use common::{Fault, JobStatus, WorkerId};
use std::{
    collections::HashSet,
    time::{Duration, SystemTime},
};
use tracing::{info, warn};

pub async fn monitor_workers(state: AppState) {
    loop {
        tokio::time::sleep(MONITOR_INTERVAL).await;
        sweep(&state, SystemTime::now(), WORKER_DEAD_TIMEOUT);
    }
}

/// Una pasada del monitor:
/// 1. marca muertos los workers sin heartbeat reciente
/// 2. falla los jobs que tenían despliegues en ellos
/// 3. olvida las unidades que atendían
///
/// Las unidades de un worker caído no se pueden mover: sus lectores ya tienen
/// cursores abiertos contra él, así que el job entero falla.
pub fn sweep(state: &AppState, now: SystemTime, timeout: Duration) -> Vec<WorkerId> {
    let mut dead_workers: HashSet<WorkerId> = HashSet::new();
    {
        let mut workers = state.workers.lock();
        for (id, meta) in workers.iter_mut() {
            if meta.dead {
                continue;
            }
            if let Ok(elapsed) = now.duration_since(meta.last_heartbeat) {
                if elapsed > timeout {
                    meta.dead = true;
                    info!("marcando worker {} como muerto", id);
                    dead_workers.insert(id.clone());
                }
            }
        }
    }

    if dead_workers.is_empty() {
        return Vec::new();
    }

    // Jobs afectados: despliegues en vuelo o en cola de esos workers
    let mut jobs_to_fail: Vec<(String, WorkerId)> = Vec::new();
    state.in_flight.lock().retain(|_, inflight| {
        let d = &inflight.deployment;
        if dead_workers.contains(&d.worker_id) {
            jobs_to_fail.push((d.job_id.clone(), d.worker_id.clone()));
            false
        } else {
            true
        }
    });
    state.deployments_queue.lock().retain(|d| {
        if dead_workers.contains(&d.worker_id) {
            jobs_to_fail.push((d.job_id.clone(), d.worker_id.clone()));
            false
        } else {
            true
        }
    });

    state
        .unit_locations
        .lock()
        .retain(|_, worker_id| !dead_workers.contains(worker_id));

    let mut failed = Vec::new();
    {
        let mut jobs = state.jobs.lock();
        for (job_id, worker_id) in jobs_to_fail {
            let Some(job) = jobs.get_mut(&job_id) else {
                continue;
            };
            if job.status.is_terminal() {
                continue;
            }
            warn!("job {} falla: perdió el worker {}", job_id, worker_id);
            job.status = JobStatus::Failed;
            job.finished_at = Some(Utc::now());
            job.faults.push(Fault::new(
                "WorkerLost",
                format!("worker {worker_id} sin heartbeat"),
            ));
            failed.push(job_id);
        }
    }

    for job_id in failed {
        state.drop_queued(&job_id);
        state.unit_locations.lock().retain(|(job, _), _| job != &job_id);
    }

    let mut dead: Vec<WorkerId> = dead_workers.into_iter().collect();
    dead.sort();
    dead
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{InFlight, WorkerMeta};
    use common::{Deployment, JobInfo, UnitKey};

    fn worker(state: &AppState, id: &str, last_heartbeat: SystemTime) {
        state.workers.lock().insert(
            id.to_string(),
            WorkerMeta {
                hostname: id.to_string(),
                address: format!("http://{id}:8081"),
                last_heartbeat,
                dead: false,
                max_concurrency: 1,
                deployments_started: 0,
                deployments_succeeded: 0,
                deployments_failed: 0,
                last_cpu_percent: None,
                last_mem_bytes: None,
            },
        );
        state.worker_order.lock().push(id.to_string());
    }

    fn job(state: &AppState, id: &str) {
        state.jobs.lock().insert(
            id.to_string(),
            JobInfo {
                id: id.to_string(),
                name: id.to_string(),
                status: JobStatus::Running,
                partitions: 2,
                submitted_at: Utc::now(),
                started_at: Some(Utc::now()),
                finished_at: None,
                total_units: 2,
                total_deployments: 2,
                completed_deployments: 0,
                faults: Vec::new(),
                outputs: Vec::new(),
            },
        );
    }

    fn deployment(id: &str, job_id: &str, worker_id: &str) -> Deployment {
        Deployment {
            id: id.to_string(),
            job_id: job_id.to_string(),
            worker_id: worker_id.to_string(),
            descriptors: Vec::new(),
        }
    }

    #[test]
    fn worker_sin_heartbeat_falla_sus_jobs() {
        let state = AppState::new();
        let now = SystemTime::now();
        worker(&state, "viejo", now - Duration::from_secs(60));
        worker(&state, "vivo", now);
        job(&state, "j1");
        job(&state, "j2");

        state.in_flight.lock().insert(
            "d1".to_string(),
            InFlight {
                deployment: deployment("d1", "j1", "viejo"),
                started_at: now,
            },
        );
        state.deployments_queue.lock().push_back(deployment("d2", "j1", "vivo"));
        state.deployments_queue.lock().push_back(deployment("d3", "j2", "vivo"));
        state
            .unit_locations
            .lock()
            .insert(("j2".to_string(), UnitKey::new(1, 0)), "viejo".to_string());

        let dead = sweep(&state, now, Duration::from_secs(20));
        assert_eq!(dead, vec!["viejo".to_string()]);

        let jobs = state.jobs.lock();
        assert_eq!(jobs["j1"].status, JobStatus::Failed);
        assert_eq!(jobs["j1"].faults[0].class, "WorkerLost");
        // j2 no tenía despliegues en el worker caído
        assert_eq!(jobs["j2"].status, JobStatus::Running);
        drop(jobs);

        let queue = state.deployments_queue.lock();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, "d3");
        drop(queue);

        assert!(state.unit_locations.lock().is_empty());
        assert_eq!(state.live_workers(), vec!["vivo".to_string()]);
    }

    #[test]
    fn segunda_pasada_no_repite_muertos() {
        let state = AppState::new();
        let now = SystemTime::now();
        worker(&state, "viejo", now - Duration::from_secs(60));
        assert_eq!(sweep(&state, now, Duration::from_secs(20)).len(), 1);
        assert!(sweep(&state, now, Duration::from_secs(20)).is_empty());
    }
}
