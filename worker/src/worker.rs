use anyhow::{Context, Result};
use common::{
    runtime, Bush, Deployment, DeploymentCompleteRequest, DeploymentRequest,
    DeploymentResponse, Directory, Fault, JobInfo, LocalCaller, RuntimeConfig,
    TransformRegistry, UnitCaller, UnitKey, UnitRegisterRequest, UnitReport, UnitState,
    WorkerHeartbeatRequest, WorkerId, WorkerRegisterRequest, WorkerRegisterResponse,
};
use reqwest::Client;
use std::{env, sync::Arc, time::Duration};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::caller::HttpCaller;
use crate::server::{self, HostedJobs};

const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
const DEFAULT_WORKER_PORT: u16 = 8081;
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Lo que comparten el loop principal y los despliegues en curso.
struct WorkerContext {
    client: Client,
    base_url: String,
    worker_id: WorkerId,
    hosted: HostedJobs,
    config: RuntimeConfig,
}

/// Loop principal del worker.
/// - Levanta el servidor de llamadas a unidades.
/// - Se registra en el master.
/// - Hace heartbeats periódicos.
/// - Pide despliegues mientras tenga "slots" libres.
/// - Corre cada despliegue en su propio bush.
pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("worker=debug,common=info,reqwest=info")
        .init();

    let base_url =
        env::var("MASTER_URL").unwrap_or_else(|_| "http://master:8080".to_string());
    let client = Client::new();

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let max_concurrency: u32 = env::var("WORKER_CONCURRENCY")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(DEFAULT_WORKER_CONCURRENCY);

    let port: u16 = env::var("WORKER_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_WORKER_PORT);

    // URL con la que los otros workers llegan a este
    let address = env::var("WORKER_ADVERTISE_URL")
        .unwrap_or_else(|_| format!("http://{hostname}:{port}"));

    let config = RuntimeConfig::from_env();

    // Servidor de llamadas remotas a unidades
    let hosted = HostedJobs::default();
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("worker atendiendo unidades en {}", listener.local_addr()?);
    let app = server::build_router(hosted.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("servidor de unidades terminó: {:?}", e);
        }
    });

    // Registro de worker
    let register_url = format!("{}/api/v1/workers/register", base_url);
    let res = client
        .post(&register_url)
        .json(&WorkerRegisterRequest {
            hostname,
            address: address.clone(),
            max_concurrency,
        })
        .send()
        .await?
        .error_for_status()?;
    let WorkerRegisterResponse { worker_id } = res.json().await?;

    info!(
        "worker {} registrado como {} con concurrency={} contra {}",
        worker_id, address, max_concurrency, base_url
    );

    let ctx = Arc::new(WorkerContext {
        client,
        base_url,
        worker_id,
        hosted,
        config,
    });
    let sem = Arc::new(Semaphore::new(max_concurrency.max(1) as usize));

    // System para leer CPU y memoria
    let mut sys = System::new_all();

    loop {
        // --------- Heartbeat al master con CPU/MEM ---------
        sys.refresh_cpu();
        sys.refresh_memory();

        let cpu_percent = sys.global_cpu_info().cpu_usage();
        // used_memory devuelve KB -> lo pasamos a bytes
        let mem_bytes = sys.used_memory() * 1024;

        let hb_url = format!("{}/api/v1/workers/heartbeat", ctx.base_url);
        let _ = ctx
            .client
            .post(&hb_url)
            .json(&WorkerHeartbeatRequest {
                worker_id: ctx.worker_id.clone(),
                cpu_percent,
                mem_bytes,
            })
            .send()
            .await;

        // --------- Control de concurrencia local ---------
        let permit = match sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        let next_url = format!("{}/api/v1/tasks/next", ctx.base_url);
        let assignment: DeploymentResponse = match ctx
            .client
            .post(&next_url)
            .json(&DeploymentRequest {
                worker_id: ctx.worker_id.clone(),
            })
            .send()
            .await
        {
            Ok(resp) => resp.json().await?,
            Err(e) => {
                warn!("no se pudo pedir despliegue al master: {:?}", e);
                drop(permit);
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        if let Some(deployment) = assignment.deployment {
            info!(
                "tengo despliegue {} del job {} ({} unidades)",
                deployment.id,
                deployment.job_id,
                deployment.descriptors.len()
            );

            let ctx = ctx.clone();
            tokio::spawn(async move {
                let deployment_id = deployment.id.clone();
                if let Err(e) = ctx.run_deployment(deployment).await {
                    warn!("despliegue {} terminó con error: {:#}", deployment_id, e);
                }
                // Liberar el "slot" al terminar
                drop(permit);
            });
        } else {
            drop(permit);
            sleep(Duration::from_secs(2)).await;
        }
    }
}

impl WorkerContext {
    /// Corre un despliegue completo: bush propio, registro de unidades,
    /// espera de los ticks, reporte, y cierre cuando el job termina.
    async fn run_deployment(&self, deployment: Deployment) -> Result<()> {
        let job_id = deployment.job_id.clone();
        let registry = Arc::new(TransformRegistry::with_builtins());
        let directory = Directory::new();
        let bush = Bush::new(&deployment.id, self.config.pool_size, directory.clone())?;

        let outcomes = match self.execute(&deployment, &bush, &registry, directory).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!("despliegue {} falló: {:#}", deployment.id, e);
                failed_reports(&deployment, &e)
            }
        };

        let report = DeploymentCompleteRequest {
            deployment_id: deployment.id.clone(),
            outcomes,
        };
        info!(
            "reportando despliegue {} (ok={})",
            deployment.id,
            report.succeeded()
        );
        let complete_url = format!("{}/api/v1/tasks/complete", self.base_url);
        let sent = self.client.post(&complete_url).json(&report).send().await;

        // Los pods siguen atendiendo a otros workers hasta que el job termine
        if sent.is_ok() {
            self.wait_job_end(&job_id).await;
        }

        self.hosted.write().remove(&job_id);
        tokio::task::spawn_blocking(move || bush.close()).await?;
        info!("despliegue {} cerrado", deployment.id);
        sent?.error_for_status()?;
        Ok(())
    }

    async fn execute(
        &self,
        deployment: &Deployment,
        bush: &Arc<Bush>,
        registry: &Arc<TransformRegistry>,
        directory: Arc<Directory>,
    ) -> Result<Vec<UnitReport>> {
        let remote = HttpCaller::new(
            deployment.job_id.clone(),
            self.base_url.clone(),
            directory.clone(),
            self.config.call_timeout(),
            Handle::current(),
        );
        let caller: Arc<dyn UnitCaller> =
            Arc::new(LocalCaller::new(directory).with_remote(Arc::new(remote)));

        runtime::deploy(bush, &deployment.descriptors, registry, &caller, &self.config)
            .with_context(|| format!("desplegando {}", deployment.id))?;

        self.hosted
            .write()
            .insert(deployment.job_id.clone(), bush.clone());
        self.register_units(&deployment.job_id, bush.units()).await?;

        let futures = bush.start();
        let results: Vec<(UnitKey, Result<(), Fault>)> = tokio::task::spawn_blocking(move || {
            futures
                .into_iter()
                .map(|future| (future.key(), future.wait()))
                .collect()
        })
        .await?;

        let outputs = registry.outputs();
        Ok(results
            .into_iter()
            .map(|(unit, outcome)| match outcome {
                Ok(()) => UnitReport {
                    unit,
                    state: UnitState::Finished,
                    fault: None,
                    values: outputs.get(unit),
                },
                Err(fault) => UnitReport {
                    unit,
                    state: UnitState::Failed,
                    fault: Some(fault),
                    values: Vec::new(),
                },
            })
            .collect())
    }

    async fn register_units(&self, job_id: &str, units: Vec<UnitKey>) -> Result<()> {
        let url = format!("{}/api/v1/units/register", self.base_url);
        self.client
            .post(&url)
            .json(&UnitRegisterRequest {
                job_id: job_id.to_string(),
                worker_id: self.worker_id.clone(),
                units,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Espera a que el master dé el job por terminado (o lo olvide).
    async fn wait_job_end(&self, job_id: &str) {
        let url = format!("{}/api/v1/jobs/{}", self.base_url, job_id);
        loop {
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.json::<JobInfo>().await {
                    Ok(job) if job.status.is_terminal() => {
                        info!("job {} terminó: {:?}", job_id, job.status);
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("JobInfo inválido para {}: {:?}", job_id, e),
                },
                Ok(resp) => {
                    warn!("master devolvió {} para el job {}", resp.status(), job_id);
                    return;
                }
                Err(e) => warn!("error HTTP consultando el job {}: {:?}", job_id, e),
            }
            sleep(JOB_POLL_INTERVAL).await;
        }
    }
}

/// Un reporte fallido por unidad tick (o por la primera unidad si no hay ticks).
fn failed_reports(deployment: &Deployment, err: &anyhow::Error) -> Vec<UnitReport> {
    let fault = Fault::from_error(err).with_frame(format!("despliegue {}", deployment.id));
    let mut units: Vec<UnitKey> = deployment
        .descriptors
        .iter()
        .filter(|d| d.is_tick())
        .map(|d| d.key)
        .collect();
    if units.is_empty() {
        units.extend(deployment.descriptors.first().map(|d| d.key));
    }
    units
        .into_iter()
        .map(|unit| UnitReport {
            unit,
            state: UnitState::Failed,
            fault: Some(fault.clone()),
            values: Vec::new(),
        })
        .collect()
}
