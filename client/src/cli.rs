use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::runtime::run_local;
use common::{
    compile, Graph, JobInfo, JobRequest, ProxyKind, RuntimeConfig, TransformRegistry,
    UnitDescriptor, WorkerMetrics,
};
use reqwest::Client;
use std::{env, fs, path::Path, path::PathBuf, sync::Arc};

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para compilar grafos de streams y hablar con el master")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía un grafo (JSON) al master como job nuevo
    Submit {
        #[arg(value_name = "GRAFO_JSON")]
        graph: PathBuf,

        /// Nombre del job (default: nombre del archivo)
        #[arg(long)]
        name: Option<String>,

        #[arg(long, default_value_t = 1)]
        partitions: u32,
    },
    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista los workers y sus métricas
    Workers,
    /// Compila el grafo localmente y muestra las unidades resultantes
    Plan {
        #[arg(value_name = "GRAFO_JSON")]
        graph: PathBuf,

        #[arg(long, default_value_t = 1)]
        partitions: u32,

        /// Imprime los descriptores como JSON
        #[arg(long)]
        json: bool,
    },
    /// Compila y ejecuta el grafo en este proceso con las transformaciones builtin
    Run {
        #[arg(value_name = "GRAFO_JSON")]
        graph: PathBuf,

        #[arg(long, default_value_t = 1)]
        partitions: u32,
    },
}

fn load_graph(path: &Path) -> Result<Graph> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("leyendo el grafo {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("grafo inválido en {}", path.display()))
}

fn job_name(path: &Path, name: Option<String>) -> String {
    name.unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "job".to_string())
    })
}

/// Una línea por unidad: clave, tipo, cadena interna y entradas.
fn describe(unit: &UnitDescriptor) -> String {
    let chain: Vec<&str> = unit.inner_nodes.iter().map(|n| n.type_tag.as_str()).collect();
    let mut line = format!(
        "{:<8} {:<9} [{}]",
        unit.key.to_string(),
        if unit.is_tick() { "tick" } else { "pod" },
        chain.join(" -> ")
    );
    for proxy in &unit.proxies {
        let upstream: Vec<String> = proxy.upstream.iter().map(|k| k.to_string()).collect();
        let kind = match proxy.kind {
            ProxyKind::Streaming => "stream",
            ProxyKind::Merging => "merge",
        };
        line.push_str(&format!(" in{}={}({})", proxy.slot, kind, upstream.join(",")));
    }
    if let Some(fan_out) = unit.fan_out_partitions {
        line.push_str(&format!(" fan_out={fan_out}"));
    }
    line
}

fn print_job(job: &JobInfo) {
    println!("Job:");
    println!("  id: {}", job.id);
    println!("  nombre: {}", job.name);
    println!("  estado: {:?}", job.status);
    println!("  particiones: {}", job.partitions);
    println!(
        "  despliegues: total={}, completados={} ({} unidades)",
        job.total_deployments, job.completed_deployments, job.total_units
    );
    println!("  submitted_at: {}", job.submitted_at);
    if let Some(ref started) = job.started_at {
        println!("  iniciado: {}", started);
    }
    if let Some(ref done) = job.finished_at {
        println!("  finalizado: {}", done);
    }
    for fault in &job.faults {
        println!("  fault: {}", fault);
        for frame in &fault.frames {
            println!("    en {}", frame);
        }
    }
    for output in &job.outputs {
        let values: Vec<String> = output.values.iter().map(|v| v.to_string()).collect();
        println!("  salida {}: [{}]", output.unit, values.join(", "));
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit {
            graph,
            name,
            partitions,
        } => {
            let req = JobRequest {
                name: job_name(&graph, name),
                graph: load_graph(&graph)?,
                partitions,
            };

            let url = format!("{}/api/v1/jobs", base_url);
            let resp = client.post(&url).json(&req).send().await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!("el master rechazó el job ({status}): {body}");
            }
            let job_info: JobInfo = resp.json().await?;

            println!("Job creado:");
            print_job(&job_info);
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/jobs/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let job: JobInfo = resp.json().await?;
                print_job(&job);
            } else {
                println!("Error: job no encontrado (status {})", resp.status());
            }
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let workers: Vec<WorkerMetrics> = resp.json().await?;
                if workers.is_empty() {
                    println!("No hay workers registrados.");
                }
                for w in workers {
                    println!("Worker {}", w.worker_id);
                    println!("  host           : {} ({})", w.hostname, w.address);
                    println!("  dead           : {}", w.dead);
                    println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                    println!("  concurrency    : max={}", w.max_concurrency);
                    println!(
                        "  despliegues    : activos={}, started={}, ok={}, failed={}",
                        w.active_deployments,
                        w.deployments_started,
                        w.deployments_succeeded,
                        w.deployments_failed
                    );
                    println!("  unidades       : {}", w.hosted_units);
                    println!("  cpu_percent    : {:.1}%", w.cpu_percent);
                    println!("  mem_bytes      : {}", w.mem_bytes);
                    println!();
                }
            } else {
                println!(
                    "Error consultando /api/v1/workers (status {})",
                    resp.status()
                );
            }
        }

        Commands::Plan {
            graph,
            partitions,
            json,
        } => {
            let graph = load_graph(&graph)?;
            let units = compile(&graph, partitions, &TransformRegistry::with_builtins())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&units)?);
            } else {
                println!("{} unidades:", units.len());
                for unit in &units {
                    println!("  {}", describe(unit));
                }
            }
        }

        Commands::Run { graph, partitions } => {
            tracing_subscriber::fmt()
                .with_env_filter("common=info")
                .init();

            let graph = load_graph(&graph)?;
            let registry = Arc::new(TransformRegistry::with_builtins());
            let config = RuntimeConfig::from_env();
            let run = tokio::task::spawn_blocking(move || {
                run_local(&graph, partitions, registry, &config)
            })
            .await??;

            println!("{} unidades ejecutadas", run.units);
            for (unit, values) in &run.outputs {
                let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                println!("  salida {}: [{}]", unit, values.join(", "));
            }
        }
    }

    Ok(())
}
