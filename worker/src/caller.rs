use anyhow::{bail, Result};
use common::{
    CallRequest, CallResponse, Directory, Fault, JobId, UnitCallRequest, UnitCaller, UnitKey,
    UnitLocation,
};
use reqwest::{Client, StatusCode};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::runtime::Handle;
use tracing::{debug, warn};

const RESOLVE_RETRY: Duration = Duration::from_millis(100);

/// Transporte HTTP hacia unidades de otros workers del mismo job.
///
/// La ubicación se pide al master y queda en el directorio local como
/// remota; si la llamada falla se olvida para volver a resolverla.
/// Se usa desde hilos fuera del runtime (pool del bush o `spawn_blocking`).
pub struct HttpCaller {
    job_id: JobId,
    master_url: String,
    client: Client,
    directory: Arc<Directory>,
    timeout: Duration,
    handle: Handle,
}

impl HttpCaller {
    pub fn new(
        job_id: JobId,
        master_url: String,
        directory: Arc<Directory>,
        timeout: Duration,
        handle: Handle,
    ) -> Self {
        Self {
            job_id,
            master_url,
            client: Client::new(),
            directory,
            timeout,
            handle,
        }
    }

    /// Dirección del worker que atiende `target`. Mientras el master no la
    /// conozca (el otro worker todavía no la registró) se reintenta hasta el
    /// timeout de llamada.
    async fn resolve(&self, target: UnitKey) -> Result<String> {
        if let Some(address) = self.directory.lookup_remote(target) {
            return Ok(address);
        }

        let url = format!(
            "{}/api/v1/jobs/{}/units/{}",
            self.master_url, self.job_id, target
        );
        let deadline = Instant::now() + self.timeout;
        loop {
            let resp = self.client.get(&url).timeout(self.timeout).send().await?;
            match resp.status() {
                status if status.is_success() => {
                    let location: UnitLocation = resp.json().await?;
                    self.directory.register_remote(target, &location.address)?;
                    debug!("unidad {} ubicada en {}", target, location.address);
                    return Ok(location.address);
                }
                StatusCode::NOT_FOUND if Instant::now() < deadline => {
                    tokio::time::sleep(RESOLVE_RETRY).await;
                }
                status => bail!("el master no ubica {target} ({status})"),
            }
        }
    }

    async fn post(&self, target: UnitKey, request: &CallRequest) -> Result<CallResponse> {
        let address = self.resolve(target).await?;
        let resp = self
            .client
            .post(format!("{address}/api/v1/units/call"))
            .json(&UnitCallRequest {
                job_id: self.job_id.clone(),
                unit: target,
                request: request.to_string(),
            })
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

impl UnitCaller for HttpCaller {
    fn call(&self, target: UnitKey, request: &CallRequest) -> CallResponse {
        match self.handle.block_on(self.post(target, request)) {
            Ok(response) => response,
            Err(e) => {
                warn!("llamada remota a {} falló: {:#}", target, e);
                self.directory.remove_remote(target);
                Fault::new("RemoteCallError", format!("{e:#}"))
                    .with_frame(format!("http {target}"))
                    .into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{build_router, HostedJobs};
    use axum::{extract::Path, http, routing::get, Json, Router};
    use common::pod::{Pod, PodSettings};
    use common::transforms::ElementStream;
    use common::{Bush, Value};
    use tokio::net::TcpListener;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        address
    }

    // master de prueba que ubica todas las unidades en `worker`
    fn fake_master(worker: Option<String>) -> Router {
        Router::new().route(
            "/api/v1/jobs/:id/units/:key",
            get(move |Path((_, key)): Path<(String, String)>| {
                let worker = worker.clone();
                async move {
                    let unit: UnitKey = key.parse().map_err(|_| http::StatusCode::BAD_REQUEST)?;
                    let address = worker.ok_or(http::StatusCode::NOT_FOUND)?;
                    Ok::<_, http::StatusCode>(Json(UnitLocation {
                        unit,
                        worker_id: "w1".to_string(),
                        address,
                    }))
                }
            }),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn llamada_remota_resuelve_por_el_master() {
        let key = UnitKey::new(7, 0);
        let bush = Bush::new("remoto", 1, Directory::new()).unwrap();
        let opener = Box::new(|_: f32| -> anyhow::Result<ElementStream> {
            Ok(Box::new((0..4).map(|v| Ok(Value::Int64(v * 10)))))
        });
        bush.add_pod(Pod::new(key, opener, PodSettings::default())).unwrap();
        let hosted = HostedJobs::default();
        hosted.write().insert("j1".to_string(), bush);

        let worker_url = serve(build_router(hosted.clone())).await;
        let master_url = serve(fake_master(Some(worker_url.clone()))).await;

        let directory = Directory::new();
        let caller = HttpCaller::new(
            "j1".to_string(),
            master_url,
            directory.clone(),
            Duration::from_secs(5),
            Handle::current(),
        );

        let responses = tokio::task::spawn_blocking(move || {
            let opened = caller.call(
                key,
                &CallRequest::new("open_cursor")
                    .arg("sample_rate", 44100)
                    .arg("partition", 0),
            );
            let CallResponse::Value(Value::Int64(cursor)) = opened else {
                panic!("open_cursor devolvió {opened:?}");
            };
            caller.call(
                key,
                &CallRequest::new("read_next").arg("cursor", cursor).arg("n", 8),
            )
        })
        .await
        .unwrap();

        assert_eq!(
            responses,
            CallResponse::List((0..4).map(|v| Value::Int64(v * 10)).collect())
        );
        assert_eq!(directory.lookup_remote(key), Some(worker_url));

        let bush = hosted.write().remove("j1").unwrap();
        tokio::task::spawn_blocking(move || bush.close()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unidad_sin_ubicar_vence_el_timeout() {
        let master_url = serve(fake_master(None)).await;
        let directory = Directory::new();
        let caller = HttpCaller::new(
            "j1".to_string(),
            master_url,
            directory.clone(),
            Duration::from_millis(300),
            Handle::current(),
        );

        let response = tokio::task::spawn_blocking(move || {
            caller.call(UnitKey::new(1, 0), &CallRequest::new("is_exhausted"))
        })
        .await
        .unwrap();

        match response {
            CallResponse::Fault(fault) => {
                assert_eq!(fault.class, "RemoteCallError");
                assert_eq!(fault.frames, vec!["http 1@0".to_string()]);
            }
            other => panic!("se esperaba fault, llegó {other:?}"),
        }
        assert_eq!(directory.lookup_remote(UnitKey::new(1, 0)), None);
    }
}
