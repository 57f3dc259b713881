use anyhow::{anyhow, Result};
use std::{collections::VecDeque, sync::Arc, thread, time::Duration};
use tracing::debug;

use crate::builder::{ProxyDescriptor, ProxyKind};
use crate::call::{CallRequest, CallResponse, Fault, Value};
use crate::directory::Directory;
use crate::error::CallError;
use crate::graph::UnitKey;
use crate::transforms::ElementStream;

/// Espera entre reintentos cuando el upstream responde una lista vacía;
/// se duplica hasta el máximo y vuelve al mínimo cuando llegan datos.
const EMPTY_BACKOFF_MIN: Duration = Duration::from_micros(50);
const EMPTY_BACKOFF_MAX: Duration = Duration::from_millis(5);

/// Transporte de llamadas hacia una unidad (local o remota).
pub trait UnitCaller: Send + Sync {
    fn call(&self, target: UnitKey, request: &CallRequest) -> CallResponse;
}

/// Resuelve la unidad en el directorio local y llama a su bush.
/// Las desconocidas van al `remote` si hay uno.
pub struct LocalCaller {
    directory: Arc<Directory>,
    remote: Option<Arc<dyn UnitCaller>>,
}

impl LocalCaller {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self {
            directory,
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn UnitCaller>) -> Self {
        self.remote = Some(remote);
        self
    }
}

impl UnitCaller for LocalCaller {
    fn call(&self, target: UnitKey, request: &CallRequest) -> CallResponse {
        if let Some(bush) = self.directory.resolve(target) {
            return bush.call_request(target, request);
        }
        match &self.remote {
            Some(remote) => remote.call(target, request),
            None => Fault::from_error(&CallError::UnitNotFound(target).into())
                .with_frame(format!("local {target}"))
                .into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProxySettings {
    pub sample_rate: f32,
    /// `n` de cada `read_next`.
    pub prefetch: u32,
    /// Bloque que toma el merge de cada upstream antes de pasar al siguiente.
    pub partition_size: u32,
}

/* --------- Streaming --------- */

/// Lee una unidad remota como iterador. Abre el cursor en la primera lectura.
pub struct StreamingProxy {
    caller: Arc<dyn UnitCaller>,
    target: UnitKey,
    partition: u32,
    settings: ProxySettings,
    cursor: Option<i64>,
    batch: VecDeque<Value>,
    done: bool,
}

impl StreamingProxy {
    pub fn new(
        caller: Arc<dyn UnitCaller>,
        target: UnitKey,
        partition: u32,
        settings: ProxySettings,
    ) -> Self {
        Self {
            caller,
            target,
            partition,
            settings,
            cursor: None,
            batch: VecDeque::new(),
            done: false,
        }
    }

    fn open(&self) -> Result<i64> {
        let request = CallRequest::new("open_cursor")
            .arg("sample_rate", self.settings.sample_rate)
            .arg("partition", self.partition);
        match self.caller.call(self.target, &request) {
            CallResponse::Value(Value::Int64(id)) => {
                debug!(
                    "proxy: cursor {id} abierto en {} para la partición {}",
                    self.target, self.partition
                );
                Ok(id)
            }
            CallResponse::Fault(fault) => Err(anyhow::Error::new(fault)
                .context(format!("abriendo cursor en {}", self.target))),
            other => Err(CallError::UnexpectedResponse {
                unit: self.target,
                detail: format!("open_cursor devolvió {other:?}"),
            }
            .into()),
        }
    }

    /// Trae el próximo lote. `Ok(false)` cuando el upstream terminó.
    fn fetch(&mut self) -> Result<bool> {
        let cursor = match self.cursor {
            Some(id) => id,
            None => {
                let id = self.open()?;
                self.cursor = Some(id);
                id
            }
        };
        let request = CallRequest::new("read_next")
            .arg("cursor", cursor)
            .arg("n", self.settings.prefetch.max(1));

        let mut backoff = EMPTY_BACKOFF_MIN;
        loop {
            match self.caller.call(self.target, &request) {
                CallResponse::List(values) if values.is_empty() => {
                    // vacío transitorio: el upstream todavía no tiene nada para este carril
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(EMPTY_BACKOFF_MAX);
                }
                CallResponse::List(values) => {
                    self.batch.extend(values);
                    return Ok(true);
                }
                CallResponse::Void => return Ok(false),
                CallResponse::Fault(fault) => {
                    return Err(anyhow::Error::new(fault)
                        .context(format!("leyendo de {}", self.target)))
                }
                CallResponse::Value(v) => {
                    return Err(CallError::UnexpectedResponse {
                        unit: self.target,
                        detail: format!("read_next devolvió un valor suelto {v}"),
                    }
                    .into())
                }
            }
        }
    }
}

impl Iterator for StreamingProxy {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(v) = self.batch.pop_front() {
                return Some(Ok(v));
            }
            if self.done {
                return None;
            }
            match self.fetch() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/* --------- Merging --------- */

/// Mezcla varios upstreams tomando `partition_size` elementos de cada uno
/// por turno. Los agotados se saltean; termina cuando se agotan todos.
pub struct MergingProxy {
    upstreams: Vec<StreamingProxy>,
    exhausted: Vec<bool>,
    active: usize,
    taken: u32,
    partition_size: u32,
}

impl MergingProxy {
    pub fn new(upstreams: Vec<StreamingProxy>, partition_size: u32) -> Self {
        let exhausted = vec![false; upstreams.len()];
        Self {
            upstreams,
            exhausted,
            active: 0,
            taken: 0,
            partition_size: partition_size.max(1),
        }
    }

    fn advance(&mut self) {
        self.active = (self.active + 1) % self.upstreams.len();
        self.taken = 0;
    }
}

impl Iterator for MergingProxy {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.exhausted.iter().any(|done| !done) {
            if self.exhausted[self.active] {
                self.advance();
                continue;
            }
            match self.upstreams[self.active].next() {
                Some(Ok(value)) => {
                    self.taken += 1;
                    if self.taken >= self.partition_size {
                        self.advance();
                    }
                    return Some(Ok(value));
                }
                Some(Err(e)) => {
                    self.exhausted.iter_mut().for_each(|done| *done = true);
                    return Some(Err(e));
                }
                None => {
                    self.exhausted[self.active] = true;
                    self.advance();
                }
            }
        }
        None
    }
}

/// Stream de entrada para un slot según su descriptor.
pub fn input_stream(
    descriptor: &ProxyDescriptor,
    caller: Arc<dyn UnitCaller>,
    settings: ProxySettings,
) -> Result<ElementStream> {
    let mut upstreams: Vec<StreamingProxy> = descriptor
        .upstream
        .iter()
        .map(|target| StreamingProxy::new(caller.clone(), *target, descriptor.partition, settings))
        .collect();

    match (descriptor.kind, upstreams.len()) {
        (_, 0) => Err(anyhow!("el slot {} no tiene upstream", descriptor.slot)),
        (ProxyKind::Streaming, 1) => Ok(Box::new(upstreams.remove(0))),
        _ => Ok(Box::new(MergingProxy::new(upstreams, settings.partition_size))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Upstream falso: cada unidad sirve su lista en lotes de a `n`,
    /// intercalando una respuesta vacía antes de cada lote.
    struct FakeCaller {
        data: HashMap<UnitKey, Vec<Value>>,
        served: Mutex<HashMap<UnitKey, (usize, bool)>>,
        fail: Option<UnitKey>,
    }

    impl FakeCaller {
        fn new(data: Vec<(UnitKey, Vec<i64>)>) -> Self {
            Self {
                data: data
                    .into_iter()
                    .map(|(k, v)| (k, v.into_iter().map(Value::Int64).collect()))
                    .collect(),
                served: Mutex::new(HashMap::new()),
                fail: None,
            }
        }
    }

    impl UnitCaller for FakeCaller {
        fn call(&self, target: UnitKey, request: &CallRequest) -> CallResponse {
            if self.fail == Some(target) {
                return Fault::new("PodError", "roto").into();
            }
            let Some(data) = self.data.get(&target) else {
                return Fault::new("CallError", "no existe").into();
            };
            match request.method.as_str() {
                "open_cursor" => CallResponse::Value(Value::Int64(1)),
                "read_next" => {
                    let n: usize = request.args[1].1.parse().unwrap();
                    let mut served = self.served.lock();
                    let (pos, gave_empty) = served.entry(target).or_insert((0, false));
                    if *pos >= data.len() {
                        return CallResponse::Void;
                    }
                    if !*gave_empty {
                        *gave_empty = true;
                        return CallResponse::List(vec![]);
                    }
                    *gave_empty = false;
                    let end = (*pos + n).min(data.len());
                    let batch = data[*pos..end].to_vec();
                    *pos = end;
                    CallResponse::List(batch)
                }
                _ => CallResponse::Void,
            }
        }
    }

    fn settings(prefetch: u32, partition_size: u32) -> ProxySettings {
        ProxySettings {
            sample_rate: 44_100.0,
            prefetch,
            partition_size,
        }
    }

    fn values(stream: impl Iterator<Item = Result<Value>>) -> Vec<i64> {
        stream
            .map(|v| v.unwrap().as_i64().unwrap())
            .collect()
    }

    #[test]
    fn streaming_reintenta_vacios_y_termina_con_void() {
        let caller = Arc::new(FakeCaller::new(vec![(UnitKey::new(1, 0), (0..7).collect())]));
        let proxy = StreamingProxy::new(caller, UnitKey::new(1, 0), 0, settings(3, 1));
        assert_eq!(values(proxy), (0..7).collect::<Vec<_>>());
    }

    /// Responde `empties` listas vacías seguidas antes del único lote.
    struct SlowCaller {
        empties: usize,
        calls: Mutex<usize>,
    }

    impl UnitCaller for SlowCaller {
        fn call(&self, _target: UnitKey, request: &CallRequest) -> CallResponse {
            if request.method == "open_cursor" {
                return CallResponse::Value(Value::Int64(1));
            }
            let mut calls = self.calls.lock();
            *calls += 1;
            match (*calls).cmp(&(self.empties + 1)) {
                std::cmp::Ordering::Less => CallResponse::List(vec![]),
                std::cmp::Ordering::Equal => CallResponse::List(vec![Value::Int64(42)]),
                std::cmp::Ordering::Greater => CallResponse::Void,
            }
        }
    }

    #[test]
    fn vacios_seguidos_esperan_con_backoff() {
        let caller = Arc::new(SlowCaller {
            empties: 10,
            calls: Mutex::new(0),
        });
        let proxy = StreamingProxy::new(caller.clone(), UnitKey::new(1, 0), 0, settings(3, 1));

        let started = std::time::Instant::now();
        assert_eq!(values(proxy), vec![42]);
        let elapsed = started.elapsed();

        // 50µs duplicando hasta 5ms: diez esperas suman ~21ms
        assert!(elapsed >= Duration::from_millis(15), "{elapsed:?}");
        assert_eq!(*caller.calls.lock(), 12);
    }

    #[test]
    fn merge_por_bloques_reconstruye_el_orden() {
        // carril 0: bloques 0,2,4 de tamaño 2; carril 1: bloques 1,3
        let caller: Arc<dyn UnitCaller> = Arc::new(FakeCaller::new(vec![
            (UnitKey::new(4, 0), vec![0, 1, 4, 5, 8, 9]),
            (UnitKey::new(4, 1), vec![2, 3, 6, 7]),
        ]));
        let desc = ProxyDescriptor {
            slot: 0,
            kind: ProxyKind::Merging,
            upstream: vec![UnitKey::new(4, 0), UnitKey::new(4, 1)],
            partition: 0,
        };
        let stream = input_stream(&desc, caller, settings(4, 2)).unwrap();
        assert_eq!(values(stream), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn merge_saltea_upstreams_agotados() {
        let caller: Arc<dyn UnitCaller> = Arc::new(FakeCaller::new(vec![
            (UnitKey::new(2, 0), vec![1]),
            (UnitKey::new(2, 1), vec![]),
            (UnitKey::new(2, 2), vec![2, 3, 4]),
        ]));
        let ups = [0, 1, 2]
            .iter()
            .map(|p| StreamingProxy::new(caller.clone(), UnitKey::new(2, *p), 0, settings(8, 1)))
            .collect();
        let merged = MergingProxy::new(ups, 1);
        assert_eq!(values(merged), vec![1, 2, 3, 4]);
    }

    #[test]
    fn fault_del_upstream_es_error_del_stream() {
        let mut fake = FakeCaller::new(vec![(UnitKey::new(1, 0), vec![1, 2])]);
        fake.fail = Some(UnitKey::new(1, 0));
        let mut proxy = StreamingProxy::new(Arc::new(fake), UnitKey::new(1, 0), 0, settings(2, 1));

        let err = proxy.next().unwrap().unwrap_err();
        let fault = err.downcast_ref::<Fault>().unwrap();
        assert_eq!(fault.class, "PodError");
        assert!(proxy.next().is_none());
    }

    #[test]
    fn local_caller_sin_unidad_devuelve_fault() {
        let caller = LocalCaller::new(Directory::new());
        let resp = caller.call(UnitKey::new(5, 0), &CallRequest::new("close"));
        let CallResponse::Fault(fault) = resp else {
            panic!("se esperaba fault");
        };
        assert_eq!(fault.class, "CallError");
    }
}
