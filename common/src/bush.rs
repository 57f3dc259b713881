use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::call::{CallRequest, CallResponse, Fault};
use crate::directory::Directory;
use crate::error::{CallError, DirectoryError};
use crate::graph::UnitKey;
use crate::pod::Pod;

/// Resultado de un paso de una unidad tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    More,
    Done,
}

/// Unidad que avanza por pasos dentro del pool (típicamente un sink).
pub trait TickUnit: Send {
    fn key(&self) -> UnitKey;
    fn step(&mut self) -> Result<Progress>;
    fn close(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    Pending,
    Running,
    Finished,
    Failed,
}

pub type UnitOutcome = std::result::Result<(), Fault>;

/// Se completa una sola vez, cuando la unidad termina o falla.
pub struct UnitFuture {
    key: UnitKey,
    rx: Receiver<UnitOutcome>,
}

impl UnitFuture {
    pub fn key(&self) -> UnitKey {
        self.key
    }

    pub fn wait(self) -> UnitOutcome {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(Fault::new("Cancelled", format!("{} no se completó", self.key))))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<UnitOutcome> {
        self.rx.recv_timeout(timeout).ok()
    }
}

type SharedTick = Arc<Mutex<Box<dyn TickUnit>>>;

struct TickTask {
    key: UnitKey,
    unit: SharedTick,
    done: Sender<UnitOutcome>,
}

enum Job {
    Tick(TickTask),
    Shutdown,
}

/// Lo que comparten los hilos del pool.
struct PoolShared {
    bush_id: String,
    jobs: Sender<Job>,
    draining: AtomicBool,
    states: RwLock<HashMap<UnitKey, UnitState>>,
}

impl PoolShared {
    fn set_state(&self, key: UnitKey, state: UnitState) {
        self.states.write().insert(key, state);
    }

    fn complete(&self, task: TickTask, outcome: UnitOutcome) {
        let state = if outcome.is_ok() {
            UnitState::Finished
        } else {
            UnitState::Failed
        };
        self.set_state(task.key, state);
        if let Err(fault) = &outcome {
            warn!("bush {}: unidad {} falló: {fault}", self.bush_id, task.key);
        } else {
            debug!("bush {}: unidad {} terminó", self.bush_id, task.key);
        }
        let _ = task.done.send(outcome);
    }

    fn run(&self, task: TickTask) {
        let stepped = catch_unwind(AssertUnwindSafe(|| task.unit.lock().step()));
        match stepped {
            Ok(Ok(Progress::More)) if !self.draining.load(Ordering::Acquire) => {
                if let Err(returned) = self.jobs.send(Job::Tick(task)) {
                    if let Job::Tick(task) = returned.0 {
                        self.complete(task, Ok(()));
                    }
                }
            }
            Ok(Ok(_)) => self.complete(task, Ok(())),
            Ok(Err(err)) => {
                let fault = Fault::from_error(&err).with_frame(format!("tick {}", task.key));
                self.complete(task, Err(fault));
            }
            Err(payload) => {
                let fault = Fault::from_panic(payload).with_frame(format!("tick {}", task.key));
                self.complete(task, Err(fault));
            }
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>, rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Tick(task) => shared.run(task),
            Job::Shutdown => break,
        }
    }
}

/// Scheduler de unidades: pods que se leen en el hilo del que llama y
/// unidades tick que se ejecutan en un pool acotado de hilos.
pub struct Bush {
    id: String,
    directory: Arc<Directory>,
    pods: RwLock<HashMap<UnitKey, Arc<Pod>>>,
    ticks: Mutex<Vec<(UnitKey, SharedTick, bool)>>,
    shared: Arc<PoolShared>,
    rx: Receiver<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Bush {
    pub fn new(id: &str, pool_size: usize, directory: Arc<Directory>) -> Result<Arc<Self>> {
        let (tx, rx) = unbounded();
        let shared = Arc::new(PoolShared {
            bush_id: id.to_string(),
            jobs: tx,
            draining: AtomicBool::new(false),
            states: RwLock::new(HashMap::new()),
        });

        let bush = Arc::new(Self {
            id: id.to_string(),
            directory: directory.clone(),
            pods: RwLock::new(HashMap::new()),
            ticks: Mutex::new(Vec::new()),
            shared,
            rx,
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        if let Err(e) = directory.register_scheduler(id, &bush) {
            // nunca quedó registrado: que el drop no toque el directorio
            bush.closed.store(true, Ordering::Release);
            return Err(e.into());
        }

        let pool_size = pool_size.max(1);
        for i in 0..pool_size {
            let shared = bush.shared.clone();
            let rx = bush.rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("{id}-{i}"))
                .spawn(move || worker_loop(shared, rx));
            match spawned {
                Ok(handle) => bush.workers.lock().push(handle),
                Err(e) => {
                    bush.close();
                    return Err(anyhow::Error::new(e).context(format!("lanzando el pool del bush {id}")));
                }
            }
        }

        info!("bush {id} iniciado con {pool_size} hilos");
        Ok(bush)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add_pod(&self, pod: Pod) -> Result<Arc<Pod>, DirectoryError> {
        let key = pod.key();
        self.directory.register_unit(key, &self.id)?;
        let pod = Arc::new(pod);
        self.pods.write().insert(key, pod.clone());
        self.shared.set_state(key, UnitState::Running);
        Ok(pod)
    }

    pub fn add_tick(&self, unit: Box<dyn TickUnit>) -> Result<(), DirectoryError> {
        let key = unit.key();
        self.directory.register_unit(key, &self.id)?;
        self.ticks
            .lock()
            .push((key, Arc::new(Mutex::new(unit)), false));
        self.shared.set_state(key, UnitState::Pending);
        Ok(())
    }

    /// Encola una vez cada unidad tick no iniciada; un future por unidad.
    pub fn start(&self) -> Vec<UnitFuture> {
        let mut futures = Vec::new();
        for (key, unit, started) in self.ticks.lock().iter_mut() {
            if *started {
                continue;
            }
            *started = true;

            let (done, rx) = crossbeam_channel::bounded(1);
            let task = TickTask {
                key: *key,
                unit: unit.clone(),
                done,
            };
            self.shared.set_state(*key, UnitState::Running);
            if let Err(returned) = self.shared.jobs.send(Job::Tick(task)) {
                if let Job::Tick(task) = returned.0 {
                    self.shared.complete(task, Ok(()));
                }
            }
            futures.push(UnitFuture { key: *key, rx });
        }
        info!("bush {}: {} unidades tick en marcha", self.id, futures.len());
        futures
    }

    pub fn state(&self, unit: UnitKey) -> Option<UnitState> {
        self.shared.states.read().get(&unit).copied()
    }

    pub fn units(&self) -> Vec<UnitKey> {
        let mut units: Vec<UnitKey> = self.shared.states.read().keys().copied().collect();
        units.sort_unstable();
        units
    }

    pub fn pod(&self, unit: UnitKey) -> Option<Arc<Pod>> {
        self.pods.read().get(&unit).cloned()
    }

    /// Llamada textual a una unidad. Nunca falla: los errores vuelven como fault.
    pub fn call(&self, unit: UnitKey, request: &str) -> CallResponse {
        match CallRequest::parse(request) {
            Ok(request) => self.call_request(unit, &request),
            Err(e) => Fault::from_error(&e.into())
                .with_frame(format!("bush {}", self.id))
                .into(),
        }
    }

    pub fn call_request(&self, unit: UnitKey, request: &CallRequest) -> CallResponse {
        if let Some(pod) = self.pod(unit) {
            return pod.call(request);
        }
        let err = if self.state(unit).is_some() {
            CallError::NotCallable(unit)
        } else {
            CallError::UnitNotFound(unit)
        };
        Fault::from_error(&err.into())
            .with_frame(format!("bush {}", self.id))
            .into()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drena el pool, cierra las unidades y sale del directorio. Idempotente.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.draining.store(true, Ordering::Release);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for _ in 0..handles.len() {
            let _ = self.shared.jobs.send(Job::Shutdown);
        }
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        // ticks que quedaron encolados después de los Shutdown
        while let Ok(job) = self.rx.try_recv() {
            if let Job::Tick(task) = job {
                self.shared.complete(task, Ok(()));
            }
        }

        for (_, unit, _) in self.ticks.lock().iter() {
            unit.lock().close();
        }
        for pod in self.pods.read().values() {
            pod.close();
        }

        self.directory.remove_scheduler(&self.id);
        info!("bush {} cerrado", self.id);
    }
}

impl Drop for Bush {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Value;
    use crate::pod::PodSettings;
    use crate::transforms::ElementStream;
    use std::sync::atomic::AtomicUsize;

    struct Countdown {
        key: UnitKey,
        left: usize,
        steps: Arc<AtomicUsize>,
    }

    impl TickUnit for Countdown {
        fn key(&self) -> UnitKey {
            self.key
        }

        fn step(&mut self) -> Result<Progress> {
            self.steps.fetch_add(1, Ordering::SeqCst);
            if self.left == 0 {
                return Ok(Progress::Done);
            }
            self.left -= 1;
            Ok(Progress::More)
        }
    }

    struct Explodes(UnitKey, bool);

    impl TickUnit for Explodes {
        fn key(&self) -> UnitKey {
            self.0
        }

        fn step(&mut self) -> Result<Progress> {
            if self.1 {
                panic!("tick roto");
            }
            anyhow::bail!("falla controlada")
        }
    }

    #[test]
    fn ticks_se_reencolan_hasta_terminar() {
        let dir = Directory::new();
        let bush = Bush::new("b1", 2, dir.clone()).unwrap();
        let steps = Arc::new(AtomicUsize::new(0));

        for node in 1..=3 {
            bush.add_tick(Box::new(Countdown {
                key: UnitKey::new(node, 0),
                left: 5,
                steps: steps.clone(),
            }))
            .unwrap();
        }
        let futures = bush.start();
        assert_eq!(futures.len(), 3);
        for f in futures {
            let key = f.key();
            assert_eq!(f.wait(), Ok(()));
            assert_eq!(bush.state(key), Some(UnitState::Finished));
        }
        assert_eq!(steps.load(Ordering::SeqCst), 3 * 6);

        // start no vuelve a lanzar lo ya iniciado
        assert!(bush.start().is_empty());
        bush.close();
    }

    #[test]
    fn errores_y_panics_se_vuelven_faults() {
        let bush = Bush::new("b2", 1, Directory::new()).unwrap();
        bush.add_tick(Box::new(Explodes(UnitKey::new(1, 0), false))).unwrap();
        bush.add_tick(Box::new(Explodes(UnitKey::new(2, 0), true))).unwrap();

        let outcomes: Vec<UnitOutcome> = bush.start().into_iter().map(|f| f.wait()).collect();
        let classes: Vec<String> = outcomes
            .into_iter()
            .map(|o| o.unwrap_err().class)
            .collect();
        assert_eq!(classes, vec!["Error".to_string(), "Panic".to_string()]);
        assert_eq!(bush.state(UnitKey::new(2, 0)), Some(UnitState::Failed));
        bush.close();
    }

    #[test]
    fn call_enruta_a_pods_y_nunca_falla() {
        let dir = Directory::new();
        let bush = Bush::new("b3", 1, dir.clone()).unwrap();
        let key = UnitKey::new(10, 0);
        bush.add_pod(Pod::new(
            key,
            Box::new(|_| Ok(Box::new((0..3).map(|v| Ok(Value::Int32(v)))) as ElementStream)),
            PodSettings::default(),
        ))
        .unwrap();

        let cursor = match bush.call(key, "open_cursor?sample_rate=8000&partition=0") {
            CallResponse::Value(Value::Int64(id)) => id,
            other => panic!("respuesta inesperada {other:?}"),
        };
        assert_eq!(
            bush.call(key, &format!("read_next?cursor={cursor}&n=5")),
            CallResponse::List(vec![Value::Int32(0), Value::Int32(1), Value::Int32(2)])
        );

        assert!(bush.call(UnitKey::new(99, 0), "close").is_fault());
        assert!(bush.call(key, "").is_fault());
        assert!(Arc::ptr_eq(&dir.resolve(key).unwrap(), &bush));
    }

    #[test]
    fn close_es_idempotente_y_sale_del_directorio() {
        let dir = Directory::new();
        let bush = Bush::new("b4", 3, dir.clone()).unwrap();
        let steps = Arc::new(AtomicUsize::new(0));
        bush.add_tick(Box::new(Countdown {
            key: UnitKey::new(1, 0),
            left: usize::MAX,
            steps,
        }))
        .unwrap();
        let future = bush.start().remove(0);

        bush.close();
        bush.close();

        // una unidad interminable se completa igual al drenar
        assert_eq!(future.wait_timeout(Duration::from_secs(5)), Some(Ok(())));
        assert!(bush.is_closed());
        assert!(dir.lookup_unit(UnitKey::new(1, 0)).is_none());
        assert!(dir.lookup_scheduler("b4").is_none());
        assert!(Bush::new("b4", 1, dir).is_ok());
    }
}
