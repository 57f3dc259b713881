use anyhow::{anyhow, Result};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::call::{CallRequest, CallResponse, CallTable, ParamKind, ParamSpec, Params, Value};
use crate::error::{CallError, PodError};
use crate::graph::UnitKey;
use crate::transforms::ElementStream;

/// Crea la secuencia compartida la primera vez que se abre un cursor.
/// Recibe el sample rate pedido por ese primer lector.
pub type StreamOpener = Box<dyn FnOnce(f32) -> Result<ElementStream> + Send>;

#[derive(Debug, Clone, PartialEq)]
pub struct PodSettings {
    /// Carriles entre los que se reparte la salida (1 = todos ven todo).
    pub fan_out: u32,
    /// Elementos consecutivos que van a un mismo carril.
    pub partition_size: u32,
    pub lock_timeout: Duration,
    /// Lectores esperados por carril; hasta que se conectan todos, el pod
    /// guarda lo producido para que el que llega tarde no pierda elementos.
    pub readers: u32,
}

impl Default for PodSettings {
    fn default() -> Self {
        Self {
            fan_out: 1,
            partition_size: 1,
            lock_timeout: Duration::from_secs(5),
            readers: 1,
        }
    }
}

enum SourceState {
    Pending(StreamOpener),
    Ready(ElementStream),
    Exhausted,
    Failed(String),
    Closed,
}

/// Registro de lo producido para un carril mientras faltan lectores.
struct LaneLog {
    joined: u32,
    replay: Option<VecDeque<Value>>,
}

struct Source {
    state: SourceState,
    /// Carril que recibe el próximo elemento.
    lane: u32,
    in_block: u32,
    lanes: Vec<LaneLog>,
}

struct Cursor {
    lane: u32,
    /// Serializa lectores del mismo cursor (espera acotada).
    reader: Mutex<()>,
    buffer: Mutex<VecDeque<Value>>,
}

/// Unidad que expone una secuencia compartida a varios cursores.
///
/// Orden de locks: lector del cursor -> fuente -> buffers.
pub struct Pod {
    key: UnitKey,
    settings: PodSettings,
    source: Mutex<Source>,
    cursors: RwLock<HashMap<i64, Arc<Cursor>>>,
    next_cursor: AtomicI64,
    closed: AtomicBool,
}

impl Pod {
    pub fn new(key: UnitKey, opener: StreamOpener, settings: PodSettings) -> Self {
        let settings = PodSettings {
            fan_out: settings.fan_out.max(1),
            partition_size: settings.partition_size.max(1),
            ..settings
        };
        let lanes = (0..settings.fan_out)
            .map(|_| LaneLog {
                joined: 0,
                replay: (settings.readers > 0).then(VecDeque::new),
            })
            .collect();

        Self {
            key,
            settings,
            source: Mutex::new(Source {
                state: SourceState::Pending(opener),
                lane: 0,
                in_block: 0,
                lanes,
            }),
            cursors: RwLock::new(HashMap::new()),
            next_cursor: AtomicI64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> UnitKey {
        self.key
    }

    pub fn fan_out(&self) -> u32 {
        self.settings.fan_out
    }

    fn ensure_open(&self) -> Result<(), PodError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PodError::Closed(self.key));
        }
        Ok(())
    }

    /// Abre un cursor para `partition`. La primera apertura crea la secuencia.
    pub fn open_cursor(&self, sample_rate: f32, partition: u32) -> Result<i64> {
        self.ensure_open()?;

        let fan_out = self.settings.fan_out;
        if fan_out > 1 && partition >= fan_out {
            return Err(PodError::LaneOutOfRange {
                unit: self.key,
                partition,
                fan_out,
            }
            .into());
        }
        let lane = if fan_out > 1 { partition } else { 0 };

        // Se mantiene el lock de la fuente mientras se inserta el cursor:
        // ningún elemento puede quedar entre el replay y el registro.
        let mut source = self.source.lock();
        if let SourceState::Pending(_) = source.state {
            let pending = std::mem::replace(&mut source.state, SourceState::Closed);
            let opened = match pending {
                SourceState::Pending(opener) => opener(sample_rate),
                _ => Err(anyhow!("pod {}: estado de la secuencia inconsistente", self.key)),
            };
            match opened {
                Ok(stream) => {
                    info!("pod {}: secuencia creada (sample_rate={sample_rate})", self.key);
                    source.state = SourceState::Ready(stream);
                }
                Err(e) => {
                    warn!("pod {}: no se pudo crear la secuencia: {e:#}", self.key);
                    source.state = SourceState::Failed(format!("{e:#}"));
                    return Err(e.context(format!("abriendo la secuencia de {}", self.key)));
                }
            }
        }
        if let SourceState::Closed = source.state {
            return Err(PodError::Closed(self.key).into());
        }

        let readers = self.settings.readers;
        let log = &mut source.lanes[lane as usize];
        log.joined += 1;
        let initial = log.replay.clone().unwrap_or_default();
        if log.joined >= readers {
            log.replay = None;
        }

        let id = self.next_cursor.fetch_add(1, Ordering::Relaxed);
        self.cursors.write().insert(
            id,
            Arc::new(Cursor {
                lane,
                reader: Mutex::new(()),
                buffer: Mutex::new(initial),
            }),
        );
        drop(source);

        debug!("pod {}: cursor {id} abierto en carril {lane}", self.key);
        Ok(id)
    }

    fn cursor(&self, id: i64) -> Result<Arc<Cursor>, PodError> {
        self.cursors
            .read()
            .get(&id)
            .cloned()
            .ok_or(PodError::UnknownCursor {
                unit: self.key,
                cursor: id,
            })
    }

    /// Hasta `n` elementos para el cursor. `None` sólo cuando su buffer está
    /// vacío y la secuencia terminó; una lista vacía significa "todavía nada".
    pub fn read_next(&self, id: i64, n: usize) -> Result<Option<Vec<Value>>> {
        self.ensure_open()?;
        let cursor = self.cursor(id)?;

        let timeout = self.settings.lock_timeout;
        let _reader = cursor
            .reader
            .try_lock_for(timeout)
            .ok_or(PodError::CursorLockTimeout {
                unit: self.key,
                cursor: id,
                timeout_ms: timeout.as_millis() as u64,
            })?;

        let buffered = cursor.buffer.lock().len();
        let mut finished = false;
        if buffered < n {
            let want = n * self.settings.fan_out as usize - buffered;
            finished = self.refill(want)?;
        }

        let mut buffer = cursor.buffer.lock();
        if buffer.is_empty() && finished {
            return Ok(None);
        }
        let take = n.min(buffer.len());
        Ok(Some(buffer.drain(..take).collect()))
    }

    /// Avanza la secuencia hasta `want` veces repartiendo cada elemento a los
    /// cursores de su carril. Devuelve `true` si la secuencia ya terminó.
    fn refill(&self, want: usize) -> Result<bool> {
        let mut source = self.source.lock();
        let fan_out = self.settings.fan_out;

        let targets: Vec<Vec<Arc<Cursor>>> = {
            let cursors = self.cursors.read();
            (0..fan_out)
                .map(|lane| {
                    cursors
                        .values()
                        .filter(|c| c.lane == lane)
                        .cloned()
                        .collect()
                })
                .collect()
        };

        let mut produced = 0usize;
        while produced < want {
            let Source {
                state,
                lane,
                in_block,
                lanes,
            } = &mut *source;

            let stream = match state {
                SourceState::Ready(stream) => stream,
                SourceState::Exhausted => return Ok(true),
                SourceState::Failed(message) => {
                    return Err(PodError::SourceFailed {
                        unit: self.key,
                        message: message.clone(),
                    }
                    .into())
                }
                SourceState::Closed => return Err(PodError::Closed(self.key).into()),
                SourceState::Pending(_) => {
                    return Err(anyhow!("pod {}: secuencia sin abrir", self.key))
                }
            };

            match stream.next() {
                Some(Ok(value)) => {
                    let current = *lane as usize;
                    if let Some(replay) = lanes[current].replay.as_mut() {
                        replay.push_back(value.clone());
                    }
                    for cursor in &targets[current] {
                        cursor.buffer.lock().push_back(value.clone());
                    }
                    *in_block += 1;
                    if *in_block >= self.settings.partition_size {
                        *in_block = 0;
                        *lane = (*lane + 1) % fan_out;
                    }
                    produced += 1;
                }
                Some(Err(e)) => {
                    warn!("pod {}: la secuencia falló: {e:#}", self.key);
                    *state = SourceState::Failed(format!("{e:#}"));
                    return Err(e.context(format!("avanzando la secuencia de {}", self.key)));
                }
                None => {
                    debug!("pod {}: secuencia agotada", self.key);
                    *state = SourceState::Exhausted;
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    pub fn cursor_count(&self) -> usize {
        self.cursors.read().len()
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.source.lock().state, SourceState::Exhausted)
    }

    pub fn buffered(&self, id: i64) -> Result<usize, PodError> {
        Ok(self.cursor(id)?.buffer.lock().len())
    }

    /// Idempotente; libera la secuencia y los cursores.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.source.lock().state = SourceState::Closed;
        self.cursors.write().clear();
        info!("pod {} cerrado", self.key);
    }

    /// Punto de entrada del borde de llamadas; nunca falla.
    pub fn call(&self, request: &CallRequest) -> CallResponse {
        pod_table().dispatch(self, request, &format!("pod {}", self.key))
    }
}

/* --------- Tabla de métodos del pod --------- */

static OPEN_CURSOR: [ParamSpec; 2] = [
    ParamSpec::new("sample_rate", ParamKind::Float32),
    ParamSpec::new("partition", ParamKind::Int32),
];
static READ_NEXT: [ParamSpec; 2] = [
    ParamSpec::new("cursor", ParamKind::Int64),
    ParamSpec::new("n", ParamKind::Int32),
];
static BUFFERED: [ParamSpec; 2] = [
    ParamSpec::new("cursor", ParamKind::Int64),
    ParamSpec::new("unit", ParamKind::Enum(&["elements", "blocks"])),
];

pub fn pod_table() -> &'static CallTable<Pod> {
    static TABLE: OnceLock<CallTable<Pod>> = OnceLock::new();
    TABLE.get_or_init(|| {
        CallTable::new()
            .method("open_cursor", &OPEN_CURSOR, call_open_cursor)
            .method("read_next", &READ_NEXT, call_read_next)
            .method("close", &[], call_close)
            .method("cursor_count", &[], call_cursor_count)
            .method("is_exhausted", &[], call_is_exhausted)
            .method("buffered", &BUFFERED, call_buffered)
    })
}

fn non_negative(name: &str, value: i32) -> Result<u32, CallError> {
    u32::try_from(value).map_err(|_| CallError::InvalidParam {
        name: name.to_string(),
        value: value.to_string(),
        expected: "entero no negativo".to_string(),
    })
}

fn call_open_cursor(pod: &Pod, params: &Params) -> Result<CallResponse> {
    let sample_rate = params.f32("sample_rate")?;
    let partition = non_negative("partition", params.i32("partition")?)?;
    let id = pod.open_cursor(sample_rate, partition)?;
    Ok(CallResponse::Value(Value::Int64(id)))
}

fn call_read_next(pod: &Pod, params: &Params) -> Result<CallResponse> {
    let cursor = params.i64("cursor")?;
    let n = non_negative("n", params.i32("n")?)?.max(1);
    Ok(match pod.read_next(cursor, n as usize)? {
        Some(values) => CallResponse::List(values),
        None => CallResponse::Void,
    })
}

fn call_close(pod: &Pod, _: &Params) -> Result<CallResponse> {
    pod.close();
    Ok(CallResponse::Void)
}

fn call_cursor_count(pod: &Pod, _: &Params) -> Result<CallResponse> {
    let count = i32::try_from(pod.cursor_count())?;
    Ok(CallResponse::Value(Value::Int32(count)))
}

fn call_is_exhausted(pod: &Pod, _: &Params) -> Result<CallResponse> {
    Ok(CallResponse::Value(Value::Bool(pod.is_exhausted())))
}

fn call_buffered(pod: &Pod, params: &Params) -> Result<CallResponse> {
    let elements = pod.buffered(params.i64("cursor")?)?;
    let size = pod.settings.partition_size as usize;
    let count = match params.enumeration("unit")? {
        "blocks" => elements.div_ceil(size),
        _ => elements,
    };
    Ok(CallResponse::Value(Value::Int64(i64::try_from(count)?)))
}
