use thiserror::Error;

use crate::graph::{NodeId, PartitionId, UnitKey};

/// Errores de construcción del plan (partition / fuse / build).
/// Son fatales: un grafo mal formado nunca se despliega.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("el link {from}@{from_partition} -> {to}@{to_partition} apunta a un nodo inexistente")]
    DanglingLink {
        from: NodeId,
        to: NodeId,
        from_partition: PartitionId,
        to_partition: PartitionId,
    },

    #[error("link duplicado {from} -> {to} (order={order})")]
    DuplicateLink { from: NodeId, to: NodeId, order: u32 },

    #[error("nodo duplicado {0}")]
    DuplicateNode(UnitKey),

    #[error("tipo de nodo desconocido: {0}")]
    UnknownType(String),

    #[error("el nodo {node} espera {expected} entradas pero tiene los slots {found:?}")]
    ArityMismatch {
        node: UnitKey,
        expected: usize,
        found: Vec<u32>,
    },

    #[error("el sink {0} no puede ser origen de un link")]
    SinkAsProducer(NodeId),

    #[error("cantidad de particiones inválida: {0}")]
    InvalidPartitionCount(u32),

    #[error("el nodo {0} tiene varios productores y varios consumidores; no hay política de particionado")]
    AmbiguousPartitioning(NodeId),

    #[error("la unidad {0} reparte su salida pero alimenta consumidores que no cubren todas las particiones")]
    MixedFanOut(UnitKey),

    #[error("el grupo fusionado {0} no tiene nodos internos")]
    EmptyGroup(UnitKey),
}

/// Violaciones de contrato dentro de un pod.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PodError {
    #[error("cursor desconocido {cursor} en el pod {unit}")]
    UnknownCursor { unit: UnitKey, cursor: i64 },

    #[error("no se pudo tomar el lock del cursor {cursor} en el pod {unit} dentro de {timeout_ms} ms")]
    CursorLockTimeout {
        unit: UnitKey,
        cursor: i64,
        timeout_ms: u64,
    },

    #[error("la partición {partition} está fuera del fan-out {fan_out} del pod {unit}")]
    LaneOutOfRange {
        unit: UnitKey,
        partition: u32,
        fan_out: u32,
    },

    #[error("el pod {0} está cerrado")]
    Closed(UnitKey),

    #[error("la secuencia del pod {unit} falló antes: {message}")]
    SourceFailed { unit: UnitKey, message: String },
}

/// Errores en el borde de llamadas (parseo y despacho).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CallError {
    #[error("request vacío")]
    EmptyRequest,

    #[error("método desconocido: {0}")]
    UnknownMethod(String),

    #[error("falta el parámetro {0}")]
    MissingParam(String),

    #[error("parámetro no declarado: {0}")]
    UnknownParam(String),

    #[error("valor inválido para {name}: {value:?} (se esperaba {expected})")]
    InvalidParam {
        name: String,
        value: String,
        expected: String,
    },

    #[error("unidad no encontrada: {0}")]
    UnitNotFound(UnitKey),

    #[error("la unidad {0} no acepta llamadas")]
    NotCallable(UnitKey),

    #[error("respuesta inesperada de {unit}: {detail}")]
    UnexpectedResponse { unit: UnitKey, detail: String },
}

/// Errores de configuración del directorio de unidades.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DirectoryError {
    #[error("la unidad {0} ya está registrada")]
    UnitAlreadyRegistered(UnitKey),

    #[error("el scheduler {0} ya está registrado")]
    SchedulerAlreadyRegistered(String),
}
