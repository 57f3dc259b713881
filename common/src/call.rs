use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    str::FromStr,
};
use thiserror::Error;
use tracing::warn;

use crate::error::{CallError, DirectoryError, GraphError, PodError};

/// Profundidad máxima de la cadena de causas de un `Fault`.
pub const MAX_FAULT_DEPTH: usize = 10;

/* --------- Valores --------- */

/// Elemento que circula por los streams y por el borde de llamadas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Bool(bool),
    Enum(String),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float32(_) => "float32",
            Value::Bool(_) => "bool",
            Value::Enum(_) => "enum",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(f64::from(*v)),
            Value::Int64(v) => Some(*v as f64),
            Value::Float32(v) => Some(f64::from(*v)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float32(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Enum(v) => write!(f, "{v}"),
        }
    }
}

/* --------- Parámetros declarados --------- */

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamKind {
    Int32,
    Int64,
    Float32,
    Bool,
    /// Conjunto fijo de constantes.
    Enum(&'static [&'static str]),
}

impl ParamKind {
    fn describe(&self) -> String {
        match self {
            ParamKind::Int32 => "int32".to_string(),
            ParamKind::Int64 => "int64".to_string(),
            ParamKind::Float32 => "float32".to_string(),
            ParamKind::Bool => "bool".to_string(),
            ParamKind::Enum(options) => format!("uno de {options:?}"),
        }
    }

    /// Convierte el texto del request según el tipo declarado.
    pub fn convert(&self, name: &str, raw: &str) -> Result<Value, CallError> {
        let invalid = || CallError::InvalidParam {
            name: name.to_string(),
            value: raw.to_string(),
            expected: self.describe(),
        };
        let raw = raw.trim();
        match self {
            ParamKind::Int32 => raw.parse().map(Value::Int32).map_err(|_| invalid()),
            ParamKind::Int64 => raw.parse().map(Value::Int64).map_err(|_| invalid()),
            ParamKind::Float32 => raw.parse().map(Value::Float32).map_err(|_| invalid()),
            ParamKind::Bool => raw.parse().map(Value::Bool).map_err(|_| invalid()),
            ParamKind::Enum(options) => options
                .iter()
                .find(|o| o.eq_ignore_ascii_case(raw))
                .map(|o| Value::Enum(o.to_string()))
                .ok_or_else(invalid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
}

impl ParamSpec {
    pub const fn new(name: &'static str, kind: ParamKind) -> Self {
        Self { name, kind }
    }
}

/// Argumentos ya convertidos de una llamada.
#[derive(Debug, Default)]
pub struct Params {
    values: HashMap<&'static str, Value>,
}

impl Params {
    /// Asocia los argumentos del request a los parámetros declarados.
    /// Los posicionales se toman en el orden de declaración.
    pub fn bind(specs: &[ParamSpec], request: &CallRequest) -> Result<Self, CallError> {
        let mut values = HashMap::new();
        for (index, (name, raw)) in request.args.iter().enumerate() {
            let spec = match name {
                Some(name) => specs
                    .iter()
                    .find(|s| s.name == name)
                    .ok_or_else(|| CallError::UnknownParam(name.clone()))?,
                None => specs
                    .get(index)
                    .ok_or_else(|| CallError::UnknownParam(format!("#{index}")))?,
            };
            values.insert(spec.name, spec.kind.convert(spec.name, raw)?);
        }
        for spec in specs {
            if !values.contains_key(spec.name) {
                return Err(CallError::MissingParam(spec.name.to_string()));
            }
        }
        Ok(Self { values })
    }

    fn get(&self, name: &str) -> Result<&Value, CallError> {
        self.values
            .get(name)
            .ok_or_else(|| CallError::MissingParam(name.to_string()))
    }

    fn mismatch(&self, name: &str, expected: &str) -> CallError {
        CallError::InvalidParam {
            name: name.to_string(),
            value: self
                .values
                .get(name)
                .map(|v| v.to_string())
                .unwrap_or_default(),
            expected: expected.to_string(),
        }
    }

    pub fn i32(&self, name: &str) -> Result<i32, CallError> {
        match self.get(name)? {
            Value::Int32(v) => Ok(*v),
            _ => Err(self.mismatch(name, "int32")),
        }
    }

    pub fn i64(&self, name: &str) -> Result<i64, CallError> {
        match self.get(name)? {
            Value::Int64(v) => Ok(*v),
            _ => Err(self.mismatch(name, "int64")),
        }
    }

    pub fn f32(&self, name: &str) -> Result<f32, CallError> {
        match self.get(name)? {
            Value::Float32(v) => Ok(*v),
            _ => Err(self.mismatch(name, "float32")),
        }
    }

    pub fn bool(&self, name: &str) -> Result<bool, CallError> {
        match self.get(name)? {
            Value::Bool(v) => Ok(*v),
            _ => Err(self.mismatch(name, "bool")),
        }
    }

    pub fn enumeration(&self, name: &str) -> Result<&str, CallError> {
        match self.get(name)? {
            Value::Enum(v) => Ok(v.as_str()),
            _ => Err(self.mismatch(name, "enum")),
        }
    }
}

/* --------- Requests --------- */

/// Request textual: `method?k1=v1&k2=v2` (o posicional `method?v1&v2`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub method: String,
    pub args: Vec<(Option<String>, String)>,
}

impl CallRequest {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, name: &str, value: impl ToString) -> Self {
        self.args.push((Some(name.to_string()), value.to_string()));
        self
    }

    pub fn positional(mut self, value: impl ToString) -> Self {
        self.args.push((None, value.to_string()));
        self
    }

    pub fn parse(raw: &str) -> Result<Self, CallError> {
        let raw = raw.trim();
        let (method, query) = match raw.split_once('?') {
            Some((method, query)) => (method, query),
            None => (raw, ""),
        };
        if method.is_empty() {
            return Err(CallError::EmptyRequest);
        }

        let args = query
            .split('&')
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((name, value)) => (Some(name.to_string()), value.to_string()),
                None => (None, part.to_string()),
            })
            .collect();

        Ok(Self {
            method: method.to_string(),
            args,
        })
    }
}

impl fmt::Display for CallRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.method)?;
        for (i, (name, value)) in self.args.iter().enumerate() {
            f.write_str(if i == 0 { "?" } else { "&" })?;
            match name {
                Some(name) => write!(f, "{name}={value}")?,
                None => f.write_str(value)?,
            }
        }
        Ok(())
    }
}

impl FromStr for CallRequest {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CallRequest::parse(s)
    }
}

/* --------- Respuestas y faults --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallResponse {
    Void,
    Value(Value),
    List(Vec<Value>),
    Fault(Fault),
}

impl CallResponse {
    pub fn is_fault(&self) -> bool {
        matches!(self, CallResponse::Fault(_))
    }
}

impl From<Fault> for CallResponse {
    fn from(fault: Fault) -> Self {
        CallResponse::Fault(fault)
    }
}

/// Error serializable que cruza el borde de llamadas.
/// Es un `Error` en sí mismo, así que un fault remoto puede viajar dentro de
/// `anyhow::Error` y volver a capturarse con su clase original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{class}: {message}")]
pub struct Fault {
    pub class: String,
    pub message: String,
    /// Recorrido de la llamada (unidad y método) por donde pasó el fault.
    #[serde(default)]
    pub frames: Vec<String>,
    #[serde(default)]
    #[source]
    pub cause: Option<Box<Fault>>,
}

impl Fault {
    pub fn new(class: &str, message: impl Into<String>) -> Self {
        Self {
            class: class.to_string(),
            message: message.into(),
            frames: Vec::new(),
            cause: None,
        }
    }

    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.frames.push(frame.into());
        self
    }

    /// Cantidad de niveles, contando este.
    pub fn depth(&self) -> usize {
        1 + self.cause.as_ref().map(|c| c.depth()).unwrap_or(0)
    }

    /// Convierte la cadena de un `anyhow::Error` en faults anidados.
    /// Si en la cadena aparece un `Fault` (ej: uno remoto) se conserva tal cual.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let mut levels: Vec<Fault> = Vec::new();
        for cause in err.chain() {
            if let Some(fault) = cause.downcast_ref::<Fault>() {
                levels.push(fault.clone());
                break;
            }
            levels.push(Fault::new(classify(cause), cause.to_string()));
        }

        let mut fault = levels
            .into_iter()
            .rev()
            .reduce(|cause, mut outer| {
                outer.cause = Some(Box::new(cause));
                outer
            })
            .unwrap_or_else(|| Fault::new("Error", err.to_string()));
        fault.truncate(MAX_FAULT_DEPTH);
        fault
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic sin mensaje".to_string()
        };
        Fault::new("Panic", message)
    }

    fn truncate(&mut self, max_depth: usize) {
        if max_depth <= 1 {
            self.cause = None;
        } else if let Some(cause) = self.cause.as_mut() {
            cause.truncate(max_depth - 1);
        }
    }
}

fn classify(err: &(dyn std::error::Error + 'static)) -> &'static str {
    if err.is::<GraphError>() {
        "GraphError"
    } else if err.is::<PodError>() {
        "PodError"
    } else if err.is::<CallError>() {
        "CallError"
    } else if err.is::<DirectoryError>() {
        "DirectoryError"
    } else if err.is::<std::io::Error>() {
        "IoError"
    } else {
        "Error"
    }
}

/* --------- Tabla de métodos --------- */

pub type Handler<T> = fn(&T, &Params) -> anyhow::Result<CallResponse>;

struct Method<T> {
    params: &'static [ParamSpec],
    handler: Handler<T>,
}

/// Tabla explícita nombre -> (parámetros, handler) para un tipo de unidad.
/// Se arma una sola vez por tipo.
pub struct CallTable<T> {
    methods: HashMap<&'static str, Method<T>>,
}

impl<T> Default for CallTable<T> {
    fn default() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }
}

impl<T> CallTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(
        mut self,
        name: &'static str,
        params: &'static [ParamSpec],
        handler: Handler<T>,
    ) -> Self {
        self.methods.insert(name, Method { params, handler });
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn params(&self, name: &str) -> Option<&'static [ParamSpec]> {
        self.methods.get(name).map(|m| m.params)
    }

    /// Ejecuta el request sobre `target`. Nunca devuelve error ni propaga
    /// panics: ambos vuelven como `CallResponse::Fault`.
    pub fn dispatch(&self, target: &T, request: &CallRequest, frame: &str) -> CallResponse {
        let method = match self.methods.get(request.method.as_str()) {
            Some(m) => m,
            None => {
                let err = anyhow::Error::from(CallError::UnknownMethod(request.method.clone()));
                return Fault::from_error(&err).with_frame(frame).into();
            }
        };

        let params = match Params::bind(method.params, request) {
            Ok(p) => p,
            Err(e) => {
                return Fault::from_error(&anyhow::Error::from(e))
                    .with_frame(format!("{frame}::{}", request.method))
                    .into()
            }
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| (method.handler)(target, &params)));
        match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                let fault = Fault::from_error(&err).with_frame(format!("{frame}::{}", request.method));
                warn!("fault en {frame}: {fault}");
                fault.into()
            }
            Err(payload) => {
                let fault =
                    Fault::from_panic(payload).with_frame(format!("{frame}::{}", request.method));
                warn!("panic en {frame}: {}", fault.message);
                fault.into()
            }
        }
    }

    /// Igual que `dispatch` pero parte del request textual.
    pub fn dispatch_str(&self, target: &T, raw: &str, frame: &str) -> CallResponse {
        match CallRequest::parse(raw) {
            Ok(request) => self.dispatch(target, &request, frame),
            Err(e) => Fault::from_error(&anyhow::Error::from(e))
                .with_frame(frame)
                .into(),
        }
    }
}
