use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    str::FromStr,
    sync::Arc,
};
use tracing::debug;

use crate::call::Value;
use crate::capability::{Capabilities, CapabilityLookup, NodeKind};
use crate::error::{CallError, GraphError};
use crate::graph::{NodeRef, UnitKey};

/// Secuencia perezosa de elementos; un `Err` corta el stream.
pub type ElementStream = Box<dyn Iterator<Item = Result<Value>> + Send>;

/// Datos del carril en el que corre una transformación.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamContext {
    pub partition: u32,
    pub partition_count: u32,
    /// Tamaño de bloque por carril.
    pub partition_size: u32,
    pub sample_rate: f32,
}

impl Default for StreamContext {
    fn default() -> Self {
        Self {
            partition: 0,
            partition_count: 1,
            partition_size: 1,
            sample_rate: 44_100.0,
        }
    }
}

/// Lo que recibe una fábrica al instanciar un nodo.
pub struct Invocation<'a> {
    pub node: &'a NodeRef,
    pub ctx: StreamContext,
    /// Un stream por slot, ordenados por `order`.
    pub inputs: Vec<ElementStream>,
    pub outputs: &'a CollectedOutputs,
}

pub type Factory = Arc<dyn Fn(Invocation<'_>) -> Result<ElementStream> + Send + Sync>;

/// Salidas acumuladas por los sinks `collect`, por unidad.
#[derive(Clone, Default)]
pub struct CollectedOutputs {
    inner: Arc<Mutex<BTreeMap<UnitKey, Vec<Value>>>>,
}

impl CollectedOutputs {
    pub fn push(&self, key: UnitKey, value: Value) {
        self.inner.lock().entry(key).or_default().push(value);
    }

    pub fn get(&self, key: UnitKey) -> Vec<Value> {
        self.inner.lock().get(&key).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<UnitKey, Vec<Value>> {
        self.inner.lock().clone()
    }

    pub fn take(&self) -> BTreeMap<UnitKey, Vec<Value>> {
        std::mem::take(&mut *self.inner.lock())
    }
}

struct Transform {
    caps: Capabilities,
    factory: Factory,
}

/// Tag de tipo -> (capacidades, fábrica de streams).
#[derive(Default)]
pub struct TransformRegistry {
    entries: HashMap<String, Transform>,
    outputs: CollectedOutputs,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registro con todas las transformaciones incluidas.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins: [(&str, Capabilities, fn(Invocation<'_>) -> Result<ElementStream>); 8] = [
            ("range", Capabilities::replicable(NodeKind::Source), op_range),
            ("sequence", Capabilities::singular(NodeKind::Source), op_sequence),
            ("scale", Capabilities::replicable(NodeKind::Single), op_scale),
            ("offset", Capabilities::replicable(NodeKind::Single), op_offset),
            ("threshold", Capabilities::replicable(NodeKind::Single), op_threshold),
            ("add", Capabilities::replicable(NodeKind::Multi), op_add),
            ("collect", Capabilities::singular(NodeKind::Sink), op_collect),
            ("discard", Capabilities::replicable(NodeKind::Sink), op_discard),
        ];
        for (tag, caps, factory) in builtins {
            registry.entries.insert(
                tag.to_string(),
                Transform {
                    caps,
                    factory: Arc::new(factory),
                },
            );
        }
        registry
    }

    pub fn register<F>(&mut self, tag: &str, caps: Capabilities, factory: F) -> Result<()>
    where
        F: Fn(Invocation<'_>) -> Result<ElementStream> + Send + Sync + 'static,
    {
        if self.entries.contains_key(tag) {
            bail!("la transformación {tag:?} ya está registrada");
        }
        self.entries.insert(
            tag.to_string(),
            Transform {
                caps,
                factory: Arc::new(factory),
            },
        );
        Ok(())
    }

    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        tags.sort_unstable();
        tags
    }

    pub fn outputs(&self) -> &CollectedOutputs {
        &self.outputs
    }

    /// Instancia un nodo plano sobre sus entradas.
    pub fn instantiate(
        &self,
        node: &NodeRef,
        ctx: StreamContext,
        inputs: Vec<ElementStream>,
    ) -> Result<ElementStream> {
        let transform = self
            .entries
            .get(&node.type_tag)
            .ok_or_else(|| GraphError::UnknownType(node.type_tag.clone()))?;

        let arity = transform.caps.kind.arity();
        if inputs.len() != arity {
            bail!(
                "el nodo {} ({}) espera {} entradas, recibió {}",
                node.key(),
                node.type_tag,
                arity,
                inputs.len()
            );
        }

        (transform.factory)(Invocation {
            node,
            ctx,
            inputs,
            outputs: &self.outputs,
        })
        .with_context(|| format!("instanciando {} ({})", node.key(), node.type_tag))
    }

    /// Encadena los nodos de una unidad: la cabeza recibe `head_inputs` y
    /// cada nodo siguiente lee la salida del anterior.
    pub fn build_chain(
        &self,
        nodes: &[NodeRef],
        ctx: StreamContext,
        head_inputs: Vec<ElementStream>,
    ) -> Result<ElementStream> {
        let (head, rest) = nodes
            .split_first()
            .ok_or_else(|| anyhow!("cadena vacía"))?;
        let mut stream = self.instantiate(head, ctx, head_inputs)?;
        for node in rest {
            stream = self.instantiate(node, ctx, vec![stream])?;
        }
        debug!("cadena de {} nodos instanciada (partición {})", nodes.len(), ctx.partition);
        Ok(stream)
    }
}

impl CapabilityLookup for TransformRegistry {
    fn capabilities(&self, type_tag: &str) -> Result<Capabilities, GraphError> {
        self.entries
            .get(type_tag)
            .map(|t| t.caps)
            .ok_or_else(|| GraphError::UnknownType(type_tag.to_string()))
    }
}

/* =========================
   Helpers
   ========================= */

/// Lee un parámetro de configuración; `default = None` lo vuelve obligatorio.
fn param<T>(node: &NodeRef, key: &str, default: Option<T>) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match node.parameters.get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("parámetro {key}={raw:?} inválido en {}: {e}", node.key())),
        None => default.ok_or_else(|| anyhow!("falta el parámetro {key} en {}", node.key())),
    }
}

fn single_input(inputs: Vec<ElementStream>) -> Result<ElementStream> {
    inputs
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("falta el stream de entrada"))
}

/// Aplica `f` al valor numérico conservando su variante.
fn numeric(value: Value, f: impl Fn(f64) -> f64) -> Result<Value> {
    Ok(match value {
        Value::Int32(v) => Value::Int32(f(f64::from(v)).round() as i32),
        Value::Int64(v) => Value::Int64(f(v as f64).round() as i64),
        Value::Float32(v) => Value::Float32(f(f64::from(v)) as f32),
        other => bail!("se esperaba un valor numérico, llegó {}", other.type_name()),
    })
}

fn sum(left: Value, right: Value) -> Result<Value> {
    Ok(match (&left, &right) {
        (Value::Int32(a), Value::Int32(b)) => Value::Int32(
            a.checked_add(*b)
                .ok_or_else(|| anyhow!("overflow sumando {a} + {b}"))?,
        ),
        (Value::Float32(a), Value::Float32(b)) => Value::Float32(a + b),
        _ => match (left.as_i64(), right.as_i64()) {
            (Some(x), Some(y)) => Value::Int64(
                x.checked_add(y)
                    .ok_or_else(|| anyhow!("overflow sumando {x} + {y}"))?,
            ),
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(x), Some(y)) => Value::Float32((x + y) as f32),
                _ => bail!(
                    "no se puede sumar {} con {}",
                    left.type_name(),
                    right.type_name()
                ),
            },
        },
    })
}

/* =========================
   Fuentes
   ========================= */

/// range: enteros `start..start+count`; cada réplica emite sólo los bloques
/// de su carril, así que el merge por bloques reconstruye el orden original.
fn op_range(inv: Invocation<'_>) -> Result<ElementStream> {
    let start: i64 = param(inv.node, "start", Some(0))?;
    let count: i64 = param(inv.node, "count", None)?;
    let block = i64::from(inv.ctx.partition_size.max(1));
    let lanes = i64::from(inv.ctx.partition_count.max(1));
    let lane = i64::from(inv.ctx.partition);
    let count = count.max(0);
    range_end(start, count)?;

    Ok(Box::new(
        (0..count)
            .filter(move |i| (i / block) % lanes == lane)
            .map(move |i| Ok(Value::Int64(start + i))),
    ))
}

/// sequence: la secuencia completa; no se replica.
fn op_sequence(inv: Invocation<'_>) -> Result<ElementStream> {
    let start: i64 = param(inv.node, "start", Some(0))?;
    let count: i64 = param(inv.node, "count", None)?;
    let end = range_end(start, count.max(0))?;
    Ok(Box::new((start..end).map(|v| Ok(Value::Int64(v)))))
}

/// `start + count` sin desbordar i64.
fn range_end(start: i64, count: i64) -> Result<i64> {
    start.checked_add(count).ok_or_else(|| {
        CallError::InvalidParam {
            name: "count".to_string(),
            value: count.to_string(),
            expected: format!("start + count <= {} (start={start})", i64::MAX),
        }
        .into()
    })
}

/* =========================
   Operadores
   ========================= */

fn op_scale(inv: Invocation<'_>) -> Result<ElementStream> {
    let factor: f64 = param(inv.node, "factor", None)?;
    let input = single_input(inv.inputs)?;
    Ok(Box::new(
        input.map(move |v| numeric(v?, |x| x * factor)),
    ))
}

fn op_offset(inv: Invocation<'_>) -> Result<ElementStream> {
    let delta: f64 = param(inv.node, "delta", None)?;
    let input = single_input(inv.inputs)?;
    Ok(Box::new(input.map(move |v| numeric(v?, |x| x + delta))))
}

fn op_threshold(inv: Invocation<'_>) -> Result<ElementStream> {
    let min: f64 = param(inv.node, "min", None)?;
    let input = single_input(inv.inputs)?;
    Ok(Box::new(input.filter_map(move |v| match v {
        Ok(value) => match value.as_f64() {
            Some(x) if x >= min => Some(Ok(value)),
            Some(_) => None,
            None => Some(Err(anyhow!(
                "threshold espera valores numéricos, llegó {}",
                value.type_name()
            ))),
        },
        Err(e) => Some(Err(e)),
    })))
}

/// add: suma elemento a elemento los slots 0 y 1.
fn op_add(inv: Invocation<'_>) -> Result<ElementStream> {
    let mut inputs = inv.inputs.into_iter();
    let (mut left, mut right) = match (inputs.next(), inputs.next()) {
        (Some(l), Some(r)) => (l, r),
        _ => bail!("add necesita dos entradas"),
    };
    let key = inv.node.key();

    Ok(Box::new(std::iter::from_fn(move || {
        match (left.next(), right.next()) {
            (None, None) => None,
            (Some(Ok(a)), Some(Ok(b))) => Some(sum(a, b)),
            (Some(Err(e)), _) | (_, Some(Err(e))) => Some(Err(e)),
            (Some(_), None) | (None, Some(_)) => Some(Err(anyhow!(
                "las entradas de {key} tienen largos distintos"
            ))),
        }
    })))
}

/* =========================
   Sinks
   ========================= */

fn op_collect(inv: Invocation<'_>) -> Result<ElementStream> {
    let key = inv.node.key();
    let outputs = inv.outputs.clone();
    let input = single_input(inv.inputs)?;
    Ok(Box::new(input.map(move |v| {
        let v = v?;
        outputs.push(key, v.clone());
        Ok(v)
    })))
}

fn op_discard(inv: Invocation<'_>) -> Result<ElementStream> {
    single_input(inv.inputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(stream: ElementStream) -> Vec<Value> {
        stream.collect::<Result<Vec<_>>>().unwrap()
    }

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().map(|v| Value::Int64(*v)).collect()
    }

    fn lane(partition: u32, partition_count: u32, partition_size: u32) -> StreamContext {
        StreamContext {
            partition,
            partition_count,
            partition_size,
            ..StreamContext::default()
        }
    }

    #[test]
    fn range_reparte_bloques_por_carril() {
        let reg = TransformRegistry::with_builtins();
        let node = NodeRef::new(1, "range").with_param("count", 10);

        let full = run(reg.instantiate(&node, StreamContext::default(), vec![]).unwrap());
        assert_eq!(full, ints(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]));

        let p0 = run(reg.instantiate(&node, lane(0, 2, 2), vec![]).unwrap());
        let p1 = run(reg.instantiate(&node, lane(1, 2, 2), vec![]).unwrap());
        assert_eq!(p0, ints(&[0, 1, 4, 5, 8, 9]));
        assert_eq!(p1, ints(&[2, 3, 6, 7]));
    }

    #[test]
    fn cadena_aplica_operadores_en_orden() {
        let reg = TransformRegistry::with_builtins();
        let nodes = vec![
            NodeRef::new(1, "sequence").with_param("start", 1).with_param("count", 5),
            NodeRef::new(2, "scale").with_param("factor", 3),
            NodeRef::new(3, "offset").with_param("delta", -1),
            NodeRef::new(4, "threshold").with_param("min", 5),
            NodeRef::new(5, "collect"),
        ];
        let out = run(reg.build_chain(&nodes, StreamContext::default(), vec![]).unwrap());
        assert_eq!(out, ints(&[5, 8, 11, 14]));
        assert_eq!(reg.outputs().get(UnitKey::new(5, 0)), ints(&[5, 8, 11, 14]));
    }

    #[test]
    fn operadores_conservan_la_variante() {
        assert_eq!(numeric(Value::Int32(3), |x| x * 2.0).unwrap(), Value::Int32(6));
        assert_eq!(
            numeric(Value::Float32(1.5), |x| x * 2.0).unwrap(),
            Value::Float32(3.0)
        );
        assert!(numeric(Value::Bool(true), |x| x).is_err());
        assert_eq!(sum(Value::Int32(1), Value::Int32(2)).unwrap(), Value::Int32(3));
        assert_eq!(sum(Value::Int32(1), Value::Int64(2)).unwrap(), Value::Int64(3));
        assert!(sum(Value::Int32(i32::MAX), Value::Int32(1)).is_err());
    }

    #[test]
    fn add_suma_slots_y_detecta_largos_distintos() {
        let reg = TransformRegistry::with_builtins();
        let node = NodeRef::new(3, "add");
        let left: ElementStream = Box::new(ints(&[1, 2, 3]).into_iter().map(Ok));
        let right: ElementStream = Box::new(ints(&[10, 20, 30]).into_iter().map(Ok));
        let out = run(reg
            .instantiate(&node, StreamContext::default(), vec![left, right])
            .unwrap());
        assert_eq!(out, ints(&[11, 22, 33]));

        let left: ElementStream = Box::new(ints(&[1, 2]).into_iter().map(Ok));
        let right: ElementStream = Box::new(ints(&[1]).into_iter().map(Ok));
        let mut s = reg
            .instantiate(&node, StreamContext::default(), vec![left, right])
            .unwrap();
        assert!(s.next().unwrap().is_ok());
        assert!(s.next().unwrap().is_err());
    }

    #[test]
    fn fuentes_rechazan_rangos_que_desbordan() {
        let reg = TransformRegistry::with_builtins();
        for tag in ["range", "sequence"] {
            let node = NodeRef::new(1, tag)
                .with_param("start", i64::MAX - 2)
                .with_param("count", 5);
            let err = reg
                .instantiate(&node, StreamContext::default(), vec![])
                .err()
                .unwrap();
            assert!(
                matches!(
                    err.root_cause().downcast_ref::<CallError>(),
                    Some(CallError::InvalidParam { name, .. }) if name == "count"
                ),
                "{tag}: {err:#}"
            );

            // justo hasta el máximo es válido
            let node = NodeRef::new(1, tag)
                .with_param("start", i64::MAX - 2)
                .with_param("count", 2);
            let out = run(reg.instantiate(&node, StreamContext::default(), vec![]).unwrap());
            assert_eq!(out, ints(&[i64::MAX - 2, i64::MAX - 1]));
        }
    }

    #[test]
    fn errores_de_registro_e_instanciacion() {
        let mut reg = TransformRegistry::with_builtins();
        assert!(reg
            .register("scale", Capabilities::replicable(NodeKind::Single), op_scale)
            .is_err());
        assert!(reg
            .register("negate", Capabilities::replicable(NodeKind::Single), |inv| {
                let input = single_input(inv.inputs)?;
                Ok(Box::new(input.map(|v| numeric(v?, |x| -x))) as ElementStream)
            })
            .is_ok());
        assert_eq!(reg.capabilities("negate").unwrap().kind, NodeKind::Single);

        // falta el parámetro obligatorio
        let node = NodeRef::new(1, "range");
        assert!(reg.instantiate(&node, StreamContext::default(), vec![]).is_err());

        // aridad incorrecta
        let node = NodeRef::new(2, "scale").with_param("factor", 2);
        assert!(reg.instantiate(&node, StreamContext::default(), vec![]).is_err());

        let node = NodeRef::new(3, "nope");
        assert!(reg.instantiate(&node, StreamContext::default(), vec![]).is_err());
    }
}
