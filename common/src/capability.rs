use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::error::GraphError;
use crate::graph::{Graph, NodeRef};

/// Forma de un tipo de nodo, vista desde el grafo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Sin entradas.
    Source,
    /// Una entrada, una salida (map / alter).
    Single,
    /// Dos entradas ordenadas (combinación binaria).
    Multi,
    /// Terminal: consume una entrada y nunca es origen de un link.
    Sink,
}

impl NodeKind {
    pub fn arity(self) -> usize {
        match self {
            NodeKind::Source => 0,
            NodeKind::Single | NodeKind::Sink => 1,
            NodeKind::Multi => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub kind: NodeKind,
    /// No se puede replicar entre particiones (ej: atado a un archivo físico).
    pub single_partition_only: bool,
}

impl Capabilities {
    pub const fn replicable(kind: NodeKind) -> Self {
        Self {
            kind,
            single_partition_only: false,
        }
    }

    pub const fn singular(kind: NodeKind) -> Self {
        Self {
            kind,
            single_partition_only: true,
        }
    }
}

/// Predicados de capacidad que provee la librería de transformaciones.
pub trait CapabilityLookup {
    fn capabilities(&self, type_tag: &str) -> Result<Capabilities, GraphError>;

    /// Capacidades de un nodo concreto. Para un grupo fusionado manda
    /// el último nodo interno, que es el que ven los lectores.
    fn node_capabilities(&self, node: &NodeRef) -> Result<Capabilities, GraphError> {
        match node.parameters.fused() {
            Some(chain) => {
                let tail = chain
                    .nodes
                    .last()
                    .ok_or(GraphError::EmptyGroup(node.key()))?;
                self.capabilities(&tail.type_tag)
            }
            None => self.capabilities(&node.type_tag),
        }
    }

    /// Aridad de entrada de un nodo; para un grupo, la de su cabeza.
    fn input_arity(&self, node: &NodeRef) -> Result<usize, GraphError> {
        match node.parameters.fused() {
            Some(chain) => {
                let head = chain
                    .nodes
                    .first()
                    .ok_or(GraphError::EmptyGroup(node.key()))?;
                Ok(self.capabilities(&head.type_tag)?.kind.arity())
            }
            None => Ok(self.capabilities(&node.type_tag)?.kind.arity()),
        }
    }
}

/// Chequeos que dependen de las capacidades:
/// - un sink nunca es origen de un link
/// - los slots (`order`) que entran a cada nodo son exactamente 0..aridad
pub fn validate_topology<C>(graph: &Graph, caps: &C) -> Result<(), GraphError>
where
    C: CapabilityLookup + ?Sized,
{
    let adj = graph.adjacency();

    for node in &graph.nodes {
        let key = node.key();
        let node_caps = caps.node_capabilities(node)?;
        if node_caps.kind == NodeKind::Sink && !adj.outgoing(key).is_empty() {
            return Err(GraphError::SinkAsProducer(node.id));
        }

        let arity = caps.input_arity(node)?;
        let slots: BTreeSet<u32> = adj.incoming(key).iter().map(|l| l.order).collect();
        let expected: BTreeSet<u32> = (0..arity as u32).collect();
        if slots != expected {
            return Err(GraphError::ArityMismatch {
                node: key,
                expected: arity,
                found: slots.into_iter().collect(),
            });
        }
    }

    Ok(())
}

/// Tabla fija tag → capacidades; útil para planificar sin fábricas de streams.
impl CapabilityLookup for HashMap<String, Capabilities> {
    fn capabilities(&self, type_tag: &str) -> Result<Capabilities, GraphError> {
        self.get(type_tag)
            .copied()
            .ok_or_else(|| GraphError::UnknownType(type_tag.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FusedChain, Parameters};

    fn table() -> HashMap<String, Capabilities> {
        let mut caps = HashMap::new();
        caps.insert("src".to_string(), Capabilities::replicable(NodeKind::Source));
        caps.insert("add".to_string(), Capabilities::replicable(NodeKind::Multi));
        caps.insert("out".to_string(), Capabilities::singular(NodeKind::Sink));
        caps
    }

    #[test]
    fn aridad_por_tipo() {
        assert_eq!(NodeKind::Source.arity(), 0);
        assert_eq!(NodeKind::Single.arity(), 1);
        assert_eq!(NodeKind::Multi.arity(), 2);
        assert_eq!(NodeKind::Sink.arity(), 1);
    }

    #[test]
    fn tipo_desconocido_es_error_de_build() {
        assert_eq!(
            table().capabilities("nope"),
            Err(GraphError::UnknownType("nope".to_string()))
        );
    }

    #[test]
    fn validate_topology_exige_slots_completos() {
        use crate::graph::LinkRef;

        let nodes = vec![
            NodeRef::new(1, "src"),
            NodeRef::new(2, "src"),
            NodeRef::new(3, "add"),
            NodeRef::new(4, "out"),
        ];
        let ok = Graph::new(
            nodes.clone(),
            vec![
                LinkRef::new(1, 3),
                LinkRef::new(2, 3).with_order(1),
                LinkRef::new(3, 4),
            ],
        );
        assert_eq!(validate_topology(&ok, &table()), Ok(()));

        // dos links al mismo slot y ninguno al slot 1
        let bad = Graph::new(
            nodes,
            vec![LinkRef::new(1, 3), LinkRef::new(2, 3), LinkRef::new(3, 4)],
        );
        assert!(matches!(
            validate_topology(&bad, &table()),
            Err(GraphError::ArityMismatch { expected: 2, .. })
        ));
    }

    #[test]
    fn sink_no_puede_producir() {
        use crate::graph::LinkRef;

        let g = Graph::new(
            vec![NodeRef::new(1, "out"), NodeRef::new(2, "out")],
            vec![LinkRef::new(1, 2)],
        );
        assert_eq!(
            validate_topology(&g, &table()),
            Err(GraphError::SinkAsProducer(1))
        );
    }

    #[test]
    fn grupo_fusionado_usa_cola_para_tipo_y_cabeza_para_aridad() {
        let mut group = NodeRef::new(10, crate::graph::FUSED_TAG);
        group.parameters = Parameters::Fused(FusedChain {
            nodes: vec![NodeRef::new(1, "add"), NodeRef::new(2, "out")],
            links: vec![crate::graph::LinkRef::new(1, 2)],
        });

        let caps = table();
        assert_eq!(caps.node_capabilities(&group).unwrap().kind, NodeKind::Sink);
        assert_eq!(caps.input_arity(&group).unwrap(), 2);
    }
}
