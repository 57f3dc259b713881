use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    str::FromStr,
};

use crate::error::GraphError;

pub type NodeId = u64;
pub type PartitionId = u32;

/// Tag reservado para los grupos creados por el fuser.
pub const FUSED_TAG: &str = "fused";

/* --------- Nodos y links --------- */

/// Configuración de un nodo: opaca para el grafo (la interpreta la transformación),
/// o bien la cadena embebida de un grupo fusionado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameters {
    Config(HashMap<String, String>),
    Fused(FusedChain),
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters::Config(HashMap::new())
    }
}

impl Parameters {
    /// Valor de configuración por nombre (nunca para grupos fusionados).
    pub fn get(&self, key: &str) -> Option<&str> {
        match self {
            Parameters::Config(map) => map.get(key).map(|s| s.as_str()),
            Parameters::Fused(_) => None,
        }
    }

    pub fn fused(&self) -> Option<&FusedChain> {
        match self {
            Parameters::Fused(chain) => Some(chain),
            Parameters::Config(_) => None,
        }
    }
}

/// Sub-cadena de un grupo fusionado, cabeza primero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedChain {
    pub nodes: Vec<NodeRef>,
    pub links: Vec<LinkRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRef {
    pub id: NodeId,
    /// Qué transformación representa: "range", "scale", "collect", ...
    pub type_tag: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub partition: PartitionId,
}

impl NodeRef {
    pub fn new(id: NodeId, type_tag: &str) -> Self {
        Self {
            id,
            type_tag: type_tag.to_string(),
            parameters: Parameters::default(),
            partition: 0,
        }
    }

    /// Agrega un parámetro de configuración (builder).
    pub fn with_param(mut self, key: &str, value: impl ToString) -> Self {
        if let Parameters::Config(map) = &mut self.parameters {
            map.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn key(&self) -> UnitKey {
        UnitKey::new(self.id, self.partition)
    }

    pub fn is_fused(&self) -> bool {
        self.type_tag == FUSED_TAG
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LinkRef {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default)]
    pub from_partition: PartitionId,
    #[serde(default)]
    pub to_partition: PartitionId,
    /// Slot lógico de entrada en `to` (0 para nodos de una sola entrada).
    #[serde(default)]
    pub order: u32,
}

impl LinkRef {
    pub fn new(from: NodeId, to: NodeId) -> Self {
        Self {
            from,
            to,
            from_partition: 0,
            to_partition: 0,
            order: 0,
        }
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    pub fn between(from: UnitKey, to: UnitKey, order: u32) -> Self {
        Self {
            from: from.node,
            to: to.node,
            from_partition: from.partition,
            to_partition: to.partition,
            order,
        }
    }

    pub fn from_key(&self) -> UnitKey {
        UnitKey::new(self.from, self.from_partition)
    }

    pub fn to_key(&self) -> UnitKey {
        UnitKey::new(self.to, self.to_partition)
    }
}

/* --------- Identidad de unidades --------- */

/// Identidad de un nodo ya particionado (y de la unidad que lo ejecuta).
/// Forma textual: `node@partition`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct UnitKey {
    pub node: NodeId,
    pub partition: PartitionId,
}

impl UnitKey {
    pub fn new(node: NodeId, partition: PartitionId) -> Self {
        Self { node, partition }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node, self.partition)
    }
}

impl FromStr for UnitKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node, partition) = s
            .split_once('@')
            .ok_or_else(|| format!("clave de unidad inválida: {s:?}"))?;
        let node = node
            .parse::<NodeId>()
            .map_err(|e| format!("nodo inválido en {s:?}: {e}"))?;
        let partition = partition
            .parse::<PartitionId>()
            .map_err(|e| format!("partición inválida en {s:?}: {e}"))?;
        Ok(UnitKey::new(node, partition))
    }
}

/* --------- Grafo --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<NodeRef>,
    pub links: Vec<LinkRef>,
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,
}

fn default_partition_count() -> u32 {
    1
}

impl Graph {
    pub fn new(nodes: Vec<NodeRef>, links: Vec<LinkRef>) -> Self {
        Self {
            nodes,
            links,
            partition_count: 1,
        }
    }

    pub fn node(&self, key: UnitKey) -> Option<&NodeRef> {
        self.nodes.iter().find(|n| n.key() == key)
    }

    /// Links que entran en `key`.
    pub fn links_to(&self, key: UnitKey) -> Vec<LinkRef> {
        self.links
            .iter()
            .filter(|l| l.to_key() == key)
            .copied()
            .collect()
    }

    /// Links que salen de `key`.
    pub fn links_from(&self, key: UnitKey) -> Vec<LinkRef> {
        self.links
            .iter()
            .filter(|l| l.from_key() == key)
            .copied()
            .collect()
    }

    pub fn max_id(&self) -> NodeId {
        self.nodes.iter().map(|n| n.id).max().unwrap_or(0)
    }

    /// Índices de adyacencia (entrantes, salientes) por clave de unidad.
    pub fn adjacency(&self) -> Adjacency {
        let mut adj = Adjacency::default();
        for link in &self.links {
            adj.incoming.entry(link.to_key()).or_default().push(*link);
            adj.outgoing.entry(link.from_key()).or_default().push(*link);
        }
        adj
    }

    /// Chequea los invariantes estructurales:
    /// - no hay nodos `(id, partición)` repetidos
    /// - todo link resuelve a nodos existentes
    /// - no hay links duplicados
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut keys: HashSet<UnitKey> = HashSet::new();
        for node in &self.nodes {
            if !keys.insert(node.key()) {
                return Err(GraphError::DuplicateNode(node.key()));
            }
        }

        let mut seen: HashSet<LinkRef> = HashSet::new();
        for link in &self.links {
            if !keys.contains(&link.from_key()) || !keys.contains(&link.to_key()) {
                return Err(GraphError::DanglingLink {
                    from: link.from,
                    to: link.to,
                    from_partition: link.from_partition,
                    to_partition: link.to_partition,
                });
            }
            if !seen.insert(*link) {
                return Err(GraphError::DuplicateLink {
                    from: link.from,
                    to: link.to,
                    order: link.order,
                });
            }
        }

        Ok(())
    }
}

/// Links agrupados por extremo.
#[derive(Debug, Default)]
pub struct Adjacency {
    pub incoming: HashMap<UnitKey, Vec<LinkRef>>,
    pub outgoing: HashMap<UnitKey, Vec<LinkRef>>,
}

impl Adjacency {
    pub fn incoming(&self, key: UnitKey) -> &[LinkRef] {
        self.incoming.get(&key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn outgoing(&self, key: UnitKey) -> &[LinkRef] {
        self.outgoing.get(&key).map(|v| v.as_slice()).unwrap_or(&[])
    }
}
