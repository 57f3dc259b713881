use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::capability::{validate_topology, CapabilityLookup, NodeKind};
use crate::error::GraphError;
use crate::fuser::fuse;
use crate::graph::{Graph, LinkRef, NodeId, NodeRef, PartitionId, UnitKey};
use crate::partitioner::partition;

/// Cómo lee un slot de entrada: de una sola unidad o mezclando varias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Streaming,
    Merging,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    /// Slot lógico (el `order` de los links entrantes).
    pub slot: u32,
    pub kind: ProxyKind,
    /// Unidades de las que lee, ordenadas por partición.
    pub upstream: Vec<UnitKey>,
    /// Partición del lector.
    pub partition: PartitionId,
}

/// Descriptor de despliegue de una unidad ("pod ref").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDescriptor {
    pub key: UnitKey,
    /// Tipo expuesto a los lectores (el del último nodo interno).
    pub kind: NodeKind,
    /// Cadena a ejecutar, cabeza primero.
    pub inner_nodes: Vec<NodeRef>,
    pub inner_links: Vec<LinkRef>,
    /// Uno por slot de la cabeza.
    pub proxies: Vec<ProxyDescriptor>,
    /// `Some(n)` si la salida se reparte entre n particiones.
    pub fan_out_partitions: Option<u32>,
    /// Cursores que se abren sobre cada carril de la salida.
    #[serde(default)]
    pub readers: u32,
    pub partition_count: u32,
}

impl UnitDescriptor {
    /// Los sinks se manejan por ticks; el resto son pods que se leen.
    pub fn is_tick(&self) -> bool {
        self.kind == NodeKind::Sink
    }

    pub fn fan_out(&self) -> u32 {
        self.fan_out_partitions.unwrap_or(1)
    }

    pub fn head(&self) -> Option<&NodeRef> {
        self.inner_nodes.first()
    }
}

/// Un descriptor por nodo (plano o fusionado) del grafo.
pub fn build<C>(graph: &Graph, caps: &C) -> Result<Vec<UnitDescriptor>, GraphError>
where
    C: CapabilityLookup + ?Sized,
{
    graph.validate()?;
    validate_topology(graph, caps)?;

    let adj = graph.adjacency();
    let mut descriptors = Vec::with_capacity(graph.nodes.len());

    for node in &graph.nodes {
        let key = node.key();
        let kind = caps.node_capabilities(node)?.kind;
        let arity = caps.input_arity(node)?;

        // slot -> productores (fan-in si hay más de uno)
        let mut slots: BTreeMap<u32, Vec<UnitKey>> = BTreeMap::new();
        for link in adj.incoming(key) {
            slots.entry(link.order).or_default().push(link.from_key());
        }
        if slots.len() != arity {
            return Err(GraphError::ArityMismatch {
                node: key,
                expected: arity,
                found: slots.keys().copied().collect(),
            });
        }

        let proxies = slots
            .into_iter()
            .map(|(slot, mut upstream)| {
                upstream.sort_by_key(|k| (k.partition, k.node));
                upstream.dedup();
                ProxyDescriptor {
                    slot,
                    kind: if upstream.len() > 1 {
                        ProxyKind::Merging
                    } else {
                        ProxyKind::Streaming
                    },
                    upstream,
                    partition: node.partition,
                }
            })
            .collect();

        let outbound = adj.outgoing(key);
        let fan_out_partitions = fan_out_for(graph, key, outbound)?;
        let readers = readers_per_lane(outbound, fan_out_partitions);

        let (inner_nodes, inner_links) = match node.parameters.fused() {
            Some(chain) => (chain.nodes.clone(), chain.links.clone()),
            None => (vec![node.clone()], Vec::new()),
        };

        descriptors.push(UnitDescriptor {
            key,
            kind,
            inner_nodes,
            inner_links,
            proxies,
            fan_out_partitions,
            readers,
            partition_count: graph.partition_count,
        });
    }

    descriptors.sort_by_key(|d| d.key);
    Ok(descriptors)
}

/// Una unidad reparte su salida cuando un mismo consumidor la lee desde
/// particiones distintas. En ese caso cada consumidor tiene que estar
/// replicado en todos los carriles, si no algún lector se quedaría con un
/// solo carril de la salida.
fn fan_out_for(
    graph: &Graph,
    key: UnitKey,
    outbound: &[LinkRef],
) -> Result<Option<u32>, GraphError> {
    let mut lanes_by_consumer: BTreeMap<NodeId, BTreeSet<PartitionId>> = BTreeMap::new();
    for link in outbound {
        lanes_by_consumer
            .entry(link.to)
            .or_default()
            .insert(link.to_partition);
    }
    if lanes_by_consumer.values().all(|lanes| lanes.len() <= 1) {
        return Ok(None);
    }

    if lanes_by_consumer
        .values()
        .any(|lanes| lanes.len() != graph.partition_count as usize)
    {
        return Err(GraphError::MixedFanOut(key));
    }

    Ok(Some(graph.partition_count))
}

/// Cursores que se abren sobre cada carril: uno por slot de cada consumidor.
/// Sin reparto todos leen el carril 0.
fn readers_per_lane(outbound: &[LinkRef], fan_out: Option<u32>) -> u32 {
    let cursors: BTreeSet<(NodeId, PartitionId, u32)> = outbound
        .iter()
        .map(|l| (l.to, l.to_partition, l.order))
        .collect();
    let lanes = fan_out.unwrap_or(1).max(1);
    (cursors.len() as u32).div_ceil(lanes).max(1)
}

/// validate -> partition -> fuse -> build.
pub fn compile<C>(graph: &Graph, partitions: u32, caps: &C) -> Result<Vec<UnitDescriptor>, GraphError>
where
    C: CapabilityLookup + ?Sized,
{
    let partitioned = partition(graph, partitions, caps)?;
    let fused = fuse(&partitioned)?;
    let descriptors = build(&fused, caps)?;
    debug!(
        "grafo compilado: {} nodos lógicos -> {} unidades en {} particiones",
        graph.nodes.len(),
        descriptors.len(),
        partitions
    );
    Ok(descriptors)
}
