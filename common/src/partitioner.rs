use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

use crate::capability::{validate_topology, CapabilityLookup, NodeKind};
use crate::error::GraphError;
use crate::graph::{Graph, LinkRef, NodeId, NodeRef, UnitKey};

/// Replica el grafo en `n` carriles paralelos.
///
/// Recorre hacia atrás desde cada sink. Los nodos replicables pasan a tener
/// `n` copias (particiones 0..n, mismo id); los `single_partition_only` quedan
/// singulares en la partición 0. Los links se generan según el par:
///   - replicable -> replicable: carril a carril
///   - replicable -> singular: fan-in (n links hacia el singular)
///   - singular -> replicable: fan-out (n links desde el singular)
///   - singular -> singular: un solo link
///
/// `order` se copia igual en todas las réplicas: identifica el slot lógico,
/// no el carril.
pub fn partition<C>(graph: &Graph, n: u32, caps: &C) -> Result<Graph, GraphError>
where
    C: CapabilityLookup + ?Sized,
{
    if n == 0 {
        return Err(GraphError::InvalidPartitionCount(n));
    }
    graph.validate()?;
    validate_topology(graph, caps)?;

    if n == 1 {
        return Ok(graph.clone());
    }
    if graph.partition_count != 1 || graph.nodes.iter().any(|node| node.partition != 0) {
        // Ya está particionado; volver a replicarlo mezclaría carriles.
        return Err(GraphError::InvalidPartitionCount(graph.partition_count));
    }

    let adj = graph.adjacency();
    let by_id: HashMap<NodeId, &NodeRef> = graph.nodes.iter().map(|n| (n.id, n)).collect();

    let mut sinks: Vec<NodeId> = Vec::new();
    for node in &graph.nodes {
        if caps.node_capabilities(node)?.kind == NodeKind::Sink {
            sinks.push(node.id);
        }
    }
    sinks.sort_unstable();

    let mut walker = Walker {
        n,
        caps,
        by_id: &by_id,
        replicas: HashMap::new(),
        links: BTreeSet::new(),
    };

    // DFS hacia atrás; `visited` evita procesar dos veces un subgrafo compartido.
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<NodeId> = sinks.into_iter().rev().collect();

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        walker.materialize(id)?;

        let inbound = adj.incoming(UnitKey::new(id, 0));
        let outbound = adj.outgoing(UnitKey::new(id, 0));
        if inbound.len() > 1 && outbound.len() > 1 {
            return Err(GraphError::AmbiguousPartitioning(id));
        }

        for link in inbound {
            walker.materialize(link.from)?;
            walker.connect(link)?;
            if !visited.contains(&link.from) {
                stack.push(link.from);
            }
        }
    }

    for node in &graph.nodes {
        if !visited.contains(&node.id) {
            warn!(
                "nodo {} ({}) no llega a ningún sink, se descarta al particionar",
                node.id, node.type_tag
            );
        }
    }

    let mut nodes: Vec<NodeRef> = walker.replicas.into_values().flatten().collect();
    nodes.sort_by_key(|node| (node.id, node.partition));
    let links: Vec<LinkRef> = walker.links.into_iter().collect();

    debug!(
        "grafo particionado en {} carriles: {} nodos, {} links",
        n,
        nodes.len(),
        links.len()
    );

    Ok(Graph {
        nodes,
        links,
        partition_count: n,
    })
}

struct Walker<'a, C: ?Sized> {
    n: u32,
    caps: &'a C,
    by_id: &'a HashMap<NodeId, &'a NodeRef>,
    /// Tabla de reemplazo: id original -> copias sintetizadas.
    replicas: HashMap<NodeId, Vec<NodeRef>>,
    links: BTreeSet<LinkRef>,
}

impl<'a, C> Walker<'a, C>
where
    C: CapabilityLookup + ?Sized,
{
    fn is_singular(&self, id: NodeId) -> Result<bool, GraphError> {
        let node = self.lookup(id)?;
        Ok(self.caps.node_capabilities(node)?.single_partition_only)
    }

    fn lookup(&self, id: NodeId) -> Result<&'a NodeRef, GraphError> {
        self.by_id.get(&id).copied().ok_or(GraphError::DanglingLink {
            from: id,
            to: id,
            from_partition: 0,
            to_partition: 0,
        })
    }

    fn materialize(&mut self, id: NodeId) -> Result<(), GraphError> {
        if self.replicas.contains_key(&id) {
            return Ok(());
        }
        let original = self.lookup(id)?;
        let lanes = if self.is_singular(id)? { 1 } else { self.n };
        let copies = (0..lanes)
            .map(|p| {
                let mut copy = original.clone();
                copy.partition = p;
                copy
            })
            .collect();
        self.replicas.insert(id, copies);
        Ok(())
    }

    fn connect(&mut self, link: &LinkRef) -> Result<(), GraphError> {
        let from_singular = self.is_singular(link.from)?;
        let to_singular = self.is_singular(link.to)?;

        match (from_singular, to_singular) {
            (false, false) => {
                for p in 0..self.n {
                    self.links.insert(LinkRef::between(
                        UnitKey::new(link.from, p),
                        UnitKey::new(link.to, p),
                        link.order,
                    ));
                }
            }
            (false, true) => {
                for p in 0..self.n {
                    self.links.insert(LinkRef::between(
                        UnitKey::new(link.from, p),
                        UnitKey::new(link.to, 0),
                        link.order,
                    ));
                }
            }
            (true, false) => {
                for p in 0..self.n {
                    self.links.insert(LinkRef::between(
                        UnitKey::new(link.from, 0),
                        UnitKey::new(link.to, p),
                        link.order,
                    ));
                }
            }
            (true, true) => {
                self.links.insert(LinkRef::between(
                    UnitKey::new(link.from, 0),
                    UnitKey::new(link.to, 0),
                    link.order,
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capabilities;

    fn caps() -> HashMap<String, Capabilities> {
        let mut caps = HashMap::new();
        caps.insert("src".to_string(), Capabilities::replicable(NodeKind::Source));
        caps.insert("file".to_string(), Capabilities::singular(NodeKind::Source));
        caps.insert("map".to_string(), Capabilities::replicable(NodeKind::Single));
        caps.insert("add".to_string(), Capabilities::replicable(NodeKind::Multi));
        caps.insert("sink".to_string(), Capabilities::singular(NodeKind::Sink));
        caps.insert("drain".to_string(), Capabilities::replicable(NodeKind::Sink));
        caps
    }

    fn linear(k: u64) -> Graph {
        // src -> map -> ... -> map -> sink (k nodos replicables)
        let mut nodes = vec![NodeRef::new(1, "src")];
        let mut links = Vec::new();
        for id in 2..=k {
            nodes.push(NodeRef::new(id, "map"));
            links.push(LinkRef::new(id - 1, id));
        }
        nodes.push(NodeRef::new(k + 1, "sink"));
        links.push(LinkRef::new(k, k + 1));
        Graph::new(nodes, links)
    }

    #[test]
    fn una_particion_devuelve_el_mismo_grafo() {
        let g = linear(3);
        assert_eq!(partition(&g, 1, &caps()).unwrap(), g);
    }

    #[test]
    fn cero_particiones_es_error() {
        assert_eq!(
            partition(&linear(2), 0, &caps()),
            Err(GraphError::InvalidPartitionCount(0))
        );
    }

    #[test]
    fn cadena_replicada_con_fan_in_al_sink_singular() {
        let k = 3;
        let n = 4;
        let g = partition(&linear(k), n, &caps()).unwrap();

        assert_eq!(g.partition_count, n);
        for id in 1..=k {
            let replicas: Vec<_> = g.nodes.iter().filter(|node| node.id == id).collect();
            assert_eq!(replicas.len(), n as usize, "nodo {id}");
        }

        let sink = UnitKey::new(k + 1, 0);
        let into_sink = g.links_to(sink);
        assert_eq!(into_sink.len(), n as usize);
        let from_parts: BTreeSet<u32> = into_sink.iter().map(|l| l.from_partition).collect();
        assert_eq!(from_parts, (0..n).collect());
        assert!(into_sink.iter().all(|l| l.order == 0));

        // carriles internos: mismo número de partición en ambos extremos
        for link in g.links.iter().filter(|l| l.to != k + 1) {
            assert_eq!(link.from_partition, link.to_partition);
        }
        assert_eq!(g.validate(), Ok(()));
    }

    #[test]
    fn fuente_singular_hace_fan_out() {
        let g = Graph::new(
            vec![
                NodeRef::new(1, "file"),
                NodeRef::new(2, "map"),
                NodeRef::new(3, "sink"),
            ],
            vec![LinkRef::new(1, 2), LinkRef::new(2, 3)],
        );
        let p = partition(&g, 3, &caps()).unwrap();

        let out = p.links_from(UnitKey::new(1, 0));
        assert_eq!(out.len(), 3);
        let to_parts: BTreeSet<u32> = out.iter().map(|l| l.to_partition).collect();
        assert_eq!(to_parts, BTreeSet::from([0, 1, 2]));
        assert_eq!(p.nodes.iter().filter(|n| n.id == 1).count(), 1);
        assert_eq!(p.nodes.len(), 1 + 3 + 1);
    }

    #[test]
    fn order_se_propaga_a_todas_las_replicas() {
        let g = Graph::new(
            vec![
                NodeRef::new(1, "src"),
                NodeRef::new(2, "src"),
                NodeRef::new(3, "add"),
                NodeRef::new(4, "sink"),
            ],
            vec![
                LinkRef::new(1, 3),
                LinkRef::new(2, 3).with_order(1),
                LinkRef::new(3, 4),
            ],
        );
        let p = partition(&g, 2, &caps()).unwrap();

        for part in 0..2 {
            let inbound = p.links_to(UnitKey::new(3, part));
            let mut slots: Vec<(u64, u32)> = inbound.iter().map(|l| (l.from, l.order)).collect();
            slots.sort_unstable();
            assert_eq!(slots, vec![(1, 0), (2, 1)]);
        }
    }

    #[test]
    fn subgrafo_compartido_se_replica_una_sola_vez() {
        // src alimenta dos maps que terminan en sinks distintos
        let g = Graph::new(
            vec![
                NodeRef::new(1, "src"),
                NodeRef::new(2, "map"),
                NodeRef::new(3, "map"),
                NodeRef::new(4, "drain"),
                NodeRef::new(5, "drain"),
            ],
            vec![
                LinkRef::new(1, 2),
                LinkRef::new(1, 3),
                LinkRef::new(2, 4),
                LinkRef::new(3, 5),
            ],
        );
        let p = partition(&g, 2, &caps()).unwrap();
        assert_eq!(p.nodes.iter().filter(|n| n.id == 1).count(), 2);
        assert_eq!(p.links_from(UnitKey::new(1, 1)).len(), 2);
        assert_eq!(p.validate(), Ok(()));
    }

    #[test]
    fn varios_productores_y_consumidores_es_ambiguo() {
        let g = Graph::new(
            vec![
                NodeRef::new(1, "src"),
                NodeRef::new(2, "src"),
                NodeRef::new(3, "add"),
                NodeRef::new(4, "drain"),
                NodeRef::new(5, "drain"),
            ],
            vec![
                LinkRef::new(1, 3),
                LinkRef::new(2, 3).with_order(1),
                LinkRef::new(3, 4),
                LinkRef::new(3, 5),
            ],
        );
        assert_eq!(
            partition(&g, 2, &caps()),
            Err(GraphError::AmbiguousPartitioning(3))
        );
        // con un solo carril no hay nada que decidir
        assert!(partition(&g, 1, &caps()).is_ok());
    }

    #[test]
    fn nodos_sin_sink_se_descartan() {
        let mut g = linear(2);
        g.nodes.push(NodeRef::new(9, "src"));
        let p = partition(&g, 2, &caps()).unwrap();
        assert!(p.nodes.iter().all(|n| n.id != 9));
    }
}
