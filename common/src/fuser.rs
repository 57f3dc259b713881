use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

use crate::error::GraphError;
use crate::graph::{
    Adjacency, FusedChain, Graph, LinkRef, NodeId, NodeRef, Parameters, UnitKey, FUSED_TAG,
};

/// Genera ids nuevos por encima del máximo existente.
/// La misma cabeza original recibe el mismo id en todas las particiones.
pub struct IdResolver {
    next: NodeId,
    assigned: HashMap<NodeId, NodeId>,
}

impl IdResolver {
    pub fn above(max_existing: NodeId) -> Self {
        Self {
            next: max_existing + 1,
            assigned: HashMap::new(),
        }
    }

    pub fn resolve(&mut self, original: NodeId) -> NodeId {
        if let Some(id) = self.assigned.get(&original) {
            return *id;
        }
        let id = self.next;
        self.next += 1;
        self.assigned.insert(original, id);
        id
    }
}

/// Colapsa cadenas lineales en grupos fusionados.
///
/// DFS hacia atrás desde cada sink (nodo sin consumidores) arrastrando el
/// "stroke" actual, armado de la cola hacia la cabeza:
///   - nodo con varios consumidores: cierra el stroke abierto y arranca uno nuevo
///   - un único productor en la misma partición: se sigue con el mismo stroke
///   - fuente, varios productores o productor en otra partición: el stroke se
///     cierra con este nodo como cabeza y cada productor arranca uno vacío
///   - nodo ya visitado: cierra el stroke entrante
///
/// Los strokes de más de un nodo se convierten en un `NodeRef` con tag
/// [`FUSED_TAG`]; los links entre strokes se reescriben al grupo que los
/// contiene y se descartan auto-links y duplicados.
pub fn fuse(graph: &Graph) -> Result<Graph, GraphError> {
    graph.validate()?;

    let adj = graph.adjacency();
    let by_key: HashMap<UnitKey, &NodeRef> = graph.nodes.iter().map(|n| (n.key(), n)).collect();

    let mut roots: Vec<UnitKey> = graph
        .nodes
        .iter()
        .map(|n| n.key())
        .filter(|key| adj.outgoing(*key).is_empty())
        .collect();
    roots.sort_unstable();

    let mut strokes = collect_strokes(&adj, &roots);

    let covered: HashSet<UnitKey> = strokes.iter().flatten().copied().collect();
    for node in &graph.nodes {
        if !covered.contains(&node.key()) {
            // sólo pasa con ciclos: no hay sink alcanzable
            warn!("nodo {} no se alcanza desde ningún sink; queda sin fusionar", node.key());
            strokes.push(vec![node.key()]);
        }
    }

    // orden determinista antes de asignar ids
    strokes.sort_by_key(|stroke| stroke[0]);

    let mut resolver = IdResolver::above(graph.max_id());
    let mut enclosing: HashMap<UnitKey, UnitKey> = HashMap::new();
    let mut nodes: Vec<NodeRef> = Vec::new();

    for stroke in &strokes {
        if stroke.len() == 1 {
            let node = by_key[&stroke[0]];
            enclosing.insert(node.key(), node.key());
            nodes.push(node.clone());
            continue;
        }

        let head = stroke[0];
        let group_key = UnitKey::new(resolver.resolve(head.node), head.partition);

        let members: Vec<NodeRef> = stroke.iter().map(|k| by_key[k].clone()).collect();
        let inner_links: Vec<LinkRef> = stroke
            .windows(2)
            .flat_map(|pair| {
                adj.outgoing(pair[0])
                    .iter()
                    .filter(|l| l.to_key() == pair[1])
                    .copied()
                    .collect::<Vec<_>>()
            })
            .collect();

        for key in stroke {
            enclosing.insert(*key, group_key);
        }

        debug!(
            "grupo {} fusiona {} nodos (cabeza {})",
            group_key,
            members.len(),
            head
        );

        nodes.push(NodeRef {
            id: group_key.node,
            type_tag: FUSED_TAG.to_string(),
            parameters: Parameters::Fused(FusedChain {
                nodes: members,
                links: inner_links,
            }),
            partition: group_key.partition,
        });
    }

    let mut links: BTreeSet<LinkRef> = BTreeSet::new();
    for link in &graph.links {
        let from = enclosing[&link.from_key()];
        let to = enclosing[&link.to_key()];
        if from == to {
            continue;
        }
        links.insert(LinkRef::between(from, to, link.order));
    }

    nodes.sort_by_key(|n| (n.id, n.partition));

    Ok(Graph {
        nodes,
        links: links.into_iter().collect(),
        partition_count: graph.partition_count,
    })
}

/// Recorrido con pila explícita; devuelve strokes cabeza primero.
fn collect_strokes(adj: &Adjacency, roots: &[UnitKey]) -> Vec<Vec<UnitKey>> {
    let mut strokes: Vec<Vec<UnitKey>> = Vec::new();
    let mut visited: HashSet<UnitKey> = HashSet::new();

    let mut work: Vec<(UnitKey, Vec<UnitKey>)> =
        roots.iter().rev().map(|r| (*r, Vec::new())).collect();

    while let Some((key, mut stroke)) = work.pop() {
        if !visited.insert(key) {
            close_stroke(stroke, &mut strokes);
            continue;
        }

        if adj.outgoing(key).len() > 1 && !stroke.is_empty() {
            close_stroke(std::mem::take(&mut stroke), &mut strokes);
        }
        stroke.push(key);

        let inbound = adj.incoming(key);
        match inbound {
            [only] if only.from_partition == key.partition => {
                work.push((only.from_key(), stroke));
            }
            _ => {
                close_stroke(stroke, &mut strokes);
                let mut producers: Vec<&LinkRef> = inbound.iter().collect();
                producers.sort_by_key(|l| (l.order, l.from_partition, l.from));
                for link in producers.into_iter().rev() {
                    work.push((link.from_key(), Vec::new()));
                }
            }
        }
    }

    strokes
}

fn close_stroke(mut stroke: Vec<UnitKey>, strokes: &mut Vec<Vec<UnitKey>>) {
    if !stroke.is_empty() {
        stroke.reverse();
        strokes.push(stroke);
    }
}
