//! Ancestry (genealogy) tree of trajectory nodes shared by all particles.
//!
//! Every filter step appends exactly one node per particle. A particle only stores the identifier of its current
//! leaf; the rest of its trajectory is recovered by walking parent links. Particles that descend from the same
//! ancestor share that part of the tree, so the storage cost of the population is the size of the genealogy rather
//! than `N * steps`.
//!
//! The tree is an arena of nodes addressed by [NodeId]. Each node carries an explicit reference count: one for each
//! particle whose current leaf it is plus one for each live child. Parent links are plain identifiers into the arena,
//! never owning pointers. Nodes can only be created as roots or as children of a node that is still live, so the
//! structure is append-only and cannot contain a cycle.
//!
//! Using a released node (retaining it, releasing it again, or giving it a child) means the filter state is corrupt
//! and panics.
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Pose2D;

/// Identifier of a node in an [AncestryTree].
///
/// Slots are reused once a node is freed, so an identifier also records the generation of its slot. An identifier
/// that outlived its node never resolves to the node that took the slot over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: usize,
    generation: u32,
}
impl NodeId {
    /// Arena slot of this node.
    pub fn index(self) -> usize {
        self.index
    }
    pub fn generation(self) -> u32 {
        self.generation
    }
}
impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// What happens to ancestors when a node is freed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PruningPolicy {
    /// Freeing a node drops its reference on the parent, and the parent is freed in turn once nothing references it.
    /// Whole lineages that lost every descendant are reclaimed immediately.
    #[default]
    Deep,
    /// Only the released node itself is freed. Its parent loses the child reference but is kept in the arena even
    /// when it becomes unreferenced; such nodes are reclaimed when the tree is dropped.
    Shallow,
}

/// A single trajectory node.
#[derive(Debug)]
pub struct TrajectoryNode<R> {
    /// Pose of the particle when the node was created.
    pub pose: Pose2D,
    /// Diagnostic weight (0 at creation, set by [AncestryTree::propagate_weights]).
    pub weight: f64,
    /// Sum of the weights of all leaves below this node after the last [AncestryTree::propagate_weights].
    pub accumulated_weight: f64,
    /// The scan that produced this node; `None` for roots.
    pub reading: Option<Arc<R>>,
    parent: Option<NodeId>,
    depth: usize,
    references: usize,
}
impl<R> TrajectoryNode<R> {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }
    /// Number of parent links between this node and its root.
    pub fn depth(&self) -> usize {
        self.depth
    }
    /// Particles and children currently referencing this node.
    pub fn references(&self) -> usize {
        self.references
    }
}

/// Snapshot of one node on a trajectory, as returned by [AncestryTree::trajectory].
#[derive(Debug)]
pub struct TrajectoryPoint<R> {
    pub node: NodeId,
    pub pose: Pose2D,
    pub weight: f64,
    pub accumulated_weight: f64,
    pub reading: Option<Arc<R>>,
}
impl<R> Clone for TrajectoryPoint<R> {
    fn clone(&self) -> Self {
        TrajectoryPoint {
            node: self.node,
            pose: self.pose,
            weight: self.weight,
            accumulated_weight: self.accumulated_weight,
            reading: self.reading.clone(),
        }
    }
}

#[derive(Debug)]
struct Slot<R> {
    /// Bumped every time the slot's node is freed.
    generation: u32,
    node: Option<TrajectoryNode<R>>,
}

/// Reference-counted arena of trajectory nodes.
#[derive(Debug)]
pub struct AncestryTree<R> {
    slots: Vec<Slot<R>>,
    free: Vec<usize>,
    live: usize,
    policy: PruningPolicy,
}
impl<R> Default for AncestryTree<R> {
    fn default() -> Self {
        AncestryTree::new(PruningPolicy::default())
    }
}
impl<R> AncestryTree<R> {
    pub fn new(policy: PruningPolicy) -> Self {
        AncestryTree {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            policy,
        }
    }
    pub fn policy(&self) -> PruningPolicy {
        self.policy
    }
    /// Number of nodes currently stored (including unreferenced nodes kept by [PruningPolicy::Shallow]).
    pub fn len(&self) -> usize {
        self.live
    }
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
    pub fn is_live(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }
    pub fn get(&self, id: NodeId) -> Option<&TrajectoryNode<R>> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }
    /// Depth of a live node (0 for roots).
    pub fn depth(&self, id: NodeId) -> usize {
        self.node(id).depth
    }
    /// Number of stored nodes that nothing references any more.
    pub fn unreferenced(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|slot| slot.node.as_ref())
            .filter(|node| node.references == 0)
            .count()
    }
    /// Create a root node. The caller owns the single reference.
    pub fn insert_root(&mut self, pose: Pose2D) -> NodeId {
        self.insert(TrajectoryNode {
            pose,
            weight: 0.0,
            accumulated_weight: 0.0,
            reading: None,
            parent: None,
            depth: 0,
            references: 1,
        })
    }
    /// Create a child of a live node. The caller owns the single reference on the child; the child holds one
    /// reference on its parent.
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        pose: Pose2D,
        weight: f64,
        reading: Option<Arc<R>>,
    ) -> NodeId {
        let parent_node = self.node_mut(parent);
        parent_node.references += 1;
        let depth = parent_node.depth + 1;
        self.insert(TrajectoryNode {
            pose,
            weight,
            accumulated_weight: 0.0,
            reading,
            parent: Some(parent),
            depth,
            references: 1,
        })
    }
    /// Add a reference to a live node.
    pub fn retain(&mut self, id: NodeId) {
        self.node_mut(id).references += 1;
    }
    /// Drop a reference to a live node, freeing it when it becomes unreferenced.
    ///
    /// # Returns
    /// The number of nodes freed (more than one only under [PruningPolicy::Deep]).
    pub fn release(&mut self, id: NodeId) -> usize {
        let mut freed = 0;
        let mut current = Some(id);
        while let Some(id) = current {
            let node = self.node_mut(id);
            assert!(node.references > 0, "node {id} released while unreferenced");
            node.references -= 1;
            if node.references > 0 {
                break;
            }
            let parent = self.remove(id).parent;
            freed += 1;
            current = match (self.policy, parent) {
                (PruningPolicy::Deep, parent) => parent,
                (PruningPolicy::Shallow, Some(parent)) => {
                    let parent_node = self.node_mut(parent);
                    assert!(
                        parent_node.references > 0,
                        "node {parent} released while unreferenced"
                    );
                    parent_node.references -= 1;
                    None
                }
                (PruningPolicy::Shallow, None) => None,
            };
        }
        freed
    }
    /// Iterate from `id` up to its root.
    pub fn ancestors(&self, id: NodeId) -> Ancestors<'_, R> {
        Ancestors {
            tree: self,
            next: Some(id),
        }
    }
    /// The path from the root down to `leaf`.
    pub fn trajectory(&self, leaf: NodeId) -> Vec<TrajectoryPoint<R>> {
        let mut points: Vec<TrajectoryPoint<R>> = self
            .ancestors(leaf)
            .map(|(id, node)| TrajectoryPoint {
                node: id,
                pose: node.pose,
                weight: node.weight,
                accumulated_weight: node.accumulated_weight,
                reading: node.reading.clone(),
            })
            .collect();
        points.reverse();
        points
    }
    /// Store each leaf's weight on the leaf and accumulate it into every ancestor.
    ///
    /// All accumulated weights are reset first, so after the call each node's `accumulated_weight` is the total
    /// weight of the leaves below it.
    pub fn propagate_weights(&mut self, leaves: &[NodeId], weights: &[f64]) {
        assert_eq!(leaves.len(), weights.len());
        for node in self.slots.iter_mut().filter_map(|slot| slot.node.as_mut()) {
            node.accumulated_weight = 0.0;
        }
        for (&leaf, &weight) in leaves.iter().zip(weights) {
            self.node_mut(leaf).weight = weight;
            let mut current = Some(leaf);
            while let Some(id) = current {
                let node = self.node_mut(id);
                node.accumulated_weight += weight;
                current = node.parent;
            }
        }
    }

    fn insert(&mut self, node: TrajectoryNode<R>) -> NodeId {
        self.live += 1;
        match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot];
                entry.node = Some(node);
                NodeId {
                    index: slot,
                    generation: entry.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        }
    }
    fn remove(&mut self, id: NodeId) -> TrajectoryNode<R> {
        let slot = self
            .slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .unwrap_or_else(|| panic!("node {id} is not live"));
        let node = slot
            .node
            .take()
            .unwrap_or_else(|| panic!("node {id} is not live"));
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        node
    }
    fn node(&self, id: NodeId) -> &TrajectoryNode<R> {
        self.get(id)
            .unwrap_or_else(|| panic!("node {id} is not live"))
    }
    fn node_mut(&mut self, id: NodeId) -> &mut TrajectoryNode<R> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .unwrap_or_else(|| panic!("node {id} is not live"))
    }
}

/// Iterator over a node and its ancestors, leaf first.
pub struct Ancestors<'a, R> {
    tree: &'a AncestryTree<R>,
    next: Option<NodeId>,
}
impl<'a, R> Iterator for Ancestors<'a, R> {
    type Item = (NodeId, &'a TrajectoryNode<R>);
    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let node = self.tree.node(id);
        self.next = node.parent;
        Some((id, node))
    }
}
