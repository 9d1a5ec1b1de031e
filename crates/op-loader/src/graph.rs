//! Prerequisite-counted task graph
//!
//! Every node carries a prerequisite count. A node fires exactly once, when
//! its count reaches zero and no hold is outstanding. Firing only queues the
//! node; the owner does its work and then calls [`DependencyGraph::remove_node`],
//! which is what notifies the dependents. Nothing recurses, so deep chains
//! cost no stack.
//!
//! Nodes live in an arena allocated in contiguous ranges and are addressed
//! by generation-checked [`NodeId`]s, so ids held across a range's release
//! go stale instead of aliasing new nodes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use tracing::{trace, warn};

/// What a node stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodePhase {
    /// Package header parsed
    PackageSummary,
    /// Every imported package has parsed its header
    PackageSetupImports,
    /// Every export of the package is serialized
    PackageExportsSerialized,
    ImportCreate,
    ImportSerialize,
    ExportStartIo,
    ExportCreate,
    ExportSerialize,
}

/// Generation-checked node address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// A contiguous block of nodes allocated together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeRange {
    start: u32,
    len: u32,
    generation: u32,
}

impl NodeRange {
    /// Id of the `offset`th node of the range
    pub fn node(&self, offset: u32) -> Option<NodeId> {
        (offset < self.len).then_some(NodeId {
            index: self.start + offset,
            generation: self.generation,
        })
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Initial state of one node
#[derive(Debug, Clone, Copy)]
pub struct NodeSpec<O> {
    pub owner: O,
    pub slot: Option<u32>,
    pub phase: NodePhase,
    /// Provisional prerequisite, released by `done_adding_prerequisites`
    pub hold: bool,
    /// Prerequisites not expressed as arcs, released by `release_implicit`
    pub implicit: u32,
}

/// A node whose prerequisites are all satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredNode<O> {
    pub id: NodeId,
    pub owner: O,
    pub slot: Option<u32>,
    pub phase: NodePhase,
}

#[derive(Debug, Clone)]
struct NodeEntry<O> {
    owner: Option<O>,
    slot: Option<u32>,
    phase: NodePhase,
    generation: u32,
    prerequisites: u32,
    hold: bool,
    fired: bool,
    live: bool,
    dependents: Vec<NodeId>,
}

impl<O> NodeEntry<O> {
    fn vacant() -> Self {
        Self {
            owner: None,
            slot: None,
            phase: NodePhase::PackageSummary,
            generation: 0,
            prerequisites: 0,
            hold: false,
            fired: false,
            live: false,
            dependents: Vec::new(),
        }
    }
}

/// Result of walking a stalled graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallReport<O> {
    /// Owners of every live node
    pub owners: Vec<O>,
    /// Wait chain from a blocked node to what it ultimately waits on
    pub chain: Vec<FiredNode<O>>,
    /// True when the chain loops back on itself
    pub cycle: bool,
}

impl<O: fmt::Debug> fmt::Display for StallReport<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<String> = self
            .chain
            .iter()
            .map(|n| match n.slot {
                Some(slot) => format!("{:?}:{:?}[{}]", n.owner, n.phase, slot),
                None => format!("{:?}:{:?}", n.owner, n.phase),
            })
            .collect();
        write!(
            f,
            "{} waits on {}",
            steps.join(" <- "),
            if self.cycle { "itself" } else { "an unreleased hold" }
        )
    }
}

/// Arena of prerequisite-counted nodes
pub struct DependencyGraph<O> {
    nodes: Vec<NodeEntry<O>>,
    free: Vec<(u32, u32)>,
    fired: VecDeque<FiredNode<O>>,
    next_generation: u32,
    live: usize,
    fired_total: u64,
}

impl<O: Copy + Eq + fmt::Debug> Default for DependencyGraph<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: Copy + Eq + fmt::Debug> DependencyGraph<O> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            fired: VecDeque::new(),
            next_generation: 1,
            live: 0,
            fired_total: 0,
        }
    }

    fn entry(&self, id: NodeId) -> Option<&NodeEntry<O>> {
        self.nodes
            .get(id.index as usize)
            .filter(|n| n.live && n.generation == id.generation)
    }

    fn entry_mut(&mut self, id: NodeId) -> Option<&mut NodeEntry<O>> {
        self.nodes
            .get_mut(id.index as usize)
            .filter(|n| n.live && n.generation == id.generation)
    }

    fn reserve(&mut self, len: u32) -> NodeRange {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);

        if let Some(pos) = self.free.iter().position(|(_, free_len)| *free_len >= len) {
            let (start, free_len) = self.free[pos];
            if free_len == len {
                self.free.swap_remove(pos);
            } else {
                self.free[pos] = (start + len, free_len - len);
            }
            return NodeRange {
                start,
                len,
                generation,
            };
        }
        let start = self.nodes.len() as u32;
        self.nodes
            .extend(std::iter::repeat_with(NodeEntry::vacant).take(len as usize));
        NodeRange {
            start,
            len,
            generation,
        }
    }

    /// Allocate one contiguous range holding `specs`, in order
    pub fn add_nodes(&mut self, specs: &[NodeSpec<O>]) -> NodeRange {
        let range = self.reserve(specs.len() as u32);
        for (offset, spec) in specs.iter().enumerate() {
            let index = (range.start as usize) + offset;
            self.nodes[index] = NodeEntry {
                owner: Some(spec.owner),
                slot: spec.slot,
                phase: spec.phase,
                generation: range.generation,
                prerequisites: spec.implicit,
                hold: spec.hold,
                fired: false,
                live: true,
                dependents: Vec::new(),
            };
            self.live += 1;
            let id = NodeId {
                index: index as u32,
                generation: range.generation,
            };
            self.try_fire(id);
        }
        range
    }

    /// Register a single node
    pub fn add_node(
        &mut self,
        owner: O,
        phase: NodePhase,
        slot: Option<u32>,
        hold: bool,
        implicit: u32,
    ) -> NodeId {
        let range = self.add_nodes(&[NodeSpec {
            owner,
            slot,
            phase,
            hold,
            implicit,
        }]);
        NodeId {
            index: range.start,
            generation: range.generation,
        }
    }

    /// Make `dependent` wait for `prerequisite` to be removed.
    ///
    /// Returns false when the prerequisite is already gone (nothing to wait
    /// for) or the dependent can no longer take prerequisites.
    pub fn add_arc(&mut self, prerequisite: NodeId, dependent: NodeId) -> bool {
        if self.entry(prerequisite).is_none() {
            return false;
        }
        match self.entry_mut(dependent) {
            Some(node) if !node.fired => node.prerequisites += 1,
            Some(node) => {
                warn!(
                    "Arc into already fired node {:?}:{:?} ignored",
                    node.owner, node.phase
                );
                return false;
            }
            None => return false,
        }
        if let Some(node) = self.entry_mut(prerequisite) {
            node.dependents.push(dependent);
        }
        true
    }

    /// Release the provisional hold of `id`
    pub fn done_adding_prerequisites(&mut self, id: NodeId) {
        if let Some(node) = self.entry_mut(id) {
            node.hold = false;
        }
        self.try_fire(id);
    }

    /// Release one implicit prerequisite of `id`
    pub fn release_implicit(&mut self, id: NodeId) {
        if let Some(node) = self.entry_mut(id) {
            node.prerequisites = node.prerequisites.saturating_sub(1);
        }
        self.try_fire(id);
    }

    fn try_fire(&mut self, id: NodeId) {
        let Some(node) = self.entry_mut(id) else {
            return;
        };
        if node.fired || node.hold || node.prerequisites > 0 {
            return;
        }
        node.fired = true;
        let Some(owner) = node.owner else {
            return;
        };
        let fired = FiredNode {
            id,
            owner,
            slot: node.slot,
            phase: node.phase,
        };
        self.fired_total += 1;
        trace!("Fired {:?}:{:?} {:?}", fired.owner, fired.phase, fired.slot);
        self.fired.push_back(fired);
    }

    /// Remove a fired node and notify its dependents.
    ///
    /// Returns the number of dependents that fired as a result.
    pub fn remove_node(&mut self, id: NodeId) -> usize {
        let dependents = match self.entry_mut(id) {
            Some(node) if node.fired => {
                node.live = false;
                std::mem::take(&mut node.dependents)
            }
            Some(node) => {
                warn!(
                    "Refusing to remove unfired node {:?}:{:?}",
                    node.owner, node.phase
                );
                return 0;
            }
            None => return 0,
        };
        self.live -= 1;

        let before = self.fired.len();
        for dependent in dependents {
            if let Some(node) = self.entry_mut(dependent) {
                node.prerequisites = node.prerequisites.saturating_sub(1);
            }
            self.try_fire(dependent);
        }
        self.fired.len() - before
    }

    /// Fire `id` regardless of its prerequisites
    pub fn force_fire(&mut self, id: NodeId) {
        if let Some(node) = self.entry_mut(id) {
            node.prerequisites = 0;
            node.hold = false;
        }
        self.try_fire(id);
    }

    /// Force-fire every live node of `range`
    pub fn force_fire_range(&mut self, range: NodeRange) {
        for offset in 0..range.len {
            if let Some(id) = range.node(offset) {
                self.force_fire(id);
            }
        }
    }

    /// Drop every node of `range` without notifying dependents and recycle it
    pub fn release_range(&mut self, range: NodeRange) {
        if range.is_empty() {
            return;
        }
        for offset in 0..range.len {
            let index = (range.start + offset) as usize;
            if let Some(node) = self.nodes.get_mut(index) {
                if node.generation == range.generation {
                    if node.live {
                        self.live -= 1;
                    }
                    *node = NodeEntry::vacant();
                }
            }
        }
        self.fired.retain(|f| {
            !(f.id.index >= range.start
                && f.id.index < range.start + range.len
                && f.id.generation == range.generation)
        });
        self.free.push((range.start, range.len));
    }

    /// Remove every live node of `range`, notifying dependents, then recycle it
    pub fn retire_range(&mut self, range: NodeRange) {
        for offset in 0..range.len {
            if let Some(id) = range.node(offset) {
                if self.is_live(id) {
                    self.force_fire(id);
                    self.remove_node(id);
                }
            }
        }
        self.release_range(range);
    }

    pub fn pop_fired(&mut self) -> Option<FiredNode<O>> {
        self.fired.pop_front()
    }

    pub fn has_fired(&self) -> bool {
        !self.fired.is_empty()
    }

    pub fn is_live(&self, id: NodeId) -> bool {
        self.entry(id).is_some()
    }

    pub fn is_fired(&self, id: NodeId) -> bool {
        self.entry(id).map_or(false, |n| n.fired)
    }

    pub fn prerequisite_count(&self, id: NodeId) -> Option<u32> {
        self.entry(id).map(|n| n.prerequisites)
    }

    /// Number of nodes not yet removed
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Number of nodes fired since creation
    pub fn fired_total(&self) -> u64 {
        self.fired_total
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.fired.clear();
        self.live = 0;
    }

    fn describe(&self, index: usize) -> Option<FiredNode<O>> {
        let node = &self.nodes[index];
        Some(FiredNode {
            id: NodeId {
                index: index as u32,
                generation: node.generation,
            },
            owner: node.owner?,
            slot: node.slot,
            phase: node.phase,
        })
    }

    /// Walk the live, unfired nodes to explain why nothing can fire.
    ///
    /// Returns `None` when no node is blocked.
    pub fn diagnose_stall(&self) -> Option<StallReport<O>> {
        let blocked: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.live && !n.fired)
            .map(|(i, _)| i)
            .collect();
        if blocked.is_empty() {
            return None;
        }

        // Reverse the dependent lists: what each blocked node waits on
        let mut waits_on: HashMap<u32, Vec<u32>> = HashMap::new();
        for (index, node) in self.nodes.iter().enumerate() {
            if !node.live {
                continue;
            }
            for dependent in &node.dependents {
                if self.entry(*dependent).is_some() {
                    waits_on.entry(dependent.index).or_default().push(index as u32);
                }
            }
        }

        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cycle = false;
        let mut current = blocked[0] as u32;
        loop {
            if !seen.insert(current) {
                cycle = true;
                break;
            }
            if let Some(step) = self.describe(current as usize) {
                chain.push(step);
            }
            match waits_on.get(&current).and_then(|p| p.first()) {
                Some(next) => current = *next,
                None => break,
            }
        }

        let mut owners = Vec::new();
        for node in self.nodes.iter().filter(|n| n.live) {
            if let Some(owner) = node.owner {
                if !owners.contains(&owner) {
                    owners.push(owner);
                }
            }
        }
        Some(StallReport {
            owners,
            chain,
            cycle,
        })
    }
}
