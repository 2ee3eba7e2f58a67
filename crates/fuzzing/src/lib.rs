//! Shared fuzzing and testing infrastructure for `rope_rep`.
//!
//! A test case is a sequence of [`Op`]s over nodes, snapshots, and handles.
//! Running it interprets each op against the real implementation and a simple
//! model, and checks after every op that the two agree.

use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use rope_rep::{
    DeleteQueue, Handle, HandleId, NodeKind, NodeRef, SingleThreadedLock, Snapshot,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    /// Create a buffer node holding `len` copies of `fill`.
    NewBuffer { id: u32, len: u16, fill: u8 },
    /// Create an external node holding `len` copies of `fill`.
    NewExternal { id: u32, len: u16, fill: u8 },
    /// Create a sub-range of node `src`. `pos` and `len` are reduced into
    /// bounds.
    SubRange { id: u32, src: u32, pos: u16, len: u16 },
    /// Take another reference to node `src`.
    CloneNode { id: u32, src: u32 },
    /// Drop a node reference.
    DropNode { id: u32 },
    /// Append `len` copies of `fill` in place, if the node allows it.
    Append { id: u32, len: u8, fill: u8 },
    /// Create a snapshot.
    NewSnapshot { id: u32 },
    /// Drop a snapshot.
    DropSnapshot { id: u32 },
    /// Create a handle.
    NewHandle { id: u32 },
    /// Delete a handle.
    DeleteHandle { id: u32 },
}

impl Op {
    fn id_mut(&mut self) -> &mut u32 {
        match self {
            Op::NewBuffer { id, .. }
            | Op::NewExternal { id, .. }
            | Op::SubRange { id, .. }
            | Op::CloneNode { id, .. }
            | Op::DropNode { id }
            | Op::Append { id, .. }
            | Op::NewSnapshot { id }
            | Op::DropSnapshot { id }
            | Op::NewHandle { id }
            | Op::DeleteHandle { id } => id,
        }
    }

    /// The id of the node this op creates, if any.
    fn created_node(&self) -> Option<u32> {
        match self {
            Op::NewBuffer { id, .. }
            | Op::NewExternal { id, .. }
            | Op::SubRange { id, .. }
            | Op::CloneNode { id, .. } => Some(*id),
            _ => None,
        }
    }
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        // Mostly small nodes, with the occasional one that needs a large
        // buffer.
        fn gen_len(ctx: &mut mutatis::Context) -> u16 {
            let max = if ctx.rng().gen_index(8) == Some(0) {
                u16::MAX as u32
            } else {
                600
            };
            (ctx.rng().gen_u32() % max) as u16
        }

        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::NewBuffer {
                    id: ctx.rng().gen_u32(),
                    len: gen_len(ctx),
                    fill: ctx.rng().gen_u32() as u8,
                })
            },
            |ctx| {
                Ok(Op::NewExternal {
                    id: ctx.rng().gen_u32(),
                    len: gen_len(ctx),
                    fill: ctx.rng().gen_u32() as u8,
                })
            },
            |ctx| {
                Ok(Op::SubRange {
                    id: ctx.rng().gen_u32(),
                    src: ctx.rng().gen_u32(),
                    pos: gen_len(ctx),
                    len: gen_len(ctx),
                })
            },
            |ctx| {
                Ok(Op::CloneNode {
                    id: ctx.rng().gen_u32(),
                    src: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::DropNode {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Append {
                    id: ctx.rng().gen_u32(),
                    len: ctx.rng().gen_u32() as u8,
                    fill: ctx.rng().gen_u32() as u8,
                })
            },
            |ctx| {
                Ok(Op::NewSnapshot {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::DropSnapshot {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::NewHandle {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::DeleteHandle {
                    id: ctx.rng().gen_u32(),
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn node_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops
                .iter()
                .enumerate()
                .filter_map(|(i, op)| op.created_node().map(|id| (i, id)))
        }

        // Retarget an operation to an existing node `id`.
        c.mutation(|ctx| {
            let num_nodes = node_positions_and_ids(ops).count();
            if let Some(node_index) = ctx.rng().gen_index(num_nodes) {
                let (_, new_id) = node_positions_and_ids(ops).nth(node_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::SubRange { src, .. } | Op::CloneNode { src, .. } => *src = new_id,
                    op => *op.id_mut() = new_id,
                }
            }
            Ok(())
        })?;

        // Drop an existing node.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_nodes = node_positions_and_ids(ops).count();
                if let Some(node_index) = ctx.rng().gen_index(num_nodes) {
                    let (op_index, id) = node_positions_and_ids(ops).nth(node_index).unwrap();
                    let drop_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(drop_index, Op::DropNode { id });
                }
                Ok(())
            })?;
        }

        // Surround part of the sequence with a snapshot, so deletions in that
        // part are deferred.
        if !c.shrink() {
            c.mutation(|ctx| {
                let id = ctx.rng().gen_u32();
                let start = ctx.rng().gen_index(ops.ops.len() + 1).unwrap();
                ops.ops.insert(start, Op::NewSnapshot { id });
                let end = start + 1 + ctx.rng().gen_index(ops.ops.len() - start).unwrap();
                ops.ops.insert(end, Op::DropSnapshot { id });
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

/// A log of released external nodes and dropped handle payloads, by key.
type Log = Arc<Mutex<Vec<u32>>>;

/// Owns the bytes of an external node built with `NodeRef::from_owner`.
struct OwnedBytes {
    key: u32,
    bytes: Vec<u8>,
    released: Log,
}

impl AsRef<[u8]> for OwnedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for OwnedBytes {
    fn drop(&mut self) {
        self.released.lock().unwrap().push(self.key);
    }
}

/// The value owned by every test handle.
struct Payload {
    key: u32,
    dropped: Log,
}

impl Drop for Payload {
    fn drop(&mut self) {
        self.dropped.lock().unwrap().push(self.key);
    }
}

/// A live node and what we expect of it.
struct LiveNode {
    node: NodeRef,
    expected: Vec<u8>,
    /// The key of the external node this node's bytes live in, if any.
    external: Option<u32>,
}

/// A deleted handle whose payload may still be alive.
struct DeletedHandle {
    key: u32,
    id: HandleId,
    deleted_at: u64,
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last op, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations, creating at most `allocation_limit` bytes
    /// of node payloads at a time.
    pub fn run(&self, allocation_limit: usize) -> Result<(), String> {
        log::debug!("========== Running test operations ==========");

        let queue = DeleteQueue::new(SingleThreadedLock::new());

        // Caller-owned memory of `from_external_parts` nodes. Freed only once
        // the node's releaser has run.
        let mut external_memory: BTreeMap<u32, Box<[u8]>> = BTreeMap::new();
        let released: Log = Arc::default();
        let dropped: Log = Arc::default();

        let mut model = Model {
            nodes: BTreeMap::new(),
            unreleased: BTreeSet::new(),
            snapshots: BTreeMap::new(),
            handles: BTreeMap::new(),
            deleted: Vec::new(),
            clock: 0,
            next_key: 0,
        };

        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::NewBuffer { id, len, fill } => {
                    if model.payload_bytes() + len as usize > allocation_limit {
                        continue;
                    }
                    let expected = vec![fill; len as usize];
                    let node = NodeRef::copy_from_slice(&expected);
                    ensure!(
                        node.kind() == NodeKind::Buffer,
                        "{len} bytes should fit in a buffer node",
                    );
                    model.insert_node(
                        id,
                        LiveNode {
                            node,
                            expected,
                            external: None,
                        },
                    );
                }

                Op::NewExternal { id, len, fill } => {
                    if model.payload_bytes() + len as usize > allocation_limit {
                        continue;
                    }
                    let key = model.key();
                    let expected = vec![fill; len as usize];
                    let node = if fill % 2 == 0 {
                        let memory = expected.clone().into_boxed_slice();
                        let released = released.clone();
                        let node = unsafe {
                            NodeRef::from_external_parts(memory.as_ptr(), memory.len(), move || {
                                released.lock().unwrap().push(key);
                            })
                        };
                        external_memory.insert(key, memory);
                        node
                    } else {
                        NodeRef::from_owner(OwnedBytes {
                            key,
                            bytes: expected.clone(),
                            released: released.clone(),
                        })
                    };
                    ensure!(node.kind() == NodeKind::External, "should be an external node");
                    model.unreleased.insert(key);
                    model.insert_node(
                        id,
                        LiveNode {
                            node,
                            expected,
                            external: Some(key),
                        },
                    );
                }

                Op::SubRange { id, src, pos, len } => {
                    let Some(source) = model.nodes.get(&src) else {
                        continue;
                    };
                    let src_len = source.expected.len();
                    if src_len == 0 {
                        continue;
                    }
                    let pos = pos as usize % src_len;
                    let n = 1 + len as usize % (src_len - pos);
                    let node = source.node.sub_range(pos, n);
                    let expected = source.expected[pos..][..n].to_vec();
                    let external = source.external;

                    if n == src_len {
                        ensure!(
                            NodeRef::ptr_eq(&node, &source.node),
                            "a full sub-range should share its source node",
                        );
                    } else {
                        let range = node.as_range();
                        ensure!(range.is_some(), "a partial sub-range should be a range node");
                        let child = range.unwrap().child();
                        ensure!(
                            child.kind() != NodeKind::Range,
                            "range nodes should never wrap range nodes",
                        );
                        let expected_child = match source.node.as_range() {
                            Some(r) => r.child(),
                            None => &source.node,
                        };
                        ensure!(
                            NodeRef::ptr_eq(child, expected_child),
                            "a sub-range should wrap its source's underlying node",
                        );
                    }

                    model.insert_node(
                        id,
                        LiveNode {
                            node,
                            expected,
                            external,
                        },
                    );
                }

                Op::CloneNode { id, src } => {
                    let Some(source) = model.nodes.get(&src) else {
                        continue;
                    };
                    let live = LiveNode {
                        node: source.node.clone(),
                        expected: source.expected.clone(),
                        external: source.external,
                    };
                    model.insert_node(id, live);
                }

                Op::DropNode { id } => {
                    model.nodes.remove(&id);
                }

                Op::Append { id, len, fill } => {
                    let expected_refs = model.references_to(id);
                    let Some(live) = model.nodes.get_mut(&id) else {
                        continue;
                    };
                    let data = vec![fill; len as usize];

                    let unique = live.node.is_unique();
                    ensure!(
                        unique == (expected_refs == 1),
                        "node with {expected_refs} model references reports unique = {unique}",
                    );
                    let appendable = match live.node.capacity() {
                        Some(cap) if unique => cap - live.expected.len(),
                        _ => 0,
                    };

                    let n = live.node.append_in_place(&data);
                    ensure!(
                        n == appendable.min(data.len()),
                        "appended {n} bytes, expected {}",
                        appendable.min(data.len()),
                    );
                    live.expected.extend_from_slice(&data[..n]);
                }

                Op::NewSnapshot { id } => {
                    model.clock += 1;
                    let snapshot = Snapshot::new_in(&queue);
                    model.snapshots.insert(id, (snapshot, model.clock));
                }

                Op::DropSnapshot { id } => {
                    model.snapshots.remove(&id);
                }

                Op::NewHandle { id } => {
                    let key = model.key();
                    let handle = Handle::new_in(
                        Payload {
                            key,
                            dropped: dropped.clone(),
                        },
                        &queue,
                    );
                    ensure!(
                        handle.safe_to_delete() == model.snapshots.is_empty(),
                        "handles are safe to delete exactly when there are no snapshots",
                    );
                    if let Some(old) = model.handles.insert(id, handle) {
                        model.delete_handle(old);
                    }
                }

                Op::DeleteHandle { id } => {
                    if let Some(handle) = model.handles.remove(&id) {
                        model.delete_handle(handle);
                    }
                }
            }

            model.check_nodes()?;
            model.check_releases(&released, &mut external_memory)?;
            model.check_queue(&queue, &dropped)?;
        }

        // Tear everything down and check that every resource is reclaimed.
        model.nodes.clear();
        model.handles.clear();
        model.snapshots.clear();
        model.check_releases(&released, &mut external_memory)?;
        ensure!(
            model.unreleased.is_empty(),
            "every external node should be released: {:?}",
            model.unreleased,
        );
        ensure!(queue.is_empty(), "the queue should be empty without snapshots");
        ensure!(
            queue.stats().pending == 0,
            "no deletions should be pending: {:?}",
            queue.stats(),
        );

        Ok(())
    }
}

/// Everything that is live during a run, and what we expect of it.
struct Model<'q> {
    nodes: BTreeMap<u32, LiveNode>,
    /// External node keys that have not been released yet.
    unreleased: BTreeSet<u32>,
    snapshots: BTreeMap<u32, (Snapshot<'q, SingleThreadedLock>, u64)>,
    handles: BTreeMap<u32, Handle<'q, Payload, SingleThreadedLock>>,
    /// Deleted handles, in deletion order.
    deleted: Vec<DeletedHandle>,
    /// Ticks on every snapshot creation and handle deletion.
    clock: u64,
    next_key: u32,
}

impl<'q> Model<'q> {
    fn key(&mut self) -> u32 {
        self.next_key += 1;
        self.next_key
    }

    fn payload_bytes(&self) -> usize {
        self.nodes.values().map(|n| n.expected.len()).sum()
    }

    fn insert_node(&mut self, id: u32, node: LiveNode) {
        log::debug!("new node: id{id} -> {:?}", node.node);
        // Drop any old node with this id only after the new one exists, since
        // the new one may be derived from it.
        let old = self.nodes.insert(id, node);
        drop(old);
    }

    /// The number of references to node `id` that the model knows about:
    /// one per live node sharing it, plus one per distinct range node
    /// wrapping it.
    fn references_to(&self, id: u32) -> usize {
        let Some(target) = self.nodes.get(&id) else {
            return 0;
        };
        let shared = self
            .nodes
            .values()
            .filter(|live| NodeRef::ptr_eq(&live.node, &target.node))
            .count();
        shared + self.distinct_ranges_over(&target.node)
    }

    fn distinct_ranges_over(&self, target: &NodeRef) -> usize {
        let mut seen: Vec<&NodeRef> = Vec::new();
        for live in self.nodes.values() {
            let wraps_target = live
                .node
                .as_range()
                .is_some_and(|r| NodeRef::ptr_eq(r.child(), target));
            if wraps_target && !seen.iter().any(|s| NodeRef::ptr_eq(s, &live.node)) {
                seen.push(&live.node);
            }
        }
        seen.len()
    }

    fn delete_handle(&mut self, handle: Handle<'q, Payload, SingleThreadedLock>) {
        self.clock += 1;
        self.deleted.push(DeletedHandle {
            key: handle.key,
            id: handle.id(),
            deleted_at: self.clock,
        });
        handle.delete();
    }

    /// Every node's contents and reference count match the model.
    fn check_nodes(&self) -> Result<(), String> {
        for (id, live) in &self.nodes {
            ensure!(
                live.node.len() == live.expected.len(),
                "id{id}: length {} != expected {}",
                live.node.len(),
                live.expected.len(),
            );
            ensure!(
                live.node.as_bytes() == &live.expected[..],
                "id{id}: contents differ from the model",
            );
            let refs = self.references_to(*id);
            ensure!(
                live.node.refcount() == refs,
                "id{id}: refcount {} != {refs} model references",
                live.node.refcount(),
            );
        }
        Ok(())
    }

    /// External nodes are released exactly once, as soon as nothing can reach
    /// them anymore.
    fn check_releases(
        &mut self,
        released: &Log,
        external_memory: &mut BTreeMap<u32, Box<[u8]>>,
    ) -> Result<(), String> {
        let reachable: BTreeSet<u32> = self.nodes.values().filter_map(|n| n.external).collect();

        for key in released.lock().unwrap().drain(..) {
            log::debug!("external node {key} released");
            ensure!(
                self.unreleased.remove(&key),
                "external node {key} released twice, or never created",
            );
            ensure!(
                !reachable.contains(&key),
                "external node {key} released while still reachable",
            );
            external_memory.remove(&key);
        }

        for key in &self.unreleased {
            ensure!(
                reachable.contains(key),
                "external node {key} unreachable but not released",
            );
        }
        Ok(())
    }

    /// A deleted handle's payload is alive exactly while some snapshot taken
    /// before its deletion is alive, and snapshots see exactly the payloads
    /// deleted after them.
    fn check_queue(
        &mut self,
        queue: &DeleteQueue<SingleThreadedLock>,
        dropped: &Log,
    ) -> Result<(), String> {
        let dropped_now: BTreeSet<u32> = dropped.lock().unwrap().drain(..).collect();
        let oldest_snapshot = self.snapshots.values().map(|(_, t)| *t).min();

        let mut still_deleted = Vec::new();
        for deleted in self.deleted.drain(..) {
            let protected = oldest_snapshot.is_some_and(|t| t < deleted.deleted_at);
            let was_dropped = dropped_now.contains(&deleted.key);
            ensure!(
                protected != was_dropped,
                "handle payload {} deleted at {}: protected = {protected}, dropped = {was_dropped}",
                deleted.key,
                deleted.deleted_at,
            );
            if protected {
                still_deleted.push(deleted);
            }
        }
        self.deleted = still_deleted;

        for (id, (snapshot, taken_at)) in &self.snapshots {
            let visible: Vec<u32> = snapshot
                .inspect_deleted::<Payload>()
                .iter()
                .map(|p| p.key)
                .collect();
            let expected: Vec<u32> = self
                .deleted
                .iter()
                .filter(|d| d.deleted_at > *taken_at)
                .map(|d| d.key)
                .collect();
            ensure!(
                visible == expected,
                "snapshot {id} sees {visible:?}, expected {expected:?}",
            );

            let ids: Vec<HandleId> = self
                .deleted
                .iter()
                .filter(|d| d.deleted_at > *taken_at)
                .map(|d| d.id)
                .collect();
            ensure!(
                snapshot.safe_to_inspect_deleted_handles() == ids,
                "snapshot {id} reports the wrong safe-to-inspect handles",
            );
            for deleted in &self.deleted {
                ensure!(
                    snapshot.is_safe_to_inspect(Some(deleted.id)) == (deleted.deleted_at > *taken_at),
                    "snapshot {id} misjudges handle payload {}",
                    deleted.key,
                );
            }
        }

        ensure!(
            queue.is_empty() == self.snapshots.is_empty(),
            "the queue should be empty exactly when there are no snapshots",
        );
        ensure!(
            queue.stats().pending == self.deleted.len(),
            "{} pending deletions, expected {}",
            queue.stats().pending,
            self.deleted.len(),
        );
        ensure!(
            queue.entries().len() == self.snapshots.len() + self.deleted.len(),
            "the queue holds {} entries",
            queue.entries().len(),
        );
        Ok(())
    }
}
