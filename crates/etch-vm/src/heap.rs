//! Reference-counted heap with an edge cache.
//!
//! Every aggregate value lives here behind a stable integer id. Strong
//! references are counted; weak references are heap objects of their own
//! holding a target id that flips to −1 when the target dies. Inter-object
//! strong edges are mirrored twice: in each object's `field_refs` multiset
//! and in the global [`EdgeBuffer`], which is what cycle detection walks
//! instead of re-scanning slot contents.
//!
//! All operations are synchronous and assume single-threaded access; the
//! VM owns the heap exclusively.

use indexmap::IndexMap;
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};

use etch_core::{HeapId, Value};

use crate::VmErrorKind;

/// Default number of allocations between automatic cycle-collection passes.
pub const DEFAULT_CYCLE_INTERVAL: u64 = 1024;

/// Fraction of invalidated edges that triggers buffer compaction.
const COMPACT_THRESHOLD: f64 = 0.25;

/* ─────────────────────────── Objects ─────────────────────────── */

/// Kind of a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    /// Field store keyed by name.
    Table,
    /// Ordered element store.
    Array,
    /// Weak reference slot.
    Weak,
}

/// Slot storage of an object.
#[derive(Debug, Clone)]
pub enum Slots {
    /// Named fields, iteration in insertion order.
    Table(IndexMap<String, Value>),
    /// Ordered elements.
    Array(Vec<Value>),
    /// Weak target: the referred id, or −1 once invalidated, plus the
    /// target's kind tag.
    Weak {
        /// Target id (−1 when the target was freed).
        target: i64,
        /// Kind the target had when the weak ref was created.
        kind: ObjKind,
    },
}

/// One heap object.
#[derive(Debug, Clone)]
pub struct HeapObject {
    /// Stable id.
    pub id: HeapId,
    /// Object kind.
    pub kind: ObjKind,
    /// Strong reference count. Negative is a critical corruption.
    pub strong_refs: i64,
    /// Mutation flag; must mirror membership in the heap's dirty set.
    pub dirty: bool,
    /// Slot storage.
    pub slots: Slots,
    /// Multiset of heap ids appearing in slot values (the edge cache).
    pub field_refs: Vec<HeapId>,
}

impl HeapObject {
    /// Recomputes the strong-id multiset from slot contents.
    pub fn ids_in_slots(&self) -> Vec<HeapId> {
        let mut out = Vec::new();
        match &self.slots {
            Slots::Table(fields) => {
                for v in fields.values() {
                    v.collect_strong_ids(&mut out);
                }
            }
            Slots::Array(elems) => {
                for v in elems {
                    v.collect_strong_ids(&mut out);
                }
            }
            Slots::Weak { .. } => {}
        }
        out
    }
}

/* ─────────────────────────── Edge buffer ─────────────────────────── */

/// Kind of a strong inter-object edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Through a named table field.
    Field,
    /// Through an array element.
    Element,
}

/// One strong edge. `dst` is −1 once invalidated in place.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    /// Source object.
    pub src: HeapId,
    /// Target object, or −1.
    pub dst: i64,
    /// How the edge is held.
    pub kind: EdgeKind,
}

/// Flat buffer of every strong inter-object edge, with a per-source index
/// for outgoing enumeration. ~12-byte entries beat per-object hash sets on
/// memory and give cycle detection O(E) traversal.
#[derive(Debug, Default)]
pub struct EdgeBuffer {
    edges: Vec<Edge>,
    by_src: HashMap<HeapId, SmallVec<[u32; 4]>>,
    invalid: usize,
}

impl EdgeBuffer {
    /// Records an edge.
    pub fn record(&mut self, src: HeapId, dst: HeapId, kind: EdgeKind) {
        let pos = self.edges.len() as u32;
        self.edges.push(Edge { src, dst: dst as i64, kind });
        self.by_src.entry(src).or_default().push(pos);
    }

    /// Invalidates the first live edge `src → dst`. Returns false when no
    /// such edge exists (a field-ref mismatch in the making).
    pub fn remove_one(&mut self, src: HeapId, dst: HeapId) -> bool {
        if let Some(positions) = self.by_src.get(&src) {
            for &pos in positions {
                let edge = &mut self.edges[pos as usize];
                if edge.dst == dst as i64 {
                    edge.dst = -1;
                    self.invalid += 1;
                    return true;
                }
            }
        }
        false
    }

    /// Invalidates every outgoing edge of `src` (object freed).
    pub fn invalidate_src(&mut self, src: HeapId) {
        if let Some(positions) = self.by_src.remove(&src) {
            for pos in positions {
                let edge = &mut self.edges[pos as usize];
                if edge.dst >= 0 {
                    edge.dst = -1;
                    self.invalid += 1;
                }
            }
        }
    }

    /// Live outgoing targets of `src`, in record order.
    pub fn outgoing(&self, src: HeapId) -> impl Iterator<Item = HeapId> + '_ {
        self.by_src
            .get(&src)
            .into_iter()
            .flatten()
            .filter_map(|&pos| {
                let edge = self.edges[pos as usize];
                (edge.dst >= 0).then_some(edge.dst as u64)
            })
    }

    /// All live edges.
    pub fn iter_live(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(|e| e.dst >= 0)
    }

    /// Total entries, including invalidated ones.
    pub fn raw_len(&self) -> usize { self.edges.len() }

    /// Fraction of entries that are invalidated.
    pub fn invalid_fraction(&self) -> f64 {
        if self.edges.is_empty() {
            0.0
        } else {
            self.invalid as f64 / self.edges.len() as f64
        }
    }

    /// Repacks live entries whose endpoints are both in `live`, rebuilding
    /// the source index.
    pub fn compact(&mut self, live: &HashSet<HeapId>) {
        let old = std::mem::take(&mut self.edges);
        self.by_src.clear();
        self.invalid = 0;
        for edge in old {
            if edge.dst >= 0 && live.contains(&edge.src) && live.contains(&(edge.dst as u64)) {
                let pos = self.edges.len() as u32;
                self.by_src.entry(edge.src).or_default().push(pos);
                self.edges.push(edge);
            }
        }
    }
}

/* ─────────────────────────── Heap ─────────────────────────── */

/// The VM heap.
#[derive(Debug, Default)]
pub struct Heap {
    pub(crate) objects: HashMap<HeapId, HeapObject>,
    pub(crate) free_list: Vec<HeapId>,
    pub(crate) dirty_objects: HashSet<HeapId>,
    pub(crate) edges: EdgeBuffer,
    next_id: HeapId,
    allocs_since_cycle: u64,
    cycle_interval: u64,
}

impl Heap {
    /// Fresh heap with the default cycle-collection interval.
    pub fn new() -> Self {
        Self { cycle_interval: DEFAULT_CYCLE_INTERVAL, ..Self::default() }
    }

    /// Overrides the allocation interval between automatic cycle passes.
    pub fn set_cycle_interval(&mut self, interval: u64) {
        self.cycle_interval = interval.max(1);
    }

    /// Number of live objects.
    pub fn live_count(&self) -> usize { self.objects.len() }

    /// The free list contents (id recycling order).
    pub fn free_list(&self) -> &[HeapId] { &self.free_list }

    /// Immutable access to an object.
    pub fn get(&self, id: HeapId) -> Option<&HeapObject> { self.objects.get(&id) }

    /// True when an automatic cycle pass is due.
    pub fn collection_due(&self) -> bool { self.allocs_since_cycle >= self.cycle_interval }

    pub(crate) fn reset_collection_clock(&mut self) { self.allocs_since_cycle = 0; }

    fn fresh_id(&mut self) -> HeapId {
        match self.free_list.pop() {
            Some(id) => id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        }
    }

    fn insert(&mut self, kind: ObjKind, slots: Slots) -> HeapId {
        let id = self.fresh_id();
        self.objects.insert(
            id,
            HeapObject { id, kind, strong_refs: 1, dirty: true, slots, field_refs: Vec::new() },
        );
        self.dirty_objects.insert(id);
        self.allocs_since_cycle += 1;
        id
    }

    /// Allocates an empty table; the new object starts with one strong ref
    /// (the register receiving it).
    pub fn alloc_table(&mut self) -> HeapId { self.insert(ObjKind::Table, Slots::Table(IndexMap::new())) }

    /// Allocates an empty array with a capacity hint.
    pub fn alloc_array(&mut self, len_hint: usize) -> HeapId {
        self.insert(ObjKind::Array, Slots::Array(Vec::with_capacity(len_hint)))
    }

    /// Allocates a weak reference slot. Does not touch the target's
    /// refcount.
    pub fn alloc_weak(&mut self, target: HeapId, kind: ObjKind) -> HeapId {
        self.insert(ObjKind::Weak, Slots::Weak { target: target as i64, kind })
    }

    /// Increments the strong count of `id`.
    pub fn inc_ref(&mut self, id: HeapId) {
        if let Some(obj) = self.objects.get_mut(&id) {
            obj.strong_refs += 1;
        }
    }

    /// Decrements the strong count of `id`, freeing on zero. Freeing
    /// cascades through outgoing edges with an explicit worklist,
    /// invalidates weak references to each freed object and recycles ids
    /// through the free list.
    pub fn dec_ref(&mut self, id: HeapId) {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let Some(obj) = self.objects.get_mut(&id) else { continue };
            obj.strong_refs -= 1;
            if obj.strong_refs > 0 {
                continue;
            }
            // strong_refs hit zero (or went negative — free anyway, verify
            // reports the corruption): release the object.
            let obj = self.objects.remove(&id).expect("object vanished mid-free");
            work.extend(obj.field_refs.iter().copied());
            self.edges.invalidate_src(id);
            self.dirty_objects.remove(&id);
            self.invalidate_weak_refs_to(id);
            self.free_list.push(id);
        }
    }

    fn invalidate_weak_refs_to(&mut self, dead: HeapId) {
        for obj in self.objects.values_mut() {
            if let Slots::Weak { target, .. } = &mut obj.slots {
                if *target == dead as i64 {
                    *target = -1;
                }
            }
        }
    }

    /// Adjusts refcounts for every strong id reachable through `value`.
    pub fn inc_value(&mut self, value: &Value) {
        let mut ids = Vec::new();
        value.collect_strong_ids(&mut ids);
        for id in ids {
            self.inc_ref(id);
        }
    }

    /// Symmetric to [`Heap::inc_value`].
    pub fn dec_value(&mut self, value: &Value) {
        let mut ids = Vec::new();
        value.collect_strong_ids(&mut ids);
        for id in ids {
            self.dec_ref(id);
        }
    }

    /// Records the edges a newly stored slot value introduces: edge buffer
    /// entry, `field_refs` mirror and target refcount, per reachable id.
    pub fn track_ref(&mut self, src: HeapId, value: &Value, kind: EdgeKind) {
        let mut ids = Vec::new();
        value.collect_strong_ids(&mut ids);
        for id in ids {
            self.edges.record(src, id, kind);
            if let Some(obj) = self.objects.get_mut(&src) {
                obj.field_refs.push(id);
            }
            self.inc_ref(id);
        }
    }

    /// Symmetric on overwrite: drops the edges the old slot value held.
    pub fn untrack_ref(&mut self, src: HeapId, old: &Value) {
        let mut ids = Vec::new();
        old.collect_strong_ids(&mut ids);
        for id in ids {
            self.edges.remove_one(src, id);
            if let Some(obj) = self.objects.get_mut(&src) {
                if let Some(pos) = obj.field_refs.iter().position(|&r| r == id) {
                    obj.field_refs.swap_remove(pos);
                }
            }
            self.dec_ref(id);
        }
    }

    fn mark_dirty(&mut self, id: HeapId) {
        if let Some(obj) = self.objects.get_mut(&id) {
            obj.dirty = true;
            self.dirty_objects.insert(id);
        }
    }

    /* ── Slot mutation (tracks edges) ── */

    /// Writes a table field, maintaining edges and refcounts.
    pub fn set_field(&mut self, id: HeapId, name: &str, value: Value) -> Result<(), VmErrorKind> {
        let old = {
            let obj = self
                .objects
                .get_mut(&id)
                .ok_or_else(|| VmErrorKind::dangling(id))?;
            let Slots::Table(fields) = &mut obj.slots else {
                return Err(VmErrorKind::Internal(format!("object #{id} is not a table")));
            };
            fields.insert(name.to_string(), value.clone())
        };
        if let Some(old) = old {
            self.untrack_ref(id, &old);
        }
        self.track_ref(id, &value, EdgeKind::Field);
        self.mark_dirty(id);
        Ok(())
    }

    /// Reads a table field.
    pub fn field(&self, id: HeapId, name: &str) -> Result<Option<Value>, VmErrorKind> {
        let obj = self.objects.get(&id).ok_or_else(|| VmErrorKind::dangling(id))?;
        match &obj.slots {
            Slots::Table(fields) => Ok(fields.get(name).cloned()),
            _ => Err(VmErrorKind::Internal(format!("object #{id} is not a table"))),
        }
    }

    /// Writes an array element (0-based, bounds-checked).
    pub fn set_element(&mut self, id: HeapId, index: i64, value: Value) -> Result<(), VmErrorKind> {
        let old = {
            let obj = self
                .objects
                .get_mut(&id)
                .ok_or_else(|| VmErrorKind::dangling(id))?;
            let Slots::Array(elems) = &mut obj.slots else {
                return Err(VmErrorKind::Internal(format!("object #{id} is not an array")));
            };
            if index < 0 || index as usize >= elems.len() {
                return Err(VmErrorKind::IndexOutOfBounds { index, len: elems.len() });
            }
            std::mem::replace(&mut elems[index as usize], value.clone())
        };
        self.untrack_ref(id, &old);
        self.track_ref(id, &value, EdgeKind::Element);
        self.mark_dirty(id);
        Ok(())
    }

    /// Reads an array element (0-based, bounds-checked).
    pub fn element(&self, id: HeapId, index: i64) -> Result<Value, VmErrorKind> {
        let obj = self.objects.get(&id).ok_or_else(|| VmErrorKind::dangling(id))?;
        match &obj.slots {
            Slots::Array(elems) => {
                if index < 0 || index as usize >= elems.len() {
                    return Err(VmErrorKind::IndexOutOfBounds { index, len: elems.len() });
                }
                Ok(elems[index as usize].clone())
            }
            _ => Err(VmErrorKind::Internal(format!("object #{id} is not an array"))),
        }
    }

    /// Appends to an array.
    pub fn push_element(&mut self, id: HeapId, value: Value) -> Result<(), VmErrorKind> {
        {
            let obj = self
                .objects
                .get_mut(&id)
                .ok_or_else(|| VmErrorKind::dangling(id))?;
            let Slots::Array(elems) = &mut obj.slots else {
                return Err(VmErrorKind::Internal(format!("object #{id} is not an array")));
            };
            elems.push(value.clone());
        }
        self.track_ref(id, &value, EdgeKind::Element);
        self.mark_dirty(id);
        Ok(())
    }

    /// Array length.
    pub fn array_len(&self, id: HeapId) -> Result<usize, VmErrorKind> {
        let obj = self.objects.get(&id).ok_or_else(|| VmErrorKind::dangling(id))?;
        match &obj.slots {
            Slots::Array(elems) => Ok(elems.len()),
            _ => Err(VmErrorKind::Internal(format!("object #{id} is not an array"))),
        }
    }

    /// Resolves a weak object to its target, if still alive.
    pub fn weak_target(&self, id: HeapId) -> Result<Option<(HeapId, ObjKind)>, VmErrorKind> {
        let obj = self.objects.get(&id).ok_or_else(|| VmErrorKind::dangling(id))?;
        match &obj.slots {
            Slots::Weak { target, kind } => Ok((*target >= 0).then_some((*target as u64, *kind))),
            _ => Err(VmErrorKind::Internal(format!("object #{id} is not a weak ref"))),
        }
    }
}

/* ─────────────────────────── Tests ─────────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_starts_dirty_with_one_ref() {
        let mut heap = Heap::new();
        let id = heap.alloc_table();
        let obj = heap.get(id).unwrap();
        assert_eq!(obj.strong_refs, 1);
        assert!(obj.dirty);
        assert!(heap.dirty_objects.contains(&id));
    }

    #[test]
    fn dec_to_zero_frees_and_recycles() {
        let mut heap = Heap::new();
        let id = heap.alloc_table();
        heap.dec_ref(id);
        assert!(heap.get(id).is_none());
        assert_eq!(heap.free_list(), &[id]);

        let id2 = heap.alloc_array(0);
        assert_eq!(id2, id, "ids recycle through the free list");
    }

    #[test]
    fn field_assignment_tracks_edges_and_refs() {
        let mut heap = Heap::new();
        let a = heap.alloc_table();
        let b = heap.alloc_table();

        heap.set_field(a, "next", Value::Table(b)).unwrap();
        assert_eq!(heap.get(b).unwrap().strong_refs, 2);
        assert_eq!(heap.get(a).unwrap().field_refs, vec![b]);
        assert_eq!(heap.edges.outgoing(a).collect::<Vec<_>>(), vec![b]);

        // overwrite unhooks the old target
        heap.set_field(a, "next", Value::Nil).unwrap();
        assert_eq!(heap.get(b).unwrap().strong_refs, 1);
        assert!(heap.get(a).unwrap().field_refs.is_empty());
        assert_eq!(heap.edges.outgoing(a).count(), 0);
    }

    #[test]
    fn cascade_free_through_fields() {
        let mut heap = Heap::new();
        let outer = heap.alloc_table();
        let inner = heap.alloc_array(2);
        heap.set_field(outer, "items", Value::Array(inner)).unwrap();
        // register drops its handle on inner
        heap.dec_ref(inner);
        assert!(heap.get(inner).is_some(), "still held by outer.items");

        heap.dec_ref(outer);
        assert!(heap.get(outer).is_none());
        assert!(heap.get(inner).is_none(), "cascade freed");
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn wrapped_values_count() {
        let mut heap = Heap::new();
        let holder = heap.alloc_table();
        let boxed = heap.alloc_table();
        heap.set_field(holder, "maybe", Value::Some(Box::new(Value::Table(boxed)))).unwrap();
        assert_eq!(heap.get(boxed).unwrap().strong_refs, 2);
        assert_eq!(heap.get(holder).unwrap().field_refs, vec![boxed]);
    }

    #[test]
    fn weak_refs_invalidate_on_target_free() {
        let mut heap = Heap::new();
        let target = heap.alloc_table();
        let weak = heap.alloc_weak(target, ObjKind::Table);
        assert_eq!(heap.get(target).unwrap().strong_refs, 1, "weak does not count");
        assert_eq!(heap.weak_target(weak).unwrap(), Some((target, ObjKind::Table)));

        heap.dec_ref(target);
        assert_eq!(heap.weak_target(weak).unwrap(), None);
    }

    #[test]
    fn element_bounds() {
        let mut heap = Heap::new();
        let arr = heap.alloc_array(1);
        heap.push_element(arr, Value::Int(5)).unwrap();
        assert_eq!(heap.element(arr, 0).unwrap(), Value::Int(5));
        assert!(matches!(
            heap.element(arr, 1),
            Err(VmErrorKind::IndexOutOfBounds { index: 1, len: 1 })
        ));
        assert!(matches!(
            heap.element(arr, -1),
            Err(VmErrorKind::IndexOutOfBounds { index: -1, len: 1 })
        ));
    }

    #[test]
    fn edge_buffer_compaction() {
        let mut buf = EdgeBuffer::default();
        for i in 0..8u64 {
            buf.record(100, i, EdgeKind::Element);
        }
        for i in 0..6u64 {
            buf.remove_one(100, i);
        }
        assert!(buf.invalid_fraction() > 0.5);

        let live: HashSet<HeapId> = [100, 6, 7].into_iter().collect();
        buf.compact(&live);
        assert_eq!(buf.raw_len(), 2);
        assert_eq!(buf.invalid_fraction(), 0.0);
        assert_eq!(buf.outgoing(100).collect::<Vec<_>>(), vec![6, 7]);
    }
}
