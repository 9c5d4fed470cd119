//! Heap self-verification and recovery.
//!
//! Verification is observation-only: it walks the heap, checks every
//! invariant and produces a report with a health score. Nothing is
//! mutated. `attempt_recovery` then fixes the repairable classes (dirty
//! inconsistency, field-ref mismatch, live-id-on-freelist); dangling
//! references, negative refcounts and weak-ref corruption are reported
//! but never auto-repaired.

use std::collections::HashMap;

use etch_core::HeapId;
use log::{debug, warn};

use crate::heap::{Heap, Slots};

/// Classes of heap issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IssueKind {
    /// `strong_refs < 0`.
    NegativeRefcount,
    /// Id present both in the object table and on the free list.
    DoubleFreed,
    /// `field_refs` disagrees with the ids actually stored in slots.
    FieldRefMismatch,
    /// Dirty flag and dirty-set membership disagree.
    DirtyInconsistency,
    /// A live edge points at an id that is not a live object.
    DanglingReference,
    /// A weak ref's target id is neither −1 nor a live object.
    WeakRefCorruption,
}

impl IssueKind {
    /// Whether `attempt_recovery` can fix this class.
    pub fn repairable(self) -> bool {
        matches!(
            self,
            IssueKind::DoubleFreed | IssueKind::FieldRefMismatch | IssueKind::DirtyInconsistency
        )
    }
}

/// Severity of an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Corruption; the heap's answers can no longer be trusted.
    Critical,
    /// Repairable inconsistency.
    Warning,
}

/// One reported issue.
#[derive(Debug, Clone)]
pub struct HeapIssue {
    /// Issue class.
    pub kind: IssueKind,
    /// Severity.
    pub severity: Severity,
    /// Offending object, when the issue is object-scoped.
    pub id: Option<HeapId>,
    /// Human description.
    pub message: String,
}

/// Outcome of a verification pass.
#[derive(Debug, Clone, Default)]
pub struct HeapReport {
    /// Issues found, in scan order.
    pub issues: Vec<HeapIssue>,
    /// Ratio of healthy invariant checks, in `[0.0, 1.0]`.
    pub health_score: f64,
    /// Number of invariant checks performed.
    pub checks: usize,
}

impl HeapReport {
    /// True when no issue was found.
    pub fn healthy(&self) -> bool { self.issues.is_empty() }

    /// Issues of a given kind.
    pub fn of_kind(&self, kind: IssueKind) -> impl Iterator<Item = &HeapIssue> {
        self.issues.iter().filter(move |i| i.kind == kind)
    }

    /// Number of critical issues.
    pub fn critical_count(&self) -> usize {
        self.issues.iter().filter(|i| i.severity == Severity::Critical).count()
    }
}

fn multiset(ids: &[HeapId]) -> HashMap<HeapId, usize> {
    let mut out = HashMap::new();
    for &id in ids {
        *out.entry(id).or_insert(0) += 1;
    }
    out
}

impl Heap {
    /// Comprehensive invariant check. `verbose` logs each object visited.
    pub fn verify_heap(&self, verbose: bool) -> HeapReport {
        let mut report = HeapReport::default();
        let mut checks = 0usize;

        let mut push = |report: &mut HeapReport, kind, severity, id, message: String| {
            if severity == Severity::Critical {
                warn!("heap verify: {message}");
            }
            report.issues.push(HeapIssue { kind, severity, id, message });
        };

        for obj in self.objects.values() {
            if verbose {
                debug!(
                    "verify #{} kind={:?} refs={} dirty={} slots={}",
                    obj.id,
                    obj.kind,
                    obj.strong_refs,
                    obj.dirty,
                    obj.field_refs.len()
                );
            }

            // refcount sign
            checks += 1;
            if obj.strong_refs < 0 {
                push(
                    &mut report,
                    IssueKind::NegativeRefcount,
                    Severity::Critical,
                    Some(obj.id),
                    format!("object #{} has negative refcount {}", obj.id, obj.strong_refs),
                );
            }

            // live ⊕ free
            checks += 1;
            if self.free_list.contains(&obj.id) {
                push(
                    &mut report,
                    IssueKind::DoubleFreed,
                    Severity::Warning,
                    Some(obj.id),
                    format!("object #{} is live but also on the free list", obj.id),
                );
            }

            // field_refs mirrors slot contents (multiset equality)
            checks += 1;
            let actual = obj.ids_in_slots();
            if multiset(&actual) != multiset(&obj.field_refs) {
                push(
                    &mut report,
                    IssueKind::FieldRefMismatch,
                    Severity::Warning,
                    Some(obj.id),
                    format!(
                        "object #{}: field refs {:?} disagree with slot contents {:?}",
                        obj.id, obj.field_refs, actual
                    ),
                );
            }

            // dirty flag ⇔ dirty set
            checks += 1;
            if obj.dirty != self.dirty_objects.contains(&obj.id) {
                push(
                    &mut report,
                    IssueKind::DirtyInconsistency,
                    Severity::Warning,
                    Some(obj.id),
                    format!(
                        "object #{}: dirty flag {} but set membership {}",
                        obj.id,
                        obj.dirty,
                        self.dirty_objects.contains(&obj.id)
                    ),
                );
            }

            // weak targets must be live or invalidated
            if let Slots::Weak { target, .. } = &obj.slots {
                checks += 1;
                if *target >= 0 && !self.objects.contains_key(&(*target as u64)) {
                    push(
                        &mut report,
                        IssueKind::WeakRefCorruption,
                        Severity::Critical,
                        Some(obj.id),
                        format!("weak #{} targets dead object #{}", obj.id, target),
                    );
                }
            }
        }

        // dirty set must not name dead objects
        for &id in &self.dirty_objects {
            checks += 1;
            if !self.objects.contains_key(&id) {
                push(
                    &mut report,
                    IssueKind::DirtyInconsistency,
                    Severity::Warning,
                    Some(id),
                    format!("dirty set names dead object #{id}"),
                );
            }
        }

        // live edges must land on live objects
        for edge in self.edges.iter_live() {
            checks += 1;
            let dst = edge.dst as u64;
            if !self.objects.contains_key(&dst) {
                push(
                    &mut report,
                    IssueKind::DanglingReference,
                    Severity::Critical,
                    Some(edge.src),
                    format!("edge #{} → #{dst} targets a dead object", edge.src),
                );
            }
        }

        report.checks = checks.max(1);
        report.health_score =
            1.0 - (report.issues.len() as f64 / report.checks as f64).clamp(0.0, 1.0);
        report
    }

    /// Fixes the repairable issues of `report`. Returns how many were
    /// fixed. The critical classes are left untouched.
    pub fn attempt_recovery(&mut self, report: &HeapReport) -> usize {
        let mut fixed = 0usize;
        for issue in &report.issues {
            if !issue.kind.repairable() {
                continue;
            }
            match issue.kind {
                IssueKind::DoubleFreed => {
                    if let Some(id) = issue.id {
                        if self.objects.contains_key(&id) {
                            self.free_list.retain(|&f| f != id);
                            fixed += 1;
                        }
                    }
                }
                IssueKind::FieldRefMismatch => {
                    if let Some(id) = issue.id {
                        if let Some(obj) = self.objects.get_mut(&id) {
                            // rebuild the cache from the fields, then refresh
                            // the edge buffer to match
                            let actual = obj.ids_in_slots();
                            obj.field_refs = actual.clone();
                            self.edges.invalidate_src(id);
                            for target in actual {
                                self.edges.record(id, target, crate::heap::EdgeKind::Field);
                            }
                            fixed += 1;
                        }
                    }
                }
                IssueKind::DirtyInconsistency => {
                    match issue.id {
                        Some(id) if self.objects.contains_key(&id) => {
                            // the flag is the authority
                            let flag = self.objects[&id].dirty;
                            if flag {
                                self.dirty_objects.insert(id);
                            } else {
                                self.dirty_objects.remove(&id);
                            }
                            fixed += 1;
                        }
                        Some(id) => {
                            self.dirty_objects.remove(&id);
                            fixed += 1;
                        }
                        None => {}
                    }
                }
                _ => {}
            }
        }
        fixed
    }

    /// Cheap production probe: refcount signs and object/freelist
    /// disjointness only.
    pub fn quick_health_check(&self) -> bool {
        self.objects.values().all(|o| o.strong_refs >= 0)
            && !self.free_list.iter().any(|id| self.objects.contains_key(id))
    }
}

/* ─────────────────────────── Tests ─────────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;
    use etch_core::Value;

    #[test]
    fn clean_heap_scores_perfect() {
        let mut heap = Heap::new();
        let a = heap.alloc_table();
        let b = heap.alloc_array(1);
        heap.set_field(a, "xs", Value::Array(b)).unwrap();

        let report = heap.verify_heap(false);
        assert!(report.healthy(), "issues: {:?}", report.issues);
        assert_eq!(report.health_score, 1.0);
        assert!(heap.quick_health_check());
    }

    #[test]
    fn detects_and_recovers_dirty_and_fieldref_issues() {
        let mut heap = Heap::new();
        let a = heap.alloc_table();
        let b = heap.alloc_table();
        heap.set_field(a, "next", Value::Table(b)).unwrap();

        // corruption 1: dirty set loses an entry while the flag stays on
        heap.dirty_objects.remove(&a);
        // corruption 2: field_refs cache loses its entry
        heap.objects.get_mut(&a).unwrap().field_refs.clear();

        let report = heap.verify_heap(false);
        assert!(report.of_kind(IssueKind::DirtyInconsistency).count() >= 1);
        assert!(report.of_kind(IssueKind::FieldRefMismatch).count() >= 1);
        assert!(report.health_score < 1.0);

        let fixed = heap.attempt_recovery(&report);
        assert!(fixed >= 2);

        let after = heap.verify_heap(false);
        assert_eq!(after.of_kind(IssueKind::DirtyInconsistency).count(), 0);
        assert_eq!(after.of_kind(IssueKind::FieldRefMismatch).count(), 0);
        assert_eq!(after.of_kind(IssueKind::DoubleFreed).count(), 0);
        assert!(after.health_score >= 0.99);
    }

    #[test]
    fn double_free_repaired() {
        let mut heap = Heap::new();
        let a = heap.alloc_table();
        heap.free_list.push(a); // id both live and free

        assert!(!heap.quick_health_check());
        let report = heap.verify_heap(false);
        assert_eq!(report.of_kind(IssueKind::DoubleFreed).count(), 1);

        let fixed = heap.attempt_recovery(&report);
        assert_eq!(fixed, 1);
        assert!(heap.quick_health_check());
    }

    #[test]
    fn negative_refcount_reported_not_repaired() {
        let mut heap = Heap::new();
        let a = heap.alloc_table();
        heap.objects.get_mut(&a).unwrap().strong_refs = -1;

        let report = heap.verify_heap(false);
        let negs: Vec<_> = report.of_kind(IssueKind::NegativeRefcount).collect();
        assert_eq!(negs.len(), 1);
        assert_eq!(negs[0].severity, Severity::Critical);
        assert!(!heap.quick_health_check());

        let fixed = heap.attempt_recovery(&report);
        assert_eq!(fixed, 0);
    }

    #[test]
    fn weak_corruption_reported() {
        let mut heap = Heap::new();
        let t = heap.alloc_table();
        let w = heap.alloc_weak(t, crate::heap::ObjKind::Table);
        // sabotage: free the target without invalidating the weak ref
        heap.objects.remove(&t);
        heap.free_list.push(t);

        let report = heap.verify_heap(false);
        assert!(report.of_kind(IssueKind::WeakRefCorruption).count() >= 1);
        let _ = w;
    }
}
