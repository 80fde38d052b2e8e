use std::collections::HashSet;

use indexmap::IndexMap;

use super::types::{Bridge, Job, JobMetric, JobSection, Pipeline};

/// A pipeline together with everything fetched for it.
#[derive(Debug, Clone, Default)]
pub struct HierarchyEntry {
    pub pipeline: Pipeline,
    pub jobs: Vec<Job>,
    pub bridges: Vec<Bridge>,
    pub sections: Vec<JobSection>,
    pub metrics: Vec<JobMetric>,
    /// Ids of pipelines triggered by this one's bridges
    pub downstream: Vec<i64>,
}

impl HierarchyEntry {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            ..Self::default()
        }
    }
}

/// A pipeline and the tree of pipelines it triggered.
///
/// Entries live in an arena keyed by pipeline id; parent/child links are ids,
/// so a malformed upstream/downstream graph cannot make traversal loop.
#[derive(Debug, Clone)]
pub struct PipelineHierarchy {
    root: i64,
    entries: IndexMap<i64, HierarchyEntry>,
}

impl PipelineHierarchy {
    pub fn new(root: HierarchyEntry) -> Self {
        let id = root.pipeline.id;
        let mut entries = IndexMap::new();
        entries.insert(id, root);
        Self { root: id, entries }
    }

    pub fn root_id(&self) -> i64 {
        self.root
    }

    pub fn root(&self) -> &HierarchyEntry {
        &self.entries[&self.root]
    }

    pub fn contains(&self, id: i64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: i64) -> Option<&HierarchyEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Attaches `child` below `parent`.
    ///
    /// Returns `false` and leaves the hierarchy untouched when the parent is
    /// unknown or the child is already part of it.
    pub fn attach(&mut self, parent: i64, child: HierarchyEntry) -> bool {
        let child_id = child.pipeline.id;
        if self.entries.contains_key(&child_id) || !self.entries.contains_key(&parent) {
            return false;
        }
        if let Some(entry) = self.entries.get_mut(&parent) {
            entry.downstream.push(child_id);
        }
        self.entries.insert(child_id, child);
        true
    }

    /// Entries in depth-first order starting at the root.
    pub fn depth_first(&self) -> Vec<&HierarchyEntry> {
        let mut order = Vec::with_capacity(self.entries.len());
        let mut visited = HashSet::new();
        let mut stack = vec![self.root];

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            order.push(entry);
            stack.extend(entry.downstream.iter().rev());
        }

        order
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut HierarchyEntry> {
        self.entries.values_mut()
    }

    /// Parent of `id` inside this hierarchy, if any.
    pub fn parent_of(&self, id: i64) -> Option<&HierarchyEntry> {
        self.entries
            .values()
            .find(|entry| entry.downstream.contains(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64) -> HierarchyEntry {
        HierarchyEntry::new(Pipeline {
            id,
            ..Pipeline::default()
        })
    }

    fn ids(hierarchy: &PipelineHierarchy) -> Vec<i64> {
        hierarchy
            .depth_first()
            .into_iter()
            .map(|e| e.pipeline.id)
            .collect()
    }

    #[test]
    fn traverses_depth_first() {
        let mut h = PipelineHierarchy::new(entry(1));
        assert!(h.attach(1, entry(2)));
        assert!(h.attach(1, entry(3)));
        assert!(h.attach(2, entry(4)));

        assert_eq!(ids(&h), [1, 2, 4, 3]);
        assert_eq!(h.parent_of(4).map(|e| e.pipeline.id), Some(2));
        assert!(h.parent_of(1).is_none());
    }

    #[test]
    fn refuses_duplicates_and_unknown_parents() {
        let mut h = PipelineHierarchy::new(entry(1));
        assert!(h.attach(1, entry(2)));
        assert!(!h.attach(2, entry(1)));
        assert!(!h.attach(99, entry(5)));
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn cyclic_links_do_not_loop() {
        let mut h = PipelineHierarchy::new(entry(1));
        h.attach(1, entry(2));
        h.entries_mut()
            .find(|e| e.pipeline.id == 2)
            .unwrap()
            .downstream
            .push(1);

        assert_eq!(ids(&h), [1, 2]);
    }
}
