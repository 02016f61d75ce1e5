//! Dependency graph over installed manifests.
//!
//! Resolution is per plugin: a cycle, a missing dependency or a version
//! mismatch fails only the plugins involved (and their hard dependents), while
//! everything else still receives a load order. The order is a topological
//! sort with ties broken by ascending plugin id, so identical inputs always
//! produce identical output.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::error::TendrilError;

use super::manifest::{DependencyKind, PluginManifest};

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Healthy plugins, dependencies first.
    pub order: Vec<String>,
    /// Plugins that cannot be loaded and why.
    pub failures: BTreeMap<String, TendrilError>,
}

impl Resolution {
    pub fn is_resolved(&self, id: &str) -> bool {
        self.order.iter().any(|o| o == id)
    }

    pub fn failure(&self, id: &str) -> Option<&TendrilError> {
        self.failures.get(id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|o| o == id)
    }

    /// Shutdown order: dependents first.
    pub fn shutdown_order(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    manifests: BTreeMap<String, Arc<PluginManifest>>,
}

impl DependencyGraph {
    pub fn new(manifests: impl IntoIterator<Item = Arc<PluginManifest>>) -> Self {
        Self {
            manifests: manifests
                .into_iter()
                .map(|m| (m.id.clone(), m))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.manifests.contains_key(id)
    }

    /// Installed dependencies of `id`; both kinds order loading.
    fn edges<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a str> + 'a {
        let installed = &self.manifests;
        self.manifests
            .get(id)
            .into_iter()
            .flat_map(|m| m.dependencies.iter())
            .filter(move |d| installed.contains_key(&d.id))
            .map(|d| d.id.as_str())
    }

    pub fn resolve(&self) -> Resolution {
        let mut failures: BTreeMap<String, TendrilError> = BTreeMap::new();

        for (id, manifest) in &self.manifests {
            for dep in &manifest.dependencies {
                let failure = match self.manifests.get(&dep.id) {
                    None if dep.kind == DependencyKind::Hard => Some(TendrilError::MissingDependency {
                        plugin: id.clone(),
                        dependency: dep.id.clone(),
                        requirement: dep.version_range.to_string(),
                    }),
                    None => None,
                    Some(found) if !dep.version_range.matches(&found.version) => {
                        Some(TendrilError::VersionMismatch {
                            plugin: id.clone(),
                            dependency: dep.id.clone(),
                            requirement: dep.version_range.to_string(),
                            found: found.version.to_string(),
                        })
                    }
                    Some(_) => None,
                };
                if let Some(failure) = failure {
                    failures.entry(id.clone()).or_insert(failure);
                }
            }
        }

        for cycle in self.detect_cycles() {
            for member in &cycle[..cycle.len().saturating_sub(1)] {
                failures
                    .entry(member.clone())
                    .or_insert_with(|| TendrilError::CyclicDependency {
                        cycle: cycle.clone(),
                    });
            }
        }

        // hard dependents of a failed plugin fail too
        loop {
            let mut newly_failed = Vec::new();
            for (id, manifest) in &self.manifests {
                if failures.contains_key(id) {
                    continue;
                }
                if let Some(dep) = manifest
                    .hard_dependencies()
                    .find(|d| failures.contains_key(&d.id))
                {
                    newly_failed.push((
                        id.clone(),
                        TendrilError::DependencyFailed {
                            plugin: id.clone(),
                            dependency: dep.id.clone(),
                        },
                    ));
                }
            }
            if newly_failed.is_empty() {
                break;
            }
            failures.extend(newly_failed);
        }

        let order = self.topological_order(&failures);
        debug!(order = ?order, failed = failures.len(), "Resolved load order");

        Resolution { order, failures }
    }

    /// Kahn's algorithm over healthy plugins with a min-ordered ready set.
    fn topological_order(&self, failures: &BTreeMap<String, TendrilError>) -> Vec<String> {
        let healthy: BTreeSet<&str> = self
            .manifests
            .keys()
            .map(String::as_str)
            .filter(|id| !failures.contains_key(*id))
            .collect();

        let mut in_degree: HashMap<&str, usize> = healthy.iter().map(|id| (*id, 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for id in &healthy {
            for dep in self.edges(id).filter(|d| healthy.contains(d)) {
                dependents.entry(dep).or_default().push(id);
                if let Some(degree) = in_degree.get_mut(id) {
                    *degree += 1;
                }
            }
        }

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(healthy.len());

        while let Some(id) = ready.pop_first() {
            order.push(id.to_string());
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        order
    }

    /// Every cycle found through a back-edge, each as `[a, b, ..., a]`.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut cycles = Vec::new();

        for id in self.manifests.keys() {
            if !marks.contains_key(id.as_str()) {
                self.visit(id, &mut marks, &mut stack, &mut cycles);
            }
        }

        cycles
    }

    pub fn find_cycle(&self) -> Option<Vec<String>> {
        self.detect_cycles().into_iter().next()
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        marks.insert(id, Mark::OnStack);
        stack.push(id);

        for dep in self.edges(id) {
            match marks.get(dep) {
                Some(Mark::OnStack) => {
                    if let Some(start) = stack.iter().position(|s| *s == dep) {
                        let mut cycle: Vec<String> =
                            stack[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(dep.to_string());
                        cycles.push(cycle);
                    }
                }
                Some(Mark::Done) => {}
                None => self.visit(dep, marks, stack, cycles),
            }
        }

        stack.pop();
        marks.insert(id, Mark::Done);
    }

    /// Transitive hard dependents of `id`, in resolution order.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        let mut found: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);

        while let Some(current) = queue.pop_front() {
            for (other, manifest) in &self.manifests {
                if found.contains(other) || other == id {
                    continue;
                }
                if manifest.hard_dependencies().any(|d| d.id == current) {
                    found.insert(other.clone());
                    queue.push_back(other);
                }
            }
        }

        self.in_resolution_order(found)
    }

    /// Direct soft dependents of `id`.
    pub fn soft_dependents_of(&self, id: &str) -> Vec<String> {
        self.manifests
            .values()
            .filter(|m| {
                m.dependencies
                    .iter()
                    .any(|d| d.id == id && d.kind == DependencyKind::Soft)
            })
            .map(|m| m.id.clone())
            .collect()
    }

    /// Transitive hard dependencies of `id`, dependencies first.
    pub fn dependencies_of(&self, id: &str) -> Vec<String> {
        let mut found: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([id.to_string()]);

        while let Some(current) = queue.pop_front() {
            if let Some(manifest) = self.manifests.get(&current) {
                for dep in manifest.hard_dependencies() {
                    if dep.id != id && found.insert(dep.id.clone()) {
                        queue.push_back(dep.id.clone());
                    }
                }
            }
        }

        self.in_resolution_order(found)
    }

    fn in_resolution_order(&self, ids: BTreeSet<String>) -> Vec<String> {
        let order = self.resolve().order;
        let mut ranked: Vec<(usize, String)> = ids
            .into_iter()
            .map(|id| {
                let rank = order.iter().position(|o| *o == id).unwrap_or(usize::MAX);
                (rank, id)
            })
            .collect();
        ranked.sort();
        ranked.into_iter().map(|(_, id)| id).collect()
    }
}

/// Resolve a set of manifests in one call.
pub fn resolve(manifests: impl IntoIterator<Item = Arc<PluginManifest>>) -> Resolution {
    DependencyGraph::new(manifests).resolve()
}
