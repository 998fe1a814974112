// cellar-common/src/dependency/resolver.rs

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error};

use crate::dependency::DependencyTag;
use crate::error::{CellarError, Result};
use crate::formulary::Formulary;
use crate::keg::KegRegistry;
use crate::model::formula::Formula;
use crate::model::{BuildSelections, DependencyPresence};

const COMMAND_LINE: &str = "command line";

pub struct ResolutionContext<'a> {
    pub formulary: &'a Formulary,
    pub keg_registry: &'a KegRegistry,
    /// Per-target selections. Anything not listed here inherits the global
    /// switches from `defaults`.
    pub target_selections: &'a HashMap<String, BuildSelections>,
    pub defaults: BuildSelections,
    /// Rebuild targets even when a matching keg exists.
    pub force: bool,
}

impl ResolutionContext<'_> {
    fn selections_for(&self, name: &str) -> BuildSelections {
        match self.target_selections.get(name) {
            Some(sel) => {
                let mut sel = sel.clone();
                sel.include_optional |= self.defaults.include_optional;
                sel.skip_recommended |= self.defaults.skip_recommended;
                sel
            }
            None => BuildSelections::inherited(&self.defaults),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStatus {
    /// A usable keg exists; nothing to build.
    Installed,
    /// Pulled in as a dependency and not installed.
    Missing,
    /// Named on the command line and will be built.
    Requested,
}

#[derive(Debug, Clone)]
pub struct ResolvedDependency {
    pub formula: Arc<Formula>,
    pub keg_path: Option<PathBuf>,
    pub opt_path: PathBuf,
    pub status: ResolutionStatus,
    pub accumulated_tags: DependencyTag,
    pub selections: BuildSelections,
    /// Selected dependencies with a formula in the catalog, declaration order.
    pub edges: Vec<String>,
    pub presence: DependencyPresence,
}

impl ResolvedDependency {
    pub fn name(&self) -> &str {
        &self.formula.name
    }

    pub fn needs_build(&self) -> bool {
        matches!(
            self.status,
            ResolutionStatus::Missing | ResolutionStatus::Requested
        )
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedGraph {
    /// Nodes to build, dependencies first.
    pub install_plan: Vec<ResolvedDependency>,
    pub resolution_details: HashMap<String, ResolvedDependency>,
    /// Switchable dependencies selected somewhere but missing from the catalog.
    pub absent: BTreeSet<String>,
}

impl ResolvedGraph {
    /// Direct dependencies of `name` that are themselves in the install plan.
    pub fn planned_dependencies_of(&self, name: &str) -> Vec<String> {
        self.resolution_details
            .get(name)
            .map(|node| {
                node.edges
                    .iter()
                    .filter(|e| {
                        self.resolution_details
                            .get(e.as_str())
                            .is_some_and(ResolvedDependency::needs_build)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedDependency> {
        self.resolution_details.get(name)
    }
}

pub struct DependencyResolver<'a> {
    context: ResolutionContext<'a>,
    visiting: Vec<String>,
    resolution_details: HashMap<String, ResolvedDependency>,
    absent: BTreeSet<String>,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(context: ResolutionContext<'a>) -> Self {
        Self {
            context,
            visiting: Vec::new(),
            resolution_details: HashMap::new(),
            absent: BTreeSet::new(),
        }
    }

    /// Resolves `targets` and everything they need. Fails on the first
    /// missing required dependency or cycle; nothing is built before this
    /// returns.
    pub fn resolve_targets(&mut self, targets: &[String]) -> Result<ResolvedGraph> {
        debug!("Starting dependency resolution for targets: {:?}", targets);
        self.visiting.clear();
        self.resolution_details.clear();
        self.absent.clear();

        for target in targets {
            self.resolve_recursive(target, DependencyTag::RUNTIME, None)?;
        }

        self.fill_presence();
        let install_plan = self.topological_sort()?;

        debug!(
            "Final installation plan: {:?}",
            install_plan
                .iter()
                .map(|d| (d.name(), d.status))
                .collect::<Vec<_>>()
        );
        Ok(ResolvedGraph {
            install_plan,
            resolution_details: self.resolution_details.clone(),
            absent: self.absent.clone(),
        })
    }

    fn resolve_recursive(
        &mut self,
        name: &str,
        edge_tags: DependencyTag,
        required_by: Option<&str>,
    ) -> Result<()> {
        if let Some(pos) = self.visiting.iter().position(|n| n == name) {
            let mut cycle: Vec<String> = self.visiting[pos..].to_vec();
            cycle.push(name.to_string());
            error!("Dependency cycle detected: {}", cycle.join(" -> "));
            return Err(CellarError::CyclicDependency { cycle });
        }

        if let Some(existing) = self.resolution_details.get_mut(name) {
            existing.accumulated_tags |= edge_tags;
            debug!("'{}' already resolved; merged tags {:?}", name, edge_tags);
            return Ok(());
        }

        let formula = match self.context.formulary.load_formula(name) {
            Ok(f) => f,
            Err(CellarError::NotFound(_)) => {
                return match required_by {
                    Some(parent) => Err(CellarError::UnresolvedDependency {
                        dependency: name.to_string(),
                        required_by: parent.to_string(),
                    }),
                    None => Err(CellarError::UnresolvedDependency {
                        dependency: name.to_string(),
                        required_by: COMMAND_LINE.to_string(),
                    }),
                };
            }
            Err(e) => return Err(e),
        };

        let selections = self.context.selections_for(name);
        let is_target = required_by.is_none() || self.context.target_selections.contains_key(name);
        if is_target {
            formula.check_selections(&selections)?;
        }
        let (status, keg_path) = self.initial_status(&formula, &selections, is_target)?;
        debug!("Initial status for '{}': {:?}, keg: {:?}", name, status, keg_path);

        self.resolution_details.insert(
            name.to_string(),
            ResolvedDependency {
                formula: Arc::clone(&formula),
                keg_path,
                opt_path: self.context.keg_registry.get_opt_path(name),
                status,
                accumulated_tags: edge_tags,
                selections: selections.clone(),
                edges: Vec::new(),
                presence: DependencyPresence::new(),
            },
        );

        self.visiting.push(name.to_string());
        let mut edges = Vec::new();
        for dep in &formula.dependencies {
            if !formula.wants_dependency(dep, &selections) {
                debug!("Edge {} -> {} not selected ({})", name, dep.name, dep.level());
                continue;
            }
            if dep.is_switchable() && self.context.formulary.load_formula(&dep.name).is_err() {
                debug!(
                    "Switchable dependency '{}' of '{}' has no formula; treating as absent",
                    dep.name, name
                );
                self.absent.insert(dep.name.clone());
                continue;
            }
            self.resolve_recursive(&dep.name, dep.tags, Some(name))?;
            edges.push(dep.name.clone());
        }
        self.visiting.pop();

        if let Some(node) = self.resolution_details.get_mut(name) {
            node.edges = edges;
        }
        Ok(())
    }

    fn initial_status(
        &self,
        formula: &Formula,
        selections: &BuildSelections,
        is_target: bool,
    ) -> Result<(ResolutionStatus, Option<PathBuf>)> {
        let registry = self.context.keg_registry;
        if !is_target {
            return Ok(match registry.get_installed_keg(&formula.name)? {
                Some(keg) => (ResolutionStatus::Installed, Some(keg.path)),
                None => (ResolutionStatus::Missing, None),
            });
        }
        if self.context.force || selections.head {
            return Ok((ResolutionStatus::Requested, None));
        }
        let Some(keg) = registry.get_keg(&formula.name, &formula.version_str_full()) else {
            return Ok((ResolutionStatus::Requested, None));
        };
        // Same version with different variant choices is a rebuild.
        let matches = keg.receipt().is_ok_and(|r| {
            r.with.iter().cloned().collect::<BTreeSet<_>>() == selections.with
                && r.without.iter().cloned().collect::<BTreeSet<_>>() == selections.without
        });
        if matches {
            Ok((ResolutionStatus::Installed, Some(keg.path)))
        } else {
            Ok((ResolutionStatus::Requested, None))
        }
    }

    fn fill_presence(&mut self) {
        let opt_paths: BTreeMap<String, PathBuf> = self
            .resolution_details
            .iter()
            .map(|(k, v)| (k.clone(), v.opt_path.clone()))
            .collect();
        for node in self.resolution_details.values_mut() {
            let mut presence = DependencyPresence::new();
            for edge in &node.edges {
                if let Some(path) = opt_paths.get(edge) {
                    presence.insert(edge.clone(), path.clone());
                }
            }
            node.presence = presence;
        }
    }

    /// Kahn's algorithm over selected edges. Ties are broken by name so the
    /// order is identical across runs.
    fn topological_sort(&self) -> Result<Vec<ResolvedDependency>> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (name, node) in &self.resolution_details {
            in_degree.entry(name.as_str()).or_default();
            for edge in &node.edges {
                *in_degree.entry(name.as_str()).or_default() += 1;
                dependents.entry(edge.as_str()).or_default().push(name.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut sorted: Vec<&str> = Vec::new();
        while let Some(name) = queue.pop_front() {
            sorted.push(name);
            let mut ready = Vec::new();
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(*dependent);
                    }
                }
            }
            ready.sort_unstable();
            queue.extend(ready);
        }

        if sorted.len() != self.resolution_details.len() {
            let stuck: Vec<String> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(n, _)| n.to_string())
                .collect();
            error!("Topological sort left nodes unsorted: {:?}", stuck);
            return Err(CellarError::CyclicDependency { cycle: stuck });
        }

        Ok(sorted
            .into_iter()
            .filter_map(|n| self.resolution_details.get(n))
            .filter(|d| d.needs_build())
            .cloned()
            .collect())
    }
}
