// cellar/src/pipeline/planner.rs

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use colored::Colorize;
use cellar_common::config::Config;
use cellar_common::dependency::resolver::{DependencyResolver, ResolutionContext};
use cellar_common::error::{CellarError, Result};
use cellar_common::formulary::Formulary;
use cellar_common::keg::KegRegistry;
use cellar_common::model::BuildSelections;
use cellar_common::pipeline::{PipelineEvent, PlannedJob, PlannedOperations};
use tokio::sync::broadcast;
use tracing::{debug, instrument};

use super::runner::PipelineFlags;

pub(crate) struct OperationPlanner<'a> {
    config: &'a Config,
    formulary: &'a Formulary,
    flags: &'a PipelineFlags,
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl<'a> OperationPlanner<'a> {
    pub fn new(
        config: &'a Config,
        formulary: &'a Formulary,
        flags: &'a PipelineFlags,
        event_tx: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            config,
            formulary,
            flags,
            event_tx,
        }
    }

    /// Variant flags apply to every target that knows the option. A flag no
    /// target knows is an error.
    fn target_selections(&self, targets: &[String]) -> Result<HashMap<String, BuildSelections>> {
        let requested = &self.flags.selections;
        let mut per_target = HashMap::new();
        let mut claimed = HashSet::new();
        for name in targets {
            let formula = self.formulary.load_formula(name)?;
            let known = formula.option_names();
            let mut sel = BuildSelections {
                head: requested.head,
                ..Default::default()
            };
            for opt in requested.with.iter().filter(|o| known.contains(*o)) {
                sel.with.insert(opt.clone());
                claimed.insert(opt.clone());
            }
            for opt in requested.without.iter().filter(|o| known.contains(*o)) {
                sel.without.insert(opt.clone());
                claimed.insert(opt.clone());
            }
            per_target.insert(name.clone(), sel);
        }
        if let Some(unknown) = requested
            .with
            .iter()
            .chain(requested.without.iter())
            .find(|o| !claimed.contains(*o))
        {
            return Err(CellarError::ValidationError(format!(
                "none of {} has an option named '{}'",
                targets.join(", "),
                unknown
            )));
        }
        Ok(per_target)
    }

    #[instrument(skip(self), fields(force = self.flags.force))]
    pub async fn plan_operations(&self, targets: &[String]) -> Result<PlannedOperations> {
        let _ = self.event_tx.send(PipelineEvent::PlanningStarted);

        let target_selections = self.target_selections(targets)?;
        let keg_registry = KegRegistry::new(self.config.clone());
        let ctx = ResolutionContext {
            formulary: self.formulary,
            keg_registry: &keg_registry,
            target_selections: &target_selections,
            defaults: BuildSelections {
                include_optional: self.flags.include_optional,
                skip_recommended: self.flags.skip_recommended,
                ..Default::default()
            },
            force: self.flags.force,
        };
        let graph = DependencyResolver::new(ctx).resolve_targets(targets)?;

        for name in &graph.absent {
            let _ = self.event_tx.send(PipelineEvent::LogWarn {
                message: format!(
                    "Selected dependency {} has no formula and will be treated as absent",
                    name.cyan()
                ),
            });
        }

        let mut jobs = Vec::new();
        let mut already_installed = HashSet::new();
        for node in &graph.install_plan {
            let name = node.name().to_string();
            if !node.needs_build() {
                debug!("'{}' is already installed", name);
                already_installed.insert(name);
                continue;
            }
            jobs.push(PlannedJob {
                depends_on: graph.planned_dependencies_of(&name),
                is_target: targets.contains(&name),
                target_id: name,
                formula: Arc::clone(&node.formula),
                selections: node.selections.clone(),
                presence: node.presence.clone(),
            });
        }
        debug!(
            "Planned {} job(s); {} already installed",
            jobs.len(),
            already_installed.len()
        );

        Ok(PlannedOperations {
            jobs,
            already_installed,
            resolved_graph: Some(Arc::new(graph)),
        })
    }
}
