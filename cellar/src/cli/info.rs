// cellar/src/cli/info.rs

use std::collections::HashMap;

use cellar_common::config::Config;
use cellar_common::dependency::resolver::{DependencyResolver, ResolutionContext};
use cellar_common::dependency::RequirementLevel;
use cellar_common::error::Result;
use cellar_common::formulary::Formulary;
use cellar_common::keg::KegRegistry;
use cellar_common::model::{BuildSelections, DependencyPresence, Formula};
use cellar_core::build::resolve_flags;
use clap::Args;
use colored::Colorize;
use prettytable::{format, Cell, Row, Table};
use tracing::warn;

#[derive(Args, Debug)]
pub struct Info {
    /// Name of the formula
    pub name: String,
}

impl Info {
    pub async fn run(&self, config: &Config, variants: &BuildSelections) -> Result<()> {
        let formulary = Formulary::new(config);
        let formula = formulary.load_formula(&self.name)?;
        formula.check_selections(variants)?;
        let registry = KegRegistry::new(config.clone());

        let presence = match resolved_presence(&formulary, &registry, &formula, variants) {
            Ok(presence) => presence,
            Err(e) => {
                warn!("Dependency resolution failed: {}", e);
                println!("{} {}", "Warning:".yellow().bold(), e);
                installed_presence(&registry, &formula, variants)?
            }
        };
        let flags = resolve_flags(&formula, variants, &presence)?;

        print_header(&formula, &registry)?;
        print_dependencies(&formula, variants, &presence);
        print_options(&formula, variants);

        println!("\n{}", "Build flags".bold());
        if flags.is_empty() {
            println!("  (none)");
        }
        for arg in flags.to_cmake_args() {
            println!("  {arg}");
        }
        Ok(())
    }
}

/// Presence as the planner would compute it for a build of `formula`.
fn resolved_presence(
    formulary: &Formulary,
    registry: &KegRegistry,
    formula: &Formula,
    variants: &BuildSelections,
) -> Result<DependencyPresence> {
    let mut target_selections = HashMap::new();
    target_selections.insert(formula.name.clone(), variants.clone());
    let ctx = ResolutionContext {
        formulary,
        keg_registry: registry,
        target_selections: &target_selections,
        defaults: BuildSelections::default(),
        force: false,
    };
    let graph = DependencyResolver::new(ctx).resolve_targets(&[formula.name.clone()])?;
    Ok(graph
        .get(&formula.name)
        .map(|node| node.presence.clone())
        .unwrap_or_default())
}

/// Selected dependencies that already have an installed keg.
fn installed_presence(
    registry: &KegRegistry,
    formula: &Formula,
    variants: &BuildSelections,
) -> Result<DependencyPresence> {
    let mut presence = DependencyPresence::new();
    for dep in &formula.dependencies {
        if formula.wants_dependency(dep, variants) && registry.get_installed_keg(&dep.name)?.is_some() {
            presence.insert(dep.name.clone(), registry.get_opt_path(&dep.name));
        }
    }
    Ok(presence)
}

fn print_header(formula: &Formula, registry: &KegRegistry) -> Result<()> {
    println!(
        "{} {}",
        formula.name.green().bold(),
        formula.version_str_full()
    );
    if let Some(desc) = &formula.desc {
        println!("{desc}");
    }
    if let Some(homepage) = &formula.homepage {
        println!("{}", homepage.blue().underline());
    }
    let installed = registry.installed_versions(&formula.name)?;
    if installed.is_empty() {
        println!("Not installed");
    } else {
        let versions: Vec<&str> = installed.iter().map(|k| k.version_str.as_str()).collect();
        println!("Installed: {}", versions.join(", "));
    }
    Ok(())
}

fn print_dependencies(formula: &Formula, variants: &BuildSelections, presence: &DependencyPresence) {
    if formula.dependencies.is_empty() {
        return;
    }
    println!("\n{}", "Dependencies".bold());
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
    table.add_row(Row::new(vec![
        Cell::new("Name").style_spec("b"),
        Cell::new("Level").style_spec("b"),
        Cell::new("Kind").style_spec("b"),
        Cell::new("Selected").style_spec("b"),
    ]));
    for dep in &formula.dependencies {
        let selected = if !formula.wants_dependency(dep, variants) {
            ""
        } else if presence.is_present(&dep.name) {
            "✔"
        } else {
            "absent"
        };
        table.add_row(Row::new(vec![
            Cell::new(&dep.name).style_spec("Fb"),
            Cell::new(&dep.level().to_string()),
            Cell::new(&dep.kind.to_string()),
            Cell::new(selected),
        ]));
    }
    table.printstd();
}

fn print_options(formula: &Formula, variants: &BuildSelections) {
    let names = formula.option_names();
    if names.is_empty() {
        return;
    }
    println!("\n{}", "Options".bold());
    for name in names {
        let description = formula
            .option(&name)
            .map(|o| o.description.clone())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| match formula.dependency(&name) {
                Some(dep) => format!("Build with {} support ({})", dep.name, dep.level()),
                None => String::new(),
            });
        let marker = if variants.with.contains(&name) {
            "on".green().to_string()
        } else if variants.without.contains(&name) {
            "off".red().to_string()
        } else {
            "default".dimmed().to_string()
        };
        println!("  {:<22} {:<8} {}", option_switch(formula, &name), marker, description);
    }
}

/// The switch that changes an option from its default: recommended
/// dependencies are on unless turned off.
fn option_switch(formula: &Formula, name: &str) -> String {
    match formula.dependency(name).map(|d| d.level()) {
        Some(RequirementLevel::Recommended) => format!("--without-{name}"),
        _ => format!("--with-{name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEMO: &str = include_str!("../../../demos/Formula/nektar.toml");

    #[test]
    fn recommended_dependencies_offer_without() {
        let formula = Formula::from_toml_str(DEMO).unwrap();
        assert_eq!(option_switch(&formula, "petsc"), "--without-petsc");
        assert_eq!(option_switch(&formula, "vtk"), "--without-vtk");
        assert_eq!(option_switch(&formula, "demos"), "--with-demos");
    }

    #[test]
    fn demo_descriptor_resolves_flags() {
        let formula = Formula::from_toml_str(DEMO).unwrap();
        let names = formula.option_names();
        for opt in ["demos", "vtk", "mpi", "arpack", "fftw", "petsc"] {
            assert!(names.iter().any(|n| n == opt), "missing option {opt}");
        }

        let mut variants = BuildSelections::default();
        variants.push_flag("--with-demos");
        variants.push_flag("--without-petsc");
        formula.check_selections(&variants).unwrap();

        let mut presence = DependencyPresence::new();
        for dep in ["zlib", "boost", "mpi"] {
            presence.insert(dep, format!("/opt/cellar/opt/{dep}"));
        }
        let args = resolve_flags(&formula, &variants, &presence)
            .unwrap()
            .to_cmake_args();
        assert!(args.contains(&"-DZLIB_ROOT=/opt/cellar/opt/zlib".to_string()));
        assert!(args.contains(&"-DNEKTAR_BUILD_DEMOS=ON".to_string()));
        assert!(args.contains(&"-DNEKTAR_USE_MPI=ON".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("-DPETSC_DIR")));
        // Absent dependencies still pin their switch.
        for off in ["PETSC", "ARPACK", "FFTW", "VTK", "SCOTCH", "HDF5"] {
            let flag = format!("-DNEKTAR_USE_{off}=OFF");
            assert!(args.contains(&flag), "{flag} missing from {args:?}");
        }
        assert!(args.contains(&"-DNEKTAR_BUILD_MESHGEN=OFF".to_string()));
    }

    #[test]
    fn demo_descriptor_enables_petsc_with_its_path() {
        let formula = Formula::from_toml_str(DEMO).unwrap();
        let mut presence = DependencyPresence::new();
        for dep in ["zlib", "mpi", "petsc"] {
            presence.insert(dep, format!("/opt/cellar/opt/{dep}"));
        }
        let args = resolve_flags(&formula, &BuildSelections::default(), &presence)
            .unwrap()
            .to_cmake_args();
        assert!(args.contains(&"-DNEKTAR_USE_MPI=ON".to_string()));
        assert!(args.contains(&"-DNEKTAR_USE_PETSC=ON".to_string()));
        assert!(args.contains(&"-DPETSC_DIR=/opt/cellar/opt/petsc/real".to_string()));
        assert!(args.contains(&"-DNEKTAR_BUILD_DEMOS=OFF".to_string()));
    }

    #[test]
    fn unknown_variant_is_rejected_by_info() {
        let formula = Formula::from_toml_str(DEMO).unwrap();
        let mut variants = BuildSelections::default();
        variants.push_flag("--with-cuda");
        assert!(formula.check_selections(&variants).is_err());
    }
}
