// cellar-common/src/formulary.rs
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::config::Config;
use super::error::{CellarError, Result};
use super::model::formula::Formula;

/// Catalog of formula descriptors, loaded lazily from a directory of
/// `<name>.toml` / `<name>.json` files.
pub struct Formulary {
    formula_dir: Option<PathBuf>,
    parsed_cache: Mutex<HashMap<String, Arc<Formula>>>,
}

impl Formulary {
    pub fn new(config: &Config) -> Self {
        Self {
            formula_dir: Some(config.formula_dir.clone()),
            parsed_cache: Mutex::new(HashMap::new()),
        }
    }

    /// An in-memory catalog; nothing is read from disk.
    pub fn from_formulas(formulas: impl IntoIterator<Item = Formula>) -> Self {
        let map = formulas
            .into_iter()
            .map(|f| (f.name.clone(), Arc::new(f)))
            .collect();
        Self {
            formula_dir: None,
            parsed_cache: Mutex::new(map),
        }
    }

    pub fn load_formula(&self, name: &str) -> Result<Arc<Formula>> {
        {
            let guard = self.parsed_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(formula) = guard.get(name) {
                debug!("Loaded formula '{}' from parsed cache.", name);
                return Ok(Arc::clone(formula));
            }
        }

        let Some(dir) = &self.formula_dir else {
            return Err(CellarError::NotFound(format!("No formula named '{name}'")));
        };
        let candidates = [
            dir.join(format!("{name}.toml")),
            dir.join(format!("{name}.json")),
        ];
        let Some(path) = candidates.iter().find(|p| p.is_file()) else {
            debug!("Formula '{}' not found in {}", name, dir.display());
            return Err(CellarError::NotFound(format!("No formula named '{name}'")));
        };

        let formula = Formula::from_path(path)?;
        if formula.name != name {
            return Err(CellarError::ValidationError(format!(
                "{} declares name '{}'",
                path.display(),
                formula.name
            )));
        }
        debug!(
            "Successfully loaded formula '{}' version {}",
            formula.name,
            formula.version_str_full()
        );
        let formula = Arc::new(formula);
        self.parsed_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&formula));
        Ok(formula)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::formula::tests::NEKTAR_TOML;

    #[test]
    fn loads_from_directory_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nektar.toml"), NEKTAR_TOML).unwrap();
        let mut config = Config::with_root(dir.path());
        config.formula_dir = dir.path().to_path_buf();

        let formulary = Formulary::new(&config);
        let a = formulary.load_formula("nektar").unwrap();
        let b = formulary.load_formula("nektar").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(
            formulary.load_formula("vtk"),
            Err(CellarError::NotFound(_))
        ));
    }

    #[test]
    fn rejects_mismatched_file_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("other.toml"), NEKTAR_TOML).unwrap();
        let mut config = Config::with_root(dir.path());
        config.formula_dir = dir.path().to_path_buf();
        assert!(Formulary::new(&config).load_formula("other").is_err());
    }
}
