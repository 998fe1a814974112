// cellar-common/src/model/options.rs
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A named build variant a formula exposes as `--with-<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Optional dependency pulled in when this option is enabled.
    #[serde(default)]
    pub implies: Option<String>,
}

/// The user's variant choices for one package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSelections {
    #[serde(default)]
    pub with: BTreeSet<String>,
    #[serde(default)]
    pub without: BTreeSet<String>,
    #[serde(default)]
    pub head: bool,
    #[serde(skip)]
    pub include_optional: bool,
    #[serde(skip)]
    pub skip_recommended: bool,
}

impl BuildSelections {
    /// Selections for a dependency pulled in by `parent`: only the global
    /// switches carry over.
    pub fn inherited(parent: &BuildSelections) -> Self {
        Self {
            include_optional: parent.include_optional,
            skip_recommended: parent.skip_recommended,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self, option: &str) -> bool {
        self.with.contains(option) && !self.without.contains(option)
    }

    /// Parses one `--with-x` / `--without-x` argument into the selections.
    /// Returns false when the argument is not a variant flag.
    pub fn push_flag(&mut self, arg: &str) -> bool {
        if let Some(name) = arg.strip_prefix("--without-") {
            if !name.is_empty() {
                self.with.remove(name);
                self.without.insert(name.to_string());
                return true;
            }
        } else if let Some(name) = arg.strip_prefix("--with-") {
            if !name.is_empty() {
                self.without.remove(name);
                self.with.insert(name.to_string());
                return true;
            }
        }
        false
    }

    pub fn is_default(&self) -> bool {
        self.with.is_empty() && self.without.is_empty() && !self.head
    }
}
