// cellar-common/src/dependency/definition.rs
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DependencyTag: u8 {
        const RUNTIME     = 0b00000001;
        const BUILD       = 0b00000010;
        const TEST        = 0b00000100;
        const OPTIONAL    = 0b00001000;
        const RECOMMENDED = 0b00010000;
    }
}

impl Default for DependencyTag {
    fn default() -> Self {
        Self::RUNTIME
    }
}

impl fmt::Display for DependencyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Requirement level as written in a formula descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequirementLevel {
    #[default]
    Required,
    Recommended,
    Optional,
    Build,
    Test,
}

impl RequirementLevel {
    pub fn tags(self) -> DependencyTag {
        match self {
            Self::Required => DependencyTag::RUNTIME,
            Self::Recommended => DependencyTag::RUNTIME | DependencyTag::RECOMMENDED,
            Self::Optional => DependencyTag::RUNTIME | DependencyTag::OPTIONAL,
            Self::Build => DependencyTag::BUILD,
            Self::Test => DependencyTag::TEST,
        }
    }

    fn from_tags(tags: DependencyTag) -> Self {
        if tags.contains(DependencyTag::RECOMMENDED) {
            Self::Recommended
        } else if tags.contains(DependencyTag::OPTIONAL) {
            Self::Optional
        } else if tags.contains(DependencyTag::TEST) {
            Self::Test
        } else if tags == DependencyTag::BUILD {
            Self::Build
        } else {
            Self::Required
        }
    }
}

impl fmt::Display for RequirementLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Required => "required",
            Self::Recommended => "recommended",
            Self::Optional => "optional",
            Self::Build => "build",
            Self::Test => "test",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyKind {
    #[default]
    Library,
    BuildTool,
    LanguageRuntime,
    InterpreterModule,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Library => "library",
            Self::BuildTool => "build-tool",
            Self::LanguageRuntime => "language-runtime",
            Self::InterpreterModule => "interpreter-module",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(
        default,
        rename = "level",
        serialize_with = "serialize_tags",
        deserialize_with = "deserialize_tags"
    )]
    pub tags: DependencyTag,
    #[serde(default)]
    pub kind: DependencyKind,
}

fn serialize_tags<S: Serializer>(tags: &DependencyTag, s: S) -> Result<S::Ok, S::Error> {
    RequirementLevel::from_tags(*tags).serialize(s)
}

fn deserialize_tags<'de, D: Deserializer<'de>>(d: D) -> Result<DependencyTag, D::Error> {
    RequirementLevel::deserialize(d).map(RequirementLevel::tags)
}

impl Dependency {
    pub fn new_runtime(name: impl Into<String>) -> Self {
        Self::new_with_level(name, RequirementLevel::Required)
    }

    pub fn new_with_level(name: impl Into<String>, level: RequirementLevel) -> Self {
        Self {
            name: name.into(),
            tags: level.tags(),
            kind: DependencyKind::Library,
        }
    }

    pub fn level(&self) -> RequirementLevel {
        RequirementLevel::from_tags(self.tags)
    }

    /// Recommended and optional dependencies may be absent without failing resolution.
    pub fn is_switchable(&self) -> bool {
        self.tags
            .intersects(DependencyTag::OPTIONAL | DependencyTag::RECOMMENDED)
    }
}

pub trait DependencyExt {
    fn filter_by_tags(&self, include: DependencyTag, exclude: DependencyTag) -> Vec<&Dependency>;
    fn runtime(&self) -> Vec<&Dependency>;
    fn build_time(&self) -> Vec<&Dependency>;
}

impl DependencyExt for Vec<Dependency> {
    fn filter_by_tags(&self, include: DependencyTag, exclude: DependencyTag) -> Vec<&Dependency> {
        self.iter()
            .filter(|dep| dep.tags.contains(include) && !dep.tags.intersects(exclude))
            .collect()
    }

    fn runtime(&self) -> Vec<&Dependency> {
        self.iter()
            .filter(|dep| dep.tags.contains(DependencyTag::RUNTIME))
            .collect()
    }

    fn build_time(&self) -> Vec<&Dependency> {
        self.filter_by_tags(DependencyTag::BUILD, DependencyTag::empty())
    }
}
