#![forbid(unsafe_code)]

//! TOML link declarations.
//!
//! ```toml
//! [executor]
//! parallel_level_fetch = true
//! plan_cache_capacity = 128
//!
//! [[links]]
//! collection = "posts"
//! name = "author"
//! target = "users"
//! cardinality = "one"
//! field = "authorId"
//!
//! [[links]]
//! collection = "users"
//! name = "posts"
//! target = "posts"
//! inverse_of = "author"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::links::{Cardinality, LinkDefinition, LinkRegistry};
use crate::query::cache::DEFAULT_PLAN_CACHE_CAPACITY;
use crate::query::ExecutorOptions;
use crate::types::LinkError;

/// Environment variable naming the config file [`LinkConfig::discover`] reads.
pub const CONFIG_ENV: &str = "LINKGRAPH_CONFIG";

/// Parsed link configuration.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct LinkConfig {
    /// Executor settings.
    #[serde(default)]
    pub executor: ExecutorSection,
    /// Link declarations in registration order.
    #[serde(default)]
    pub links: Vec<LinkEntry>,
}

/// `[executor]` table.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// Fetch the nodes of one level concurrently.
    pub parallel_level_fetch: bool,
    /// Plans kept by the plan cache.
    pub plan_cache_capacity: usize,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            parallel_level_fetch: false,
            plan_cache_capacity: DEFAULT_PLAN_CACHE_CAPACITY,
        }
    }
}

/// One `[[links]]` entry.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct LinkEntry {
    /// Collection the link is declared on.
    pub collection: String,
    /// Link name.
    pub name: String,
    /// Related collection.
    pub target: String,
    /// Declared cardinality; ignored for inverse links.
    #[serde(default)]
    pub cardinality: Cardinality,
    /// Storage field of a direct link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Direct link mirrored by an inverse link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse_of: Option<String>,
    /// References carry extra attributes.
    #[serde(default)]
    pub metadata: bool,
    /// Unique `one` link.
    #[serde(default)]
    pub unique: bool,
    /// Cascade deletion from this side.
    #[serde(default)]
    pub autoremove: bool,
    /// Ask for an index on the storage field.
    #[serde(default)]
    pub indexed: bool,
}

impl LinkEntry {
    /// Converts the entry into a registry definition.
    pub fn definition(&self) -> LinkDefinition {
        LinkDefinition {
            target_collection: self.target.clone(),
            cardinality: self.cardinality,
            storage_field: self.field.clone(),
            inverse_of: self.inverse_of.clone(),
            metadata: self.metadata,
            unique: self.unique,
            autoremove: self.autoremove,
            indexed: self.indexed,
        }
    }
}

impl LinkConfig {
    /// Reads and parses `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), links = config.links.len(), "config.loaded");
        Ok(config)
    }

    /// Loads from `$LINKGRAPH_CONFIG`, else `<config dir>/linkgraph/links.toml`.
    ///
    /// A missing file at the default location yields an empty configuration.
    pub fn discover() -> Result<Self, ConfigError> {
        if let Some(explicit) = std::env::var_os(CONFIG_ENV) {
            return Self::load(PathBuf::from(explicit));
        }
        let path = default_config_path().ok_or(ConfigError::NoConfigDir)?;
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parses configuration text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Renders the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Registers every entry and validates the resulting graph.
    pub fn build_registry(&self) -> Result<Arc<LinkRegistry>, ConfigError> {
        let mut registry = LinkRegistry::new();
        for entry in &self.links {
            registry.add_link(&entry.collection, &entry.name, entry.definition())?;
        }
        Ok(registry.freeze()?)
    }

    /// Executor options described by the `[executor]` table.
    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            parallel_level_fetch: self.executor.parallel_level_fetch,
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("linkgraph").join("links.toml"))
}

/// Errors raised while loading link configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read link config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid configuration TOML.
    #[error("failed to parse link config {path}: {source}")]
    Parse {
        /// File path, or `<inline>` for text.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// The configuration could not be rendered.
    #[error("failed to serialize link config: {source}")]
    Serialize {
        /// Underlying TOML error.
        source: toml::ser::Error,
    },
    /// No platform config directory exists and no explicit path was given.
    #[error("no config directory found; set LINKGRAPH_CONFIG")]
    NoConfigDir,
    /// The declared links do not form a valid graph.
    #[error(transparent)]
    Links(#[from] LinkError),
}

impl ConfigError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "ConfigRead",
            ConfigError::Parse { .. } => "ConfigParse",
            ConfigError::Serialize { .. } => "ConfigSerialize",
            ConfigError::NoConfigDir => "ConfigNoDir",
            ConfigError::Links(err) => err.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::LinkSide;

    const BLOG: &str = r#"
        [executor]
        parallel_level_fetch = true

        [[links]]
        collection = "posts"
        name = "author"
        target = "users"
        cardinality = "one"
        field = "authorId"
        indexed = true

        [[links]]
        collection = "users"
        name = "posts"
        target = "posts"
        inverse_of = "author"
        autoremove = true
    "#;

    #[test]
    fn parses_links_and_executor_section() {
        let config = LinkConfig::from_toml_str(BLOG).unwrap();
        assert!(config.executor_options().parallel_level_fetch);
        assert_eq!(config.executor.plan_cache_capacity, DEFAULT_PLAN_CACHE_CAPACITY);
        assert_eq!(config.links.len(), 2);
        assert_eq!(config.links[1].definition().side(), LinkSide::Inverse);

        let registry = config.build_registry().unwrap();
        let posts = registry.resolve("users", "posts").unwrap();
        assert_eq!(posts.cardinality, Cardinality::Many);
        assert!(posts.autoremove);
        assert_eq!(registry.index_advice().len(), 1);
    }

    #[test]
    fn invalid_graph_surfaces_link_error() {
        let config = LinkConfig::from_toml_str(
            r#"
            [[links]]
            collection = "users"
            name = "posts"
            target = "posts"
            inverse_of = "missing"
            "#,
        )
        .unwrap();
        let err = config.build_registry().unwrap_err();
        assert_eq!(err.code(), "InvalidLinkDefinition");
    }

    #[test]
    fn unknown_cardinality_is_a_parse_error() {
        let err = LinkConfig::from_toml_str(
            r#"
            [[links]]
            collection = "a"
            name = "b"
            target = "c"
            cardinality = "several"
            field = "x"
            "#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "ConfigParse");
    }

    #[test]
    fn renders_back_to_equivalent_toml() {
        let config = LinkConfig::from_toml_str(BLOG).unwrap();
        let text = config.to_toml_string().unwrap();
        assert_eq!(LinkConfig::from_toml_str(&text).unwrap(), config);
    }
}
