//! Table dependency resolution.
//!
//! Tables declare which other tables they depend on; a page's freshness
//! depends on the transitive closure of those declarations.

use std::collections::{BTreeMap, BTreeSet};

use tracing::error;

use super::config::{ActionConfig, CacheConfig, TableConfig};
use super::error::CacheError;

/// Supplies per-table dependency declarations.
pub trait DependencyProvider: Send + Sync {
    /// Tables that `table` directly depends on.
    fn depends_on(&self, table: &str) -> Vec<String>;
}

/// Optional overrides for whether render-time table usage is merged into
/// page details. `None` defers to the next less specific level.
pub trait CacheTrackingPolicy: Send + Sync {
    fn application(&self) -> Option<bool> {
        None
    }

    fn table(&self, _table: &str) -> Option<bool> {
        None
    }

    fn action(&self, _action: &str) -> Option<bool> {
        None
    }

    /// Dependency list that replaces the primary table for this action.
    fn action_depends(&self, _action: &str) -> Option<Vec<String>> {
        None
    }
}

/// Declarations taken from the `[tables]` and `[actions]` configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    application: Option<bool>,
    tables: BTreeMap<String, TableConfig>,
    actions: BTreeMap<String, ActionConfig>,
}

impl StaticCatalog {
    pub fn new(
        tables: BTreeMap<String, TableConfig>,
        actions: BTreeMap<String, ActionConfig>,
    ) -> Self {
        Self {
            application: None,
            tables,
            actions,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            application: config.app_track_used_tables,
            tables: config.tables.clone(),
            actions: config.actions.clone(),
        }
    }
}

impl DependencyProvider for StaticCatalog {
    fn depends_on(&self, table: &str) -> Vec<String> {
        self.tables
            .get(table)
            .map(|t| t.depends.clone())
            .unwrap_or_default()
    }
}

impl CacheTrackingPolicy for StaticCatalog {
    fn application(&self) -> Option<bool> {
        self.application
    }

    fn table(&self, table: &str) -> Option<bool> {
        self.tables.get(table).and_then(|t| t.track_used_tables)
    }

    fn action(&self, action: &str) -> Option<bool> {
        self.actions.get(action).and_then(|a| a.track_used_tables)
    }

    fn action_depends(&self, action: &str) -> Option<Vec<String>> {
        self.actions.get(action).and_then(|a| a.depends.clone())
    }
}

/// Walks dependency declarations with cycle detection.
pub struct DependencyResolver<'a> {
    provider: &'a dyn DependencyProvider,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(provider: &'a dyn DependencyProvider) -> Self {
        Self { provider }
    }

    /// Transitive dependencies of `table`, sorted and de-duplicated.
    ///
    /// `table` itself is only included if something it depends on leads back
    /// to it, which is reported as an error instead.
    pub fn resolve(&self, table: &str) -> Result<BTreeSet<String>, CacheError> {
        let mut path = Vec::new();
        let mut expanded = BTreeSet::new();
        let mut out = BTreeSet::new();
        self.visit(table, &mut path, &mut expanded, &mut out)
            .inspect_err(|err| error!(table, error = %err, "table dependency metadata is invalid"))?;
        Ok(out)
    }

    fn visit(
        &self,
        table: &str,
        path: &mut Vec<String>,
        expanded: &mut BTreeSet<String>,
        out: &mut BTreeSet<String>,
    ) -> Result<(), CacheError> {
        if path.iter().any(|t| t == table) {
            let mut cycle = path.clone();
            cycle.push(table.to_string());
            return Err(CacheError::CircularDependency { path: cycle });
        }
        // A fully expanded table cannot reach anything on the current path,
        // or the cycle would have surfaced while expanding it.
        if expanded.contains(table) {
            return Ok(());
        }

        path.push(table.to_string());
        for dep in self.provider.depends_on(table) {
            out.insert(dep.clone());
            self.visit(&dep, path, expanded, out)?;
        }
        path.pop();
        expanded.insert(table.to_string());
        Ok(())
    }
}
