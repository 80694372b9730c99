//! Content-version ledger and the update step that keeps details warm.
//!
//! The ledger is the only durable state. At flush, every update command the
//! render produced is committed to it first; the cached app and user details
//! are then patched (or rebuilt) so the next request can compose a version
//! hash without touching the ledger.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, error, warn};

use super::details::{AppDetails, DetailsCache, UserDetails};
use super::error::CacheError;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::ledger";
const METRIC_LEDGER_ERROR: &str = "pagecache_ledger_error_total";

/// Request to bump one `(table, user)` counter. An empty `user` is the
/// application-wide scope; an empty `table` bumps the whole scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpdateCommand {
    pub user: String,
    pub table: String,
}

impl UpdateCommand {
    pub fn new(user: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            table: table.into(),
        }
    }

    /// Bump `table` for every caller.
    pub fn app_table(table: impl Into<String>) -> Self {
        Self::new("", table)
    }

    /// Bump `table` for one user.
    pub fn user_table(user: impl Into<String>, table: impl Into<String>) -> Self {
        Self::new(user, table)
    }

    /// Parse `user:table`. A value without a colon names an app-wide table.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((user, table)) => Self::new(user.trim(), table.trim()),
            None => Self::app_table(raw.trim()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRow {
    pub table: String,
    pub user: String,
    pub version: i64,
}

/// Durable `(table, user) -> version` counters.
#[async_trait]
pub trait ContentVersionLedger: Send + Sync {
    /// Atomically increment the counter for `command`, creating it at 1.
    /// Returns the new version.
    async fn increment(&self, command: &UpdateCommand) -> Result<i64, CacheError>;

    /// Every counter recorded for `user`.
    async fn versions_for(&self, user: &str) -> Result<Vec<VersionRow>, CacheError>;

    /// Database-wide content version.
    async fn base_version(&self) -> Result<i64, CacheError>;
}

/// Process-local ledger used when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    rows: Mutex<BTreeMap<(String, String), i64>>,
    base_version: Mutex<i64>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_base_version(&self, version: i64) {
        *mutex_lock(&self.base_version, SOURCE, "set_base_version") = version;
    }

    pub fn version(&self, table: &str, user: &str) -> i64 {
        mutex_lock(&self.rows, SOURCE, "version")
            .get(&(table.to_string(), user.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ContentVersionLedger for MemoryLedger {
    async fn increment(&self, command: &UpdateCommand) -> Result<i64, CacheError> {
        let mut rows = mutex_lock(&self.rows, SOURCE, "increment");
        let version = rows
            .entry((command.table.clone(), command.user.clone()))
            .or_insert(0);
        *version += 1;
        Ok(*version)
    }

    async fn versions_for(&self, user: &str) -> Result<Vec<VersionRow>, CacheError> {
        let rows = mutex_lock(&self.rows, SOURCE, "versions_for");
        Ok(rows
            .iter()
            .filter(|((_, u), _)| u == user)
            .map(|((table, user), version)| VersionRow {
                table: table.clone(),
                user: user.clone(),
                version: *version,
            })
            .collect())
    }

    async fn base_version(&self) -> Result<i64, CacheError> {
        Ok(*mutex_lock(&self.base_version, SOURCE, "base_version"))
    }
}

/// Scope counter and per-table counters for one user's rows.
fn project(rows: &[VersionRow]) -> (i64, BTreeMap<String, i64>) {
    let mut scope = 0;
    let mut tables = BTreeMap::new();
    for row in rows {
        if row.table.is_empty() {
            scope = row.version;
        } else {
            tables.insert(row.table.clone(), row.version);
        }
    }
    (scope, tables)
}

/// Apply committed versions to a scope counter and its table map.
fn patch(
    scope: &mut i64,
    tables: &mut BTreeMap<String, i64>,
    committed: &[(UpdateCommand, i64)],
    user: &str,
) -> bool {
    let mut changed = false;
    for (command, version) in committed.iter().filter(|(c, _)| c.user == user) {
        if command.table.is_empty() {
            *scope = *version;
        } else {
            tables.insert(command.table.clone(), *version);
        }
        changed = true;
    }
    changed
}

/// What an update pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub committed: usize,
    pub app_written: bool,
    pub user_written: bool,
}

/// Commits update commands and refreshes the cached details projections.
pub struct UpdateLedger<'a> {
    ledger: &'a dyn ContentVersionLedger,
    app_ttl: Duration,
    user_ttl: Duration,
}

impl<'a> UpdateLedger<'a> {
    pub fn new(ledger: &'a dyn ContentVersionLedger, app_ttl: Duration, user_ttl: Duration) -> Self {
        Self {
            ledger,
            app_ttl,
            user_ttl,
        }
    }

    /// Commit `commands`, then bring the app details and the details of the
    /// environment `user` belongs to up to date.
    ///
    /// A ledger write failure stops the pass: the commands already committed
    /// are still applied to the cached details before the error is returned.
    /// Failures while reading the ledger to rebuild details, or while writing
    /// details back, are logged and otherwise ignored.
    pub async fn process(
        &self,
        commands: &[UpdateCommand],
        user: &str,
        details: &mut DetailsCache,
    ) -> Result<UpdateSummary, CacheError> {
        let mut committed = Vec::with_capacity(commands.len());
        for command in commands {
            match self.ledger.increment(command).await {
                Ok(version) => {
                    debug!(table = %command.table, user = %command.user, version, "ledger committed");
                    committed.push((command.clone(), version));
                }
                Err(err) => {
                    counter!(METRIC_LEDGER_ERROR).increment(1);
                    error!(table = %command.table, user = %command.user, error = %err, "ledger commit failed");
                    if !committed.is_empty() {
                        self.refresh_app(&committed, details).await;
                        self.refresh_user(&committed, user, details).await;
                    }
                    return Err(err);
                }
            }
        }

        let app_written = self.refresh_app(&committed, details).await;
        let user_written = self.refresh_user(&committed, user, details).await;
        Ok(UpdateSummary {
            committed: committed.len(),
            app_written,
            user_written,
        })
    }

    async fn refresh_app(&self, committed: &[(UpdateCommand, i64)], details: &mut DetailsCache) -> bool {
        let base_version = match self.ledger.base_version().await {
            Ok(version) => Some(version),
            Err(err) => {
                warn!(error = %err, "could not read base version");
                None
            }
        };

        let app = match details.app_details().await {
            Some(mut app) => {
                let mut changed = patch(&mut app.version, &mut app.table_versions, committed, "");
                if let Some(base) = base_version.filter(|b| *b != app.base_version) {
                    app.base_version = base;
                    changed = true;
                }
                if !changed {
                    return false;
                }
                app
            }
            None => {
                let Some(base_version) = base_version else {
                    return false;
                };
                let rows = match self.ledger.versions_for("").await {
                    Ok(rows) => rows,
                    Err(err) => {
                        warn!(error = %err, "could not rebuild app details from ledger");
                        return false;
                    }
                };
                let (version, table_versions) = project(&rows);
                AppDetails {
                    version,
                    base_version,
                    table_versions,
                }
            }
        };
        details.put_app_details(app, self.app_ttl).await
    }

    async fn refresh_user(
        &self,
        committed: &[(UpdateCommand, i64)],
        user: &str,
        details: &mut DetailsCache,
    ) -> bool {
        let record = match details.user_details().await {
            Some(mut record) => {
                if !patch(&mut record.app_version, &mut record.table_versions, committed, user) {
                    return false;
                }
                record
            }
            None => {
                let rows = match self.ledger.versions_for(user).await {
                    Ok(rows) => rows,
                    Err(err) => {
                        warn!(user, error = %err, "could not rebuild user details from ledger");
                        return false;
                    }
                };
                let (app_version, table_versions) = project(&rows);
                UserDetails {
                    app_version,
                    table_versions,
                }
            }
        };
        details.put_user_details(record, self.user_ttl).await
    }
}
