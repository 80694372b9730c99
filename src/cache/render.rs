//! Render-time signals.
//!
//! Uses `tokio::task_local!` so handlers (or the upstream proxy) can report
//! which tables they read, who the caller is, and which content they changed
//! without threading a handle through every call. The middleware opens a
//! scope around rendering and reads the record back at flush.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use super::ledger::UpdateCommand;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::render";

tokio::task_local! {
    static RENDER: RenderScope;
}

/// Everything the render reported about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderRecord {
    pub user: Option<String>,
    /// Replaces the authenticated user name in the environment.
    pub cache_user: Option<String>,
    pub language: Option<String>,
    pub primary_table: Option<String>,
    pub action: Option<String>,
    pub tables_touched: BTreeSet<String>,
    pub updates: Vec<UpdateCommand>,
    /// Seconds.
    pub expiry_override: Option<u64>,
    pub no_cache: bool,
}

impl RenderRecord {
    /// Authenticated user name, empty for anonymous callers.
    pub fn current_user(&self) -> &str {
        self.user.as_deref().unwrap_or("")
    }

    /// Name the environment is derived from. An empty cache user is unset.
    pub fn effective_user(&self) -> &str {
        match self.cache_user.as_deref() {
            Some(user) if !user.is_empty() && !self.current_user().is_empty() => user,
            _ => self.current_user(),
        }
    }

    pub fn tables_touched(&self) -> &BTreeSet<String> {
        &self.tables_touched
    }

    pub fn update_commands(&self) -> &[UpdateCommand] {
        &self.updates
    }

    pub fn expiry_override(&self) -> Option<u64> {
        self.expiry_override
    }
}

/// Shared handle to the record being built for one request.
#[derive(Debug, Clone, Default)]
pub struct RenderScope {
    record: Arc<Mutex<RenderRecord>>,
}

impl RenderScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// The scope active on this task, if any.
    pub fn current() -> Option<Self> {
        RENDER.try_with(Clone::clone).ok()
    }

    fn update(&self, op: &'static str, f: impl FnOnce(&mut RenderRecord)) {
        let mut record = mutex_lock(&self.record, SOURCE, op);
        f(&mut *record);
    }

    pub fn record_table(&self, table: impl Into<String>) {
        let table = table.into();
        if !table.is_empty() {
            self.update("record_table", |r| {
                r.tables_touched.insert(table);
            });
        }
    }

    pub fn invalidate(&self, command: UpdateCommand) {
        self.update("invalidate", |r| r.updates.push(command));
    }

    pub fn set_user(&self, user: impl Into<String>) {
        let user = user.into();
        self.update("set_user", |r| r.user = Some(user));
    }

    pub fn set_cache_user(&self, user: impl Into<String>) {
        let user = user.into();
        self.update("set_cache_user", |r| r.cache_user = Some(user));
    }

    pub fn set_language(&self, language: impl Into<String>) {
        let language = language.into();
        self.update("set_language", |r| r.language = Some(language));
    }

    pub fn set_primary_table(&self, table: impl Into<String>) {
        let table = table.into();
        self.update("set_primary_table", |r| r.primary_table = Some(table));
    }

    pub fn set_action(&self, action: impl Into<String>) {
        let action = action.into();
        self.update("set_action", |r| r.action = Some(action));
    }

    pub fn set_expiry(&self, secs: u64) {
        self.update("set_expiry", |r| r.expiry_override = Some(secs));
    }

    pub fn suppress_cache(&self) {
        self.update("suppress_cache", |r| r.no_cache = true);
    }

    pub fn snapshot(&self) -> RenderRecord {
        mutex_lock(&self.record, SOURCE, "snapshot").clone()
    }

    /// Run `f` with this scope installed as the task's render scope.
    pub async fn run<F: Future>(self, f: F) -> (F::Output, RenderRecord) {
        let result = RENDER.scope(self.clone(), f).await;
        (result, self.snapshot())
    }
}

fn with_current(f: impl FnOnce(&RenderScope)) {
    let _ = RENDER.try_with(f);
}

/// Record that the render read `table`. Outside a render scope this is a no-op.
pub fn record_table(table: impl Into<String>) {
    with_current(|scope| scope.record_table(table));
}

/// Request a version bump for `command` at flush.
pub fn invalidate(command: UpdateCommand) {
    with_current(|scope| scope.invalidate(command));
}

pub fn set_user(user: impl Into<String>) {
    with_current(|scope| scope.set_user(user));
}

pub fn set_cache_user(user: impl Into<String>) {
    with_current(|scope| scope.set_cache_user(user));
}

pub fn set_language(language: impl Into<String>) {
    with_current(|scope| scope.set_language(language));
}

pub fn set_primary_table(table: impl Into<String>) {
    with_current(|scope| scope.set_primary_table(table));
}

pub fn set_action(action: impl Into<String>) {
    with_current(|scope| scope.set_action(action));
}

pub fn set_expiry(secs: u64) {
    with_current(|scope| scope.set_expiry(secs));
}

/// Keep this response out of the content store.
pub fn suppress_cache() {
    with_current(|scope| scope.suppress_cache());
}

/// Run `f` inside a fresh render scope, returning its output and the record.
pub async fn with_render_scope<F: Future>(f: F) -> (F::Output, RenderRecord) {
    RenderScope::new().run(f).await
}
