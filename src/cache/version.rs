//! Version string composition.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use url::form_urlencoded;

use super::details::{AppDetails, PageDetails, UserDetails};

/// Canonical version string for a page, or `None` when any of the three
/// details records is absent.
///
/// Pairs are emitted in key order, so the result does not depend on the
/// order tables were recorded in.
pub fn compose_version_string(
    app: Option<&AppDetails>,
    user: Option<&UserDetails>,
    page: Option<&PageDetails>,
) -> Option<String> {
    let (app, user, page) = (app?, user?, page?);

    let mut pairs = BTreeMap::new();
    pairs.insert(
        "appVersion".to_string(),
        format!("{}.{}.{}", app.base_version, app.version, user.app_version),
    );
    for table in &page.tables {
        let app_table = app.table_versions.get(table).copied().unwrap_or(0);
        let user_table = user.table_versions.get(table).copied().unwrap_or(0);
        pairs.insert(format!("tables.{table}"), format!("{app_table}.{user_table}"));
    }

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in &pairs {
        serializer.append_pair(key, value);
    }
    Some(serializer.finish())
}

/// Fixed-length digest of a version string.
pub fn version_hash(version: &str) -> String {
    hex::encode(Sha256::digest(version.as_bytes()))
}

pub fn compose_version_hash(
    app: Option<&AppDetails>,
    user: Option<&UserDetails>,
    page: Option<&PageDetails>,
) -> Option<String> {
    compose_version_string(app, user, page).map(|s| version_hash(&s))
}
