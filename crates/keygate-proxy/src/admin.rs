//! Operator subcommands on the access control document

use keygate::access::AccessDocument;
use keygate::authz::PermissionSet;
use keygate::storage::{Storage, walk};

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::info;

async fn load(storage: &dyn Storage, key: &str) -> Result<AccessDocument> {
    let Some(data) = storage.get(key).await.with_context(|| format!("cannot read {key}"))? else {
        return Ok(AccessDocument::new());
    };
    AccessDocument::parse(&data).with_context(|| format!("{key} is not a valid access control document"))
}

async fn save(storage: &dyn Storage, key: &str, doc: &AccessDocument) -> Result<()> {
    let json = doc.to_json_pretty()?;
    storage
        .put(key, Bytes::from(json))
        .await
        .with_context(|| format!("cannot write {key}"))
}

/// Adds `prefix` to the grants of `identity`. Returns `false` if it was already there.
pub async fn grant(storage: &dyn Storage, key: &str, identity: &str, prefix: &str) -> Result<bool> {
    let mut doc = load(storage, key).await?;
    if !doc.grant(identity, prefix) {
        return Ok(false);
    }
    save(storage, key, &doc).await?;
    info!(identity, prefix, "granted");
    Ok(true)
}

/// Removes one grant, or the identity entirely when `prefix` is `None`.
/// Returns `false` if there was nothing to remove.
pub async fn revoke(storage: &dyn Storage, key: &str, identity: &str, prefix: Option<&str>) -> Result<bool> {
    let mut doc = load(storage, key).await?;
    if !doc.revoke(identity, prefix) {
        return Ok(false);
    }
    save(storage, key, &doc).await?;
    info!(identity, prefix, "revoked");
    Ok(true)
}

/// The whole document, or the grants of one identity, as JSON.
pub async fn show(storage: &dyn Storage, key: &str, identity: Option<&str>) -> Result<String> {
    let doc = load(storage, key).await?;
    let text = match identity {
        None => String::from_utf8(doc.to_json_pretty()?)?,
        Some(id) => serde_json::to_string_pretty(doc.grants_of(id).unwrap_or_default())?,
    };
    Ok(text)
}

/// Every object key `identity` may read.
pub async fn audit(storage: &dyn Storage, key: &str, identity: &str) -> Result<Vec<String>> {
    let doc = load(storage, key).await?;
    let perms = doc.permissions(identity);

    let roots = match &perms {
        PermissionSet::All => vec![String::new()],
        PermissionSet::Prefixes(prefixes) => prefixes.clone(),
    };

    let mut keys = BTreeSet::new();
    for root in &roots {
        for object in walk(storage, root).await.with_context(|| format!("cannot list {root:?}"))? {
            if perms.is_allowed(&object.key) {
                keys.insert(object.key);
            }
        }
    }
    Ok(keys.into_iter().collect())
}
