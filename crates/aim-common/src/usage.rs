//! Usage tracking: which endpoints reference which recipes and caches
//!
//! Recipe and cache controllers both need the inverse of the endpoint →
//! recipe/cache relation, for deletion protection and for usage statistics.
//! [`UsageIndex`] builds that inverted index in a single pass over a set of
//! endpoints so each lookup afterwards is a map access.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::ResourceExt;

use crate::crd::{AIMEndpoint, RecipeUsage};

/// Stable `namespace/name` key for a namespaced object
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

/// An endpoint that references a recipe or cache
#[derive(Clone, Debug, PartialEq)]
pub struct EndpointRef {
    /// Endpoint namespace
    pub namespace: String,
    /// Endpoint name
    pub name: String,
    /// Model the endpoint serves
    pub model_id: String,
    /// Endpoint creation time
    pub created: Option<DateTime<Utc>>,
}

impl EndpointRef {
    fn from_endpoint(ep: &AIMEndpoint) -> Self {
        Self {
            namespace: ep.namespace().unwrap_or_default(),
            name: ep.name_any(),
            model_id: ep.spec.model.id.clone(),
            created: ep.creation_timestamp().map(|t| t.0),
        }
    }
}

impl std::fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Inverted index from recipes and caches to the endpoints using them
#[derive(Clone, Debug, Default)]
pub struct UsageIndex {
    /// Recipe name → endpoints whose selected recipe has that name.
    /// Each entry remembers the namespace the snapshot recorded, if any.
    by_recipe: BTreeMap<String, Vec<(Option<String>, EndpointRef)>>,
    /// Endpoints with caching enabled
    caching: Vec<EndpointRef>,
}

impl UsageIndex {
    /// Build the index from a snapshot of endpoints.
    ///
    /// Endpoints already being deleted are ignored: they no longer hold
    /// their recipe or cache.
    pub fn build<'a>(endpoints: impl IntoIterator<Item = &'a AIMEndpoint>) -> Self {
        let mut index = Self::default();
        for ep in endpoints {
            if ep.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let ep_ref = EndpointRef::from_endpoint(ep);

            if let Some(selected) = ep.status.as_ref().and_then(|s| s.selected_recipe.as_ref()) {
                index
                    .by_recipe
                    .entry(selected.name.clone())
                    .or_default()
                    .push((selected.namespace.clone(), ep_ref.clone()));
            }
            if ep.spec.cache_enabled() {
                index.caching.push(ep_ref);
            }
        }
        index
    }

    /// Endpoints whose resolved recipe is `namespace/name`.
    ///
    /// Snapshots that predate namespace tracking match on name alone.
    pub fn recipe_users(&self, namespace: &str, name: &str) -> Vec<&EndpointRef> {
        let mut users: Vec<&EndpointRef> = self
            .by_recipe
            .get(name)
            .into_iter()
            .flatten()
            .filter(|(ns, _)| ns.as_deref().map_or(true, |ns| ns == namespace))
            .map(|(_, ep)| ep)
            .collect();
        users.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        users
    }

    /// Usage statistics for a recipe: reference count and latest referencing
    /// endpoint's creation time
    pub fn recipe_usage(&self, namespace: &str, name: &str) -> RecipeUsage {
        let users = self.recipe_users(namespace, name);
        RecipeUsage {
            endpoint_count: users.len() as i32,
            last_used: users.iter().filter_map(|ep| ep.created).max(),
        }
    }

    /// Every endpoint with caching enabled, in any namespace
    pub fn caching_endpoints(&self) -> Vec<&EndpointRef> {
        let mut users: Vec<&EndpointRef> = self.caching.iter().collect();
        users.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        users
    }

    /// Number of caching endpoints in `namespace` serving `model_id`
    pub fn cached_model_users(&self, namespace: &str, model_id: &str) -> usize {
        self.caching
            .iter()
            .filter(|ep| ep.namespace == namespace && ep.model_id == model_id)
            .count()
    }
}

/// Render blocking references as `[ns/a, ns/b]` for a condition message
pub fn format_refs(refs: &[&EndpointRef]) -> String {
    let names: Vec<String> = refs.iter().map(|r| r.to_string()).collect();
    format!("[{}]", names.join(", "))
}
