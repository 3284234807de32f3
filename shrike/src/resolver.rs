//! The resolver pipeline: prioritized callables that map a request to a
//! route before the built-in table lookup gets its turn.

use crate::routing::{Route, RouteOptions, RoutingTable, target_from_opts};
use crate::urls::{Target, path_starts_with, strip_host_port};
use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use pingora_http::RequestHeader;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A resolver that fails poisons the whole batch for that request; the
/// request then proceeds as a routing miss.
#[derive(Debug, Error)]
#[error("resolver failed: {0}")]
pub struct ResolverError(pub String);

/// What a resolver may hand back.
pub enum Resolution {
    /// A ready route, used as-is.
    Route(Arc<Route>),
    /// A bare target URL; becomes a root route for this request.
    Target(String),
    /// A route descriptor: one or more target URLs plus an optional path
    /// and options.
    Spec(RouteSpec),
}

/// Descriptor form of a resolver result.
#[derive(Default)]
pub struct RouteSpec {
    pub urls: Vec<String>,
    pub path: Option<String>,
    pub opts: Option<RouteOptions>,
}

impl RouteSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            path: None,
            opts: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_opts(mut self, opts: RouteOptions) -> Self {
        self.opts = Some(opts);
        self
    }

    fn cache_key(&self) -> String {
        format!(
            "{}|{}",
            self.urls.join(","),
            self.path.as_deref().unwrap_or("/")
        )
    }
}

/// A prioritized route resolver. Higher priorities run earlier in the scan
/// order; the built-in table resolver sits at priority 0.
#[async_trait]
pub trait Resolver: Send + Sync {
    fn priority(&self) -> i32 {
        0
    }

    async fn resolve(
        &self,
        host: &str,
        url: &str,
        req: &RequestHeader,
    ) -> Result<Option<Resolution>, ResolverError>;
}

/// The built-in resolver backed by the routing table.
pub struct TableResolver {
    table: Arc<RoutingTable>,
}

impl TableResolver {
    pub fn new(table: Arc<RoutingTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Resolver for TableResolver {
    async fn resolve(
        &self,
        host: &str,
        url: &str,
        _req: &RequestHeader,
    ) -> Result<Option<Resolution>, ResolverError> {
        Ok(self.table.lookup(host, url).map(Resolution::Route))
    }
}

/// Ordered resolver list. Kept sorted by descending priority with stable
/// ties; duplicates (same `Arc`) are dropped on insert.
pub struct ResolverPipeline {
    resolvers: RwLock<Vec<Arc<dyn Resolver>>>,
    /// Coerced-route cache so repeat string/descriptor results keep their
    /// round-robin cursor. Keyed by the result's textual form; options are
    /// not part of the key.
    coerced: Mutex<HashMap<String, Arc<Route>>>,
}

impl ResolverPipeline {
    /// A pipeline containing only the built-in table resolver.
    pub fn new(table: Arc<RoutingTable>) -> Self {
        let pipeline = Self {
            resolvers: RwLock::new(Vec::new()),
            coerced: Mutex::new(HashMap::new()),
        };
        pipeline.add(Arc::new(TableResolver::new(table)));
        pipeline
    }

    pub fn add(&self, resolver: Arc<dyn Resolver>) {
        let mut resolvers = self.resolvers.write();
        if resolvers.iter().any(|r| Arc::ptr_eq(r, &resolver)) {
            return;
        }
        resolvers.push(resolver);
        resolvers.sort_by_key(|r| std::cmp::Reverse(r.priority()));
    }

    pub fn add_many(&self, new: impl IntoIterator<Item = Arc<dyn Resolver>>) {
        for r in new {
            self.add(r);
        }
    }

    /// Removal is by pointer identity.
    pub fn remove(&self, resolver: &Arc<dyn Resolver>) {
        self.resolvers
            .write()
            .retain(|r| !Arc::ptr_eq(r, resolver));
    }

    pub fn len(&self) -> usize {
        self.resolvers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.read().is_empty()
    }

    pub(crate) fn priorities(&self) -> Vec<i32> {
        self.resolvers.read().iter().map(|r| r.priority()).collect()
    }

    /// Run every resolver concurrently, then scan results in pipeline order
    /// for the first that coerces to a route covering `url`.
    pub async fn resolve(
        &self,
        host: &str,
        url: &str,
        req: &RequestHeader,
    ) -> Option<Arc<Route>> {
        let host = strip_host_port(host).to_ascii_lowercase();
        let resolvers: Vec<Arc<dyn Resolver>> = self.resolvers.read().clone();

        let results = join_all(
            resolvers
                .iter()
                .map(|r| r.resolve(&host, url, req)),
        )
        .await;

        if let Some(err) = results.iter().find_map(|r| r.as_ref().err()) {
            tracing::warn!(host = %host, url = %url, "resolver batch failed: {}", err);
            return None;
        }

        for result in results.into_iter().flatten().flatten() {
            let Some(route) = self.build_route(result) else {
                continue;
            };
            // A resolver-produced route may not usurp unrelated URLs; table
            // routes already passed the prefix check.
            if route.is_resolved && route.path != "/" && !path_starts_with(url, &route.path) {
                continue;
            }
            return Some(route);
        }
        None
    }

    /// Coerce a resolution into a route. String and descriptor results go
    /// through the cache.
    fn build_route(&self, resolution: Resolution) -> Option<Arc<Route>> {
        match resolution {
            Resolution::Route(route) => Some(route),
            Resolution::Target(url) => {
                let mut cache = self.coerced.lock();
                if let Some(route) = cache.get(&url) {
                    return Some(route.clone());
                }
                let opts = RouteOptions::default();
                let target = self.coerce_target(&url, &opts)?;
                let route = Arc::new(Route::resolved("/", vec![target], opts));
                cache.insert(url, route.clone());
                Some(route)
            }
            Resolution::Spec(spec) => {
                if spec.urls.is_empty() {
                    return None;
                }
                let key = spec.cache_key();
                let mut cache = self.coerced.lock();
                if let Some(route) = cache.get(&key) {
                    return Some(route.clone());
                }
                let opts = spec.opts.unwrap_or_default();
                let targets: Vec<Target> = spec
                    .urls
                    .iter()
                    .filter_map(|u| self.coerce_target(u, &opts))
                    .collect();
                if targets.is_empty() {
                    return None;
                }
                let path = spec.path.unwrap_or_else(|| "/".to_string());
                let route = Arc::new(Route::resolved(path, targets, opts));
                cache.insert(key, route.clone());
                Some(route)
            }
        }
    }

    fn coerce_target(&self, url: &str, opts: &RouteOptions) -> Option<Target> {
        match target_from_opts(url, opts) {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!(url = %url, "ignoring unparseable resolver target: {}", e);
                None
            }
        }
    }
}

impl std::fmt::Debug for ResolverPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverPipeline")
            .field("resolvers", &self.len())
            .finish()
    }
}
