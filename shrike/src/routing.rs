//! The routing table: hostname buckets of path-prefix routes, each carrying
//! an ordered target list with a round-robin cursor.

use crate::hooks::{ErrorHook, RequestHook, ResponseHook};
use crate::urls::{self, Target, path_starts_with};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Forwarder options merged into the upstream peer; the route-level value
/// wins over the proxy-wide one.
#[derive(Debug, Clone, Default)]
pub struct ForwardOptions {
    /// Verify the upstream TLS certificate.
    pub secure: Option<bool>,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
}

impl ForwardOptions {
    /// Route options over global options over the proxy-wide `secure` flag.
    pub fn merged_secure(route: Option<&Self>, global: &Self, default_secure: bool) -> bool {
        route
            .and_then(|f| f.secure)
            .or(global.secure)
            .unwrap_or(default_secure)
    }
}

/// How a TLS route obtains its certificate.
#[derive(Debug, Clone)]
pub enum TlsProvision {
    /// No certificate of its own; the listener default serves this host.
    ListenerDefault,
    /// Explicit PEM files.
    Files {
        key: PathBuf,
        cert: PathBuf,
        ca: Option<PathBuf>,
    },
    /// Obtain and renew through the ACME service.
    LetsEncrypt {
        email: String,
        production: bool,
        renew_within: Option<Duration>,
    },
}

/// TLS options for a registered route.
#[derive(Debug, Clone)]
pub struct RouteTls {
    /// Redirect plain-HTTP requests for this route to HTTPS.
    pub redirect: bool,
    pub provision: TlsProvision,
}

impl RouteTls {
    pub fn listener_default() -> Self {
        Self {
            redirect: true,
            provision: TlsProvision::ListenerDefault,
        }
    }

    pub fn files(key: impl Into<PathBuf>, cert: impl Into<PathBuf>) -> Self {
        Self {
            redirect: true,
            provision: TlsProvision::Files {
                key: key.into(),
                cert: cert.into(),
                ca: None,
            },
        }
    }

    pub fn letsencrypt(email: impl Into<String>, production: bool) -> Self {
        Self {
            redirect: true,
            provision: TlsProvision::LetsEncrypt {
                email: email.into(),
                production,
                renew_within: None,
            },
        }
    }

    pub fn no_redirect(mut self) -> Self {
        self.redirect = false;
        self
    }
}

/// Per-route options supplied at registration.
#[derive(Clone, Default)]
pub struct RouteOptions {
    pub tls: Option<RouteTls>,
    /// Rewrite the outgoing `Host` header to the target's host.
    pub use_target_host_header: bool,
    pub forward: Option<ForwardOptions>,
    pub on_request: Option<Arc<dyn RequestHook>>,
    pub on_response: Option<Arc<dyn ResponseHook>>,
    pub on_error: Option<Arc<dyn ErrorHook>>,
}

impl RouteOptions {
    pub fn with_tls(mut self, tls: RouteTls) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_target_host_header(mut self) -> Self {
        self.use_target_host_header = true;
        self
    }

    pub fn with_forward(mut self, forward: ForwardOptions) -> Self {
        self.forward = Some(forward);
        self
    }

    pub fn with_on_request(mut self, hook: impl RequestHook + 'static) -> Self {
        self.on_request = Some(Arc::new(hook));
        self
    }

    pub fn with_on_response(mut self, hook: impl ResponseHook + 'static) -> Self {
        self.on_response = Some(Arc::new(hook));
        self
    }

    pub fn with_on_error(mut self, hook: impl ErrorHook + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub(crate) fn has_hooks(&self) -> bool {
        self.on_request.is_some() || self.on_response.is_some() || self.on_error.is_some()
    }
}

impl std::fmt::Debug for RouteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteOptions")
            .field("tls", &self.tls)
            .field("use_target_host_header", &self.use_target_host_header)
            .field("forward", &self.forward)
            .field("on_request", &self.on_request.is_some())
            .field("on_response", &self.on_response.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// A path-prefix route under a host bucket.
pub struct Route {
    /// Path prefix, always starting with `/`.
    pub path: String,
    pub opts: RouteOptions,
    /// True for routes coerced from resolver results rather than the table.
    pub is_resolved: bool,
    urls: RwLock<Vec<Target>>,
    rr: AtomicUsize,
}

impl Route {
    pub fn new(path: impl Into<String>, opts: RouteOptions) -> Self {
        Self {
            path: path.into(),
            opts,
            is_resolved: false,
            urls: RwLock::new(Vec::new()),
            rr: AtomicUsize::new(0),
        }
    }

    pub(crate) fn resolved(path: impl Into<String>, targets: Vec<Target>, opts: RouteOptions) -> Self {
        Self {
            path: path.into(),
            opts,
            is_resolved: true,
            urls: RwLock::new(targets),
            rr: AtomicUsize::new(0),
        }
    }

    /// Whether this route's path prefix covers `url`.
    pub fn matches(&self, url: &str) -> bool {
        self.path == "/" || path_starts_with(url, &self.path)
    }

    /// Round-robin target selection. The cursor advances exactly once per
    /// pick, atomically; fairness across concurrent picks is best effort.
    pub fn next_target(&self) -> Option<Target> {
        let urls = self.urls.read();
        let len = urls.len();
        if len == 0 {
            return None;
        }
        let prev = self
            .rr
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some((i + 1) % len))
            .unwrap_or(0);
        urls.get(prev % len).cloned()
    }

    pub fn targets(&self) -> Vec<Target> {
        self.urls.read().clone()
    }

    pub fn target_count(&self) -> usize {
        self.urls.read().len()
    }

    /// Current round-robin cursor, for inspection.
    pub fn rr_index(&self) -> usize {
        self.rr.load(Ordering::Acquire)
    }

    fn push_target(&self, target: Target) {
        self.urls.write().push(target);
    }

    /// Remove targets by href (all targets when `href` is None). Returns
    /// how many remain. The cursor is clamped back into range.
    fn remove_targets(&self, href: Option<&str>) -> usize {
        let mut urls = self.urls.write();
        match href {
            Some(h) => urls.retain(|t| t.href() != h),
            None => urls.clear(),
        }
        let len = urls.len();
        if len == 0 {
            self.rr.store(0, Ordering::Release);
        } else {
            let _ = self
                .rr
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some(i % len));
        }
        len
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.path)
            .field("urls", &self.urls.read().len())
            .field("rr", &self.rr.load(Ordering::Relaxed))
            .field("is_resolved", &self.is_resolved)
            .finish()
    }
}

/// Build a target from user input, deriving its flags from route options.
pub(crate) fn target_from_opts(input: &str, opts: &RouteOptions) -> Result<Target, urls::UrlError> {
    urls::build_target(
        input,
        urls::TargetFlags {
            ssl_redirect: opts.tls.as_ref().is_some_and(|t| t.redirect),
            use_target_host_header: opts.use_target_host_header,
        },
    )
}

/// Outcome of an unregister, used by the owner to decide whether the
/// hostname's certificate entry should be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub route_removed: bool,
    pub host_empty: bool,
}

/// Hostname → ordered routes. Buckets are kept sorted by descending path
/// length so prefix matching consults the most specific path first; shard
/// locking means a reader sees a bucket before or after a mutation, never
/// mid-sort.
#[derive(Default)]
pub struct RoutingTable {
    buckets: DashMap<String, Vec<Arc<Route>>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a target under `(hostname, path)`, creating the route when it is
    /// new. Repeat registrations for the same pair push further targets
    /// onto the same route.
    pub fn insert(
        &self,
        hostname: &str,
        path: &str,
        target: Target,
        opts: RouteOptions,
    ) -> Arc<Route> {
        let mut bucket = self.buckets.entry(hostname.to_string()).or_default();

        let route = match bucket.iter().find(|r| r.path == path) {
            Some(existing) => existing.clone(),
            None => {
                let route = Arc::new(Route::new(path, opts));
                bucket.push(route.clone());
                route
            }
        };
        route.push_target(target);

        // Most specific first; stable sort keeps insertion order for ties.
        bucket.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        route
    }

    /// Remove targets under `(hostname, path)`. A route whose target list
    /// becomes empty is spliced out; an empty bucket is dropped.
    pub fn remove(&self, hostname: &str, path: &str, target_href: Option<&str>) -> RemoveOutcome {
        let mut outcome = RemoveOutcome {
            route_removed: false,
            host_empty: false,
        };

        let Some(mut bucket) = self.buckets.get_mut(hostname) else {
            return outcome;
        };

        if let Some(pos) = bucket.iter().position(|r| r.path == path) {
            let remaining = bucket[pos].remove_targets(target_href);
            if remaining == 0 {
                bucket.remove(pos);
                outcome.route_removed = true;
            }
        }

        let empty = bucket.is_empty();
        drop(bucket);
        if empty {
            self.buckets.remove_if(hostname, |_, b| b.is_empty());
            outcome.host_empty = true;
        }
        outcome
    }

    /// First route in the host bucket whose path is `/` or a valid prefix
    /// of `url`.
    pub fn lookup(&self, hostname: &str, url: &str) -> Option<Arc<Route>> {
        let bucket = self.buckets.get(hostname)?;
        bucket.iter().find(|r| r.matches(url)).cloned()
    }

    pub fn routes_for(&self, hostname: &str) -> Vec<Arc<Route>> {
        self.buckets
            .get(hostname)
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    pub fn host_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("hosts", &self.buckets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urls::{TargetFlags, build_target};

    fn target(input: &str) -> Target {
        build_target(
            input,
            TargetFlags {
                ssl_redirect: false,
                use_target_host_header: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_insert_creates_route_and_appends_targets() {
        let table = RoutingTable::new();
        table.insert("example.com", "/", target("127.0.0.1:8080"), RouteOptions::default());
        table.insert("example.com", "/", target("127.0.0.1:8081"), RouteOptions::default());

        let routes = table.routes_for("example.com");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].target_count(), 2);
    }

    #[test]
    fn test_bucket_sorted_by_descending_path_length() {
        let table = RoutingTable::new();
        table.insert("example.com", "/", target("127.0.0.1:1"), RouteOptions::default());
        table.insert("example.com", "/api/v1", target("127.0.0.1:2"), RouteOptions::default());
        table.insert("example.com", "/api", target("127.0.0.1:3"), RouteOptions::default());

        let paths: Vec<String> = table
            .routes_for("example.com")
            .iter()
            .map(|r| r.path.clone())
            .collect();
        assert_eq!(paths, vec!["/api/v1", "/api", "/"]);
    }

    #[test]
    fn test_equal_length_paths_keep_insertion_order() {
        let table = RoutingTable::new();
        table.insert("example.com", "/aa", target("127.0.0.1:1"), RouteOptions::default());
        table.insert("example.com", "/bb", target("127.0.0.1:2"), RouteOptions::default());

        let paths: Vec<String> = table
            .routes_for("example.com")
            .iter()
            .map(|r| r.path.clone())
            .collect();
        assert_eq!(paths, vec!["/aa", "/bb"]);
    }

    #[test]
    fn test_lookup_prefers_most_specific_prefix() {
        let table = RoutingTable::new();
        table.insert("example.com", "/", target("127.0.0.1:1"), RouteOptions::default());
        table.insert("example.com", "/api", target("127.0.0.1:2"), RouteOptions::default());

        assert_eq!(table.lookup("example.com", "/api/users").unwrap().path, "/api");
        assert_eq!(table.lookup("example.com", "/other").unwrap().path, "/");
    }

    #[test]
    fn test_lookup_respects_path_boundary() {
        let table = RoutingTable::new();
        table.insert("example.com", "/foo", target("127.0.0.1:1"), RouteOptions::default());

        assert!(table.lookup("example.com", "/foo/bar").is_some());
        assert!(table.lookup("example.com", "/foo?a=b").is_some());
        assert!(table.lookup("example.com", "/foobar").is_none());
    }

    #[test]
    fn test_lookup_unknown_host() {
        let table = RoutingTable::new();
        assert!(table.lookup("nope.example.com", "/").is_none());
    }

    #[test]
    fn test_round_robin_advances_once_per_pick() {
        let table = RoutingTable::new();
        let route = table.insert("example.com", "/", target("127.0.0.1:8080"), RouteOptions::default());
        table.insert("example.com", "/", target("127.0.0.1:8081"), RouteOptions::default());
        table.insert("example.com", "/", target("127.0.0.1:8082"), RouteOptions::default());

        let mut ports = Vec::new();
        for _ in 0..6 {
            ports.push(route.next_target().unwrap().port);
        }
        assert_eq!(ports, vec![8080, 8081, 8082, 8080, 8081, 8082]);
        assert!(route.rr_index() < route.target_count());
    }

    #[test]
    fn test_round_robin_cursor_clamped_after_removal() {
        let table = RoutingTable::new();
        let route = table.insert("example.com", "/", target("127.0.0.1:8080"), RouteOptions::default());
        table.insert("example.com", "/", target("127.0.0.1:8081"), RouteOptions::default());

        route.next_target();
        route.next_target();
        route.next_target(); // cursor now 1

        table.remove("example.com", "/", Some(&target("127.0.0.1:8081").href()));
        assert_eq!(route.target_count(), 1);
        assert!(route.rr_index() < 1);
        assert_eq!(route.next_target().unwrap().port, 8080);
    }

    #[test]
    fn test_remove_specific_target_keeps_route() {
        let table = RoutingTable::new();
        table.insert("example.com", "/", target("127.0.0.1:8080"), RouteOptions::default());
        table.insert("example.com", "/", target("127.0.0.1:8081"), RouteOptions::default());

        let outcome = table.remove("example.com", "/", Some(&target("127.0.0.1:8080").href()));
        assert!(!outcome.route_removed);
        assert!(!outcome.host_empty);
        assert_eq!(table.routes_for("example.com")[0].target_count(), 1);
    }

    #[test]
    fn test_register_then_unregister_restores_table() {
        let table = RoutingTable::new();
        table.insert("example.com", "/x", target("127.0.0.1:8080"), RouteOptions::default());

        let outcome = table.remove("example.com", "/x", None);
        assert!(outcome.route_removed);
        assert!(outcome.host_empty);
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_unknown_route_is_noop() {
        let table = RoutingTable::new();
        table.insert("example.com", "/", target("127.0.0.1:8080"), RouteOptions::default());

        let outcome = table.remove("example.com", "/nope", None);
        assert!(!outcome.route_removed);
        assert!(!outcome.host_empty);
        assert_eq!(table.host_count(), 1);
    }

    #[test]
    fn test_concurrent_round_robin_each_pick_advances_once() {
        let table = RoutingTable::new();
        let route = table.insert("example.com", "/", target("127.0.0.1:8080"), RouteOptions::default());
        table.insert("example.com", "/", target("127.0.0.1:8081"), RouteOptions::default());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let r = route.clone();
            handles.push(std::thread::spawn(move || {
                let mut counts = [0usize; 2];
                for _ in 0..100 {
                    match r.next_target().unwrap().port {
                        8080 => counts[0] += 1,
                        8081 => counts[1] += 1,
                        _ => unreachable!(),
                    }
                }
                counts
            }));
        }

        let mut totals = [0usize; 2];
        for h in handles {
            let c = h.join().unwrap();
            totals[0] += c[0];
            totals[1] += c[1];
        }
        // 800 picks over 2 targets: the modular cursor pairs every advance
        // with one use, so the split is exact.
        assert_eq!(totals[0], 400);
        assert_eq!(totals[1], 400);
    }
}
