//! Proxy construction: options, the public control-plane handle, and the
//! pingora server with its listeners.

use crate::conn::ConnectionTracker;
use crate::hooks::{ErrorHook, NotFoundHandler};
use crate::proxy::ProxyEngine;
use crate::resolver::{Resolver, ResolverPipeline};
use crate::routing::{
    ForwardOptions, RouteOptions, RoutingTable, TlsProvision, target_from_opts,
};
use crate::tls::{AcmeOptions, AcmeService, CertBundle, CertError, CertStore, SniCertSelector};
use crate::urls::{UrlError, parse_source};
use parking_lot::{Mutex, RwLock};
use pingora_core::listeners::tls::TlsSettings;
use pingora_core::prelude::*;
use pingora_core::server::configuration::{Opt, ServerConf};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors from proxy construction
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("workers must be between 1 and 32, got {0}")]
    InvalidWorkers(usize),

    #[error("failed to start background runtime: {0}")]
    Runtime(std::io::Error),
}

/// Errors from route registration. These are control-plane mistakes and
/// are loud by design.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("source and target are both required")]
    MissingSourceOrTarget,

    #[error(transparent)]
    Url(#[from] UrlError),

    #[error("TLS route registered but no HTTPS listener is configured")]
    NoHttpsListener,

    #[error("letsencrypt route registered but no ACME path is configured")]
    AcmeNotConfigured,

    #[error(transparent)]
    Cert(#[from] CertError),
}

/// The plain-HTTP listener.
#[derive(Debug, Clone)]
pub struct HttpListener {
    pub port: u16,
    pub host: String,
}

impl HttpListener {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// One HTTPS listener: bind address, default certificate files, and
/// per-listener TLS knobs.
#[derive(Debug, Clone)]
pub struct SslListener {
    pub port: u16,
    pub ip: String,
    pub key: PathBuf,
    pub cert: PathBuf,
    /// CA bundle appended to the served chain.
    pub ca: Option<PathBuf>,
    pub http2: bool,
    /// Port advertised in HTTP→HTTPS redirects; defaults to `port`.
    pub redirect_port: Option<u16>,
}

impl SslListener {
    pub fn new(port: u16, key: impl Into<PathBuf>, cert: impl Into<PathBuf>) -> Self {
        Self {
            port,
            ip: "0.0.0.0".to_string(),
            key: key.into(),
            cert: cert.into(),
            ca: None,
            http2: false,
            redirect_port: None,
        }
    }

    pub fn with_http2(mut self) -> Self {
        self.http2 = true;
        self
    }
}

/// Proxy-wide construction options.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub http: Option<HttpListener>,
    pub ssl: Vec<SslListener>,
    /// Default forwarder options, merged under each route's.
    pub forward: ForwardOptions,
    /// Add `X-Forwarded-*` headers.
    pub xfwd: bool,
    /// Verify upstream TLS certificates.
    pub secure: bool,
    /// Prefer `X-Forwarded-Host` when determining the source host.
    pub prefer_forwarded_host: bool,
    pub letsencrypt: Option<AcmeOptions>,
    /// pingora worker threads, 1..=32.
    pub workers: Option<usize>,
    /// Split multi-challenge `WWW-Authenticate` response headers.
    pub ntlm: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            http: None,
            ssl: Vec::new(),
            forward: ForwardOptions::default(),
            xfwd: true,
            secure: true,
            prefer_forwarded_host: false,
            letsencrypt: None,
            workers: None,
            ntlm: false,
        }
    }
}

impl ProxyOptions {
    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http = Some(HttpListener::new(port));
        self
    }

    pub fn with_ssl(mut self, listener: SslListener) -> Self {
        self.ssl.push(listener);
        self
    }
}

/// Shared state between the control-plane handle and the data-plane
/// engine.
pub(crate) struct ProxyState {
    pub(crate) options: ProxyOptions,
    pub(crate) table: Arc<RoutingTable>,
    pub(crate) resolvers: ResolverPipeline,
    pub(crate) certs: Arc<CertStore>,
    pub(crate) tracker: ConnectionTracker,
    pub(crate) acme: Option<Arc<AcmeService>>,
    pub(crate) error_handler: RwLock<Option<Arc<dyn ErrorHook>>>,
    pub(crate) not_found: RwLock<Option<Arc<dyn NotFoundHandler>>>,
    pub(crate) background: tokio::runtime::Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyState {
    /// Port advertised in HTTP→HTTPS redirects.
    pub(crate) fn redirect_port(&self) -> Option<u16> {
        self.options
            .ssl
            .first()
            .map(|s| s.redirect_port.unwrap_or(s.port))
    }
}

/// The dynamic reverse proxy.
///
/// Cheap to clone; all clones share the routing table, certificate store,
/// and resolver pipeline, so routes can be registered and removed while
/// the server is running.
#[derive(Clone)]
pub struct ReverseProxy {
    state: Arc<ProxyState>,
    /// Runtime for control-plane tasks (ACME orders, renewal timers, the
    /// challenge server). Pingora manages its own runtimes.
    background: Arc<tokio::runtime::Runtime>,
}

impl ReverseProxy {
    pub fn new(options: ProxyOptions) -> Result<Self, ProxyError> {
        if let Some(workers) = options.workers
            && !(1..=32).contains(&workers)
        {
            return Err(ProxyError::InvalidWorkers(workers));
        }

        let background = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("shrike-background")
            .enable_all()
            .build()
            .map_err(ProxyError::Runtime)?;

        let table = Arc::new(RoutingTable::new());
        let certs = Arc::new(CertStore::new());
        let resolvers = ResolverPipeline::new(table.clone());
        let acme = options
            .letsencrypt
            .clone()
            .map(|opts| Arc::new(AcmeService::new(opts, certs.clone())));

        let state = Arc::new(ProxyState {
            options,
            table,
            resolvers,
            certs,
            tracker: ConnectionTracker::new(),
            acme: acme.clone(),
            error_handler: RwLock::new(None),
            not_found: RwLock::new(None),
            background: background.handle().clone(),
            tasks: Mutex::new(Vec::new()),
        });

        if let Some(acme) = &acme {
            state.resolvers.add(acme.challenge_resolver());
            let _guard = background.enter();
            state.tasks.lock().push(acme.spawn_challenge_server());
        }

        Ok(Self {
            state,
            background: Arc::new(background),
        })
    }

    /// Register a route from `src` (hostname, optional path prefix) to an
    /// upstream `target`. Repeat calls for the same source add further
    /// round-robin targets.
    pub fn register(&self, src: &str, target: &str) -> Result<(), RegisterError> {
        self.register_with(src, target, RouteOptions::default())
    }

    pub fn register_with(
        &self,
        src: &str,
        target: &str,
        opts: RouteOptions,
    ) -> Result<(), RegisterError> {
        if src.trim().is_empty() || target.trim().is_empty() {
            return Err(RegisterError::MissingSourceOrTarget);
        }

        let source = parse_source(src)?;
        let target = target_from_opts(target, &opts)?;

        if let Some(tls) = &opts.tls {
            if self.state.options.ssl.is_empty() {
                return Err(RegisterError::NoHttpsListener);
            }

            if !self.state.certs.contains(&source.hostname) {
                match &tls.provision {
                    TlsProvision::Files { key, cert, ca } => {
                        let bundle = CertBundle::from_files(cert, key, ca.as_deref())?;
                        self.state.certs.install(&source.hostname, Arc::new(bundle));
                    }
                    TlsProvision::LetsEncrypt {
                        email,
                        production,
                        renew_within,
                    } => {
                        let acme = self
                            .state
                            .acme
                            .clone()
                            .ok_or(RegisterError::AcmeNotConfigured)?;
                        let renew_within = renew_within.unwrap_or_else(|| acme.renew_within());
                        self.state.background.spawn(acme.clone().update_certificates(
                            source.hostname.clone(),
                            Some(email.clone()),
                            *production,
                            renew_within,
                            false,
                        ));
                    }
                    TlsProvision::ListenerDefault => {
                        self.state.certs.install_default(&source.hostname);
                    }
                }
            }
        }

        let route = self
            .state
            .table
            .insert(&source.hostname, &source.pathname, target.clone(), opts);

        tracing::info!(
            host = %source.hostname,
            path = %route.path,
            target = %target.href(),
            targets = route.target_count(),
            "route registered"
        );
        Ok(())
    }

    /// Remove every target under `(hostname, path)`.
    pub fn unregister(&self, src: &str) -> Result<(), RegisterError> {
        self.unregister_inner(src, None)
    }

    /// Remove one target under `(hostname, path)`, matched by its parsed
    /// canonical form.
    pub fn unregister_target(&self, src: &str, target: &str) -> Result<(), RegisterError> {
        let target = target_from_opts(target, &RouteOptions::default())?;
        self.unregister_inner(src, Some(target.href()))
    }

    fn unregister_inner(&self, src: &str, href: Option<String>) -> Result<(), RegisterError> {
        let source = parse_source(src)?;
        let outcome =
            self.state
                .table
                .remove(&source.hostname, &source.pathname, href.as_deref());

        // The certificate (and its renewal timer) lives as long as the
        // hostname has routes.
        if outcome.host_empty {
            self.state.certs.remove(&source.hostname);
        }

        tracing::info!(
            host = %source.hostname,
            path = %source.pathname,
            route_removed = outcome.route_removed,
            "route unregistered"
        );
        Ok(())
    }

    pub fn add_resolver(&self, resolver: Arc<dyn Resolver>) {
        self.state.resolvers.add(resolver);
    }

    pub fn add_resolvers(&self, resolvers: impl IntoIterator<Item = Arc<dyn Resolver>>) {
        self.state.resolvers.add_many(resolvers);
    }

    pub fn remove_resolver(&self, resolver: &Arc<dyn Resolver>) {
        self.state.resolvers.remove(resolver);
    }

    /// Install a global fallback for forwarding errors.
    pub fn set_error_handler(&self, handler: impl ErrorHook + 'static) {
        *self.state.error_handler.write() = Some(Arc::new(handler));
    }

    /// Replace the default 404 responder.
    pub fn not_found(&self, handler: impl NotFoundHandler + 'static) {
        *self.state.not_found.write() = Some(Arc::new(handler));
    }

    /// In-flight requests right now.
    pub fn active_requests(&self) -> usize {
        self.state.tracker.active()
    }

    /// Stop admitting requests and release control-plane resources
    /// (renewal timers, the challenge server). With `shutdown`, also wait
    /// briefly for in-flight requests to drain. Listener teardown itself
    /// is the server's graceful stop.
    pub fn close(&self, shutdown: bool) {
        self.state.tracker.close();
        for task in self.state.tasks.lock().drain(..) {
            task.abort();
        }
        self.state.certs.abort_renewals();

        if shutdown && !self.state.tracker.drain(Duration::from_millis(300)) {
            tracing::warn!(
                live = self.state.tracker.active(),
                "shutdown drain window elapsed with requests still in flight"
            );
        }
    }

    /// Build the pingora server: the engine, the HTTP listener, and one
    /// TLS listener per `ssl` entry with SNI selection against the
    /// certificate store.
    pub fn build_server(&self) -> Result<Server> {
        let mut server = match self.state.options.workers {
            Some(threads) => {
                let mut conf = ServerConf::default();
                conf.threads = threads;
                Server::new_with_opt_and_conf(None::<Opt>, conf)
            }
            None => Server::new(None)?,
        };
        server.bootstrap();

        let engine = ProxyEngine {
            state: self.state.clone(),
        };
        let mut service = pingora_proxy::http_proxy_service(&server.configuration, engine);

        if let Some(http) = &self.state.options.http {
            service.add_tcp(&format!("{}:{}", http.host, http.port));
            tracing::info!(port = http.port, "HTTP listener enabled");
        }

        for ssl in &self.state.options.ssl {
            let default_bundle = CertBundle::from_files(&ssl.cert, &ssl.key, ssl.ca.as_deref())
                .map_err(|e| {
                    Error::explain(
                        ErrorType::InternalError,
                        format!("failed to load listener certificate: {}", e),
                    )
                })?;
            let selector =
                SniCertSelector::new(self.state.certs.clone(), Arc::new(default_bundle));

            let mut tls_settings = TlsSettings::with_callbacks(Box::new(selector))?;
            if ssl.http2 {
                tls_settings.enable_h2();
            }
            service.add_tls_with_settings(&format!("{}:{}", ssl.ip, ssl.port), None, tls_settings);
            tracing::info!(port = ssl.port, http2 = ssl.http2, "HTTPS listener enabled");
        }

        server.add_service(service);
        Ok(server)
    }

    pub(crate) fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }
}

impl std::fmt::Debug for ReverseProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseProxy")
            .field("hosts", &self.state.table.host_count())
            .field("certs", &self.state.certs.len())
            .finish()
    }
}
