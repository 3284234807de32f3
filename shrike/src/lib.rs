//! Shrike is a dynamic reverse proxy.
//!
//! Traffic arriving on one HTTP listener and any number of HTTPS listeners
//! (with SNI certificate selection) is matched against a host+path routing
//! table and forwarded to a round-robin-selected upstream target.
//! Routes can be registered and removed while the server is running, carry
//! optional request/response/error hooks, and can opt into automatic
//! certificate acquisition and renewal through ACME.
//!
//! ```no_run
//! use shrike::{ProxyOptions, ReverseProxy};
//!
//! let proxy = ReverseProxy::new(ProxyOptions::default().with_http_port(8080))?;
//! proxy.register("example.com", "127.0.0.1:3000")?;
//! proxy.register("example.com/static", "127.0.0.1:3001")?;
//!
//! let server = proxy.build_server()?;
//! server.run_forever();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod conn;
mod hooks;
mod proxy;
mod resolver;
mod routing;
mod server;
mod tls;
mod urls;

pub use conn::{ConnectionTracker, LiveRequest};
pub use hooks::{ErrorHook, NotFoundHandler, RequestAction, RequestHook, ResponseHook};
pub use resolver::{Resolution, Resolver, ResolverError, ResolverPipeline, RouteSpec, TableResolver};
pub use routing::{
    ForwardOptions, RemoveOutcome, Route, RouteOptions, RouteTls, RoutingTable, TlsProvision,
};
pub use server::{
    HttpListener, ProxyError, ProxyOptions, RegisterError, ReverseProxy, SslListener,
};
pub use tls::{AcmeError, AcmeOptions, AcmeService, CHALLENGE_PREFIX, CertBundle, CertError, CertStore, SniCertSelector};
pub use urls::{Scheme, SourceUrl, Target, UrlError};

// Hook signatures are written against these types.
pub use bytes::Bytes;
pub use pingora_core::Error as ForwardError;
pub use pingora_http::{RequestHeader, ResponseHeader};
