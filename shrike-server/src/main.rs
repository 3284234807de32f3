//! Standalone shrike server: a TOML file describes the listeners and the
//! initial routing table, the proxy runs until stopped.

use clap::Parser;
use serde::Deserialize;
use shrike::{
    AcmeOptions, HttpListener, ProxyOptions, ReverseProxy, RouteOptions, RouteTls, SslListener,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Shrike - dynamic reverse proxy
#[derive(Parser)]
#[command(name = "shrike-server")]
#[command(version)]
#[command(about = "Shrike - dynamic reverse proxy")]
struct Args {
    /// TOML configuration file with listeners and routes
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// HTTP port (overrides the configuration file)
    #[arg(long)]
    port: Option<u16>,

    /// HTTP bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    http: Option<HttpConfig>,
    #[serde(default)]
    ssl: Vec<SslConfig>,
    letsencrypt: Option<LetsEncryptConfig>,
    workers: Option<usize>,
    #[serde(default = "default_true")]
    xfwd: bool,
    #[serde(default = "default_true")]
    secure: bool,
    #[serde(default)]
    prefer_forwarded_host: bool,
    #[serde(default)]
    ntlm: bool,
    #[serde(default, rename = "route")]
    routes: Vec<RouteConfig>,
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: None,
            ssl: Vec::new(),
            letsencrypt: None,
            workers: None,
            xfwd: true,
            secure: true,
            prefer_forwarded_host: false,
            ntlm: false,
            routes: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpConfig {
    port: u16,
    host: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SslConfig {
    port: u16,
    ip: Option<String>,
    key: PathBuf,
    cert: PathBuf,
    ca: Option<PathBuf>,
    #[serde(default)]
    http2: bool,
    redirect_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LetsEncryptConfig {
    path: PathBuf,
    port: Option<u16>,
    renew_within_days: Option<u64>,
    min_renew_time_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteConfig {
    src: String,
    #[serde(default)]
    targets: Vec<String>,
    target: Option<String>,
    #[serde(default)]
    use_target_host_header: bool,
    tls: Option<RouteTlsConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteTlsConfig {
    #[serde(default = "default_true")]
    redirect: bool,
    key: Option<PathBuf>,
    cert: Option<PathBuf>,
    ca: Option<PathBuf>,
    letsencrypt: Option<RouteLetsEncryptConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteLetsEncryptConfig {
    email: String,
    #[serde(default)]
    production: bool,
}

impl Config {
    fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    fn proxy_options(&self) -> ProxyOptions {
        let mut options = ProxyOptions {
            xfwd: self.xfwd,
            secure: self.secure,
            prefer_forwarded_host: self.prefer_forwarded_host,
            ntlm: self.ntlm,
            workers: self.workers,
            ..Default::default()
        };

        if let Some(http) = &self.http {
            let mut listener = HttpListener::new(http.port);
            if let Some(host) = &http.host {
                listener.host = host.clone();
            }
            options.http = Some(listener);
        }

        for ssl in &self.ssl {
            let mut listener = SslListener::new(ssl.port, &ssl.key, &ssl.cert);
            if let Some(ip) = &ssl.ip {
                listener.ip = ip.clone();
            }
            listener.ca = ssl.ca.clone();
            listener.http2 = ssl.http2;
            listener.redirect_port = ssl.redirect_port;
            options.ssl.push(listener);
        }

        if let Some(le) = &self.letsencrypt {
            let mut acme = AcmeOptions::new(&le.path);
            if let Some(port) = le.port {
                acme.port = port;
            }
            if let Some(days) = le.renew_within_days {
                acme.renew_within = Duration::from_secs(days * 24 * 60 * 60);
            }
            if let Some(secs) = le.min_renew_time_secs {
                acme.min_renew_time = Duration::from_secs(secs);
            }
            options.letsencrypt = Some(acme);
        }

        options
    }
}

impl RouteConfig {
    fn route_options(&self) -> Result<RouteOptions, String> {
        let mut opts = RouteOptions::default();
        if self.use_target_host_header {
            opts = opts.with_target_host_header();
        }

        if let Some(tls) = &self.tls {
            let mut route_tls = match (&tls.key, &tls.cert, &tls.letsencrypt) {
                (Some(key), Some(cert), None) => {
                    let mut t = RouteTls::files(key, cert);
                    if let Some(ca) = &tls.ca
                        && let shrike::TlsProvision::Files { ca: slot, .. } = &mut t.provision
                    {
                        *slot = Some(ca.clone());
                    }
                    t
                }
                (None, None, Some(le)) => RouteTls::letsencrypt(&le.email, le.production),
                (None, None, None) => RouteTls::listener_default(),
                _ => {
                    return Err(format!(
                        "route '{}': tls needs either key+cert, letsencrypt, or neither",
                        self.src
                    ));
                }
            };
            route_tls.redirect = tls.redirect;
            opts = opts.with_tls(route_tls);
        }

        Ok(opts)
    }

    fn target_list(&self) -> Vec<&str> {
        self.target
            .as_deref()
            .into_iter()
            .chain(self.targets.iter().map(String::as_str))
            .collect()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let mut options = config.proxy_options();
    if let Some(port) = args.port {
        options.http = Some(HttpListener {
            port,
            host: args.host.clone(),
        });
    }
    if options.http.is_none() && options.ssl.is_empty() {
        return Err("no listeners configured: set --port or a config file".into());
    }

    tracing::info!("Shrike v{}", env!("CARGO_PKG_VERSION"));
    if let Some(http) = &options.http {
        tracing::info!("HTTP: {}:{}", http.host, http.port);
    }
    for ssl in &options.ssl {
        tracing::info!("HTTPS: {}:{} (h2: {})", ssl.ip, ssl.port, ssl.http2);
    }

    let proxy = ReverseProxy::new(options)?;

    for route in &config.routes {
        let opts = route.route_options()?;
        let targets = route.target_list();
        if targets.is_empty() {
            return Err(format!("route '{}' has no targets", route.src).into());
        }
        for target in targets {
            proxy.register_with(&route.src, target, opts.clone())?;
        }
    }

    let server = proxy.build_server()?;

    // Blocks until the process is stopped.
    server.run_forever();
}
