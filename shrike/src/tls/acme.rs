//! ACME certificate acquisition and renewal scheduling.
//!
//! Uses instant-acme for the protocol and HTTP-01 challenges for domain
//! validation. Challenges are answered by a loopback challenge server; a
//! highest-priority resolver steers `/.well-known/acme-challenge` traffic
//! from any listener to it. Issued certificates land in the [`CertStore`]
//! and a single-shot timer re-enters the acquisition path shortly before
//! expiry.

use super::store::{CertBundle, CertError, CertStore};
use crate::resolver::{Resolution, Resolver, ResolverError};
use async_trait::async_trait;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, OrderStatus,
    RetryPolicy,
};
use parking_lot::RwLock;
use pingora_http::RequestHeader;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// URL prefix of HTTP-01 challenge requests.
pub const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge";

/// Errors that can occur during ACME operations
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Challenge failed: {0}")]
    ChallengeFailed(String),

    #[error("Order not ready: {0}")]
    OrderNotReady(String),

    #[error("HTTP-01 challenge not available")]
    NoHttp01Challenge,

    #[error("Failed to persist credentials: {0}")]
    Credentials(String),

    #[error("ACME error: {0}")]
    Acme(#[from] instant_acme::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),
}

/// ACME configuration, set once at proxy construction.
#[derive(Debug, Clone)]
pub struct AcmeOptions {
    /// Directory for account credentials and issued PEMs.
    pub path: PathBuf,
    /// Loopback port the challenge server binds.
    pub port: u16,
    /// Renew this long before expiry, unless the route says otherwise.
    pub renew_within: Duration,
    /// Floor for the renewal timer when a certificate is already inside
    /// its renewal window.
    pub min_renew_time: Duration,
    /// Timeout for order polling.
    pub timeout: Duration,
}

impl AcmeOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            port: 3000,
            renew_within: Duration::from_secs(30 * 24 * 60 * 60),
            min_renew_time: Duration::from_secs(60 * 60),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

fn directory_url(production: bool) -> String {
    if production {
        "https://acme-v02.api.letsencrypt.org/directory".to_string()
    } else {
        "https://acme-staging-v02.api.letsencrypt.org/directory".to_string()
    }
}

/// HTTP-01 challenge tokens, token → key authorization.
pub type ChallengeTokens = Arc<RwLock<HashMap<String, String>>>;

/// Drives certificate acquisition and renewal for hostnames registered
/// with a letsencrypt provision.
pub struct AcmeService {
    opts: AcmeOptions,
    store: Arc<CertStore>,
    tokens: ChallengeTokens,
    /// Cached accounts, one per directory (staging / production).
    accounts: tokio::sync::Mutex<HashMap<bool, Account>>,
}

impl AcmeService {
    pub fn new(opts: AcmeOptions, store: Arc<CertStore>) -> Self {
        Self {
            opts,
            store,
            tokens: Arc::new(RwLock::new(HashMap::new())),
            accounts: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn port(&self) -> u16 {
        self.opts.port
    }

    pub fn renew_within(&self) -> Duration {
        self.opts.renew_within
    }

    pub fn challenge_tokens(&self) -> ChallengeTokens {
        self.tokens.clone()
    }

    /// The priority-9999 resolver that steers challenge traffic to the
    /// loopback challenge server.
    pub fn challenge_resolver(&self) -> Arc<dyn Resolver> {
        Arc::new(AcmeChallengeResolver {
            port: self.opts.port,
        })
    }

    /// Bind the loopback challenge server and serve tokens until aborted.
    pub fn spawn_challenge_server(&self) -> JoinHandle<()> {
        let tokens = self.tokens.clone();
        let port = self.opts.port;
        tokio::spawn(async move {
            let listener = match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!(port = port, "Failed to bind ACME challenge server: {}", e);
                    return;
                }
            };
            tracing::info!(port = port, "ACME challenge server listening");
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let tokens = tokens.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_challenge(stream, tokens).await {
                                tracing::debug!("challenge connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("challenge accept failed: {}", e),
                }
            }
        })
    }

    /// Obtain (or renew) a certificate for `domain`, install it, and
    /// schedule the next renewal. Failure is logged and not rescheduled;
    /// the next registration or an explicit renewal re-enters.
    pub async fn update_certificates(
        self: Arc<Self>,
        domain: String,
        email: Option<String>,
        production: bool,
        renew_within: Duration,
        renew: bool,
    ) {
        tracing::info!(
            domain = %domain,
            renew = renew,
            production = production,
            "Requesting certificate via ACME"
        );

        match self.obtain(&domain, email.as_deref(), production).await {
            Ok(bundle) => {
                let expires_at = bundle.expires_at();
                self.store.install(&domain, bundle);

                let delay = expires_at
                    .map(|exp| {
                        renewal_delay(exp, SystemTime::now(), renew_within, self.opts.min_renew_time)
                    })
                    .unwrap_or(self.opts.min_renew_time);
                tracing::info!(
                    domain = %domain,
                    renew_in_secs = delay.as_secs(),
                    "Certificate installed, renewal scheduled"
                );
                self.schedule_renewal(&domain, email, production, renew_within, delay);
            }
            Err(e) => {
                tracing::error!(domain = %domain, "Certificate acquisition failed: {}", e);
            }
        }
    }

    fn schedule_renewal(
        self: &Arc<Self>,
        domain: &str,
        email: Option<String>,
        production: bool,
        renew_within: Duration,
        delay: Duration,
    ) {
        let service = self.clone();
        let host = domain.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Boxed so the renewal future's type does not contain itself.
            let renewal: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(
                service
                    .clone()
                    .update_certificates(host, email, production, renew_within, true),
            );
            renewal.await;
        });
        self.store.set_renewal(domain, handle);
    }

    /// Drive one HTTP-01 order to completion.
    async fn obtain(
        &self,
        domain: &str,
        email: Option<&str>,
        production: bool,
    ) -> Result<Arc<CertBundle>, AcmeError> {
        if domain.is_empty() || domain.contains('/') || domain.starts_with('.') {
            return Err(AcmeError::InvalidDomain(domain.to_string()));
        }

        let account = self.account(email, production).await?;

        let identifiers = [Identifier::Dns(domain.to_string())];
        let new_order = NewOrder::new(&identifiers);
        let mut order = account.new_order(&new_order).await?;

        let mut authorizations = order.authorizations();
        while let Some(auth_result) = authorizations.next().await {
            let mut auth = auth_result?;

            match auth.status {
                AuthorizationStatus::Pending => {
                    let mut challenge = auth
                        .challenge(ChallengeType::Http01)
                        .ok_or(AcmeError::NoHttp01Challenge)?;

                    let key_auth = challenge.key_authorization();
                    let token = challenge.token.clone();
                    self.tokens
                        .write()
                        .insert(token.clone(), key_auth.as_str().to_string());

                    tracing::info!(
                        domain = %domain,
                        token = %token,
                        "HTTP-01 challenge staged"
                    );
                    challenge.set_ready().await?;
                }
                AuthorizationStatus::Valid => {
                    tracing::debug!(domain = %domain, "Authorization already valid");
                }
                status => {
                    self.clear_tokens();
                    return Err(AcmeError::ChallengeFailed(format!(
                        "unexpected authorization status: {:?}",
                        status
                    )));
                }
            }
        }
        drop(authorizations);

        let retry = RetryPolicy::new().timeout(self.opts.timeout);
        let status = order.poll_ready(&retry).await;
        self.clear_tokens();

        match status? {
            OrderStatus::Ready => {}
            status => return Err(AcmeError::OrderNotReady(format!("{:?}", status))),
        }

        // finalize generates the CSR internally and hands back the key PEM.
        let key_pem = order.finalize().await?;
        let chain_pem = order.poll_certificate(&retry).await?;

        self.persist(domain, &chain_pem, &key_pem)?;
        let bundle = CertBundle::from_pem(chain_pem.as_bytes(), key_pem.as_bytes(), None)?;
        Ok(Arc::new(bundle))
    }

    /// Load or create the account for a directory, persisting credentials
    /// under the configured path.
    async fn account(&self, email: Option<&str>, production: bool) -> Result<Account, AcmeError> {
        let mut cache = self.accounts.lock().await;
        if let Some(account) = cache.get(&production) {
            return Ok(account.clone());
        }

        let dir = self.opts.path.join("accounts");
        std::fs::create_dir_all(&dir)?;
        let credentials_path = dir.join(if production {
            "production.json"
        } else {
            "staging.json"
        });

        if credentials_path.exists() {
            match load_account(&credentials_path).await {
                Ok(account) => {
                    tracing::info!(production = production, "Loaded existing ACME account");
                    cache.insert(production, account.clone());
                    return Ok(account);
                }
                Err(e) => {
                    tracing::warn!("Failed to load ACME account, creating a new one: {}", e);
                }
            }
        }

        let contact = email.map(|e| format!("mailto:{}", e));
        let contact_refs: Vec<&str> = contact.as_deref().into_iter().collect();
        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let (account, credentials) = Account::builder()?
            .create(&new_account, directory_url(production), None)
            .await?;

        let json = serde_json::to_string_pretty(&credentials)
            .map_err(|e| AcmeError::Credentials(e.to_string()))?;
        std::fs::write(&credentials_path, json)?;

        tracing::info!(
            production = production,
            id = %account.id(),
            "Created new ACME account"
        );
        cache.insert(production, account.clone());
        Ok(account)
    }

    fn persist(&self, domain: &str, chain_pem: &str, key_pem: &str) -> Result<(), AcmeError> {
        let domain_dir = self.opts.path.join(domain);
        std::fs::create_dir_all(&domain_dir)?;

        let cert_path = domain_dir.join("fullchain.pem");
        let key_path = domain_dir.join("privkey.pem");
        std::fs::write(&cert_path, chain_pem)?;
        std::fs::write(&key_path, key_pem)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    fn clear_tokens(&self) {
        self.tokens.write().clear();
    }
}

impl std::fmt::Debug for AcmeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeService")
            .field("path", &self.opts.path)
            .field("port", &self.opts.port)
            .finish()
    }
}

async fn load_account(path: &std::path::Path) -> Result<Account, AcmeError> {
    let contents = std::fs::read_to_string(path)?;
    let credentials: instant_acme::AccountCredentials = serde_json::from_str(&contents)
        .map_err(|e| AcmeError::Credentials(e.to_string()))?;

    let account = Account::builder()?.from_credentials(credentials).await?;
    Ok(account)
}

/// When to fire the renewal timer: `expires_at - now - renew_within`,
/// floored at `min_renew_time` once inside the window.
fn renewal_delay(
    expires_at: SystemTime,
    now: SystemTime,
    renew_within: Duration,
    min_renew_time: Duration,
) -> Duration {
    let until_expiry = expires_at.duration_since(now).unwrap_or_default();
    let delay = until_expiry.saturating_sub(renew_within);
    if delay.is_zero() { min_renew_time } else { delay }
}

/// Steers challenge requests from any listener to the loopback challenge
/// server, ahead of every other resolver.
struct AcmeChallengeResolver {
    port: u16,
}

#[async_trait]
impl Resolver for AcmeChallengeResolver {
    fn priority(&self) -> i32 {
        9999
    }

    async fn resolve(
        &self,
        host: &str,
        url: &str,
        _req: &RequestHeader,
    ) -> Result<Option<Resolution>, ResolverError> {
        Ok(url.starts_with(CHALLENGE_PREFIX).then(|| {
            Resolution::Target(format!("http://127.0.0.1:{}/{}", self.port, host))
        }))
    }
}

async fn serve_challenge(mut stream: TcpStream, tokens: ChallengeTokens) -> std::io::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut buf = vec![0u8; 4096];
    let mut read = 0;
    loop {
        if read == buf.len() {
            break;
        }
        let n = stream.read(&mut buf[read..]).await?;
        if n == 0 {
            break;
        }
        read += n;
        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let head = String::from_utf8_lossy(&buf[..read]).into_owned();
    let path = head
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .unwrap_or("/");

    let response = token_response(path, &tokens.read());
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// The challenge server answers by the trailing token segment; the proxied
/// path may carry a host prefix in front of the well-known part.
fn token_response(path: &str, tokens: &HashMap<String, String>) -> String {
    let token = path
        .split('?')
        .next()
        .unwrap_or("")
        .rsplit('/')
        .next()
        .unwrap_or("");

    match tokens.get(token) {
        Some(key_auth) => format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            key_auth.len(),
            key_auth
        ),
        None => {
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renewal_delay_outside_window() {
        let now = SystemTime::now();
        let expires = now + Duration::from_secs(86400 * 90);
        let delay = renewal_delay(
            expires,
            now,
            Duration::from_secs(86400 * 30),
            Duration::from_secs(3600),
        );
        assert_eq!(delay, Duration::from_secs(86400 * 60));
    }

    #[test]
    fn test_renewal_delay_clamped_inside_window() {
        let now = SystemTime::now();
        let expires = now + Duration::from_secs(86400 * 10);
        let delay = renewal_delay(
            expires,
            now,
            Duration::from_secs(86400 * 30),
            Duration::from_secs(3600),
        );
        assert_eq!(delay, Duration::from_secs(3600));
    }

    #[test]
    fn test_renewal_delay_clamped_for_expired_cert() {
        let now = SystemTime::now();
        let expires = now - Duration::from_secs(86400);
        let delay = renewal_delay(
            expires,
            now,
            Duration::from_secs(86400 * 30),
            Duration::from_secs(3600),
        );
        assert_eq!(delay, Duration::from_secs(3600));
    }

    #[test]
    fn test_directory_url() {
        assert!(directory_url(true).contains("acme-v02"));
        assert!(directory_url(false).contains("staging"));
    }

    #[test]
    fn test_token_response_found() {
        let mut tokens = HashMap::new();
        tokens.insert("tok123".to_string(), "tok123.keyauth".to_string());

        let resp = token_response("/.well-known/acme-challenge/tok123", &tokens);
        assert!(resp.starts_with("HTTP/1.1 200"));
        assert!(resp.ends_with("tok123.keyauth"));
    }

    #[test]
    fn test_token_response_with_host_prefix_and_query() {
        let mut tokens = HashMap::new();
        tokens.insert("tok123".to_string(), "auth".to_string());

        // The challenge resolver prefixes the requesting host.
        let resp = token_response(
            "/example.com/.well-known/acme-challenge/tok123?x=1",
            &tokens,
        );
        assert!(resp.starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn test_token_response_unknown_token() {
        let tokens = HashMap::new();
        let resp = token_response("/.well-known/acme-challenge/nope", &tokens);
        assert!(resp.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_challenge_resolver_matches_only_well_known() {
        let resolver = AcmeChallengeResolver { port: 3999 };
        let req = RequestHeader::build("GET", b"/", None).unwrap();

        let hit = resolver
            .resolve("example.com", "/.well-known/acme-challenge/tok", &req)
            .await
            .unwrap();
        match hit {
            Some(Resolution::Target(url)) => {
                assert_eq!(url, "http://127.0.0.1:3999/example.com");
            }
            _ => panic!("expected a target resolution"),
        }

        assert!(resolver
            .resolve("example.com", "/other", &req)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_challenge_resolver_priority() {
        let resolver = AcmeChallengeResolver { port: 3000 };
        assert_eq!(resolver.priority(), 9999);
    }

    #[tokio::test]
    async fn test_challenge_server_serves_tokens_end_to_end() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let store = Arc::new(CertStore::new());
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let service = Arc::new(AcmeService::new(
            AcmeOptions::new(std::env::temp_dir()).with_port(port),
            store,
        ));
        service
            .challenge_tokens()
            .write()
            .insert("abc".to_string(), "abc.key".to_string());
        let server = service.spawn_challenge_server();

        // Wait for the listener to come up.
        let mut stream = loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(s) => break s,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };

        stream
            .write_all(b"GET /.well-known/acme-challenge/abc HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("abc.key"));

        server.abort();
    }
}
