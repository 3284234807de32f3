//! The proxy engine: one `ProxyHttp` implementation shared by every
//! listener.
//!
//! Each request is resolved to a route, rewritten, pointed at a
//! round-robin-selected target, and run through the route's hooks before
//! pingora forwards it (WebSocket upgrades ride the same path and are
//! tunneled by pingora's upgrade passthrough).

use crate::hooks::{ErrorHook, NotFoundHandler, RequestAction, RequestHook, ResponseHook};
use crate::routing::{ForwardOptions, Route};
use crate::server::ProxyState;
use crate::urls::{Target, join_target_path, strip_host_port, strip_route_prefix};
use async_trait::async_trait;
use bytes::Bytes;
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{FailToProxy, ProxyHttp, Session};
use std::sync::Arc;

pub(crate) struct ProxyEngine {
    pub(crate) state: Arc<ProxyState>,
}

/// Per-request state threaded through the engine's phases.
pub(crate) struct RequestCtx {
    conn_id: Option<u64>,
    route: Option<Arc<Route>>,
    target: Option<Target>,
    source_host: Option<String>,
    /// Path-and-query before rewriting.
    original_path: Option<String>,
    /// Header snapshot taken before hooks ran; only kept when the route
    /// has hooks installed.
    original_headers: Option<http::HeaderMap>,
    host_override: Option<String>,
    is_https: bool,
}

/// Source hostname for routing: `X-Forwarded-Host` when preferred and
/// present, else `Host`, else the URI authority; the port is dropped.
pub(crate) fn source_host(req: &RequestHeader, prefer_forwarded: bool) -> Option<String> {
    let header = |name: &str| {
        req.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    };

    let raw = if prefer_forwarded {
        header("x-forwarded-host").or_else(|| header("host"))
    } else {
        header("host")
    };

    raw.map(|h| strip_host_port(h).to_ascii_lowercase())
        .or_else(|| req.uri.host().map(str::to_ascii_lowercase))
}

/// Default status mapping for forwarding failures.
pub(crate) fn default_error_code(e: &Error) -> u16 {
    match &e.etype {
        ErrorType::ConnectRefused => 502,
        ErrorType::HTTPStatus(code) => *code,
        _ => 500,
    }
}

/// Connection-reset class errors are routine; keep them out of the error
/// log.
pub(crate) fn is_noisy_disconnect(e: &Error) -> bool {
    matches!(
        e.etype,
        ErrorType::ConnectionClosed | ErrorType::ReadError | ErrorType::WriteError
    )
}

/// Split a combined `WWW-Authenticate` header into one value per
/// challenge. NTLM negotiation breaks when challenges share a value.
pub(crate) fn split_www_authenticate(resp: &mut ResponseHeader) -> Result<()> {
    let Some(combined) = resp
        .headers
        .get("www-authenticate")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return Ok(());
    };

    if !combined.contains(',') {
        return Ok(());
    }

    resp.remove_header("www-authenticate");
    for challenge in combined.split(',') {
        let challenge = challenge.trim();
        if !challenge.is_empty() {
            resp.append_header("WWW-Authenticate", challenge.to_string())?;
        }
    }
    Ok(())
}

impl ProxyEngine {
    async fn respond(
        &self,
        session: &mut Session,
        mut header: ResponseHeader,
        body: Bytes,
    ) -> Result<()> {
        header.insert_header("Content-Length", body.len().to_string())?;
        session
            .write_response_header(Box::new(header), false)
            .await?;
        session.write_response_body(Some(body), true).await?;
        Ok(())
    }

    async fn respond_not_found(&self, session: &mut Session) -> Result<()> {
        let (status, body) = match self.state.not_found.read().clone() {
            Some(handler) => handler.respond(session.req_header()),
            None => (404, Bytes::from_static(b"Not Found")),
        };
        let mut header = ResponseHeader::build(status, None)?;
        header.insert_header("Content-Type", "text/plain")?;
        self.respond(session, header, body).await
    }

    /// Whether `target` is the loopback ACME challenge endpoint; challenge
    /// traffic is exempt from the HTTPS redirect.
    fn is_challenge_target(&self, target: &Target) -> bool {
        self.state
            .acme
            .as_ref()
            .is_some_and(|acme| target.hostname == "127.0.0.1" && target.port == acme.port())
    }
}

#[async_trait]
impl ProxyHttp for ProxyEngine {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        RequestCtx {
            conn_id: None,
            route: None,
            target: None,
            source_host: None,
            original_path: None,
            original_headers: None,
            host_override: None,
            is_https: false,
        }
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let state = &self.state;

        if state.tracker.is_closed() {
            let mut header = ResponseHeader::build(503, None)?;
            header.insert_header("Connection", "close")?;
            self.respond(session, header, Bytes::from_static(b"Shutting down"))
                .await?;
            return Ok(true);
        }

        ctx.is_https = session
            .digest()
            .map(|d| d.ssl_digest.is_some())
            .unwrap_or(false);

        let client = session
            .client_addr()
            .and_then(|a| a.as_inet())
            .map(|a| a.ip().to_string());

        let Some(host) = source_host(session.req_header(), state.options.prefer_forwarded_host)
        else {
            ctx.conn_id = Some(state.tracker.begin("-", client));
            self.respond_not_found(session).await?;
            return Ok(true);
        };
        ctx.conn_id = Some(state.tracker.begin(&host, client));
        ctx.source_host = Some(host.clone());

        let path_and_query = session
            .req_header()
            .uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let Some(route) = state
            .resolvers
            .resolve(&host, &path_and_query, session.req_header())
            .await
        else {
            self.respond_not_found(session).await?;
            return Ok(true);
        };

        let Some(target) = route.next_target() else {
            self.respond_not_found(session).await?;
            return Ok(true);
        };

        // Rewrite: strip the matched prefix, then mount on the target path.
        ctx.original_path = Some(path_and_query.clone());
        let remainder = strip_route_prefix(&path_and_query, &route.path);
        let new_path = join_target_path(&target.path, remainder);
        if new_path != path_and_query {
            let uri = new_path.parse::<http::Uri>().map_err(|e| {
                Error::explain(
                    ErrorType::InvalidHTTPHeader,
                    format!("rewritten path '{}' is not a valid URI: {}", new_path, e),
                )
            })?;
            session.req_header_mut().set_uri(uri);
        }

        if target.use_target_host_header {
            ctx.host_override = Some(target.host_header());
        }

        let has_hooks = route.opts.has_hooks() || state.error_handler.read().is_some();
        if has_hooks {
            ctx.original_headers = Some(session.req_header().headers.clone());
        }

        let mut effective = target;
        if let Some(hook) = route.opts.on_request.clone() {
            match hook.on_request(session.req_header_mut(), &effective).await {
                RequestAction::Continue => {}
                RequestAction::Replace(new_target) => {
                    if new_target.use_target_host_header {
                        ctx.host_override = Some(new_target.host_header());
                    }
                    effective = new_target;
                }
                RequestAction::Respond {
                    status,
                    headers,
                    body,
                } => {
                    let mut header = ResponseHeader::build(status, None)?;
                    for (name, value) in headers {
                        header.insert_header(name, value)?;
                    }
                    // The skip still completes the request; the response
                    // hook observes it with no target.
                    if let Some(hook) = route.opts.on_response.clone() {
                        hook.on_response(&mut header, None).await;
                    }
                    self.respond(session, header, body).await?;
                    ctx.route = Some(route);
                    return Ok(true);
                }
            }
        }

        if !ctx.is_https
            && effective.ssl_redirect
            && state.certs.contains(&host)
            && !self.is_challenge_target(&effective)
        {
            let location = match state.redirect_port() {
                Some(443) | None => format!("https://{}{}", host, path_and_query),
                Some(port) => format!("https://{}:{}{}", host, port, path_and_query),
            };
            let mut header = ResponseHeader::build(302, None)?;
            header.insert_header("Location", location)?;
            self.respond(session, header, Bytes::from_static(b""))
                .await?;
            ctx.route = Some(route);
            return Ok(true);
        }

        ctx.route = Some(route);
        ctx.target = Some(effective);
        Ok(false)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let target = ctx
            .target
            .clone()
            .ok_or_else(|| Error::new(ErrorType::ConnectNoRoute))?;

        let mut peer = HttpPeer::new(
            (target.hostname.clone(), target.port),
            target.is_https(),
            target.hostname.clone(),
        );

        let route_forward = ctx.route.as_ref().and_then(|r| r.opts.forward.as_ref());
        let secure = ForwardOptions::merged_secure(
            route_forward,
            &self.state.options.forward,
            self.state.options.secure,
        );
        if target.is_https() && !secure {
            peer.options.verify_cert = false;
            peer.options.verify_hostname = false;
        }

        let connect_timeout = route_forward
            .and_then(|f| f.connect_timeout)
            .or(self.state.options.forward.connect_timeout);
        if connect_timeout.is_some() {
            peer.options.connection_timeout = connect_timeout;
        }
        let read_timeout = route_forward
            .and_then(|f| f.read_timeout)
            .or(self.state.options.forward.read_timeout);
        if read_timeout.is_some() {
            peer.options.read_timeout = read_timeout;
        }

        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if let Some(host) = &ctx.host_override {
            upstream_request.insert_header("Host", host.clone())?;
        }

        if self.state.options.xfwd {
            let client = session
                .client_addr()
                .and_then(|a| a.as_inet())
                .map(|a| a.ip().to_string());
            if let Some(client) = client {
                let forwarded = match upstream_request
                    .headers
                    .get("x-forwarded-for")
                    .and_then(|v| v.to_str().ok())
                {
                    Some(existing) => format!("{}, {}", existing, client),
                    None => client,
                };
                upstream_request.insert_header("X-Forwarded-For", forwarded)?;
            }

            let proto = if ctx.is_https { "https" } else { "http" };
            upstream_request.insert_header("X-Forwarded-Proto", proto)?;

            if let Some(host) = &ctx.source_host {
                upstream_request.insert_header("X-Forwarded-Host", host.clone())?;
            }
        }

        Ok(())
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if self.state.options.ntlm {
            split_www_authenticate(upstream_response)?;
        }

        if let Some(hook) = ctx
            .route
            .as_ref()
            .and_then(|r| r.opts.on_response.clone())
        {
            hook.on_response(upstream_response, ctx.target.as_ref())
                .await;
        }

        Ok(())
    }

    async fn fail_to_proxy(
        &self,
        session: &mut Session,
        e: &Error,
        ctx: &mut Self::CTX,
    ) -> FailToProxy {
        let mut code = None;
        if let Some(hook) = ctx.route.as_ref().and_then(|r| r.opts.on_error.clone()) {
            code = hook
                .on_error(e, session.req_header(), ctx.target.as_ref())
                .await;
        }
        if code.is_none() {
            let global = self.state.error_handler.read().clone();
            if let Some(handler) = global {
                code = handler
                    .on_error(e, session.req_header(), ctx.target.as_ref())
                    .await;
            }
        }
        let code = code.unwrap_or_else(|| default_error_code(e));

        if is_noisy_disconnect(e) {
            tracing::debug!(host = ?ctx.source_host, "forward aborted: {}", e);
        } else {
            tracing::error!(
                host = ?ctx.source_host,
                code = code,
                client_headers = ctx.original_headers.as_ref().map(|h| h.len()).unwrap_or(0),
                "forward failed: {}",
                e
            );
        }

        // Body carries the error code string; skipped when the upstream
        // response already started.
        if session.response_written().is_none() {
            let body = Bytes::from(e.etype.as_str().to_string());
            let write = async {
                let mut header = ResponseHeader::build(code, None)?;
                header.insert_header("Content-Type", "text/plain")?;
                self.respond(session, header, body).await
            };
            if let Err(write_err) = write.await {
                tracing::debug!("failed to write error response: {}", write_err);
            }
        }

        FailToProxy {
            error_code: code,
            can_reuse_downstream: false,
        }
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        if let Some(id) = ctx.conn_id.take() {
            self.state.tracker.end(id);
        }

        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);
        let method = session.req_header().method.as_str();
        let path = session.req_header().uri.path();

        tracing::info!(
            host = ctx.source_host.as_deref().unwrap_or("-"),
            method = method,
            path = path,
            status = status,
            https = ctx.is_https,
            error = e.map(|e| e.etype.as_str()).unwrap_or("-"),
            "request completed"
        );
    }
}
