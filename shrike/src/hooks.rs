//! Per-route request/response/error hooks.
//!
//! Hooks run inside the proxy engine's filter phases. The request hook's
//! verdict is an explicit tagged action rather than a convention-laden
//! return value.

use crate::urls::Target;
use async_trait::async_trait;
use bytes::Bytes;
use pingora_core::Error;
use pingora_http::{RequestHeader, ResponseHeader};

/// What the proxy should do after the request hook ran.
pub enum RequestAction {
    /// Forward to the selected target.
    Continue,
    /// Forward, but to this target instead.
    Replace(Target),
    /// Do not forward; the hook supplies the whole response.
    Respond {
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
}

impl RequestAction {
    /// Shorthand for a plain-text early response.
    pub fn respond(status: u16, body: impl Into<Bytes>) -> Self {
        RequestAction::Respond {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }
}

/// Runs before forwarding. May mutate the (already rewritten) request
/// headers, swap the target, or answer the request itself.
#[async_trait]
pub trait RequestHook: Send + Sync {
    async fn on_request(&self, req: &mut RequestHeader, target: &Target) -> RequestAction;
}

/// Runs when the upstream response header arrives, or after a
/// [`RequestAction::Respond`] skip (then with no target).
#[async_trait]
pub trait ResponseHook: Send + Sync {
    async fn on_response(&self, resp: &mut ResponseHeader, target: Option<&Target>);
}

/// Runs when forwarding fails. Returning a status replaces the default
/// error handler for this request.
#[async_trait]
pub trait ErrorHook: Send + Sync {
    async fn on_error(
        &self,
        err: &Error,
        req: &RequestHeader,
        target: Option<&Target>,
    ) -> Option<u16>;
}

/// Replaces the default `404 Not Found` responder.
pub trait NotFoundHandler: Send + Sync {
    fn respond(&self, req: &RequestHeader) -> (u16, Bytes);
}

#[async_trait]
impl<F> RequestHook for F
where
    F: Fn(&mut RequestHeader, &Target) -> RequestAction + Send + Sync,
{
    async fn on_request(&self, req: &mut RequestHeader, target: &Target) -> RequestAction {
        self(req, target)
    }
}

#[async_trait]
impl<F> ResponseHook for F
where
    F: Fn(&mut ResponseHeader, Option<&Target>) + Send + Sync,
{
    async fn on_response(&self, resp: &mut ResponseHeader, target: Option<&Target>) {
        self(resp, target)
    }
}

#[async_trait]
impl<F> ErrorHook for F
where
    F: Fn(&Error, &RequestHeader, Option<&Target>) -> Option<u16> + Send + Sync,
{
    async fn on_error(
        &self,
        err: &Error,
        req: &RequestHeader,
        target: Option<&Target>,
    ) -> Option<u16> {
        self(err, req, target)
    }
}

impl<F> NotFoundHandler for F
where
    F: Fn(&RequestHeader) -> (u16, Bytes) + Send + Sync,
{
    fn respond(&self, req: &RequestHeader) -> (u16, Bytes) {
        self(req)
    }
}
