//! HTTP middleware for the server transports.
//!
//! Middleware wraps request handling on the push-stream transport and is the
//! supported extension point for authentication, cross-origin headers, rate
//! limiting, tracing, and request-id stamping. Composition follows the
//! reverse-registration rule: the last middleware added wraps first at the
//! outside, so it sees the request first and the response last.

use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use futures::future::LocalBoxFuture;

/// One layer of HTTP middleware.
///
/// Implementations decide whether to call `next` (continuing down the chain
/// towards the transport's own handler) or to answer the request themselves.
#[async_trait::async_trait(?Send)]
pub trait HttpMiddleware: Send + Sync + 'static {
    /// Handles one request.
    ///
    /// # Arguments
    ///
    /// * `req` - The incoming HTTP request
    /// * `body` - The request body
    /// * `next` - The remainder of the chain
    ///
    /// # Returns
    ///
    /// The HTTP response to send
    async fn handle(&self, req: HttpRequest, body: web::Bytes, next: Next<'_>) -> HttpResponse;
}

type Endpoint = dyn Fn(HttpRequest, web::Bytes) -> LocalBoxFuture<'static, HttpResponse>;

/// The remainder of a middleware chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn HttpMiddleware>],
    endpoint: &'a Endpoint,
}

impl<'a> Next<'a> {
    /// Continues processing with the rest of the chain.
    ///
    /// # Arguments
    ///
    /// * `req` - The HTTP request to pass down
    /// * `body` - The request body to pass down
    ///
    /// # Returns
    ///
    /// The HTTP response produced by the rest of the chain
    pub async fn run(self, req: HttpRequest, body: web::Bytes) -> HttpResponse {
        match self.chain.split_last() {
            Some((middleware, rest)) => {
                middleware
                    .handle(
                        req,
                        body,
                        Next {
                            chain: rest,
                            endpoint: self.endpoint,
                        },
                    )
                    .await
            }
            None => (self.endpoint)(req, body).await,
        }
    }
}

/// Run `endpoint` through the middleware chain.
pub(crate) async fn run_chain(
    chain: &[Arc<dyn HttpMiddleware>],
    req: HttpRequest,
    body: web::Bytes,
    endpoint: impl Fn(HttpRequest, web::Bytes) -> LocalBoxFuture<'static, HttpResponse> + 'static,
) -> HttpResponse {
    Next {
        chain,
        endpoint: &endpoint,
    }
    .run(req, body)
    .await
}
