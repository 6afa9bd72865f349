//! Server-side transport implementations.

mod http;
mod middleware;
mod sse;
mod stdio;

pub use http::ServerHttpTransport;
pub use middleware::{HttpMiddleware, Next};
pub use sse::ServerSseTransport;
pub use stdio::ServerStdioTransport;
