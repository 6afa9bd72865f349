//! Client-side transport implementations.

mod http;
mod sse;
mod stdio;

pub use http::ClientHttpTransport;
pub use sse::{ClientSseTransport, ClientSseTransportBuilder};
pub use stdio::ClientStdioTransport;
