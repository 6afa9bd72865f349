//! # mcp-wire
//!
//! `mcp-wire` is a Rust implementation of the Model Context Protocol (MCP),
//! an open JSON-RPC 2.0-based protocol for exposing tools, prompts, and
//! resources from a server to an LLM-driven client.
//!
//! The crate provides both sides of the protocol over three interchangeable
//! transports:
//!
//! - **stdio** — newline-delimited JSON over standard streams; the client
//!   side spawns the server as a subprocess
//! - **SSE** — a persistent server-sent event stream for server→client
//!   messages plus a session-scoped POST endpoint for client→server messages
//! - **streamable HTTP** — stateless request/reply, one envelope pair per
//!   HTTP exchange
//!
//! ## Architecture
//!
//! - [`types`]: the MCP data model (tools, prompts, resources, content)
//! - [`transport`]: the envelope model, the [`Transport`](transport::Transport)
//!   trait, and the six transport implementations
//! - [`protocol`]: the JSON-RPC correlation engine on top of any transport
//! - [`server`]: the MCP server registry with schema derivation, pagination,
//!   and dynamic registration
//! - [`client`]: the strongly-typed MCP client façade
//!
//! Tool and prompt argument types derive `serde::Deserialize` and
//! `schemars::JsonSchema`; input schemas are generated at registration and
//! advertised through `tools/list`.

pub mod client;
pub mod error;
pub mod protocol;
pub mod schema;
pub mod server;
pub mod transport;
pub mod types;

pub use error::{Error, Result};

/// Creates a tool response carrying an error message as text, with the
/// `is_error` flag set.
///
/// # Examples
///
/// ```
/// use mcp_wire::tool_error_response;
///
/// let error = anyhow::Error::msg("Something went wrong");
/// let response = tool_error_response!(error);
/// assert_eq!(response.is_error, Some(true));
/// ```
#[macro_export]
macro_rules! tool_error_response {
    ($e:expr) => {{
        $crate::types::CallToolResponse::error($e.to_string())
    }};
}

/// Creates a successful tool response with text content.
///
/// # Examples
///
/// ```
/// use mcp_wire::tool_text_response;
///
/// let response = tool_text_response!("Hello, world!");
/// assert_eq!(response.is_error, None);
/// ```
#[macro_export]
macro_rules! tool_text_response {
    ($e:expr) => {{
        $crate::types::CallToolResponse::text($e)
    }};
}

/// Creates a text content block.
#[macro_export]
macro_rules! tool_text_content {
    ($e:expr) => {{
        $crate::types::Content::text($e)
    }};
}

/// Creates an image content block from base64 data and a MIME type.
#[macro_export]
macro_rules! tool_image_content {
    ($data:expr, $mime_type:expr) => {{
        $crate::types::Content::image($data, $mime_type)
    }};
}

/// Creates an embedded-resource content block.
#[macro_export]
macro_rules! tool_resource_content {
    ($resource:expr) => {{
        $crate::types::Content::resource($resource)
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn response_macros() {
        let response = tool_text_response!("Hello");
        assert_eq!(response.is_error, None);

        let response = tool_error_response!(anyhow::Error::msg("boom"));
        assert_eq!(response.is_error, Some(true));
        match &response.content[0] {
            crate::types::Content::Text { text } => assert_eq!(text, "boom"),
            other => panic!("expected text content, got {other:?}"),
        }
    }
}
