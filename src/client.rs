//! MCP client.
//!
//! A thin strongly-typed wrapper over the correlation engine: each method
//! composes the MCP method name and parameter object, sends the request, and
//! deserializes the result into the matching record. [`Client::initialize`]
//! must be called before any other method; it records the server's
//! capabilities for later introspection.

use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::{Protocol, ProtocolBuilder, RequestOptions};
use crate::transport::Transport;
use crate::types::{
    CallToolRequest, CallToolResponse, ClientCapabilities, GetPromptRequest, GetPromptResponse,
    Implementation, InitializeRequest, InitializeResponse, ListPromptsResponse, ListRequest,
    ListResourcesResponse, ListToolsResponse, ReadResourceRequest, ReadResourceResponse,
    ServerCapabilities, PROTOCOL_VERSION,
};

/// An MCP client over any transport.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    protocol: Protocol,
    transport: Arc<dyn Transport>,
    client_info: Implementation,
    initialize_response: RwLock<Option<InitializeResponse>>,
}

impl Client {
    /// Creates a client with default client info.
    ///
    /// # Arguments
    ///
    /// * `transport` - The transport to use for communication with the server
    ///
    /// # Returns
    ///
    /// A new `Client` instance
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::builder(transport).build()
    }

    /// Creates a new client builder.
    ///
    /// # Arguments
    ///
    /// * `transport` - The transport to use for communication with the server
    ///
    /// # Returns
    ///
    /// A `ClientBuilder` for configuring and building the client
    pub fn builder(transport: Arc<dyn Transport>) -> ClientBuilder {
        ClientBuilder::new(transport)
    }

    /// Connects the transport and performs the initialize exchange,
    /// recording the server's capabilities.
    ///
    /// Must be called before any other method.
    ///
    /// # Returns
    ///
    /// A `Result` containing the server's initialization response
    pub async fn initialize(&self) -> Result<InitializeResponse> {
        if self.initialize_response().is_some() {
            return Err(Error::AlreadyInitialized);
        }

        self.inner
            .protocol
            .connect(self.inner.transport.clone())
            .await?;

        let request = InitializeRequest {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: self.inner.client_info.clone(),
        };
        let result = self
            .request("initialize", Some(serde_json::to_value(request)?))
            .await?;
        let response: InitializeResponse = serde_json::from_value(result)?;

        tracing::info!(
            "initialized MCP client: server={} v{}",
            response.server_info.name,
            response.server_info.version
        );
        *self
            .inner
            .initialize_response
            .write()
            .expect("initialize lock poisoned") = Some(response.clone());
        Ok(response)
    }

    /// Gets the server capabilities obtained during initialization.
    ///
    /// # Returns
    ///
    /// An `Option` containing the capabilities once initialized
    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.initialize_response().map(|r| r.capabilities)
    }

    /// Gets the full initialize response.
    ///
    /// # Returns
    ///
    /// An `Option` containing the server's response once initialized
    pub fn initialize_response(&self) -> Option<InitializeResponse> {
        self.inner
            .initialize_response
            .read()
            .expect("initialize lock poisoned")
            .clone()
    }

    /// Sends a raw request through the correlation engine.
    ///
    /// # Arguments
    ///
    /// * `method` - The method name
    /// * `params` - Optional parameters for the request
    ///
    /// # Returns
    ///
    /// A `Result` containing the server's response result
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.inner
            .protocol
            .request(method, params, RequestOptions::default())
            .await
    }

    /// Lists tools available on the server.
    ///
    /// # Arguments
    ///
    /// * `cursor` - Optional pagination cursor to resume from
    ///
    /// # Returns
    ///
    /// A `Result` containing the list of tools
    pub async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResponse> {
        self.assert_initialized()?;
        let params = serde_json::to_value(ListRequest { cursor })?;
        let result = self.request("tools/list", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Calls a tool on the server.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the tool to call
    /// * `arguments` - Optional arguments for the tool
    ///
    /// # Returns
    ///
    /// A `Result` containing the tool's response
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResponse> {
        self.assert_initialized()?;
        let params = serde_json::to_value(CallToolRequest {
            name: name.to_string(),
            arguments,
        })?;
        let result = self.request("tools/call", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Lists prompts available on the server.
    ///
    /// # Arguments
    ///
    /// * `cursor` - Optional pagination cursor to resume from
    ///
    /// # Returns
    ///
    /// A `Result` containing the list of prompts
    pub async fn list_prompts(&self, cursor: Option<String>) -> Result<ListPromptsResponse> {
        self.assert_initialized()?;
        let params = serde_json::to_value(ListRequest { cursor })?;
        let result = self.request("prompts/list", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Retrieves a rendered prompt from the server.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the prompt
    /// * `arguments` - Optional arguments for templating the prompt
    ///
    /// # Returns
    ///
    /// A `Result` containing the prompt's messages
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<GetPromptResponse> {
        self.assert_initialized()?;
        let params = serde_json::to_value(GetPromptRequest {
            name: name.to_string(),
            arguments,
        })?;
        let result = self.request("prompts/get", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Lists resources available on the server.
    ///
    /// # Arguments
    ///
    /// * `cursor` - Optional pagination cursor to resume from
    ///
    /// # Returns
    ///
    /// A `Result` containing the list of resources
    pub async fn list_resources(&self, cursor: Option<String>) -> Result<ListResourcesResponse> {
        self.assert_initialized()?;
        let params = serde_json::to_value(ListRequest { cursor })?;
        let result = self.request("resources/list", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Reads a resource from the server.
    ///
    /// # Arguments
    ///
    /// * `uri` - The URI of the resource to read
    ///
    /// # Returns
    ///
    /// A `Result` containing the resource contents
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResponse> {
        self.assert_initialized()?;
        let params = serde_json::to_value(ReadResourceRequest {
            uri: uri.to_string(),
        })?;
        let result = self.request("resources/read", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Sends a ping request to check server connectivity.
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    pub async fn ping(&self) -> Result<()> {
        self.assert_initialized()?;
        self.request("ping", None).await?;
        Ok(())
    }

    /// Closes the session.
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    pub async fn close(&self) -> Result<()> {
        self.inner.protocol.close().await
    }

    fn assert_initialized(&self) -> Result<()> {
        if self.initialize_response().is_none() {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    client_info: Implementation,
    protocol_builder: ProtocolBuilder,
}

impl ClientBuilder {
    /// Creates a new client builder.
    ///
    /// # Arguments
    ///
    /// * `transport` - The transport to use for communication with the server
    ///
    /// # Returns
    ///
    /// A new `ClientBuilder` instance
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            protocol_builder: Protocol::builder(),
        }
    }

    /// Sets the client name and version sent in the initialize request.
    ///
    /// # Arguments
    ///
    /// * `name` - The client name
    /// * `version` - The client version
    ///
    /// # Returns
    ///
    /// The modified builder instance
    pub fn client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_info = Implementation {
            name: name.into(),
            version: version.into(),
        };
        self
    }

    /// Registers a handler for a server-originated notification (for
    /// example `notifications/tools/list_changed`).
    ///
    /// # Arguments
    ///
    /// * `method` - The notification method name to handle
    /// * `handler` - The handler function
    ///
    /// # Returns
    ///
    /// The modified builder instance
    pub fn notification_handler<N>(
        mut self,
        method: &str,
        handler: impl Fn(N) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>
            + Send
            + Sync
            + 'static,
    ) -> Self
    where
        N: serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        self.protocol_builder = self.protocol_builder.notification_handler(method, handler);
        self
    }

    /// Builds the client with the configured settings.
    ///
    /// # Returns
    ///
    /// A new `Client` instance
    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                protocol: self.protocol_builder.build(),
                transport: self.transport,
                client_info: self.client_info,
                initialize_response: RwLock::new(None),
            }),
        }
    }
}
