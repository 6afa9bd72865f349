//! MCP server registry and dispatch.
//!
//! [`McpServer`] stores tools, prompts, and resources, derives tool input
//! schemas from handler argument types, answers the MCP query methods
//! through the correlation engine, and emits list-changed notifications
//! when the registries mutate while serving.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcp_wire::server::McpServer;
//! use mcp_wire::transport::ServerStdioTransport;
//! use mcp_wire::types::CallToolResponse;
//! use schemars::JsonSchema;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize, JsonSchema)]
//! struct EchoArgs {
//!     /// The message to echo back
//!     message: String,
//! }
//!
//! # async fn run() -> mcp_wire::Result<()> {
//! let server = McpServer::builder().name("echo").version("1.0").build();
//! server
//!     .register_tool("echo", "Echo back the message you send", |args: EchoArgs| async move {
//!         Ok(CallToolResponse::text(format!("Echo: {}", args.message)))
//!     })
//!     .await;
//! server.serve(Arc::new(ServerStdioTransport::new())).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::protocol::Protocol;
use crate::schema::{arguments_from_schema, generate_schema};
use crate::transport::Transport;
use crate::types::{
    CallToolRequest, CallToolResponse, GetPromptRequest, GetPromptResponse, Implementation,
    InitializeRequest, InitializeResponse, ListPromptsResponse, ListRequest, ListResourcesResponse,
    ListToolsResponse, Prompt, PromptCapabilities, ReadResourceRequest, ReadResourceResponse,
    Resource, ResourceCapabilities, ServerCapabilities, Tool, ToolCapabilities,
    NOTIFICATION_PROMPTS_LIST_CHANGED, NOTIFICATION_RESOURCES_LIST_CHANGED,
    NOTIFICATION_TOOLS_LIST_CHANGED, PROTOCOL_VERSION,
};

/// Listing batch size when none is configured.
pub const DEFAULT_PAGINATION_LIMIT: usize = 10;

type BoxFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

/// An MCP server with dynamic tool, prompt, and resource registries.
///
/// Cloning is cheap; all clones share the same registries and protocol.
#[derive(Clone)]
pub struct McpServer {
    protocol: Protocol,
    registry: Arc<RwLock<Registry>>,
    info: Implementation,
}

impl McpServer {
    /// Creates a new server builder.
    ///
    /// # Returns
    ///
    /// A `McpServerBuilder` for configuring the server
    pub fn builder() -> McpServerBuilder {
        McpServerBuilder::default()
    }

    /// Gets the server's identity.
    ///
    /// # Returns
    ///
    /// The name and version reported by `initialize`
    pub fn info(&self) -> &Implementation {
        &self.info
    }

    /// Connects to a transport and begins serving.
    ///
    /// Registration stays legal after this point; mutations from here on
    /// emit list-changed notifications.
    ///
    /// # Arguments
    ///
    /// * `transport` - The transport to use for communication with clients
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    pub async fn serve(&self, transport: Arc<dyn Transport>) -> Result<()> {
        self.protocol.connect(transport).await?;
        self.registry
            .write()
            .expect("registry lock poisoned")
            .started = true;
        tracing::info!(
            "MCP server '{}' v{} started",
            self.info.name,
            self.info.version
        );
        Ok(())
    }

    /// Shuts the server down. Terminal.
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    pub async fn close(&self) -> Result<()> {
        self.protocol.close().await
    }

    /// Registers a tool, deriving its input schema from the handler's
    /// argument type. Re-registering a name replaces the entry.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the tool
    /// * `description` - A human-readable description of the tool
    /// * `handler` - The handler function implementing the tool
    pub async fn register_tool<A, F, Fut>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) where
        A: DeserializeOwned + JsonSchema + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<CallToolResponse>> + Send + 'static,
    {
        let name = name.into();
        let input_schema = generate_schema::<A>();
        {
            let mut registry = self.registry.write().expect("registry lock poisoned");
            registry.tools.insert(
                name.clone(),
                RegisteredTool {
                    tool: Tool {
                        name: name.clone(),
                        description: Some(description.into()),
                        input_schema,
                    },
                    handler: Arc::new(TypedToolHandler {
                        handler,
                        _marker: PhantomData,
                    }),
                },
            );
        }
        tracing::info!("registered tool: {name}");
        self.notify_list_changed(NOTIFICATION_TOOLS_LIST_CHANGED)
            .await;
    }

    /// Registers a prompt. The prompt's argument metadata is derived from
    /// the handler's argument type.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the prompt
    /// * `description` - A human-readable description of the prompt
    /// * `handler` - The handler function rendering the prompt
    pub async fn register_prompt<A, F, Fut>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) where
        A: DeserializeOwned + JsonSchema + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<GetPromptResponse>> + Send + 'static,
    {
        let name = name.into();
        let schema = generate_schema::<A>();
        let arguments = arguments_from_schema(&schema);
        {
            let mut registry = self.registry.write().expect("registry lock poisoned");
            registry.prompts.insert(
                name.clone(),
                RegisteredPrompt {
                    prompt: Prompt {
                        name: name.clone(),
                        description: Some(description.into()),
                        arguments,
                    },
                    handler: Arc::new(TypedPromptHandler {
                        handler,
                        _marker: PhantomData,
                    }),
                },
            );
        }
        tracing::info!("registered prompt: {name}");
        self.notify_list_changed(NOTIFICATION_PROMPTS_LIST_CHANGED)
            .await;
    }

    /// Registers a resource.
    ///
    /// # Arguments
    ///
    /// * `uri` - The URI of the resource
    /// * `name` - A human-readable name for the resource
    /// * `description` - A description of what the resource represents
    /// * `mime_type` - The MIME type of the resource contents
    /// * `handler` - The handler function reading the resource
    pub async fn register_resource<F, Fut>(
        &self,
        uri: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        mime_type: impl Into<String>,
        handler: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ReadResourceResponse>> + Send + 'static,
    {
        let uri = uri.into();
        let name = name.into();
        {
            let mut registry = self.registry.write().expect("registry lock poisoned");
            registry.resources.insert(
                uri.clone(),
                RegisteredResource {
                    resource: Resource {
                        uri: uri.clone(),
                        name: name.clone(),
                        description: Some(description.into()),
                        mime_type: Some(mime_type.into()),
                    },
                    handler: Arc::new(FnResourceHandler { handler }),
                },
            );
        }
        tracing::info!("registered resource: {name} ({uri})");
        self.notify_list_changed(NOTIFICATION_RESOURCES_LIST_CHANGED)
            .await;
    }

    /// Removes a tool from the server.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the tool to remove
    ///
    /// # Returns
    ///
    /// A `Result` that is [`Error::ToolNotFound`] if no such tool exists
    pub async fn deregister_tool(&self, name: &str) -> Result<()> {
        {
            let mut registry = self.registry.write().expect("registry lock poisoned");
            if registry.tools.remove(name).is_none() {
                return Err(Error::ToolNotFound(name.to_string()));
            }
        }
        tracing::info!("deregistered tool: {name}");
        self.notify_list_changed(NOTIFICATION_TOOLS_LIST_CHANGED)
            .await;
        Ok(())
    }

    /// Removes a prompt from the server.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the prompt to remove
    ///
    /// # Returns
    ///
    /// A `Result` that is [`Error::PromptNotFound`] if no such prompt exists
    pub async fn deregister_prompt(&self, name: &str) -> Result<()> {
        {
            let mut registry = self.registry.write().expect("registry lock poisoned");
            if registry.prompts.remove(name).is_none() {
                return Err(Error::PromptNotFound(name.to_string()));
            }
        }
        tracing::info!("deregistered prompt: {name}");
        self.notify_list_changed(NOTIFICATION_PROMPTS_LIST_CHANGED)
            .await;
        Ok(())
    }

    /// Removes a resource from the server.
    ///
    /// # Arguments
    ///
    /// * `uri` - The URI of the resource to remove
    ///
    /// # Returns
    ///
    /// A `Result` that is [`Error::ResourceNotFound`] if no such resource
    /// exists
    pub async fn deregister_resource(&self, uri: &str) -> Result<()> {
        {
            let mut registry = self.registry.write().expect("registry lock poisoned");
            if registry.resources.remove(uri).is_none() {
                return Err(Error::ResourceNotFound(uri.to_string()));
            }
        }
        tracing::info!("deregistered resource: {uri}");
        self.notify_list_changed(NOTIFICATION_RESOURCES_LIST_CHANGED)
            .await;
        Ok(())
    }

    /// Checks if a tool is registered.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the tool to check
    ///
    /// # Returns
    ///
    /// `true` if the tool is registered, `false` otherwise
    pub fn has_tool(&self, name: &str) -> bool {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .tools
            .contains_key(name)
    }

    /// Checks if a prompt is registered.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the prompt to check
    ///
    /// # Returns
    ///
    /// `true` if the prompt is registered, `false` otherwise
    pub fn has_prompt(&self, name: &str) -> bool {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .prompts
            .contains_key(name)
    }

    /// Checks if a resource is registered.
    ///
    /// # Arguments
    ///
    /// * `uri` - The URI of the resource to check
    ///
    /// # Returns
    ///
    /// `true` if the resource is registered, `false` otherwise
    pub fn has_resource(&self, uri: &str) -> bool {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .resources
            .contains_key(uri)
    }

    /// Emit a list-changed notification, but only once the server is
    /// serving; before that there is no client to receive it. Dispatched
    /// outside the registry lock.
    async fn notify_list_changed(&self, method: &str) {
        let started = self.registry.read().expect("registry lock poisoned").started;
        if !started {
            return;
        }
        match self.protocol.notify(method, None).await {
            Ok(()) => tracing::debug!("sent {method}"),
            Err(e) => tracing::warn!("failed to send {method}: {e}"),
        }
    }
}

/// Builder for [`McpServer`].
pub struct McpServerBuilder {
    name: String,
    version: String,
    instructions: Option<String>,
    pagination_limit: Option<usize>,
}

impl Default for McpServerBuilder {
    fn default() -> Self {
        Self {
            name: "mcp-server".to_string(),
            version: "0.1.0".to_string(),
            instructions: None,
            pagination_limit: Some(DEFAULT_PAGINATION_LIMIT),
        }
    }
}

impl McpServerBuilder {
    /// Sets the server name reported by `initialize`.
    ///
    /// # Arguments
    ///
    /// * `name` - The server name
    ///
    /// # Returns
    ///
    /// The modified builder instance
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the server version reported by `initialize`.
    ///
    /// # Arguments
    ///
    /// * `version` - The server version
    ///
    /// # Returns
    ///
    /// The modified builder instance
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets usage instructions reported by `initialize`.
    ///
    /// Instructions provide guidance for AI models on how to use the
    /// server's tools.
    ///
    /// # Arguments
    ///
    /// * `instructions` - The instructions for using the server
    ///
    /// # Returns
    ///
    /// The modified builder instance
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Sets the listing batch size.
    ///
    /// # Arguments
    ///
    /// * `limit` - The pagination limit; `None` disables pagination
    ///
    /// # Returns
    ///
    /// The modified builder instance
    pub fn pagination_limit(mut self, limit: impl Into<Option<usize>>) -> Self {
        self.pagination_limit = limit.into();
        self
    }

    /// Builds the server with the configured settings.
    ///
    /// # Returns
    ///
    /// A `McpServer` with every MCP method handler wired to its registries
    pub fn build(self) -> McpServer {
        let registry: Arc<RwLock<Registry>> = Arc::new(RwLock::new(Registry::default()));
        let limit = self.pagination_limit.filter(|n| *n > 0);
        let info = Implementation {
            name: self.name,
            version: self.version,
        };

        let init_info = info.clone();
        let instructions = self.instructions;
        let tools_registry = registry.clone();
        let call_registry = registry.clone();
        let prompts_registry = registry.clone();
        let get_registry = registry.clone();
        let resources_registry = registry.clone();
        let read_registry = registry.clone();

        let protocol = Protocol::builder()
            .request_handler("initialize", move |_req: InitializeRequest| {
                let server_info = init_info.clone();
                let instructions = instructions.clone();
                Box::pin(async move {
                    // Every category advertises list_changed so clients can
                    // follow dynamic registration.
                    Ok(InitializeResponse {
                        protocol_version: PROTOCOL_VERSION.to_string(),
                        capabilities: ServerCapabilities {
                            tools: Some(ToolCapabilities {
                                list_changed: Some(true),
                            }),
                            prompts: Some(PromptCapabilities {
                                list_changed: Some(true),
                            }),
                            resources: Some(ResourceCapabilities {
                                subscribe: Some(false),
                                list_changed: Some(true),
                            }),
                            logging: None,
                        },
                        server_info,
                        instructions,
                    })
                })
            })
            .request_handler("ping", |_req: Value| Box::pin(async move { Ok(json!({})) }))
            .request_handler("tools/list", move |req: ListRequest| {
                let registry = tools_registry.clone();
                Box::pin(async move {
                    let tools: Vec<Tool> = {
                        let registry = registry
                            .read()
                            .map_err(|_| anyhow::anyhow!("registry lock poisoned"))?;
                        registry.tools.values().map(|t| t.tool.clone()).collect()
                    };
                    let (tools, next_cursor) =
                        paginate(tools, |t| &t.name, req.cursor.as_deref(), limit);
                    Ok(ListToolsResponse { tools, next_cursor })
                })
            })
            .request_handler("tools/call", move |req: CallToolRequest| {
                let registry = call_registry.clone();
                Box::pin(async move {
                    let handler = {
                        let registry = registry
                            .read()
                            .map_err(|_| anyhow::anyhow!("registry lock poisoned"))?;
                        registry.tools.get(&req.name).map(|t| t.handler.clone())
                    };
                    let Some(handler) = handler else {
                        return Ok(CallToolResponse::error(format!("Unknown tool: {}", req.name)));
                    };

                    tracing::debug!("calling tool: {}", req.name);
                    let arguments = req.arguments.unwrap_or_else(|| json!({}));
                    match handler.call(arguments).await {
                        Ok(response) => Ok(response),
                        Err(e) => Ok(CallToolResponse::error(format!("Error: {e}"))),
                    }
                })
            })
            .request_handler("prompts/list", move |req: ListRequest| {
                let registry = prompts_registry.clone();
                Box::pin(async move {
                    let prompts: Vec<Prompt> = {
                        let registry = registry
                            .read()
                            .map_err(|_| anyhow::anyhow!("registry lock poisoned"))?;
                        registry.prompts.values().map(|p| p.prompt.clone()).collect()
                    };
                    let (prompts, next_cursor) =
                        paginate(prompts, |p| &p.name, req.cursor.as_deref(), limit);
                    Ok(ListPromptsResponse {
                        prompts,
                        next_cursor,
                    })
                })
            })
            .request_handler("prompts/get", move |req: GetPromptRequest| {
                let registry = get_registry.clone();
                Box::pin(async move {
                    let handler = {
                        let registry = registry
                            .read()
                            .map_err(|_| anyhow::anyhow!("registry lock poisoned"))?;
                        registry.prompts.get(&req.name).map(|p| p.handler.clone())
                    };
                    let Some(handler) = handler else {
                        anyhow::bail!("unknown prompt: {}", req.name);
                    };

                    tracing::debug!("getting prompt: {}", req.name);
                    let arguments = req.arguments.unwrap_or_else(|| json!({}));
                    handler
                        .call(arguments)
                        .await
                        .map_err(|e| anyhow::anyhow!("error calling prompt handler: {e}"))
                })
            })
            .request_handler("resources/list", move |req: ListRequest| {
                let registry = resources_registry.clone();
                Box::pin(async move {
                    let resources: Vec<Resource> = {
                        let registry = registry
                            .read()
                            .map_err(|_| anyhow::anyhow!("registry lock poisoned"))?;
                        registry
                            .resources
                            .values()
                            .map(|r| r.resource.clone())
                            .collect()
                    };
                    let (resources, next_cursor) =
                        paginate(resources, |r| &r.uri, req.cursor.as_deref(), limit);
                    Ok(ListResourcesResponse {
                        resources,
                        next_cursor,
                    })
                })
            })
            .request_handler("resources/read", move |req: ReadResourceRequest| {
                let registry = read_registry.clone();
                Box::pin(async move {
                    let handler = {
                        let registry = registry
                            .read()
                            .map_err(|_| anyhow::anyhow!("registry lock poisoned"))?;
                        registry.resources.get(&req.uri).map(|r| r.handler.clone())
                    };
                    let Some(handler) = handler else {
                        anyhow::bail!("unknown resource: {}", req.uri);
                    };

                    tracing::debug!("reading resource: {}", req.uri);
                    handler
                        .call()
                        .await
                        .map_err(|e| anyhow::anyhow!("error calling resource handler: {e}"))
                })
            })
            .build();

        McpServer {
            protocol,
            registry,
            info,
        }
    }
}

#[derive(Default)]
struct Registry {
    started: bool,
    tools: BTreeMap<String, RegisteredTool>,
    prompts: BTreeMap<String, RegisteredPrompt>,
    resources: BTreeMap<String, RegisteredResource>,
}

struct RegisteredTool {
    tool: Tool,
    handler: Arc<dyn ToolHandler>,
}

struct RegisteredPrompt {
    prompt: Prompt,
    handler: Arc<dyn PromptHandler>,
}

struct RegisteredResource {
    resource: Resource,
    handler: Arc<dyn ResourceHandler>,
}

trait ToolHandler: Send + Sync {
    fn call(&self, arguments: Value) -> BoxFuture<CallToolResponse>;
}

struct TypedToolHandler<A, F> {
    handler: F,
    _marker: PhantomData<fn(A)>,
}

impl<A, F, Fut> ToolHandler for TypedToolHandler<A, F>
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<CallToolResponse>> + Send + 'static,
{
    fn call(&self, arguments: Value) -> BoxFuture<CallToolResponse> {
        match serde_json::from_value::<A>(arguments) {
            Ok(args) => Box::pin((self.handler)(args)),
            Err(e) => {
                let message = format!("failed to deserialize arguments: {e}");
                Box::pin(async move { Err(anyhow::Error::msg(message)) })
            }
        }
    }
}

trait PromptHandler: Send + Sync {
    fn call(&self, arguments: Value) -> BoxFuture<GetPromptResponse>;
}

struct TypedPromptHandler<A, F> {
    handler: F,
    _marker: PhantomData<fn(A)>,
}

impl<A, F, Fut> PromptHandler for TypedPromptHandler<A, F>
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<GetPromptResponse>> + Send + 'static,
{
    fn call(&self, arguments: Value) -> BoxFuture<GetPromptResponse> {
        match serde_json::from_value::<A>(arguments) {
            Ok(args) => Box::pin((self.handler)(args)),
            Err(e) => {
                let message = format!("failed to deserialize arguments: {e}");
                Box::pin(async move { Err(anyhow::Error::msg(message)) })
            }
        }
    }
}

trait ResourceHandler: Send + Sync {
    fn call(&self) -> BoxFuture<ReadResourceResponse>;
}

struct FnResourceHandler<F> {
    handler: F,
}

impl<F, Fut> ResourceHandler for FnResourceHandler<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ReadResourceResponse>> + Send + 'static,
{
    fn call(&self) -> BoxFuture<ReadResourceResponse> {
        Box::pin((self.handler)())
    }
}

fn encode_cursor(key: &str) -> String {
    BASE64.encode(key.as_bytes())
}

fn decode_cursor(cursor: &str) -> Option<String> {
    let bytes = BASE64.decode(cursor).ok()?;
    String::from_utf8(bytes).ok()
}

/// Page through `items` (already sorted by key). The cursor is the base64
/// of the last emitted key; an unreadable cursor restarts the listing, and
/// the page after a cursor holds only keys strictly greater than it.
fn paginate<T>(
    items: Vec<T>,
    key_of: impl Fn(&T) -> &str,
    cursor: Option<&str>,
    limit: Option<usize>,
) -> (Vec<T>, Option<String>) {
    let start = match cursor.and_then(decode_cursor) {
        Some(last) => items.partition_point(|item| key_of(item) <= last.as_str()),
        None => 0,
    };

    match limit {
        Some(limit) if items.len() - start > limit => {
            let next_cursor = encode_cursor(key_of(&items[start + limit - 1]));
            let page = items.into_iter().skip(start).take(limit).collect();
            (page, Some(next_cursor))
        }
        _ => (items.into_iter().skip(start).collect(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::transport::{
        JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, MessageContext, RequestId,
    };
    use crate::types::{Content, PromptMessage, ResourceContents, Role};

    #[derive(serde::Deserialize, JsonSchema)]
    struct EchoArgs {
        /// The message to echo back
        message: String,
    }

    #[derive(serde::Deserialize, JsonSchema)]
    struct GreetArgs {
        name: String,
    }

    async fn echo_server() -> (McpServer, MockTransport) {
        let server = McpServer::builder()
            .name("test-server")
            .version("1.0.0")
            .build();
        server
            .register_tool("echo", "Echo back the message you send", |args: EchoArgs| {
                async move { Ok(CallToolResponse::text(format!("Echo: {}", args.message))) }
            })
            .await;
        let mock = MockTransport::new();
        server.serve(Arc::new(mock.clone())).await.unwrap();
        mock.clear_sent();
        (server, mock)
    }

    async fn call(mock: &MockTransport, id: u64, method: &str, params: Value) -> JsonRpcResponse {
        mock.receive(
            MessageContext::default(),
            JsonRpcMessage::Request(JsonRpcRequest::new(id, method, Some(params))),
        )
        .await;
        let response = mock
            .sent_messages()
            .into_iter()
            .find_map(|message| match message {
                JsonRpcMessage::Response(response) if response.id == RequestId::Number(id) => {
                    Some(response)
                }
                _ => None,
            })
            .unwrap_or_else(|| panic!("no response for {method}"));
        response
    }

    #[tokio::test]
    async fn echo_tool_round_trip() {
        let (_server, mock) = echo_server().await;
        let response = call(
            &mock,
            1,
            "tools/call",
            json!({"name": "echo", "arguments": {"message": "Hi"}}),
        )
        .await;

        assert!(response.error.is_none());
        assert_eq!(
            response.result.unwrap(),
            json!({"content": [{"type": "text", "text": "Echo: Hi"}]})
        );
    }

    #[tokio::test]
    async fn unknown_tool_is_a_tool_error_not_a_protocol_error() {
        let (_server, mock) = echo_server().await;
        let response = call(
            &mock,
            1,
            "tools/call",
            json!({"name": "nonexistent", "arguments": {}}),
        )
        .await;

        assert!(response.error.is_none());
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["text"], "Unknown tool: nonexistent");
    }

    #[tokio::test]
    async fn failing_tool_maps_to_is_error_response() {
        let (server, mock) = echo_server().await;
        server
            .register_tool("boom", "Always fails", |_args: EchoArgs| async move {
                Err(anyhow::anyhow!("boom"))
            })
            .await;

        let response = call(
            &mock,
            1,
            "tools/call",
            json!({"name": "boom", "arguments": {"message": "x"}}),
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["text"], "Error: boom");
    }

    #[tokio::test]
    async fn bad_tool_arguments_map_to_is_error_response() {
        let (_server, mock) = echo_server().await;
        let response = call(
            &mock,
            1,
            "tools/call",
            json!({"name": "echo", "arguments": {"message": 42}}),
        )
        .await;
        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
    }

    #[tokio::test]
    async fn listing_reflects_registration_and_deregistration() {
        let (server, mock) = echo_server().await;
        assert!(server.has_tool("echo"));

        let response = call(&mock, 1, "tools/list", json!({})).await;
        let result = response.result.unwrap();
        assert_eq!(result["tools"][0]["name"], "echo");
        assert_eq!(
            result["tools"][0]["inputSchema"]["properties"]["message"]["type"],
            "string"
        );

        server.deregister_tool("echo").await.unwrap();
        assert!(!server.has_tool("echo"));
        let response = call(&mock, 2, "tools/list", json!({})).await;
        assert_eq!(response.result.unwrap()["tools"], json!([]));

        let err = server.deregister_tool("echo").await.unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn list_changed_gated_on_serving() {
        let server = McpServer::builder().build();
        // Idle: no client, no notification (and nothing to send through).
        server
            .register_tool("early", "Registered before serve", |_: EchoArgs| async move {
                Ok(CallToolResponse::text("early"))
            })
            .await;

        let mock = MockTransport::new();
        server.serve(Arc::new(mock.clone())).await.unwrap();
        assert!(mock.sent_messages().is_empty());

        server
            .register_tool("late", "Registered while serving", |_: EchoArgs| async move {
                Ok(CallToolResponse::text("late"))
            })
            .await;

        let notifications: Vec<_> = mock
            .sent_messages()
            .into_iter()
            .filter_map(|message| match message {
                JsonRpcMessage::Notification(n) => Some(n.method),
                _ => None,
            })
            .collect();
        assert_eq!(notifications, vec!["notifications/tools/list_changed"]);

        server.deregister_tool("late").await.unwrap();
        let count = mock
            .sent_messages()
            .iter()
            .filter(|m| m.method() == Some("notifications/tools/list_changed"))
            .count();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn pagination_walks_the_full_listing() {
        let server = McpServer::builder().pagination_limit(10).build();
        let mock = MockTransport::new();
        server.serve(Arc::new(mock.clone())).await.unwrap();

        for i in 0..25 {
            server
                .register_tool(format!("t{i:02}"), "A numbered tool", |_: EchoArgs| {
                    async move { Ok(CallToolResponse::text("ok")) }
                })
                .await;
        }
        mock.clear_sent();

        let first = call(&mock, 1, "tools/list", json!({})).await.result.unwrap();
        let names =
            |v: &Value| -> Vec<String> {
                v["tools"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|t| t["name"].as_str().unwrap().to_string())
                    .collect()
            };
        assert_eq!(names(&first)[0], "t00");
        assert_eq!(names(&first)[9], "t09");
        assert_eq!(first["nextCursor"], BASE64.encode("t09"));

        let second = call(&mock, 2, "tools/list", json!({"cursor": first["nextCursor"]}))
            .await
            .result
            .unwrap();
        assert_eq!(names(&second)[0], "t10");
        assert_eq!(names(&second)[9], "t19");
        assert_eq!(second["nextCursor"], BASE64.encode("t19"));

        let third = call(&mock, 3, "tools/list", json!({"cursor": second["nextCursor"]}))
            .await
            .result
            .unwrap();
        assert_eq!(names(&third), vec!["t20", "t21", "t22", "t23", "t24"]);
        assert!(third.get("nextCursor").is_none());

        // Concatenation equals the sorted full listing.
        let mut all = names(&first);
        all.extend(names(&second));
        all.extend(names(&third));
        let expected: Vec<String> = (0..25).map(|i| format!("t{i:02}")).collect();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn unreadable_cursor_restarts_the_listing() {
        let server = McpServer::builder().pagination_limit(2).build();
        let mock = MockTransport::new();
        server.serve(Arc::new(mock.clone())).await.unwrap();
        for name in ["a", "b", "c"] {
            server
                .register_tool(name, "A tool", |_: EchoArgs| async move {
                    Ok(CallToolResponse::text("ok"))
                })
                .await;
        }
        mock.clear_sent();

        let result = call(&mock, 1, "tools/list", json!({"cursor": "%%%not-base64%%%"}))
            .await
            .result
            .unwrap();
        assert_eq!(result["tools"][0]["name"], "a");
    }

    #[tokio::test]
    async fn prompt_round_trip_and_derived_arguments() {
        let (server, mock) = echo_server().await;
        server
            .register_prompt("greet", "Greet a user by name", |args: GreetArgs| {
                async move {
                    Ok(GetPromptResponse {
                        description: Some("A greeting".to_string()),
                        messages: vec![PromptMessage::new(
                            Role::Assistant,
                            Content::text(format!("Hello {}", args.name)),
                        )],
                    })
                }
            })
            .await;

        let listing = call(&mock, 1, "prompts/list", json!({})).await.result.unwrap();
        assert_eq!(listing["prompts"][0]["name"], "greet");
        assert_eq!(listing["prompts"][0]["arguments"][0]["name"], "name");
        assert_eq!(listing["prompts"][0]["arguments"][0]["required"], true);

        let got = call(
            &mock,
            2,
            "prompts/get",
            json!({"name": "greet", "arguments": {"name": "Ada"}}),
        )
        .await
        .result
        .unwrap();
        assert_eq!(got["messages"][0]["role"], "assistant");
        assert_eq!(got["messages"][0]["content"]["text"], "Hello Ada");
    }

    #[tokio::test]
    async fn unknown_prompt_is_a_protocol_error() {
        let (_server, mock) = echo_server().await;
        let response = call(&mock, 1, "prompts/get", json!({"name": "missing"})).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, -32603);
        assert!(error.message.contains("unknown prompt: missing"));
    }

    #[tokio::test]
    async fn resource_round_trip() {
        let (server, mock) = echo_server().await;
        server
            .register_resource(
                "test://resource",
                "Test Resource",
                "A test resource",
                "text/plain",
                || async move {
                    Ok(ReadResourceResponse {
                        contents: vec![ResourceContents::text(
                            "test://resource",
                            "test content",
                            "text/plain",
                        )],
                    })
                },
            )
            .await;
        assert!(server.has_resource("test://resource"));

        let listing = call(&mock, 1, "resources/list", json!({}))
            .await
            .result
            .unwrap();
        assert_eq!(listing["resources"][0]["uri"], "test://resource");
        assert_eq!(listing["resources"][0]["mimeType"], "text/plain");

        let read = call(&mock, 2, "resources/read", json!({"uri": "test://resource"}))
            .await
            .result
            .unwrap();
        assert_eq!(read["contents"][0]["text"], "test content");
    }

    #[tokio::test]
    async fn unknown_resource_is_a_protocol_error() {
        let (_server, mock) = echo_server().await;
        let response = call(&mock, 1, "resources/read", json!({"uri": "test://missing"})).await;
        assert_eq!(response.error.unwrap().code, -32603);
    }

    #[tokio::test]
    async fn initialize_reports_identity_and_capabilities() {
        let (_server, mock) = echo_server().await;
        let result = call(
            &mock,
            1,
            "initialize",
            json!({"protocolVersion": "2024-11-05", "capabilities": {}, "clientInfo": {"name": "c", "version": "1"}}),
        )
        .await
        .result
        .unwrap();

        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "test-server");
        assert_eq!(result["serverInfo"]["version"], "1.0.0");
        assert_eq!(result["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(result["capabilities"]["prompts"]["listChanged"], true);
        assert_eq!(result["capabilities"]["resources"]["listChanged"], true);
        assert_eq!(result["capabilities"]["resources"]["subscribe"], false);
    }

    #[tokio::test]
    async fn ping_returns_empty_object() {
        let (_server, mock) = echo_server().await;
        let result = call(&mock, 1, "ping", json!({})).await.result.unwrap();
        assert_eq!(result, json!({}));
    }

    #[test]
    fn paginate_handles_cursor_past_the_end() {
        let items = vec!["a".to_string(), "b".to_string()];
        let cursor = encode_cursor("z");
        let (page, next) = paginate(items, |s| s.as_str(), Some(&cursor), Some(10));
        assert!(page.is_empty());
        assert!(next.is_none());
    }

    #[test]
    fn paginate_without_limit_returns_everything() {
        let items: Vec<String> = (0..50).map(|i| format!("k{i:02}")).collect();
        let (page, next) = paginate(items.clone(), |s| s.as_str(), None, None);
        assert_eq!(page, items);
        assert!(next.is_none());
    }
}
