//! Tool registry for conversation mode.
//!
//! Tools are typed handler structs. The model's JSON arguments are
//! deserialized into the handler's `Args` type before the handler runs,
//! and the JSON schema advertised to the model is derived from that same
//! type, so the two cannot drift apart.
//!
//! The registry is assembled once at startup with [`ToolRegistryBuilder`]
//! and shared read-only across concurrent turns.

use crate::error::ToolError;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use speda_ai::ToolSpec;
use speda_core::{ConversationId, UserId};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Definition of a tool available during conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON schema for input parameters.
    pub input_schema: JsonValue,
    /// Whether this tool requires confirmation before execution.
    pub requires_confirmation: bool,
}

/// Who is calling a tool, and from where.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolContext {
    /// The user the conversation belongs to.
    pub user_id: UserId,
    /// Display name of the user, if known.
    pub user_name: Option<String>,
    /// The conversation the call belongs to.
    pub conversation_id: ConversationId,
    /// Client-reported location, passed through verbatim.
    pub location: Option<JsonValue>,
    /// IANA timezone name reported by the client.
    pub timezone: Option<String>,
}

/// A typed tool handler.
pub trait Tool: Send + Sync + 'static {
    /// Argument type, deserialized from the model's JSON.
    type Args: DeserializeOwned + JsonSchema + Send;

    /// Unique tool name.
    const NAME: &'static str;

    /// Description shown to the model.
    fn description(&self) -> &str;

    /// Whether the tool has side effects that need explicit user approval.
    fn requires_confirmation(&self) -> bool {
        false
    }

    /// Executes the tool.
    fn execute(
        &self,
        args: Self::Args,
        context: &ToolContext,
    ) -> impl Future<Output = Result<JsonValue, ToolError>> + Send;
}

#[async_trait]
trait ErasedTool: Send + Sync {
    async fn call(&self, arguments: JsonValue, context: &ToolContext)
    -> Result<JsonValue, ToolError>;
}

struct Typed<T>(T);

#[async_trait]
impl<T: Tool> ErasedTool for Typed<T> {
    async fn call(
        &self,
        arguments: JsonValue,
        context: &ToolContext,
    ) -> Result<JsonValue, ToolError> {
        let args: T::Args =
            serde_json::from_value(arguments).map_err(|e| ToolError::InvalidInput {
                name: T::NAME.to_string(),
                reason: e.to_string(),
            })?;
        self.0.execute(args, context).await
    }
}

/// A registered tool: its definition plus an executor.
#[derive(Clone)]
pub struct ToolDescriptor {
    definition: ToolDefinition,
    handler: Arc<dyn ErasedTool>,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

impl ToolDescriptor {
    /// Returns the definition.
    #[must_use]
    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    /// Returns the tool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Whether execution needs explicit user approval.
    #[must_use]
    pub fn requires_confirmation(&self) -> bool {
        self.definition.requires_confirmation
    }

    /// Validates the arguments and runs the tool.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the arguments do not match the schema, or
    /// whatever error the tool itself reports.
    pub async fn execute(
        &self,
        arguments: JsonValue,
        context: &ToolContext,
    ) -> Result<JsonValue, ToolError> {
        self.handler.call(arguments, context).await
    }
}

fn schema_for<A: JsonSchema>() -> JsonValue {
    let mut schema = schemars::schema_for!(A).to_value();
    if let Some(object) = schema.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    schema
}

/// Builder for an immutable [`ToolRegistry`].
#[derive(Debug, Default)]
pub struct ToolRegistryBuilder {
    tools: BTreeMap<String, ToolDescriptor>,
}

impl ToolRegistryBuilder {
    /// Registers a tool. A later registration with the same name replaces
    /// the earlier one.
    #[must_use]
    pub fn register<T: Tool>(mut self, tool: T) -> Self {
        let definition = ToolDefinition {
            name: T::NAME.to_string(),
            description: tool.description().to_string(),
            input_schema: schema_for::<T::Args>(),
            requires_confirmation: tool.requires_confirmation(),
        };
        self.tools.insert(
            definition.name.clone(),
            ToolDescriptor {
                definition,
                handler: Arc::new(Typed(tool)),
            },
        );
        self
    }

    /// Finishes the registry.
    #[must_use]
    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

/// Registry of available tools.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    /// Looks up a tool by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no tool has this name.
    pub fn lookup(&self, name: &str) -> Result<&ToolDescriptor, ToolError> {
        self.tools.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })
    }

    /// Returns all registered tool definitions, ordered by name.
    pub fn definitions(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.values().map(ToolDescriptor::definition)
    }

    /// Returns the number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Converts definitions to the format expected by LLM APIs.
    #[must_use]
    pub fn to_llm_format(&self) -> Vec<ToolSpec> {
        self.definitions()
            .map(|def| ToolSpec {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters: def.input_schema.clone(),
            })
            .collect()
    }
}
