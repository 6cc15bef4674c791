//! Tool trait — the abstraction over agent capabilities.
//!
//! Tools declare their parameters with a [`ToolSchema`]; the [`ToolRegistry`]
//! uses it to turn whatever the model wrote inside `name[...]` into typed
//! params before dispatching. From the model's side every tool is string in,
//! string out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::args;
use crate::error::ToolError;

/// Typed parameters handed to [`Tool::execute`].
pub type ToolParams = Map<String, Value>;

/// JSON types a parameter can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,

    #[serde(rename = "type")]
    pub param_type: ParamType,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ToolParameter {
    pub fn required(name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Declarative description of a tool: name, purpose and ordered parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    /// Add a parameter. A parameter with the same name is replaced.
    pub fn with_parameter(mut self, parameter: ToolParameter) -> Self {
        match self.parameters.iter_mut().find(|p| p.name == parameter.name) {
            Some(existing) => *existing = parameter,
            None => self.parameters.push(parameter),
        }
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ToolParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn required_names(&self) -> impl Iterator<Item = &str> {
        self.parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
    }

    /// Check that every required parameter is present.
    pub fn validate(&self, params: &ToolParams) -> Result<(), ToolError> {
        match self.required_names().find(|name| !params.contains_key(*name)) {
            Some(missing) => Err(ToolError::MissingParameter(missing.to_string())),
            None => Ok(()),
        }
    }

    /// JSON Schema rendering, for catalogs and function-calling providers.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for p in &self.parameters {
            let mut prop = json!({
                "type": p.param_type.as_str(),
                "description": p.description,
            });
            if let Some(default) = &p.default {
                prop["default"] = default.clone();
            }
            properties.insert(p.name.clone(), prop);
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": self.required_names().collect::<Vec<_>>(),
        })
    }
}

/// The core Tool trait.
///
/// `execute` receives params that already passed schema coercion and
/// required-parameter validation.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> &ToolSchema;

    fn name(&self) -> &str {
        &self.schema().name
    }

    fn description(&self) -> &str {
        &self.schema().description
    }

    fn validate(&self, params: &ToolParams) -> Result<(), ToolError> {
        self.schema().validate(params)
    }

    async fn execute(&self, params: ToolParams) -> Result<String, ToolError>;
}

type ToolFn = dyn Fn(&str) -> String + Send + Sync;

/// A closure exposed as a tool with a single required `input` parameter.
pub struct FunctionTool {
    schema: ToolSchema,
    func: Box<ToolFn>,
}

impl FunctionTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        func: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        let schema = ToolSchema::new(name, description).with_parameter(ToolParameter::required(
            "input",
            ParamType::String,
            "input text",
        ));
        Self {
            schema,
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: ToolParams) -> Result<String, ToolError> {
        let input = match params.get("input") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => return Err(ToolError::MissingParameter("input".into())),
        };
        Ok((self.func)(&input))
    }
}

/// What happened when the registry dispatched one action.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// Params after parsing and coercion; `None` when input could not be
    /// turned into params or the tool does not exist.
    pub params: Option<ToolParams>,

    /// The observation text, including rendered errors.
    pub output: String,
}

/// A registry of available tools, in registration order.
///
/// Writes happen during setup; after that the registry is shared read-only
/// (typically behind an `Arc`) by any number of agents.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool. An existing tool with the same name is replaced in place.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        if name.is_empty() {
            tracing::warn!("Ignoring tool with an empty name");
            return;
        }
        match self.tools.iter_mut().find(|t| t.name() == name) {
            Some(slot) => {
                tracing::warn!(tool = %name, "Tool already registered, overwriting");
                *slot = tool;
            }
            None => {
                tracing::debug!(tool = %name, "Registered tool");
                self.tools.push(tool);
            }
        }
    }

    /// Register a closure as a tool taking a single `input` string.
    pub fn register_function(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        func: impl Fn(&str) -> String + Send + Sync + 'static,
    ) {
        self.register(Box::new(FunctionTool::new(name, description, func)));
    }

    /// Remove a tool. No-op if absent.
    pub fn unregister(&mut self, name: &str) {
        self.tools.retain(|t| t.name() != name);
    }

    pub fn clear(&mut self) {
        self.tools.clear();
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    /// Schemas in registration order.
    pub fn list(&self) -> Vec<&ToolSchema> {
        self.tools.iter().map(|t| t.schema()).collect()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// `- name: description` lines, fed verbatim into the ReAct prompt.
    pub fn describe(&self) -> String {
        if self.tools.is_empty() {
            return "暂无可用工具".to_string();
        }
        self.tools
            .iter()
            .map(|t| format!("- {}: {}", t.name(), t.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Parse `raw` against the tool's schema and run it; errors are
    /// rendered into the output string.
    pub async fn execute(&self, name: &str, raw: &str) -> String {
        self.invoke(name, raw).await.output
    }

    /// Like [`execute`](Self::execute) but also reports the parsed params.
    pub async fn invoke(&self, name: &str, raw: &str) -> ToolInvocation {
        let Some(tool) = self.get(name) else {
            return ToolInvocation {
                params: None,
                output: render_not_found(name),
            };
        };

        match args::prepare_params(tool.schema(), raw) {
            Ok(params) => {
                let shown = serde_json::to_string(&params).unwrap_or_default();
                tracing::debug!(tool = %name, params = %shown, "Dispatching tool");
                let output = run_tool(tool, params.clone()).await;
                ToolInvocation {
                    params: Some(params),
                    output,
                }
            }
            Err(e) => {
                tracing::debug!(tool = %name, error = %e, "Rejected tool input");
                ToolInvocation {
                    params: None,
                    output: render_input_error(name, &e),
                }
            }
        }
    }

    /// Dispatch already-structured params (coerced and validated first).
    pub async fn execute_params(&self, name: &str, mut params: ToolParams) -> String {
        let Some(tool) = self.get(name) else {
            return render_not_found(name);
        };
        args::coerce_params(&mut params, tool.schema());
        if let Err(e) = tool.validate(&params) {
            return render_input_error(name, &e);
        }
        run_tool(tool, params).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_tool(tool: &dyn Tool, params: ToolParams) -> String {
    match tool.execute(params).await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(tool = %tool.name(), error = %e, "Tool execution failed");
            format!("错误：执行工具 '{}' 时发生异常: {}", tool.name(), e)
        }
    }
}

fn render_not_found(name: &str) -> String {
    format!("错误：未找到名为 '{name}' 的工具。")
}

fn render_input_error(name: &str, err: &ToolError) -> String {
    match err {
        ToolError::MissingParameter(_) => err.to_string(),
        ToolError::StructuredInputRequired(_) => format!(
            "错误：工具 '{name}' 需要结构化参数，请使用 JSON 传参，例如 {name}[{{\"param\": \"value\"}}]"
        ),
        other => format!("错误：{other}"),
    }
}
