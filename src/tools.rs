//! Tool registry for the HTTP surface.
//!
//! Every operation is exposed as a named tool with a JSON Schema for its
//! parameters, listed by `GET /tools/list` and called through
//! `POST /tools/{name}`. Tools are thin: they decode parameters, call the
//! matching [`Service`] method with the caller identity from the
//! [`ToolContext`], and encode the result. Parameters that fail to decode
//! are still charged to the tool's rate-limit class and audited.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::guard::OpClass;
use crate::service::{
    IndexRequest, OpenRequest, RewriteRequest, SearchRequest, Service, SummarizeRequest,
};

/// A callable operation.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Route name, as in `POST /tools/{name}`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Rate-limit class charged for every call, including rejected ones.
    fn class(&self) -> OpClass;

    /// JSON Schema (`type: "object"`) for the parameters.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ApiResult<Value>;
}

/// Per-call context: the service and who is calling.
pub struct ToolContext {
    pub service: Arc<Service>,
    pub caller: String,
}

/// Entry in `GET /tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Decode tool parameters; a missing body counts as `{}`.
fn parse_params<T: DeserializeOwned>(params: Value) -> ApiResult<T> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| ApiError::validation(format!("invalid parameters: {}", e)))
}

/// [`parse_params`], with a failure accounted against the calling tool.
fn decode<T: DeserializeOwned>(tool: &dyn Tool, params: Value, ctx: &ToolContext) -> ApiResult<T> {
    parse_params(params).map_err(|e| ctx.service.reject(tool.name(), tool.class(), &ctx.caller, e))
}

fn to_value<T: Serialize>(value: &T) -> ApiResult<Value> {
    serde_json::to_value(value).map_err(|e| ApiError::Internal(format!("encode result: {}", e)))
}

pub struct ListRootsTool;

#[async_trait]
impl Tool for ListRootsTool {
    fn name(&self) -> &str {
        "listRoots"
    }

    fn class(&self) -> OpClass {
        OpClass::Roots
    }

    fn description(&self) -> &str {
        "List the allow-listed root directories and how many files each has indexed"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> ApiResult<Value> {
        let roots = ctx.service.list_roots(&ctx.caller).await?;
        Ok(json!({ "roots": roots }))
    }
}

pub struct IndexFolderTool;

#[async_trait]
impl Tool for IndexFolderTool {
    fn name(&self) -> &str {
        "indexFolder"
    }

    fn class(&self) -> OpClass {
        OpClass::Index
    }

    fn description(&self) -> &str {
        "Index new and changed files under an allow-listed folder"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "root": { "type": "string", "description": "Absolute folder path inside a configured root" },
                "full": { "type": "boolean", "default": false, "description": "Reprocess every file" },
                "priority": { "type": "string", "enum": ["low", "normal", "high"], "default": "normal" }
            },
            "required": ["root"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ApiResult<Value> {
        let req: IndexRequest = decode(self, params, ctx)?;
        to_value(&ctx.service.index_folder(&ctx.caller, req).await?)
    }
}

pub struct SearchFilesTool;

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "searchFiles"
    }

    fn class(&self) -> OpClass {
        OpClass::Search
    }

    fn description(&self) -> &str {
        "Full-text search over indexed files with optional type, year and root filters"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Words or \"quoted phrases\"" },
                "k": { "type": "integer", "minimum": 1, "description": "Page size" },
                "offset": { "type": "integer", "minimum": 0, "default": 0 },
                "exts": { "type": "array", "items": { "type": "string" }, "description": "e.g. [\".pdf\", \"docx\"]" },
                "years": { "type": "array", "items": { "type": "integer" }, "description": "Modification years (UTC)" },
                "roots": { "type": "array", "items": { "type": "string" }, "description": "Restrict to these roots" },
                "ai": { "type": "boolean", "default": false, "description": "Opt in to AI rewrite, summary and related queries" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ApiResult<Value> {
        let req: SearchRequest = decode(self, params, ctx)?;
        to_value(&ctx.service.search_files(&ctx.caller, req).await?)
    }
}

pub struct OpenFileTool;

#[async_trait]
impl Tool for OpenFileTool {
    fn name(&self) -> &str {
        "openFile"
    }

    fn class(&self) -> OpClass {
        OpClass::Preview
    }

    fn description(&self) -> &str {
        "Preview one chunk of an indexed file"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "pointer": { "type": "string", "description": "Chunk locator such as \"page 3\"; defaults to the first chunk" },
                "before": { "type": "integer", "minimum": 0 },
                "after": { "type": "integer", "minimum": 0 }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ApiResult<Value> {
        let req: OpenRequest = decode(self, params, ctx)?;
        to_value(&ctx.service.open_file(&ctx.caller, req).await?)
    }
}

pub struct SummarizeResultsTool;

#[async_trait]
impl Tool for SummarizeResultsTool {
    fn name(&self) -> &str {
        "summarizeResults"
    }

    fn class(&self) -> OpClass {
        OpClass::Summarize
    }

    fn description(&self) -> &str {
        "Summarize a set of search results, with a local fallback when AI is off or over budget"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "results": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "path": { "type": "string" },
                            "snippet": { "type": "string" }
                        },
                        "required": ["path"]
                    }
                },
                "style": { "type": "string", "default": "brief" },
                "max_tokens": { "type": "integer", "minimum": 1 }
            },
            "required": ["query", "results"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ApiResult<Value> {
        let req: SummarizeRequest = decode(self, params, ctx)?;
        to_value(&ctx.service.summarize_results(&ctx.caller, req).await?)
    }
}

pub struct RewriteQueryTool;

#[async_trait]
impl Tool for RewriteQueryTool {
    fn name(&self) -> &str {
        "rewriteQuery"
    }

    fn class(&self) -> OpClass {
        OpClass::Rewrite
    }

    fn description(&self) -> &str {
        "Turn a natural-language request into an engine query and filters"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ApiResult<Value> {
        let req: RewriteRequest = decode(self, params, ctx)?;
        to_value(&ctx.service.rewrite_query(&ctx.caller, req).await?)
    }
}

pub struct UsageTool;

#[async_trait]
impl Tool for UsageTool {
    fn name(&self) -> &str {
        "usage"
    }

    fn class(&self) -> OpClass {
        OpClass::Roots
    }

    fn description(&self) -> &str {
        "Today's AI token usage against the daily limit"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> ApiResult<Value> {
        to_value(&ctx.service.usage(&ctx.caller).await?)
    }
}

/// Tools by name, in registration order.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry with every built-in operation.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ListRootsTool));
        registry.register(Box::new(IndexFolderTool));
        registry.register(Box::new(SearchFilesTool));
        registry.register(Box::new(OpenFileTool));
        registry.register(Box::new(SummarizeResultsTool));
        registry.register(Box::new(RewriteQueryTool));
        registry.register(Box::new(UsageTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn infos(&self) -> Vec<ToolInfo> {
        self.tools
            .iter()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
