//! MCP tool handlers for the Godot bridge

use godot_bridge::RemoteEndpoint;
use godot_bridge_core::{BridgeError, Result, error_codes};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::GodotBridgeServer;
use crate::mcp::{RequestId, Response};

/// Tool definition for MCP tools/list
#[derive(Debug, Clone, Serialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

fn tool(name: &str, description: &str, input_schema: Value) -> ToolDef {
    ToolDef {
        name: name.into(),
        description: description.into(),
        input_schema,
    }
}

fn no_arguments() -> Value {
    json!({ "type": "object", "properties": {} })
}

fn clear_argument() -> Value {
    json!({
        "type": "object",
        "properties": {
            "clear": {
                "type": "boolean",
                "description": "Drop the returned lines from the buffer",
                "default": false
            }
        }
    })
}

/// Get list of available tools
pub fn list_tools() -> Vec<ToolDef> {
    vec![
        tool(
            "debug_connect",
            "Connect to the Godot debug adapter (default 127.0.0.1:6006) and run the initialize handshake. Returns adapter capabilities.",
            no_arguments(),
        ),
        tool(
            "debug_attach",
            "Attach to (or launch) the running game. Stepping tools re-attach automatically.",
            json!({
                "type": "object",
                "properties": {
                    "arguments": {
                        "type": "object",
                        "description": "Raw attach/launch arguments passed to the adapter"
                    },
                    "launch": {
                        "type": "boolean",
                        "description": "Send launch instead of attach",
                        "default": false
                    }
                }
            }),
        ),
        tool(
            "debug_set_breakpoints",
            "Replace all breakpoints in a script. Example: {\"path\": \"res://player.gd\", \"lines\": [12, 30]}",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Script path, e.g. res://player.gd" },
                    "lines": {
                        "type": "array",
                        "items": { "type": "integer", "minimum": 1 },
                        "description": "1-based line numbers"
                    }
                },
                "required": ["path", "lines"]
            }),
        ),
        tool(
            "debug_add_breakpoint",
            "Add one breakpoint, keeping the others in the file",
            breakpoint_line_schema(),
        ),
        tool(
            "debug_remove_breakpoint",
            "Remove one breakpoint, keeping the others in the file",
            breakpoint_line_schema(),
        ),
        tool("debug_continue", "Resume execution", no_arguments()),
        tool("debug_pause", "Pause execution", no_arguments()),
        tool("debug_step_over", "Step over the current line", no_arguments()),
        tool("debug_step_into", "Step into the call on the current line", no_arguments()),
        tool("debug_step_out", "Run until the current function returns", no_arguments()),
        tool(
            "debug_stack_trace",
            "Get the call stack of a thread (defaults to the last stopped thread)",
            json!({
                "type": "object",
                "properties": {
                    "thread_id": { "type": "integer" }
                }
            }),
        ),
        tool(
            "debug_scopes",
            "List the variable scopes of a stack frame",
            json!({
                "type": "object",
                "properties": {
                    "frame_id": { "type": "integer", "description": "Frame id from debug_stack_trace" }
                },
                "required": ["frame_id"]
            }),
        ),
        tool(
            "debug_variables",
            "Expand a variables reference from debug_scopes or a previous debug_variables call",
            json!({
                "type": "object",
                "properties": {
                    "variables_reference": { "type": "integer" }
                },
                "required": ["variables_reference"]
            }),
        ),
        tool(
            "debug_evaluate",
            "Evaluate a GDScript expression in the paused game",
            json!({
                "type": "object",
                "properties": {
                    "expression": { "type": "string" },
                    "frame_id": { "type": "integer" }
                },
                "required": ["expression"]
            }),
        ),
        tool(
            "debug_request",
            "Send a raw Debug Adapter Protocol command",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "DAP command, e.g. threads" },
                    "arguments": { "type": "object" }
                },
                "required": ["command"]
            }),
        ),
        tool("debug_output", "Read captured game output", clear_argument()),
        tool("debug_disconnect", "Disconnect from the debug adapter", no_arguments()),
        tool(
            "editor_invoke",
            "Run an editor plugin command. Commands naming the same scene_path, resource_path, script_path or path run one at a time in call order.",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Plugin command, e.g. get_scene_tree" },
                    "params": { "type": "object" }
                },
                "required": ["command"]
            }),
        ),
        tool("editor_output", "Read captured editor output", clear_argument()),
        tool("bridge_status", "Connection state of both channels", no_arguments()),
    ]
}

fn breakpoint_line_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "path": { "type": "string", "description": "Script path, e.g. res://player.gd" },
            "line": { "type": "integer", "minimum": 1 }
        },
        "required": ["path", "line"]
    })
}

/// Parameters for debug_attach
#[derive(Debug, Default, Deserialize)]
pub struct AttachParams {
    #[serde(default)]
    pub arguments: Option<Value>,
    #[serde(default)]
    pub launch: bool,
}

/// Parameters for debug_set_breakpoints
#[derive(Debug, Deserialize)]
pub struct SetBreakpointsParams {
    pub path: String,
    pub lines: Vec<u32>,
}

/// Parameters for debug_add_breakpoint / debug_remove_breakpoint
#[derive(Debug, Deserialize)]
pub struct BreakpointParams {
    pub path: String,
    pub line: u32,
}

#[derive(Debug, Deserialize)]
struct StackTraceParams {
    #[serde(default)]
    thread_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ScopesParams {
    frame_id: i64,
}

#[derive(Debug, Deserialize)]
struct VariablesParams {
    variables_reference: i64,
}

#[derive(Debug, Deserialize)]
struct EvaluateParams {
    expression: String,
    #[serde(default)]
    frame_id: Option<i64>,
}

/// Parameters for debug_request
#[derive(Debug, Deserialize)]
pub struct RawRequestParams {
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Parameters for editor_invoke
#[derive(Debug, Deserialize)]
pub struct InvokeParams {
    pub command: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Default, Deserialize)]
struct OutputParams {
    #[serde(default)]
    clear: bool,
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| BridgeError::InvalidArguments(e.to_string()))
}

/// JSON-RPC error code for a bridge failure
pub fn error_code(error: &BridgeError) -> i32 {
    match error {
        BridgeError::RemoteFailure { .. } => error_codes::REMOTE_FAILURE,
        BridgeError::RequestTimeout { .. } => error_codes::REQUEST_TIMEOUT,
        BridgeError::InvalidArguments(_) => error_codes::INVALID_PARAMS,
        e if e.is_connection_error() => error_codes::NOT_CONNECTED,
        _ => error_codes::INTERNAL_ERROR,
    }
}

/// Handle a tools/call request
pub async fn handle_tool_call(
    name: &str,
    params: Value,
    id: RequestId,
    server: &GodotBridgeServer,
) -> Response {
    let result = match name {
        "debug_connect" => server.dap().connect().await,
        "debug_attach" => handle_attach(params, server).await,
        "debug_set_breakpoints" => handle_set_breakpoints(params, server).await,
        "debug_add_breakpoint" => match parse::<BreakpointParams>(params) {
            Ok(p) => server.dap().add_breakpoint(&p.path, p.line).await,
            Err(e) => Err(e),
        },
        "debug_remove_breakpoint" => match parse::<BreakpointParams>(params) {
            Ok(p) => server.dap().remove_breakpoint(&p.path, p.line).await,
            Err(e) => Err(e),
        },
        "debug_continue" => server.dap().continue_execution().await,
        "debug_pause" => server.dap().pause().await,
        "debug_step_over" => server.dap().step_over().await,
        "debug_step_into" => server.dap().step_into().await,
        "debug_step_out" => server.dap().step_out().await,
        "debug_stack_trace" => match parse::<StackTraceParams>(params) {
            Ok(p) => server.dap().stack_trace(p.thread_id).await,
            Err(e) => Err(e),
        },
        "debug_scopes" => match parse::<ScopesParams>(params) {
            Ok(p) => server.dap().scopes(p.frame_id).await,
            Err(e) => Err(e),
        },
        "debug_variables" => match parse::<VariablesParams>(params) {
            Ok(p) => server.dap().variables(p.variables_reference).await,
            Err(e) => Err(e),
        },
        "debug_evaluate" => match parse::<EvaluateParams>(params) {
            Ok(p) => server.dap().evaluate(&p.expression, p.frame_id).await,
            Err(e) => Err(e),
        },
        "debug_request" => match parse::<RawRequestParams>(params) {
            Ok(p) => server.dap().send_request(&p.command, p.arguments).await,
            Err(e) => Err(e),
        },
        "debug_output" => handle_output(params, server.dap()),
        "debug_disconnect" => server
            .dap()
            .disconnect()
            .await
            .map(|()| json!({ "disconnected": true })),
        "editor_invoke" => match parse::<InvokeParams>(params) {
            Ok(p) => server.editor().invoke(&p.command, p.params).await,
            Err(e) => Err(e),
        },
        "editor_output" => handle_output(params, server.editor()),
        "bridge_status" => handle_status(server),
        _ => Err(BridgeError::InvalidArguments(format!("Unknown tool: {}", name))),
    };

    match result {
        Ok(value) => Response::success(
            id,
            json!({ "content": [{ "type": "text", "text": value.to_string() }] }),
        ),
        Err(e) => Response::error(id, error_code(&e), e.to_string()),
    }
}

async fn handle_attach(params: Value, server: &GodotBridgeServer) -> Result<Value> {
    let p: AttachParams = parse(params)?;
    let arguments = p.arguments.unwrap_or_else(|| json!({}));
    if p.launch {
        server.dap().launch(arguments).await
    } else {
        server.dap().attach(arguments).await
    }
}

async fn handle_set_breakpoints(params: Value, server: &GodotBridgeServer) -> Result<Value> {
    let p: SetBreakpointsParams = parse(params)?;
    if p.lines.contains(&0) {
        return Err(BridgeError::InvalidArguments(
            "breakpoint lines start at 1".into(),
        ));
    }
    server.dap().set_breakpoints(&p.path, &p.lines).await?;
    Ok(json!({ "path": p.path, "lines": server.dap().breakpoints(&p.path) }))
}

fn handle_output(params: Value, endpoint: &dyn RemoteEndpoint) -> Result<Value> {
    let p: OutputParams = parse(params)?;
    Ok(json!({ "lines": endpoint.buffered_events(p.clear) }))
}

fn handle_status(server: &GodotBridgeServer) -> Result<Value> {
    Ok(json!({
        "dap": serde_json::to_value(server.dap().status())?,
        "editor": serde_json::to_value(server.editor().status())?,
    }))
}
