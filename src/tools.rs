//! MCP tool definitions and handlers.
//!
//! Each tool is defined as a JSON schema (returned by [`tool_definitions`])
//! and handled by an async function dispatched from [`handle_tool_call`].
//! Tools forward to [`ObsClient`]; the remote request catalog itself is not
//! modelled here, `obs-request` passes any request type through verbatim.
//!
//! ## Tools
//!
//! - `obs-request`, `obs-request-batch`: generic pass-through
//! - `obs-get-version`, `obs-get-stats`, `obs-get-scene-list`,
//!   `obs-set-current-program-scene`: common shortcuts
//! - `obs-connection-status`: local session state
//! - `obs-recent-events`: events buffered from the catch-all subscription

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::client::ObsClient;
use crate::events::ObsEvent;
use crate::protocol::BatchRequest;

/// Events kept for `obs-recent-events`.
pub const RECENT_EVENTS_CAPACITY: usize = 200;
const DEFAULT_RECENT_EVENTS: usize = 20;

/// Bounded buffer of the most recent events, oldest first.
pub struct RecentEvents {
    entries: Mutex<VecDeque<ObsEvent>>,
    capacity: usize,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, event: ObsEvent) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(event);
    }

    /// Up to `limit` most recent events, oldest first.
    pub fn latest(&self, limit: usize) -> Vec<ObsEvent> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }
}

/// Everything a tool handler needs.
pub struct ToolContext {
    pub client: ObsClient,
    pub recent: Arc<RecentEvents>,
}

impl ToolContext {
    /// Wrap a client and start buffering its events.
    pub fn new(client: ObsClient) -> Self {
        let recent = Arc::new(RecentEvents::new(RECENT_EVENTS_CAPACITY));
        let buffer = Arc::clone(&recent);
        client.on_any(move |event| {
            buffer.push(event.clone());
            Ok(())
        });
        Self { client, recent }
    }
}

/// Result of an MCP tool call, ready to be serialized into a JSON-RPC response.
pub struct ToolResult {
    /// MCP content blocks (a single `{"type":"text","text":"..."}` entry).
    pub content: Vec<Value>,
    /// Maps to `isError` in the MCP response.
    pub is_error: bool,
}

impl ToolResult {
    fn success(value: &Value) -> Self {
        let text = serde_json::to_string_pretty(value).unwrap_or_default();
        Self {
            content: vec![json!({ "type": "text", "text": text })],
            is_error: false,
        }
    }

    fn message(text: &str) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": text })],
            is_error: false,
        }
    }

    fn error(message: String) -> Self {
        Self {
            content: vec![json!({ "type": "text", "text": message })],
            is_error: true,
        }
    }
}

pub fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "obs-request",
            "description": "Send any obs-websocket request (e.g. GetInputList, SetInputMute, StartStream) and return its responseData.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "requestType": {
                        "type": "string",
                        "description": "obs-websocket request type, e.g. GetSceneItemList."
                    },
                    "requestData": {
                        "type": "object",
                        "description": "Request fields as documented for the request type."
                    },
                    "timeoutMs": {
                        "type": "integer",
                        "description": "Response timeout in milliseconds. Default is 10000."
                    }
                },
                "required": ["requestType"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "obs-request-batch",
            "description": "Send several obs-websocket requests in one batch and return each result with its status.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "requests": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "requestType": { "type": "string" },
                                "requestData": { "type": "object" }
                            },
                            "required": ["requestType"]
                        }
                    },
                    "haltOnFailure": {
                        "type": "boolean",
                        "description": "Stop at the first failing request. Default false."
                    }
                },
                "required": ["requests"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "obs-get-version",
            "description": "Gets data about the current plugin and RPC version.",
            "inputSchema": { "type": "object", "properties": {}, "additionalProperties": false }
        }),
        json!({
            "name": "obs-get-stats",
            "description": "Gets statistics about OBS, obs-websocket, and the current session.",
            "inputSchema": { "type": "object", "properties": {}, "additionalProperties": false }
        }),
        json!({
            "name": "obs-get-scene-list",
            "description": "Gets an array of all scenes in OBS and the current program/preview scenes.",
            "inputSchema": { "type": "object", "properties": {}, "additionalProperties": false }
        }),
        json!({
            "name": "obs-set-current-program-scene",
            "description": "Sets the current program scene.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "sceneName": {
                        "type": "string",
                        "description": "Scene name to set as the current program scene."
                    }
                },
                "required": ["sceneName"],
                "additionalProperties": false
            }
        }),
        json!({
            "name": "obs-connection-status",
            "description": "Report the local connection state to OBS and the negotiated RPC version.",
            "inputSchema": { "type": "object", "properties": {}, "additionalProperties": false }
        }),
        json!({
            "name": "obs-recent-events",
            "description": "Return the most recent events pushed by OBS (scene changes, stream state, input changes, ...).",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "limit": {
                        "type": "integer",
                        "description": "Maximum number of events to return. Default 20."
                    },
                    "eventType": {
                        "type": "string",
                        "description": "Only return events of this type."
                    }
                },
                "additionalProperties": false
            }
        }),
    ]
}

/// Handle a tool call and return MCP content.
pub async fn handle_tool_call(name: &str, args: &Value, ctx: &ToolContext) -> ToolResult {
    match name {
        "obs-connection-status" => return handle_connection_status(ctx),
        "obs-recent-events" => return handle_recent_events(args, ctx),
        _ => {}
    }

    if !tool_definitions().iter().any(|t| t["name"] == name) {
        return ToolResult::error(format!("Unknown tool: {name}"));
    }

    // Connect lazily; also recovers after OBS restarts.
    if !ctx.client.is_ready() {
        debug!(tool = name, "Not connected, connecting before tool call");
        if let Err(e) = ctx.client.connect().await {
            return ToolResult::error(format!("Failed to connect to OBS: {e}"));
        }
    }

    match name {
        "obs-request" => handle_request(args, ctx).await,
        "obs-request-batch" => handle_request_batch(args, ctx).await,
        "obs-get-version" => simple_request(ctx, "GetVersion", None).await,
        "obs-get-stats" => simple_request(ctx, "GetStats", None).await,
        "obs-get-scene-list" => simple_request(ctx, "GetSceneList", None).await,
        "obs-set-current-program-scene" => handle_set_current_program_scene(args, ctx).await,
        _ => ToolResult::error(format!("Unknown tool: {name}")),
    }
}

async fn simple_request(ctx: &ToolContext, request_type: &str, data: Option<Value>) -> ToolResult {
    match ctx.client.send_request(request_type, data).await {
        Ok(v) => ToolResult::success(&v),
        Err(e) => ToolResult::error(format!("Error calling {request_type}: {e}")),
    }
}

async fn handle_request(args: &Value, ctx: &ToolContext) -> ToolResult {
    let Some(request_type) = args.get("requestType").and_then(Value::as_str) else {
        return ToolResult::error("Missing required parameter: requestType".into());
    };
    let data = args.get("requestData").cloned();
    let timeout = args
        .get("timeoutMs")
        .and_then(Value::as_u64)
        .map_or(ctx.client.options().request_timeout, Duration::from_millis);

    match ctx
        .client
        .send_request_with_timeout(request_type, data, timeout)
        .await
    {
        Ok(v) => ToolResult::success(&v),
        Err(e) => ToolResult::error(format!("Error calling {request_type}: {e}")),
    }
}

async fn handle_request_batch(args: &Value, ctx: &ToolContext) -> ToolResult {
    let Some(items) = args.get("requests").and_then(Value::as_array) else {
        return ToolResult::error("Missing required parameter: requests (array)".into());
    };
    let mut requests = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let Some(request_type) = item.get("requestType").and_then(Value::as_str) else {
            return ToolResult::error(format!("requests[{i}] is missing requestType"));
        };
        requests.push(BatchRequest {
            request_type: request_type.to_string(),
            request_id: None,
            request_data: item.get("requestData").cloned(),
        });
    }
    let halt_on_failure = args
        .get("haltOnFailure")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    match ctx.client.send_batch(requests, halt_on_failure).await {
        Ok(results) => ToolResult::success(&json!({ "results": results })),
        Err(e) => ToolResult::error(format!("Error sending request batch: {e}")),
    }
}

async fn handle_set_current_program_scene(args: &Value, ctx: &ToolContext) -> ToolResult {
    let Some(scene_name) = args.get("sceneName").and_then(Value::as_str) else {
        return ToolResult::error("Missing required parameter: sceneName".into());
    };
    match ctx
        .client
        .send_request("SetCurrentProgramScene", Some(json!({ "sceneName": scene_name })))
        .await
    {
        Ok(_) => ToolResult::message(&format!("Switched to scene '{scene_name}'")),
        Err(e) => ToolResult::error(format!("Error setting current program scene: {e}")),
    }
}

fn handle_connection_status(ctx: &ToolContext) -> ToolResult {
    let client = &ctx.client;
    ToolResult::success(&json!({
        "url": client.options().url,
        "state": format!("{:?}", client.state()),
        "negotiatedRpcVersion": client.negotiated_rpc_version(),
        "eventSubscriptions": client.event_subscriptions().bits(),
        "pendingRequests": client.pending_requests().len(),
    }))
}

fn handle_recent_events(args: &Value, ctx: &ToolContext) -> ToolResult {
    let limit = args
        .get("limit")
        .and_then(Value::as_u64)
        .map_or(DEFAULT_RECENT_EVENTS, |l| l as usize);
    let filter = args.get("eventType").and_then(Value::as_str);

    let events: Vec<Value> = ctx
        .recent
        .latest(RECENT_EVENTS_CAPACITY)
        .into_iter()
        .filter(|e| filter.map_or(true, |f| e.event_type == f))
        .map(|e| json!({ "eventType": e.event_type, "eventData": e.event_data }))
        .collect();
    let skip = events.len().saturating_sub(limit);

    ToolResult::success(&json!({ "events": &events[skip..] }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientOptions;

    fn event(event_type: &str, n: u64) -> ObsEvent {
        ObsEvent {
            event_type: event_type.to_string(),
            event_intent: 4,
            event_data: json!({ "n": n }),
        }
    }

    fn context() -> ToolContext {
        // Nothing listens here; tools that need OBS fail to connect.
        ToolContext::new(ObsClient::new(ClientOptions::new("ws://127.0.0.1:9")))
    }

    fn text(result: &ToolResult) -> &str {
        result.content[0]["text"].as_str().unwrap()
    }

    #[test]
    fn recent_events_is_bounded() {
        let recent = RecentEvents::new(3);
        for n in 0..5 {
            recent.push(event("SceneCreated", n));
        }
        let latest = recent.latest(10);
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[0].event_data["n"], 2);
        assert_eq!(recent.latest(1)[0].event_data["n"], 4);
    }

    #[test]
    fn definitions_have_unique_names_and_schemas() {
        let defs = tool_definitions();
        let mut names: Vec<&str> = defs.iter().map(|d| d["name"].as_str().unwrap()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), defs.len());
        assert!(defs.iter().all(|d| d["inputSchema"]["type"] == "object"));
    }

    #[tokio::test]
    async fn unknown_tool_is_error() {
        let ctx = context();
        let result = handle_tool_call("obs-nope", &json!({}), &ctx).await;
        assert!(result.is_error);
        assert_eq!(text(&result), "Unknown tool: obs-nope");
    }

    #[tokio::test]
    async fn connection_status_works_offline() {
        let ctx = context();
        let result = handle_tool_call("obs-connection-status", &json!({}), &ctx).await;
        assert!(!result.is_error);
        let status: Value = serde_json::from_str(text(&result)).unwrap();
        assert_eq!(status["state"], "Idle");
        assert_eq!(status["negotiatedRpcVersion"], Value::Null);
        assert_eq!(status["eventSubscriptions"], 2047);
    }

    #[tokio::test]
    async fn recent_events_filters_and_limits() {
        let ctx = context();
        ctx.recent.push(event("SceneCreated", 1));
        ctx.recent.push(event("InputMuteStateChanged", 2));
        ctx.recent.push(event("SceneCreated", 3));

        let result = handle_tool_call(
            "obs-recent-events",
            &json!({ "eventType": "SceneCreated", "limit": 1 }),
            &ctx,
        )
        .await;
        let body: Value = serde_json::from_str(text(&result)).unwrap();
        assert_eq!(body["events"].as_array().unwrap().len(), 1);
        assert_eq!(body["events"][0]["eventData"]["n"], 3);
    }

    #[tokio::test]
    async fn request_tool_reports_connect_failure() {
        let ctx = context();
        let result =
            handle_tool_call("obs-request", &json!({ "requestType": "GetVersion" }), &ctx).await;
        assert!(result.is_error);
        assert!(text(&result).starts_with("Failed to connect to OBS"));
    }
}
