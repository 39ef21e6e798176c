//! Newline-delimited JSON-RPC 2.0 transport
//!
//! One request per line in, one response per line out. Requests are handled
//! concurrently, so responses arrive in completion order and callers match
//! them by `id`. Supported methods
//! are `initialize`, `ping`, `tools/list` and `tools/call`. Requests without
//! an `id` are notifications and get no response.
//!
//! Operation failures are not protocol errors: a failed `tools/call` returns
//! a normal result with `isError: true` and the error payload as content.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value as Json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::tools::ToolTable;

/// Protocol revision announced by `initialize`
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<Json>,
    method: String,
    #[serde(default)]
    params: Json,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Json,
}

/// Serve requests from `reader` until end of input and every in-flight
/// request has answered.
pub async fn serve<R, W>(reader: R, mut writer: W, tools: &ToolTable) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut in_flight = FuturesUnordered::new();
    let mut input_open = true;

    while input_open || !in_flight.is_empty() {
        tokio::select! {
            line = lines.next_line(), if input_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => in_flight.push(async move { handle_message(tools, &line).await }),
                None => {
                    debug!(pending = in_flight.len(), "input closed");
                    input_open = false;
                }
            },
            Some(response) = in_flight.next(), if !in_flight.is_empty() => {
                if let Some(response) = response {
                    writer.write_all(response.to_string().as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await?;
                }
            }
        }
    }
    Ok(())
}

/// Handle one raw message, returning the response if one is due
pub async fn handle_message(tools: &ToolTable, line: &str) -> Option<Json> {
    let raw: Json = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "unparseable message");
            return Some(error_response(Json::Null, PARSE_ERROR, e.to_string()));
        }
    };

    let id_hint = raw.get("id").cloned().unwrap_or(Json::Null);
    let request: Request = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(e) => return Some(error_response(id_hint, INVALID_REQUEST, e.to_string())),
    };

    if request.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
        return Some(error_response(
            id_hint,
            INVALID_REQUEST,
            "unsupported jsonrpc version".to_string(),
        ));
    }

    let Some(id) = request.id else {
        debug!(method = %request.method, "notification ignored");
        return None;
    };

    let result = match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": { "tools": {} },
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tools.list() })),
        "tools/call" => match serde_json::from_value::<CallParams>(request.params) {
            Ok(call) => Ok(call_tool(tools, call).await),
            Err(e) => Err((INVALID_PARAMS, e.to_string())),
        },
        other => Err((METHOD_NOT_FOUND, format!("method not found: {other}"))),
    };

    Some(match result {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err((code, message)) => error_response(id, code, message),
    })
}

async fn call_tool(tools: &ToolTable, call: CallParams) -> Json {
    let (payload, is_error) = match tools.dispatch(&call.name, call.arguments).await {
        Ok(payload) => (payload, false),
        Err(e) => {
            debug!(tool = %call.name, kind = e.kind(), error = %e, "operation failed");
            (e.to_payload(), true)
        }
    };

    json!({
        "content": [{ "type": "text", "text": payload.to_string() }],
        "structuredContent": payload,
        "isError": is_error,
    })
}

fn error_response(id: Json, code: i64, message: String) -> Json {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}
