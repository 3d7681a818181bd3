// Copyright © 2025 rustmailer.com
// Licensed under RustMailer License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::code::ErrorCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

pub mod tools;

pub use tools::{dispatch, ToolContext};

#[derive(Deserialize)]
struct ToolCall {
    tool: String,
    #[serde(default)]
    args: Value,
    id: Option<Value>,
}

/// Line-delimited JSON over stdio: `{"tool": ..., "args": {...}, "id"?}`
/// in, `{"id"?, "result"|"error"}` out. The outer protocol framing is the
/// host's concern; this loop only answers tool calls.
pub async fn serve(ctx: ToolContext) -> std::io::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    info!("query server ready");
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ToolCall>(&line) {
            Ok(call) => {
                debug!(tool = %call.tool, "tool invocation");
                let mut response = dispatch(&ctx, &call.tool, call.args).await;
                if let Some(id) = call.id {
                    response["id"] = id;
                }
                response
            }
            Err(e) => json!({
                "error": {
                    "code": ErrorCode::InvalidParameter.wire_name(),
                    "message": format!("undecodable tool call: {e}"),
                }
            }),
        };
        let mut body = serde_json::to_vec(&response)?;
        body.push(b'\n');
        stdout.write_all(&body).await?;
        stdout.flush().await?;
    }
    info!("stdin closed, query server exiting");
    Ok(())
}
