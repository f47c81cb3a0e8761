//! Script execution requests sent to runners on the app queue.

use serde::{Deserialize, Serialize};

use super::store::AppRecord;

/// Body of a run-script call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptRequest {
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub input: String,
}

/// What a runner receives as the work payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub file_path: String,
    pub input: String,
    /// `KEY=VALUE` pairs from the app's secrets.
    pub env: Vec<String>,
}

impl Script {
    /// Merge a request with the app's defaults and secrets. Returns `None`
    /// when neither names a script file.
    pub fn for_app(app: &AppRecord, request: ScriptRequest) -> Option<Self> {
        let file_path = request
            .file_path
            .filter(|p| !p.trim().is_empty())
            .or_else(|| app.config.script.file_path.clone())?;
        Some(Self {
            file_path,
            input: request.input,
            env: app.config.env_pairs(),
        })
    }
}

/// Render a runner reply for the HTTP caller. JSON replies pass through
/// untouched; anything else is returned as text output.
pub fn render_reply(reply: &[u8]) -> serde_json::Value {
    serde_json::from_slice(reply).unwrap_or_else(|_| {
        serde_json::json!({ "output": String::from_utf8_lossy(reply) })
    })
}
