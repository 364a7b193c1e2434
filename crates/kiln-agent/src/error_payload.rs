use crate::error::SupervisorError;

/// Marks a line whose remainder is an [`ErrorPayload`] as JSON.
pub const PREFIX: &str = "KILN_ERROR_JSON:";

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;
const CLIPPED: &str = "…(truncated)";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Cuts `s` to at most `max_bytes` on a char boundary, marking the cut.
fn clip(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let budget = max_bytes.saturating_sub(CLIPPED.len()).max(1);
    let end = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= budget)
        .last()
        .unwrap_or(0);
    format!("{}{CLIPPED}", &s[..end])
}

impl From<&SupervisorError> for ErrorPayload {
    fn from(err: &SupervisorError) -> Self {
        Self {
            code: err.code().to_string(),
            message: clip(&err.to_string(), MAX_MESSAGE_BYTES),
            hint: err.hint().map(|h| clip(&h, MAX_HINT_BYTES)),
        }
    }
}

/// Renders an error as one prefixed JSON line that a transport can forward as is.
pub fn encode(err: &SupervisorError) -> String {
    let json = serde_json::to_string(&ErrorPayload::from(err))
        .unwrap_or_else(|_| r#"{"code":"internal","message":"serialize_failed"}"#.to_string());
    format!("{PREFIX}{json}")
}

/// Parses a line produced by [`encode`]. Anything else yields `None`.
pub fn decode(line: &str) -> Option<ErrorPayload> {
    let json = line.trim().strip_prefix(PREFIX)?;
    serde_json::from_str(json).ok()
}
