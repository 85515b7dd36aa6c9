//! External → internal model-ID translation.

/// Map a client-facing model name to the upstream model ID.
///
/// Exact matches win; `auto` selects the enhanced sonnet; anything unknown is
/// passed through untouched and left for the upstream to accept or reject.
/// Never fails.
pub fn internal_id(external: &str) -> &str {
    match external {
        "claude-opus-4-5" | "claude-opus-4-5-20251101" | "claude-opus-4.5" => "claude-opus-4.5",
        "claude-haiku-4-5" | "claude-haiku-4.5" => "claude-haiku-4.5",
        "claude-sonnet-4-5" | "claude-sonnet-4-5-20250929" | "CLAUDE_SONNET_4_5_20250929_V1_0" => {
            "CLAUDE_SONNET_4_5_20250929_V1_0"
        }
        "claude-sonnet-4" | "claude-sonnet-4-20250514" | "CLAUDE_SONNET_4_20250514_V1_0" => {
            "CLAUDE_SONNET_4_20250514_V1_0"
        }
        "claude-3-7-sonnet-20250219" | "CLAUDE_3_7_SONNET_20250219_V1_0" => {
            "CLAUDE_3_7_SONNET_20250219_V1_0"
        }
        "auto" => "claude-sonnet-4.5",
        other => other,
    }
}
