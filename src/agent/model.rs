pub const HAIKU: &str = "claude-haiku-4-5-20251001";
pub const SONNET: &str = "claude-sonnet-4-5-20250929";

/// Expand a short alias; anything else is passed through as a full model id.
pub fn resolve(name: &str) -> &str {
  match name.to_lowercase().as_str() {
    "haiku" => HAIKU,
    "sonnet" => SONNET,
    _ => name,
  }
}
