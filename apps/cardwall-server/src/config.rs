use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 8780;

/// Directory holding the SQLite store. `CARDWALL_STATE_DIR` wins;
/// otherwise `.cardwall` under the current directory.
pub fn state_dir() -> PathBuf {
    std::env::var("CARDWALL_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".cardwall"))
}

pub fn default_port() -> u16 {
    std::env::var("CARDWALL_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub fn admin_token() -> Option<String> {
    std::env::var("CARDWALL_ADMIN_TOKEN")
        .ok()
        .filter(|t| !t.is_empty())
}

pub fn debug_mode() -> bool {
    env_truthy("CARDWALL_DEBUG")
}

pub fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}
