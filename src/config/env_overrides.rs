use super::Config;
use std::path::PathBuf;

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("REPO_DIR").or_else(|_| std::env::var("MIND_REPO_DIR"))
            && !dir.is_empty()
        {
            self.repo_dir = PathBuf::from(dir);
        }

        if let Ok(path) = std::env::var("DB_PATH")
            && !path.is_empty()
        {
            self.database.path = PathBuf::from(path);
        }

        if let Ok(raw) = std::env::var("DB_MAX_CONNECTIONS")
            && let Ok(n) = raw.parse::<u32>()
            && n > 0
        {
            self.database.max_connections = n;
        }

        if let Ok(raw) = std::env::var("DB_CONNECT_RETRIES")
            && let Ok(n) = raw.parse::<u32>()
        {
            self.database.connect_retries = n;
        }

        if let Ok(raw) = std::env::var("ENGINE_ENABLED") {
            match parse_flag(&raw) {
                Some(enabled) => self.engine.enabled = enabled,
                None => tracing::warn!(value = %raw, "ignoring unrecognised ENGINE_ENABLED"),
            }
        }

        if let Ok(name) = std::env::var("MIND_ACTOR_NAME")
            && !name.is_empty()
        {
            self.engine.actor_name = name;
        }

        if let Ok(raw) = std::env::var("MIND_TICK_SECS")
            && let Ok(secs) = raw.parse::<u64>()
            && secs > 0
        {
            self.engine.tick_interval_secs = secs;
        }

        if let Ok(bin) = std::env::var("CLAUDE_BIN")
            && !bin.is_empty()
        {
            self.tool.binary = bin;
        }

        if let Ok(dir) = std::env::var("TOOLCHAIN_BIN")
            && !dir.is_empty()
        {
            self.tool.toolchain_bin = PathBuf::from(dir);
        }
    }
}
