use std::env;

/// Database configuration.
///
/// Reads from the `CONTROL_DB_PATH` environment variable, falling back to
/// `control_plane.db` in the current directory when unset. The special
/// value `:memory:` opens a private in-memory database, used by tests and
/// ephemeral runs.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// File path, or `:memory:`.
    pub db_path: String,
}

impl DbConfig {
    /// The default path used when no environment variable is set.
    pub const DEFAULT_PATH: &str = "control_plane.db";

    /// Build a config from the environment.
    ///
    /// Priority: `CONTROL_DB_PATH` env var, then the compile-time default.
    pub fn from_env() -> Self {
        let db_path =
            env::var("CONTROL_DB_PATH").unwrap_or_else(|_| Self::DEFAULT_PATH.to_owned());
        Self { db_path }
    }

    /// Build a config from an explicit path (useful for tests and CLI flags).
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// An in-memory database, private to the connection that opens it.
    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }

    /// Whether this config points at an in-memory (non-durable) database.
    pub fn is_in_memory(&self) -> bool {
        self.db_path == ":memory:"
    }

    /// The `sqlx` connection URL for this config.
    pub fn connect_url(&self) -> String {
        if self.is_in_memory() {
            "sqlite::memory:".to_owned()
        } else {
            format!("sqlite://{}?mode=rwc", self.db_path)
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path() {
        let cfg = DbConfig::new(DbConfig::DEFAULT_PATH);
        assert_eq!(cfg.db_path, "control_plane.db");
    }

    #[test]
    fn in_memory_detection() {
        let cfg = DbConfig::in_memory();
        assert!(cfg.is_in_memory());
        assert_eq!(cfg.connect_url(), "sqlite::memory:");
    }

    #[test]
    fn file_backed_connect_url() {
        let cfg = DbConfig::new("/tmp/control.db");
        assert_eq!(cfg.connect_url(), "sqlite:///tmp/control.db?mode=rwc");
    }
}
