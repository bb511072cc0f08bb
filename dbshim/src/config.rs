//! Connection settings.
//!
//! Settings come from a TOML file describing named connections. The raw
//! serde structs are normalized into typed configs here, so every
//! misconfiguration (unknown type string, dangling cache backing, inverted
//! cache TTL bounds) surfaces at load time instead of at call time.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::errors::{DbError, DbResult};

/// The historical MySQL driver flavor a connection goes through.
///
/// Both ride the same wire driver; the flavor preserves the capability
/// differences of the original APIs (warnings, multi-statement, charset
/// and timezone handshake).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverFlavor {
    /// The legacy driver API: no charset handshake, no warnings, no
    /// multi-statement support.
    Legacy,
    /// The improved driver API.
    Improved,
}

/// What a named connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    MySql(DriverFlavor),
    /// A query-result cache in front of a backing MySQL connection.
    Cache,
}

impl ConnectionKind {
    fn parse(name: &str, s: &str) -> DbResult<Self> {
        match s.to_lowercase().as_str() {
            "mysql" => Ok(ConnectionKind::MySql(DriverFlavor::Legacy)),
            "mysqli" | "mysql-improved" => Ok(ConnectionKind::MySql(DriverFlavor::Improved)),
            "memcache" | "cache" => Ok(ConnectionKind::Cache),
            other => Err(DbError::Config(format!(
                "database type '{}' for connection '{}' not supported",
                other, name
            ))),
        }
    }
}

/// Bounds for the reconnect-and-replay cycle, as configured.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_replays: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_replays: 5,
            min_delay_ms: 2_000,
            max_delay_ms: 12_000,
        }
    }
}

/// Settings for a MySQL connection (either flavor).
#[derive(Debug, Clone)]
pub struct MySqlConfig {
    pub flavor: DriverFlavor,
    pub hostname: Option<String>,
    pub port: u16,
    /// Unix socket path, used instead of hostname/port when set.
    pub socket: Option<String>,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Charset handshake option. The improved flavor defaults to "utf8";
    /// the legacy flavor leaves the driver default.
    pub charset: Option<String>,
    /// When set, the improved flavor runs `SET time_zone = '...'` after
    /// connecting.
    pub set_timezone: Option<String>,
    pub connect_on_demand: bool,
    pub non_fatal: bool,
    pub retry: RetryConfig,
}

/// Settings for a cache connection.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Name of the MySQL connection queried on a miss.
    pub backing: String,
    /// Cache server URL, e.g. `redis://127.0.0.1:6379`.
    pub server: String,
    pub min_cache_minutes: u64,
    pub max_cache_minutes: u64,
    pub connect_on_demand: bool,
    pub non_fatal: bool,
}

/// Normalized settings for one named connection.
#[derive(Debug, Clone)]
pub enum ConnectionConfig {
    MySql(MySqlConfig),
    Cache(CacheConfig),
}

impl ConnectionConfig {
    pub fn kind(&self) -> ConnectionKind {
        match self {
            ConnectionConfig::MySql(c) => ConnectionKind::MySql(c.flavor),
            ConnectionConfig::Cache(_) => ConnectionKind::Cache,
        }
    }

    pub fn connect_on_demand(&self) -> bool {
        match self {
            ConnectionConfig::MySql(c) => c.connect_on_demand,
            ConnectionConfig::Cache(c) => c.connect_on_demand,
        }
    }

    pub fn non_fatal(&self) -> bool {
        match self {
            ConnectionConfig::MySql(c) => c.non_fatal,
            ConnectionConfig::Cache(c) => c.non_fatal,
        }
    }
}

/// The full settings file: named connections.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub connections: BTreeMap<String, ConnectionConfig>,
}

impl Settings {
    /// Reads and validates a settings file.
    pub fn load(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DbError::Config(format!("could not read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Parses and validates settings from TOML text.
    pub fn from_toml(text: &str) -> DbResult<Self> {
        let raw: RawSettings = toml::from_str(text)
            .map_err(|e| DbError::Config(format!("settings parse error: {}", e)))?;

        let mut connections = BTreeMap::new();
        for (name, raw_conn) in raw.connections {
            let config = normalize(&name, raw_conn)?;
            connections.insert(name, config);
        }

        // Cache connections must point at an existing MySQL connection.
        for (name, config) in &connections {
            if let ConnectionConfig::Cache(cache) = config {
                match connections.get(&cache.backing) {
                    None => {
                        return Err(DbError::Config(format!(
                            "cache connection '{}' backs onto unknown connection '{}'",
                            name, cache.backing
                        )))
                    }
                    Some(ConnectionConfig::Cache(_)) => {
                        return Err(DbError::Config(format!(
                            "cache connection '{}' cannot back onto another cache ('{}')",
                            name, cache.backing
                        )))
                    }
                    Some(ConnectionConfig::MySql(_)) => {}
                }
            }
        }

        Ok(Settings { connections })
    }
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default)]
    connections: BTreeMap<String, RawConnection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConnection {
    #[serde(rename = "type")]
    kind: String,
    hostname: Option<String>,
    port: Option<u16>,
    socket: Option<String>,
    username: Option<String>,
    password: Option<String>,
    /// Name of an environment variable holding the password.
    password_env: Option<String>,
    database: Option<String>,
    charset: Option<String>,
    set_timezone: Option<String>,
    #[serde(default)]
    connect_on_demand: bool,
    #[serde(default)]
    non_fatal: bool,
    retry: Option<RawRetry>,
    backing: Option<String>,
    server: Option<String>,
    min_cache_minutes: Option<u64>,
    max_cache_minutes: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRetry {
    max_replays: Option<u32>,
    min_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

fn normalize(name: &str, raw: RawConnection) -> DbResult<ConnectionConfig> {
    match ConnectionKind::parse(name, &raw.kind)? {
        ConnectionKind::MySql(flavor) => normalize_mysql(name, flavor, raw),
        ConnectionKind::Cache => normalize_cache(name, raw),
    }
}

fn normalize_mysql(
    name: &str,
    flavor: DriverFlavor,
    raw: RawConnection,
) -> DbResult<ConnectionConfig> {
    if raw.hostname.is_none() && raw.socket.is_none() {
        return Err(DbError::Config(format!(
            "connection '{}' requires a hostname or socket",
            name
        )));
    }
    if raw.port.is_some() && raw.socket.is_some() {
        return Err(DbError::Config(format!(
            "connection '{}' specifies both a port and a socket",
            name
        )));
    }
    let database = raw.database.ok_or_else(|| {
        DbError::Config(format!("connection '{}' requires a database", name))
    })?;

    let password = resolve_password(name, raw.password, raw.password_env)?;

    let retry_raw = raw.retry.unwrap_or(RawRetry {
        max_replays: None,
        min_delay_ms: None,
        max_delay_ms: None,
    });
    let defaults = RetryConfig::default();
    let retry = RetryConfig {
        max_replays: retry_raw.max_replays.unwrap_or(defaults.max_replays),
        min_delay_ms: retry_raw.min_delay_ms.unwrap_or(defaults.min_delay_ms),
        max_delay_ms: retry_raw.max_delay_ms.unwrap_or(defaults.max_delay_ms),
    };
    if retry.min_delay_ms > retry.max_delay_ms {
        return Err(DbError::Config(format!(
            "connection '{}': retry min_delay_ms exceeds max_delay_ms",
            name
        )));
    }

    let charset = match flavor {
        DriverFlavor::Improved => Some(raw.charset.unwrap_or_else(|| "utf8".to_string())),
        DriverFlavor::Legacy => raw.charset,
    };

    Ok(ConnectionConfig::MySql(MySqlConfig {
        flavor,
        hostname: raw.hostname,
        port: raw.port.unwrap_or(3306),
        socket: raw.socket,
        username: raw.username.unwrap_or_else(|| "root".to_string()),
        password,
        database,
        charset,
        set_timezone: raw.set_timezone,
        connect_on_demand: raw.connect_on_demand,
        non_fatal: raw.non_fatal,
        retry,
    }))
}

fn normalize_cache(name: &str, raw: RawConnection) -> DbResult<ConnectionConfig> {
    let backing = raw.backing.ok_or_else(|| {
        DbError::Config(format!(
            "cache connection '{}' requires a backing connection",
            name
        ))
    })?;
    let server = raw.server.ok_or_else(|| {
        DbError::Config(format!("cache connection '{}' requires a server URL", name))
    })?;
    let min = raw.min_cache_minutes.ok_or_else(|| {
        DbError::Config(format!(
            "cache connection '{}' requires min_cache_minutes",
            name
        ))
    })?;
    let max = raw.max_cache_minutes.ok_or_else(|| {
        DbError::Config(format!(
            "cache connection '{}' requires max_cache_minutes",
            name
        ))
    })?;
    if min < 1 || max < 1 {
        return Err(DbError::Config(format!(
            "cache connection '{}': cache minutes must be at least 1",
            name
        )));
    }
    if min > max {
        return Err(DbError::Config(format!(
            "cache connection '{}': min_cache_minutes exceeds max_cache_minutes",
            name
        )));
    }

    Ok(ConnectionConfig::Cache(CacheConfig {
        backing,
        server,
        min_cache_minutes: min,
        max_cache_minutes: max,
        connect_on_demand: raw.connect_on_demand,
        non_fatal: raw.non_fatal,
    }))
}

fn resolve_password(
    name: &str,
    password: Option<String>,
    password_env: Option<String>,
) -> DbResult<String> {
    match (password, password_env) {
        (Some(_), Some(_)) => Err(DbError::Config(format!(
            "connection '{}' sets both password and password_env",
            name
        ))),
        (Some(p), None) => Ok(p),
        (None, Some(var)) => std::env::var(&var).map_err(|_| {
            DbError::Config(format!(
                "connection '{}': environment variable '{}' is not set",
                name, var
            ))
        }),
        (None, None) => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [connections.main]
        type = "mysqli"
        hostname = "db.internal"
        username = "app"
        password = "secret"
        database = "app"
        set_timezone = "+00:00"

        [connections.main.retry]
        max_replays = 3
        min_delay_ms = 100
        max_delay_ms = 500

        [connections.old]
        type = "mysql"
        hostname = "db-old.internal"
        port = 3307
        database = "legacy"
        non_fatal = true

        [connections.cache]
        type = "memcache"
        backing = "main"
        server = "redis://127.0.0.1:6379"
        min_cache_minutes = 5
        max_cache_minutes = 15
        connect_on_demand = true
    "#;

    #[test]
    fn test_parse_sample() {
        let settings = Settings::from_toml(SAMPLE).unwrap();
        assert_eq!(settings.connections.len(), 3);

        let main = &settings.connections["main"];
        assert_eq!(main.kind(), ConnectionKind::MySql(DriverFlavor::Improved));
        let ConnectionConfig::MySql(main) = main else {
            panic!("expected mysql config");
        };
        assert_eq!(main.port, 3306);
        assert_eq!(main.charset.as_deref(), Some("utf8"));
        assert_eq!(main.set_timezone.as_deref(), Some("+00:00"));
        assert_eq!(main.retry.max_replays, 3);

        let old = &settings.connections["old"];
        assert_eq!(old.kind(), ConnectionKind::MySql(DriverFlavor::Legacy));
        assert!(old.non_fatal());
        let ConnectionConfig::MySql(old) = old else {
            panic!("expected mysql config");
        };
        assert_eq!(old.port, 3307);
        assert_eq!(old.username, "root");
        assert_eq!(old.charset, None);
        assert_eq!(old.retry.max_replays, 5);

        let cache = &settings.connections["cache"];
        assert_eq!(cache.kind(), ConnectionKind::Cache);
        assert!(cache.connect_on_demand());
    }

    #[test]
    fn test_type_aliases() {
        for (alias, kind) in [
            ("mysql-improved", ConnectionKind::MySql(DriverFlavor::Improved)),
            ("MySQLi", ConnectionKind::MySql(DriverFlavor::Improved)),
            ("cache", ConnectionKind::Cache),
        ] {
            assert_eq!(ConnectionKind::parse("x", alias).unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = ConnectionKind::parse("x", "mongodb").unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_missing_hostname_rejected() {
        let text = r#"
            [connections.a]
            type = "mysql"
            database = "d"
        "#;
        assert!(Settings::from_toml(text).is_err());
    }

    #[test]
    fn test_socket_instead_of_hostname() {
        let text = r#"
            [connections.a]
            type = "mysql"
            socket = "/run/mysqld/mysqld.sock"
            database = "d"
        "#;
        let settings = Settings::from_toml(text).unwrap();
        let ConnectionConfig::MySql(c) = &settings.connections["a"] else {
            panic!("expected mysql config");
        };
        assert_eq!(c.socket.as_deref(), Some("/run/mysqld/mysqld.sock"));
    }

    #[test]
    fn test_port_and_socket_rejected() {
        let text = r#"
            [connections.a]
            type = "mysql"
            hostname = "h"
            port = 3306
            socket = "/tmp/mysql.sock"
            database = "d"
        "#;
        assert!(Settings::from_toml(text).is_err());
    }

    #[test]
    fn test_cache_backing_must_exist() {
        let text = r#"
            [connections.cache]
            type = "memcache"
            backing = "nope"
            server = "redis://localhost"
            min_cache_minutes = 1
            max_cache_minutes = 2
        "#;
        let err = Settings::from_toml(text).unwrap_err();
        assert!(err.to_string().contains("unknown connection"));
    }

    #[test]
    fn test_cache_cannot_back_onto_cache() {
        let text = r#"
            [connections.a]
            type = "mysql"
            hostname = "h"
            database = "d"

            [connections.b]
            type = "memcache"
            backing = "a"
            server = "redis://localhost"
            min_cache_minutes = 1
            max_cache_minutes = 2

            [connections.c]
            type = "memcache"
            backing = "b"
            server = "redis://localhost"
            min_cache_minutes = 1
            max_cache_minutes = 2
        "#;
        let err = Settings::from_toml(text).unwrap_err();
        assert!(err.to_string().contains("another cache"));
    }

    #[test]
    fn test_cache_minute_bounds() {
        let text = r#"
            [connections.a]
            type = "mysql"
            hostname = "h"
            database = "d"

            [connections.b]
            type = "memcache"
            backing = "a"
            server = "redis://localhost"
            min_cache_minutes = 10
            max_cache_minutes = 5
        "#;
        assert!(Settings::from_toml(text).is_err());
    }

    #[test]
    fn test_retry_delays_must_be_ordered() {
        let text = r#"
            [connections.a]
            type = "mysql"
            hostname = "h"
            database = "d"

            [connections.a.retry]
            min_delay_ms = 5000
            max_delay_ms = 1000
        "#;
        assert!(Settings::from_toml(text).is_err());
    }

    #[test]
    fn test_password_env_resolution() {
        std::env::set_var("DBSHIM_TEST_PW", "hunter2");
        let text = r#"
            [connections.a]
            type = "mysql"
            hostname = "h"
            database = "d"
            password_env = "DBSHIM_TEST_PW"
        "#;
        let settings = Settings::from_toml(text).unwrap();
        let ConnectionConfig::MySql(c) = &settings.connections["a"] else {
            panic!("expected mysql config");
        };
        assert_eq!(c.password, "hunter2");
    }

    #[test]
    fn test_password_env_missing() {
        let text = r#"
            [connections.a]
            type = "mysql"
            hostname = "h"
            database = "d"
            password_env = "DBSHIM_TEST_PW_UNSET"
        "#;
        let err = Settings::from_toml(text).unwrap_err();
        assert!(err.to_string().contains("is not set"));
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let settings = Settings::load(file.path()).unwrap();
        assert!(settings.connections.contains_key("cache"));
    }
}
