use std::time::Duration;

const URL_SCHEME: &str = "tallydb://";

/// Store connection configuration
///
/// Mirrors the knobs of a relational driver's pool settings, plus the
/// session-level `lock_timeout`.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Store host (for display and future client-server mode)
    pub host: String,

    /// Store port (for display and future client-server mode)
    pub port: u16,

    /// Logical store name, used in logs
    pub database: String,

    /// Upper bound on a single row lock wait. `None` waits indefinitely.
    pub lock_timeout: Option<Duration>,

    /// Connections kept parked for reuse. Checkouts never wait on this
    /// limit; surplus connections are closed when returned.
    pub max_connections: usize,

    /// Connections opened eagerly when the pool starts
    pub min_connections: usize,

    /// Idle connections parked longer than this are dropped
    pub idle_timeout: Option<Duration>,

    /// Connections older than this are dropped instead of reused
    pub max_lifetime: Option<Duration>,
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "tallydb".to_string(),
            lock_timeout: None,
            max_connections: 10,
            min_connections: 1,
            idle_timeout: Some(Duration::from_secs(10 * 60)),
            max_lifetime: Some(Duration::from_secs(30 * 60)),
        }
    }

    pub fn database(mut self, database: &str) -> Self {
        self.database = database.to_string();
        self
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Bound row lock waits
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn max_connections(mut self, limit: usize) -> Self {
        self.max_connections = limit;
        self
    }

    pub fn min_connections(mut self, warm: usize) -> Self {
        self.min_connections = warm;
        self
    }

    pub fn idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = Some(idle);
        self
    }

    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    /// Parse a `tallydb://` connection string
    ///
    /// Format: `tallydb://host[:port]/database[?key=value&...]` with keys
    /// `max_connections`, `min_connections` and `lock_timeout_ms`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use tallydb::ConnectionConfig;
    /// let config = ConnectionConfig::from_url(
    ///     "tallydb://localhost:5432/stock?max_connections=16&lock_timeout_ms=250"
    /// ).unwrap();
    /// assert_eq!(config.max_connections, 16);
    /// ```
    pub fn from_url(url: &str) -> Result<Self, String> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| format!("URL must start with '{}'", URL_SCHEME))?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let (host_port, database) = location
            .split_once('/')
            .ok_or_else(|| "Invalid host/database format".to_string())?;
        if database.is_empty() || database.contains('/') {
            return Err("Invalid host/database format".to_string());
        }

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>().map_err(|_| "Invalid port".to_string())?,
            ),
            None => (host_port, 5432),
        };

        let mut config = Self::new().host(host).port(port).database(database);

        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("Invalid query parameter '{}'", pair))?;
            let number = || {
                value
                    .parse::<u64>()
                    .map_err(|_| format!("Invalid value for '{}': {}", key, value))
            };
            match key {
                "max_connections" => config.max_connections = number()? as usize,
                "min_connections" => config.min_connections = number()? as usize,
                "lock_timeout_ms" => config.lock_timeout = Some(Duration::from_millis(number()?)),
                other => return Err(format!("Unknown parameter '{}'", other)),
            }
        }

        Ok(config)
    }

    /// Render as a connection string accepted by [`ConnectionConfig::from_url`]
    pub fn to_url(&self) -> String {
        let mut url = format!(
            "{}{}:{}/{}?max_connections={}&min_connections={}",
            URL_SCHEME,
            self.host,
            self.port,
            self.database,
            self.max_connections,
            self.min_connections
        );
        if let Some(lock_timeout) = self.lock_timeout {
            url.push_str(&format!("&lock_timeout_ms={}", lock_timeout.as_millis()));
        }
        url
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.database.is_empty() {
            return Err("Database name cannot be empty".to_string());
        }

        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }

        if self.min_connections > self.max_connections {
            return Err("min_connections cannot exceed max_connections".to_string());
        }

        if self.lock_timeout == Some(Duration::ZERO) {
            return Err("lock_timeout must be > 0 when set".to_string());
        }

        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5432);
        assert_eq!(config.lock_timeout, None);
    }

    #[test]
    fn test_builder_pattern() {
        let config = ConnectionConfig::new()
            .host("example.com")
            .port(3306)
            .database("stock")
            .max_connections(20)
            .lock_timeout(Duration::from_millis(50));

        assert_eq!(config.host, "example.com");
        assert_eq!(config.port, 3306);
        assert_eq!(config.database, "stock");
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.lock_timeout, Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_from_url() {
        let config = ConnectionConfig::from_url(
            "tallydb://db.example.com:6000/orders?max_connections=4&lock_timeout_ms=100",
        )
        .unwrap();

        assert_eq!(config.host, "db.example.com");
        assert_eq!(config.port, 6000);
        assert_eq!(config.database, "orders");
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.lock_timeout, Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_from_url_default_port() {
        let config = ConnectionConfig::from_url("tallydb://localhost/testdb").unwrap();
        assert_eq!(config.port, 5432);
        assert_eq!(config.database, "testdb");
    }

    #[test]
    fn test_invalid_url() {
        assert!(ConnectionConfig::from_url("invalid://url").is_err());
        assert!(ConnectionConfig::from_url("tallydb://nodatabase").is_err());
        assert!(ConnectionConfig::from_url("tallydb://host:port/db").is_err());
        assert!(ConnectionConfig::from_url("tallydb://host/db?bogus=1").is_err());
        assert!(ConnectionConfig::from_url("tallydb://host/db?max_connections=x").is_err());
    }

    #[test]
    fn test_url_round_trip_keeps_settings() {
        let config = ConnectionConfig::new()
            .database("stock")
            .max_connections(8)
            .lock_timeout(Duration::from_millis(75));

        let parsed = ConnectionConfig::from_url(&config.to_url()).unwrap();
        assert_eq!(parsed.database, "stock");
        assert_eq!(parsed.max_connections, 8);
        assert_eq!(parsed.lock_timeout, Some(Duration::from_millis(75)));
    }

    #[test]
    fn test_validate() {
        assert!(ConnectionConfig::new().validate().is_ok());

        let invalid_max_conn = ConnectionConfig::new().max_connections(0);
        assert!(invalid_max_conn.validate().is_err());

        let invalid_min_max = ConnectionConfig::new()
            .min_connections(10)
            .max_connections(5);
        assert!(invalid_min_max.validate().is_err());

        let zero_lock_timeout = ConnectionConfig::new().lock_timeout(Duration::ZERO);
        assert!(zero_lock_timeout.validate().is_err());
    }
}
