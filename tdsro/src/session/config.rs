//! Session configuration.
use std::{borrow::Cow, env::var, fmt, time::Duration};

use crate::tds::{
    ServerFlavor, TdsVersion,
    packet::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE},
};

/// Wait for a cancel acknowledgement before the connection is given up.
const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(30);

/// Prepared handles kept per session.
const DEFAULT_PROC_CACHE: usize = 500;

/// Session configuration builder.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) user: String,
    pub(crate) pass: String,
    pub(crate) database: String,
    pub(crate) app_name: String,
    pub(crate) client_host: String,
    pub(crate) language: String,
    /// Client charset requested in the TDS 5.0 login.
    pub(crate) charset: String,
    pub(crate) flavor: ServerFlavor,
    pub(crate) version: TdsVersion,
    pub(crate) packet_size: u16,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancel_grace: Duration,
    pub(crate) lazy_lobs: bool,
    pub(crate) proc_cache: usize,
    pub(crate) max_streams: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config::new(ServerFlavor::SqlServer)
    }
}

impl Config {
    /// Default configuration for a server family.
    pub fn new(flavor: ServerFlavor) -> Config {
        Config {
            host: "localhost".into(),
            port: flavor.default_port(),
            user: "sa".into(),
            pass: String::new(),
            database: String::new(),
            app_name: "tdsro".into(),
            client_host: String::new(),
            language: String::new(),
            charset: "iso_1".into(),
            flavor,
            version: flavor.default_version(),
            packet_size: DEFAULT_PACKET_SIZE as u16,
            timeout: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            lazy_lobs: false,
            proc_cache: DEFAULT_PROC_CACHE,
            max_streams: u16::MAX,
        }
    }

    /// Retrieve configuration from environment variable.
    ///
    /// It reads:
    /// - `TDSSERVER`, `sqlserver` or `sybase`
    /// - `TDSHOST`
    /// - `TDSPORT`
    /// - `TDSUSER`
    /// - `TDSPASS`
    /// - `TDSDATABASE`
    /// - `TDSVERSION`, e.g. `7.1`
    /// - `TDSPACKETSIZE`
    /// - `TDSTIMEOUT`, in seconds
    ///
    /// Unparsable values fall back to the default, [`Config::validate`]
    /// reports combinations that make no sense.
    pub fn from_env() -> Config {
        let flavor = var("TDSSERVER")
            .ok()
            .and_then(|e| ServerFlavor::parse(&e))
            .unwrap_or(ServerFlavor::SqlServer);
        let mut me = Config::new(flavor);

        macro_rules! env {
            ($name:literal,$field:ident) => {
                if let Ok(ok) = var($name) {
                    me.$field = ok;
                }
            };
            ($name:literal,$field:ident,$parse:expr) => {
                if let Some(ok) = var($name).ok().and_then($parse) {
                    me.$field = ok;
                }
            };
        }

        env!("TDSHOST", host);
        env!("TDSUSER", user);
        env!("TDSPASS", pass);
        env!("TDSDATABASE", database);
        env!("TDSPORT", port, |e| e.parse().ok());
        env!("TDSVERSION", version, |e| TdsVersion::parse(&e));
        env!("TDSPACKETSIZE", packet_size, |e| e.parse().ok());
        env!("TDSTIMEOUT", timeout, |e| {
            e.parse::<u64>().ok().filter(|&s| s > 0).map(|s| Some(Duration::from_secs(s)))
        });

        me
    }

    /// Check that the configuration can be used to log in.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (self.flavor, self.version) {
            (ServerFlavor::Sybase, TdsVersion::V50) => {},
            (ServerFlavor::Sybase, _) => {
                return Err(ConfigError::new("sybase servers only speak TDS 5.0"));
            },
            (ServerFlavor::SqlServer, TdsVersion::V50) => {
                return Err(ConfigError::new("sql server requires TDS 7.0 or later"));
            },
            (ServerFlavor::SqlServer, _) => {},
        }

        let size = self.packet_size as usize;
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
            return Err(ConfigError::new(format!(
                "packet size {size} outside {MIN_PACKET_SIZE}..={MAX_PACKET_SIZE}"
            )));
        }

        if self.host.is_empty() {
            return Err(ConfigError::new("host is empty"));
        }

        if self.proc_cache == 0 {
            return Err(ConfigError::new("procedure cache size must not be zero"));
        }

        Ok(())
    }
}

/// Builder setters.
impl Config {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, pass: impl Into<String>) -> Self {
        self.pass = pass.into();
        self
    }

    /// Database selected at login, empty keeps the login default.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Workstation name reported to the server.
    pub fn client_host(mut self, name: impl Into<String>) -> Self {
        self.client_host = name.into();
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Client charset requested on TDS 5.0, e.g. `iso_1` or `utf8`.
    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    /// Set server family, the port and version follow unless set afterwards.
    pub fn flavor(mut self, flavor: ServerFlavor) -> Self {
        if self.port == self.flavor.default_port() {
            self.port = flavor.default_port();
        }
        if self.version == self.flavor.default_version() {
            self.version = flavor.default_version();
        }
        self.flavor = flavor;
        self
    }

    pub fn version(mut self, version: TdsVersion) -> Self {
        self.version = version;
        self
    }

    /// Requested packet size, the server may negotiate another.
    pub fn packet_size(mut self, size: u16) -> Self {
        self.packet_size = size;
        self
    }

    /// Default timeout of every logical stream, `None` waits forever.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// How long to wait for a cancel acknowledgement.
    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Leave large object columns unread until requested.
    pub fn lazy_lobs(mut self, lazy: bool) -> Self {
        self.lazy_lobs = lazy;
        self
    }

    /// Capacity of the prepared procedure cache.
    pub fn proc_cache_size(mut self, size: usize) -> Self {
        self.proc_cache = size;
        self
    }

    /// Highest logical stream id allocated.
    pub fn max_streams(mut self, max: u16) -> Self {
        self.max_streams = max;
        self
    }
}

/// Error when configuration is invalid.
pub struct ConfigError {
    reason: Cow<'static, str>,
}

impl ConfigError {
    fn new(reason: impl Into<Cow<'static, str>>) -> ConfigError {
        ConfigError { reason: reason.into() }
    }
}

impl std::error::Error for ConfigError { }

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            return f.write_str(&self.reason);
        }
        write!(f, "invalid config: {}", self.reason)
    }
}

impl fmt::Debug for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_follow_flavor() {
        let config = Config::new(ServerFlavor::SqlServer);
        assert_eq!(config.port, 1433);
        assert_eq!(config.version, TdsVersion::V71);
        assert_eq!(config.packet_size, 4096);
        assert_eq!(config.app_name, "tdsro");
        assert!(config.validate().is_ok());

        let config = Config::default().flavor(ServerFlavor::Sybase);
        assert_eq!(config.port, 5000);
        assert_eq!(config.version, TdsVersion::V50);
        assert!(config.validate().is_ok());

        let config = Config::default().port(2000).flavor(ServerFlavor::Sybase);
        assert_eq!(config.port, 2000);
    }

    #[test]
    fn rejects_impossible_combinations() {
        let config = Config::new(ServerFlavor::Sybase).version(TdsVersion::V72);
        assert!(config.validate().is_err());

        let config = Config::new(ServerFlavor::SqlServer).version(TdsVersion::V50);
        assert!(config.validate().is_err());

        let config = Config::default().packet_size(256);
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "invalid config: packet size 256 outside 512..=32767");
    }
}
