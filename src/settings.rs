//! configuration of the server source
//!
//! every option is reachable both through typed accessors and by its
//! property name, the way a launch line sets them:
//!
//! ```
//! use sctp_rpc_src::Settings;
//!
//! let settings: Settings = "bind-address=127.0.0.1 port=0 transport=tcp".parse().unwrap();
//! assert_eq!(settings.host(), "127.0.0.1");
//! assert_eq!(settings.port(), 0);
//! ```

use std::str::FromStr;
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::frame::DEFAULT_MAX_PAYLOAD;
use crate::socket::{SocketOptions, Transport};

/// default bind address
pub const DEFAULT_HOST: &str = "localhost";
/// default listening port
pub const DEFAULT_PORT: u16 = 9999;
/// upper bound of `buffer-size`
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// all recognised property names
pub const PROPERTIES: &[&str] = &[
    "bind-address",
    "port",
    "current-port",
    "num-ostreams",
    "max-instreams",
    "buffer-size",
    "transport",
    "poll-interval",
    "query-timeout",
];

/// configured values of a server source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    host: String,
    port: u16,
    num_ostreams: u16,
    max_instreams: u16,
    buffer_size: usize,
    transport: Transport,
    poll_interval: Duration,
    query_timeout: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            num_ostreams: 1,
            max_instreams: 1,
            buffer_size: DEFAULT_MAX_PAYLOAD,
            transport: Transport::Sctp,
            poll_interval: Duration::from_millis(100),
            query_timeout: None,
        }
    }
}

fn parse_num<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidProperty(format!("{name}: `{value}` is out of range")))
}

impl Settings {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// the bind address, must not be empty
    pub fn set_host(&mut self, host: &str) -> Result<()> {
        if host.is_empty() {
            warn!("bind-address cannot be empty");
            return Err(Error::InvalidProperty("bind-address cannot be empty".to_owned()));
        }
        self.host = host.to_owned();
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// port to listen on, 0 picks a random available port
    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn num_ostreams(&self) -> u16 {
        self.num_ostreams
    }

    pub fn set_num_ostreams(&mut self, n: u16) {
        self.num_ostreams = n;
    }

    pub fn max_instreams(&self) -> u16 {
        self.max_instreams
    }

    pub fn set_max_instreams(&mut self, n: u16) {
        self.max_instreams = n;
    }

    /// max payload of a single frame, also the size of one produced buffer
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn set_buffer_size(&mut self, size: usize) -> Result<()> {
        if size == 0 || size > MAX_BUFFER_SIZE {
            return Err(Error::InvalidProperty(format!(
                "buffer-size must be within 1..={MAX_BUFFER_SIZE}, got {size}"
            )));
        }
        self.buffer_size = size;
        Ok(())
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn set_transport(&mut self, transport: Transport) {
        self.transport = transport;
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn set_poll_interval(&mut self, interval: Duration) -> Result<()> {
        if interval < Duration::from_millis(1) {
            return Err(Error::InvalidProperty(
                "poll-interval must be at least 1ms".to_owned(),
            ));
        }
        self.poll_interval = interval;
        Ok(())
    }

    /// how long an outbound query waits for its response, `None` waits forever
    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout
    }

    pub fn set_query_timeout(&mut self, timeout: Option<Duration>) {
        self.query_timeout = timeout.filter(|t| !t.is_zero());
    }

    pub(crate) fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            transport: self.transport,
            num_ostreams: self.num_ostreams,
            max_instreams: self.max_instreams,
            poll_interval: self.poll_interval,
        }
    }

    /// set a property from its string form
    ///
    /// `current-port` is known but read-only
    pub fn set_property(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "bind-address" => self.set_host(value)?,
            "port" => self.port = parse_num(name, value)?,
            "current-port" => return Err(Error::ReadOnlyProperty(name.to_owned())),
            "num-ostreams" => self.num_ostreams = parse_num(name, value)?,
            "max-instreams" => self.max_instreams = parse_num(name, value)?,
            "buffer-size" => self.set_buffer_size(parse_num(name, value)?)?,
            "transport" => self.transport = value.parse()?,
            "poll-interval" => {
                self.set_poll_interval(Duration::from_millis(parse_num(name, value)?))?
            }
            "query-timeout" => {
                let ms: u64 = parse_num(name, value)?;
                self.set_query_timeout(Some(Duration::from_millis(ms)));
            }
            _ => return Err(Error::InvalidProperty(format!("unknown property `{name}`"))),
        }
        debug!("set property {name}={value}");
        Ok(())
    }

    /// read a property in its string form
    ///
    /// `current-port` is live state, it's served by the source itself
    pub fn property(&self, name: &str) -> Result<String> {
        Ok(match name {
            "bind-address" => self.host.clone(),
            "port" => self.port.to_string(),
            "num-ostreams" => self.num_ostreams.to_string(),
            "max-instreams" => self.max_instreams.to_string(),
            "buffer-size" => self.buffer_size.to_string(),
            "transport" => self.transport.to_string(),
            "poll-interval" => self.poll_interval.as_millis().to_string(),
            "query-timeout" => self
                .query_timeout
                .map_or(0, |t| t.as_millis())
                .to_string(),
            _ => return Err(Error::InvalidProperty(format!("unknown property `{name}`"))),
        })
    }
}

impl FromStr for Settings {
    type Err = Error;

    /// parse whitespace separated `name=value` pairs over the defaults
    fn from_str(s: &str) -> Result<Self> {
        let mut settings = Settings::default();
        for pair in s.split_whitespace() {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::InvalidProperty(format!("expect name=value, got `{pair}`")))?;
            settings.set_property(name, value)?;
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.host(), DEFAULT_HOST);
        assert_eq!(s.port(), DEFAULT_PORT);
        assert_eq!(s.num_ostreams(), 1);
        assert_eq!(s.max_instreams(), 1);
        assert_eq!(s.buffer_size(), 16 * 1024);
        assert_eq!(s.transport(), Transport::Sctp);
        assert_eq!(s.query_timeout(), None);
    }

    #[test]
    fn properties_by_name() {
        let mut s = Settings::default();
        s.set_property("port", "0").unwrap();
        s.set_property("num-ostreams", "65535").unwrap();
        s.set_property("max-instreams", "10").unwrap();
        s.set_property("query-timeout", "250").unwrap();
        assert_eq!(s.property("port").unwrap(), "0");
        assert_eq!(s.num_ostreams(), u16::MAX);
        assert_eq!(s.property("max-instreams").unwrap(), "10");
        assert_eq!(s.query_timeout(), Some(Duration::from_millis(250)));

        s.set_property("query-timeout", "0").unwrap();
        assert_eq!(s.query_timeout(), None);
    }

    #[test]
    fn rejected_values() {
        let mut s = Settings::default();
        assert!(matches!(
            s.set_property("port", "65536"),
            Err(Error::InvalidProperty(_))
        ));
        assert!(matches!(
            s.set_property("port", "-1"),
            Err(Error::InvalidProperty(_))
        ));
        assert!(matches!(
            s.set_property("bind-address", ""),
            Err(Error::InvalidProperty(_))
        ));
        assert!(matches!(
            s.set_property("current-port", "1"),
            Err(Error::ReadOnlyProperty(_))
        ));
        assert!(matches!(
            s.set_property("colour", "red"),
            Err(Error::InvalidProperty(_))
        ));
        assert!(s.set_buffer_size(0).is_err());
        assert!(s.set_poll_interval(Duration::ZERO).is_err());
        // nothing above changed the settings
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn every_property_is_known() {
        let mut s = Settings::default();
        for name in PROPERTIES.iter().filter(|n| **n != "current-port") {
            let value = s.property(name).unwrap();
            s.set_property(name, &value).unwrap();
        }
        assert_eq!(s, Settings::default());
        // served by the source, not by the settings
        assert!(s.property("current-port").is_err());
    }

    #[test]
    fn launch_line() {
        let s: Settings = "bind-address=0.0.0.0 port=5000 transport=tcp buffer-size=1024"
            .parse()
            .unwrap();
        assert_eq!(s.host(), "0.0.0.0");
        assert_eq!(s.port(), 5000);
        assert_eq!(s.transport(), Transport::Tcp);
        assert_eq!(s.buffer_size(), 1024);

        assert!("port".parse::<Settings>().is_err());
    }
}
