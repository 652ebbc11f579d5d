use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
    time::Duration,
};

use osd_protocol::ModuleAddress;

use crate::{
    discovery::{ChainOrder, EnumerationPolicy},
    error::ConnectError,
    session::Session,
    transport::ScanChain,
};

/// Selects and parameterizes the transport a session runs on.
#[derive(Clone)]
pub enum TransportConfig {
    /// Reliable byte stream, e.g. a debug bridge or a device gateway reachable over TCP
    Tcp { addr: String },
    /// Unreliable datagrams. Loss and reordering are tolerated by the router.
    Udp { bind: String, remote: String },
    /// Synchronous scan chain backend with a single operation in flight
    ScanChain(Arc<Mutex<Option<Box<dyn ScanChain>>>>),
}

impl TransportConfig {
    pub fn tcp(addr: impl Into<String>) -> TransportConfig {
        TransportConfig::Tcp { addr: addr.into() }
    }

    pub fn udp(bind: impl Into<String>, remote: impl Into<String>) -> TransportConfig {
        TransportConfig::Udp {
            bind: bind.into(),
            remote: remote.into(),
        }
    }

    /// The backend is handed to the first session that connects with this configuration.
    pub fn scan_chain(backend: impl ScanChain) -> TransportConfig {
        TransportConfig::ScanChain(Arc::new(Mutex::new(Some(Box::new(backend)))))
    }
}

impl Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportConfig::Tcp { addr } => f.debug_struct("Tcp").field("addr", addr).finish(),
            TransportConfig::Udp { bind, remote } => f
                .debug_struct("Udp")
                .field("bind", bind)
                .field("remote", remote)
                .finish(),
            TransportConfig::ScanChain(_) => f.write_str("ScanChain"),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::tcp("127.0.0.1:9537")
    }
}

/// Everything a session needs to know at connect time.
#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportConfig,
    /// Timeout of a single request
    pub timeout: Duration,
    /// How many requests may be outstanding per module before issuers have to wait
    pub max_pending_per_module: usize,
    /// How often discovery asks a silent module to describe itself again
    pub retry_count: u32,
    /// Largest payload exchanged in one packet
    pub mtu: usize,
    /// How long discovery waits for answers to its probe
    pub discovery_timeout: Duration,
    /// Number of events buffered per subscriber before it is reported as lagging
    pub event_capacity: usize,
    /// Address the host uses as event destination
    pub host_address: ModuleAddress,
    /// Order in which discovered modules are enumerated
    pub enumeration: Arc<dyn EnumerationPolicy>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            timeout: Duration::from_secs(1),
            max_pending_per_module: 8,
            retry_count: 3,
            mtu: 1024,
            discovery_timeout: Duration::from_millis(200),
            event_capacity: 256,
            host_address: ModuleAddress::HOST,
            enumeration: Arc::new(ChainOrder),
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<(), ConnectError> {
        if self.max_pending_per_module == 0 {
            return Err(ConnectError::InvalidConfig(
                "max_pending_per_module must be at least 1",
            ));
        }
        if self.mtu == 0 || self.mtu > osd_protocol::codec::MAX_PAYLOAD - osd_protocol::codec::HEADER_LEN
        {
            return Err(ConnectError::InvalidConfig("mtu out of range"));
        }
        if self.event_capacity == 0 {
            return Err(ConnectError::InvalidConfig("event_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Builder to create a [Session] and modify configuration options
///
/// # Example
///
/// ```ignore
/// use osd_host::config::Builder;
/// use std::time::Duration;
///
/// let session = Builder::new()
///     .tcp("127.0.0.1:9537")
///     .timeout(Duration::from_millis(500))
///     .max_pending_per_module(4)
///     .connect()
///     .await?;
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.config.transport = transport;
        self
    }

    /// Connect to a target over TCP
    pub fn tcp(self, addr: impl Into<String>) -> Self {
        self.transport(TransportConfig::tcp(addr))
    }

    /// Set the per-request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the number of outstanding requests allowed per module
    pub fn max_pending_per_module(mut self, max: usize) -> Self {
        self.config.max_pending_per_module = max;
        self
    }

    /// Set how often discovery retries a silent module
    pub fn retry_count(mut self, retries: u32) -> Self {
        self.config.retry_count = retries;
        self
    }

    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Set how long discovery waits for probe answers
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.discovery_timeout = timeout;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn host_address(mut self, address: ModuleAddress) -> Self {
        self.config.host_address = address;
        self
    }

    pub fn enumeration(mut self, policy: impl EnumerationPolicy + 'static) -> Self {
        self.config.enumeration = Arc::new(policy);
        self
    }

    /// Return the configuration without connecting
    pub fn build(self) -> Config {
        self.config
    }

    /// Connect and return the ready session
    pub async fn connect(self) -> Result<Session, ConnectError> {
        Session::connect(self.config).await
    }
}

#[test]
fn builder_overrides_defaults() {
    let config = Builder::new()
        .tcp("10.0.0.1:1234")
        .timeout(Duration::from_millis(50))
        .max_pending_per_module(2)
        .retry_count(0)
        .build();
    assert_eq!(config.timeout, Duration::from_millis(50));
    assert_eq!(config.max_pending_per_module, 2);
    assert_eq!(config.retry_count, 0);
    assert_eq!(config.mtu, 1024);
    assert!(matches!(config.transport, TransportConfig::Tcp { ref addr } if addr == "10.0.0.1:1234"));
}

#[test]
fn zero_pending_is_rejected() {
    let config = Builder::new().max_pending_per_module(0).build();
    assert!(matches!(
        config.validate(),
        Err(ConnectError::InvalidConfig(_))
    ));
}
