//! # OSD Host
//!
//! Host side of the Open SoC Debug interconnect: connects to a debug target, discovers the
//! debug modules behind it and exchanges debug packets with them.
//!
//! ## Overview
//!
//! A [`Session`] is created by connecting to a target. Connecting runs discovery: the host
//! broadcasts a probe, asks every module that answered to describe itself and records the
//! descriptors in a [`Registry`]. Modules that stay silent are reported as degraded instead of
//! failing the connection.
//!
//! Afterwards, typed [drivers](driver) give access to the modules. All traffic runs through a
//! [`Router`] that keeps answers of each module in request order, limits the number of
//! outstanding requests per module and hands out unsolicited events to subscribers.
//!
//! ## Transports
//!
//! - **TCP**: length-prefixed packets over a byte stream
//! - **UDP**: one packet per datagram
//! - **Scan chain**: a blocking [`ScanChain`](transport::ScanChain) backend
//! - **In-memory**: [`Link::pair`](transport::Link::pair), for in-process targets
//!
//! ## Basic Usage
//!
//! ```ignore
//! use osd_host::{config::Builder, driver::ModuleDriver};
//! use osd_protocol::ModuleAddress;
//!
//! let session = Builder::new().tcp("127.0.0.1:9537").connect().await?;
//! for module in session.modules() {
//!     println!("{}", module);
//! }
//!
//! if let ModuleDriver::Memory(mam) = session.driver_for(ModuleAddress::new(0, 2))? {
//!     mam.write(0x1000, b"hello").await?;
//!     let data = mam.read(0x1000, 5).await?;
//! }
//! ```
//!
//! ## Related Crates
//!
//! - [`osd_protocol`] - Packet encoding and decoding
//! - `osd_target` - Simulated debug target
pub mod config;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;

pub use config::{Builder, Config, TransportConfig};
pub use driver::ModuleDriver;
pub use error::{ConnectError, NotFound, RequestError, SequenceGap, TransportError};
pub use registry::Registry;
pub use router::Router;
pub use session::Session;
pub use transport::Link;
