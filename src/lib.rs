//! # Reading HAProxy PROXY protocol headers.
//!
//! This library reads the PROXY-protocol header an upstream proxy or load
//! balancer prepends to a freshly accepted connection, and reports the
//! original client's address.
//!
//! Both the human-readable (v1) and binary (v2) formats are supported, as
//! specified here:
//! <https://www.haproxy.org/download/2.4/doc/proxy-protocol.txt>
//!
//! Decoding works on a [PeekSource], so exactly the header bytes are consumed:
//! the next read from the connection returns the first byte of the payload.
//! Every field is read under its own deadline ([Config::read_timeout]).
//!
//! ```no_run
//! # async fn serve(socket: tokio::net::TcpStream) -> Result<(), Box<dyn std::error::Error>> {
//! use proxy_header_reader::{read_header, PeekableStream};
//!
//! let peer = socket.peer_addr()?;
//! let mut stream = PeekableStream::new(socket);
//! let header = read_header(&mut stream).await?;
//! let client = header.source_address().unwrap_or(peer);
//! // `stream` now yields the proxied payload.
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod source;
mod version1;
mod version2;

pub use config::Config;
pub use error::{Error, ErrorKind, Field, Malformed};
pub use source::{PeekSource, PeekableStream, ReadError};

use error::{UnrecognizedHeader, WhileReading as _};
use snafu::ensure;
use std::{fmt, net::SocketAddr};
use tracing::{debug, trace};

type Result<T, E = Error> = std::result::Result<T, E>;

/// The v1 header starts with `PROXY` and a single space.
const V1_PREFIX: [u8; 6] = [b'P', b'R', b'O', b'X', b'Y', b' '];

/// The 12 bytes every v2 header starts with.
const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[cfg_attr(not(feature = "always_exhaustive"), non_exhaustive)]
pub enum Version {
    /// The human-readable format (section 2.1).
    V1,
    /// The binary format (section 2.2).
    V2,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[cfg_attr(not(feature = "always_exhaustive"), non_exhaustive)]
pub enum Command {
    /// The connection was relayed on behalf of another node.
    Proxy,
    /// The proxy connected on its own behalf, e.g. for a health check. Only
    /// v2 headers carry this; the real connection endpoints apply.
    Local,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[cfg_attr(not(feature = "always_exhaustive"), non_exhaustive)]
pub enum AddressFamily {
    /// `UNKNOWN` in v1, `AF_UNSPEC` in v2.
    Unspecified,
    /// `TCP4` in v1, `AF_INET` in v2.
    Ipv4,
    /// `TCP6` in v1, `AF_INET6` in v2.
    Ipv6,
}

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[cfg_attr(not(feature = "always_exhaustive"), non_exhaustive)]
pub enum Transport {
    /// `UNKNOWN` in v1, `UNSPEC` in v2.
    Unspecified,
    /// TCP; the only transport v1 can express.
    Stream,
    /// UDP, v2 only.
    Datagram,
}

/// The address family and transport the original connection used.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct TransportProtocol {
    family: AddressFamily,
    transport: Transport,
}

impl TransportProtocol {
    pub const UNSPECIFIED: Self = Self::new(AddressFamily::Unspecified, Transport::Unspecified);

    pub const fn new(family: AddressFamily, transport: Transport) -> Self {
        Self { family, transport }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }
}

/// The PROXY header read from the start of a connection.
///
/// The destination address is validated on the wire but not retained.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct Header {
    version: Version,
    command: Command,
    transport_protocol: TransportProtocol,
    source_address: Option<SocketAddr>,
}

impl Header {
    pub(crate) fn proxied(
        version: Version,
        transport_protocol: TransportProtocol,
        source_address: SocketAddr,
    ) -> Self {
        Self {
            version,
            command: Command::Proxy,
            transport_protocol,
            source_address: Some(source_address),
        }
    }

    /// A header without address information: v1 `UNKNOWN`, or v2 `LOCAL`.
    pub(crate) fn unaddressed(version: Version, command: Command) -> Self {
        Self {
            version,
            command,
            transport_protocol: TransportProtocol::UNSPECIFIED,
            source_address: None,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn transport_protocol(&self) -> TransportProtocol {
        self.transport_protocol
    }

    /// The original client address, if the header carries one.
    ///
    /// IPv4 clients are always reported as [std::net::IpAddr::V4], even when
    /// sent as v4-mapped IPv6 addresses.
    pub fn source_address(&self) -> Option<SocketAddr> {
        self.source_address
    }

    /// Whether the proxy connected on its own behalf (v2 `LOCAL`).
    ///
    /// A v1 `UNKNOWN` header is not local, yet carries no address either;
    /// check [Header::source_address] before substituting the peer address.
    pub fn is_local(&self) -> bool {
        self.command == Command::Local
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::V1 => f.write_str("v1"),
            Version::V2 => f.write_str("v2"),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Proxy => f.write_str("PROXY"),
            Command::Local => f.write_str("LOCAL"),
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let family = match self.family {
            AddressFamily::Unspecified => "unspec",
            AddressFamily::Ipv4 => "inet",
            AddressFamily::Ipv6 => "inet6",
        };
        let transport = match self.transport {
            Transport::Unspecified => "unspec",
            Transport::Stream => "stream",
            Transport::Datagram => "dgram",
        };
        write!(f, "{}/{}", family, transport)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.version, self.command, self.transport_protocol)?;
        if let Some(source) = self.source_address {
            write!(f, " from {}", source)?;
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Format {
    Version1,
    Version2,
}

/// Finds out which format the stream starts with, and moves the peek cursor
/// past the prefix of that format.
///
/// Bytes are looked at as they arrive, so a stream that cannot start with
/// either prefix is rejected without waiting for a full prefix.
async fn detect(source: &mut impl PeekSource, config: &Config) -> Result<Format> {
    source.set_read_deadline(config.next_deadline());

    let mut wanted = 1;
    let format = loop {
        let buf = source.peek(wanted).await.while_reading(Field::Signature)?;
        if buf.starts_with(&V2_SIGNATURE) {
            break Format::Version2;
        }
        if buf.starts_with(&V1_PREFIX) {
            break Format::Version1;
        }

        let v1_candidate = V1_PREFIX.starts_with(&buf[..buf.len().min(V1_PREFIX.len())]);
        let v2_candidate = V2_SIGNATURE.starts_with(&buf[..buf.len().min(V2_SIGNATURE.len())]);
        ensure!(v1_candidate || v2_candidate, UnrecognizedHeader);

        wanted = buf.len() + 1;
    };

    let prefix_len = match format {
        Format::Version1 => V1_PREFIX.len(),
        Format::Version2 => V2_SIGNATURE.len(),
    };
    source
        .peek_exact(prefix_len)
        .await
        .while_reading(Field::Signature)?;

    trace!(?format, "detected PROXY header");
    Ok(format)
}

/// Reads the PROXY header from the start of `source` with the default
/// [Config].
///
/// See [read_header_with_config].
pub async fn read_header(source: &mut impl PeekSource) -> Result<Header> {
    read_header_with_config(source, &Config::default()).await
}

/// Reads the PROXY header from the start of `source`.
///
/// On success exactly the header has been consumed. On
/// [Error::UnrecognizedHeader] nothing has been consumed, and the caller may
/// treat the stream as unproxied. Any other error leaves the source at an
/// unspecified position; the connection should be closed.
pub async fn read_header_with_config(
    source: &mut impl PeekSource,
    config: &Config,
) -> Result<Header> {
    let result = match detect(source, config).await {
        Ok(Format::Version1) => version1::parse(source, config).await,
        Ok(Format::Version2) => version2::parse(source, config).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(header) => {
            let len = source.peeked();
            source.consume(len);
            debug!(%header, len, "read PROXY header");
            Ok(header)
        }
        Err(e) => {
            if let Error::UnrecognizedHeader = e {
                source.rewind();
            }
            debug!(error = %e, "could not read PROXY header");
            Err(e)
        }
    }
}
