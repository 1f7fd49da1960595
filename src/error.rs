use crate::source::ReadError;
use snafu::{ResultExt as _, Snafu};
use std::{fmt, io, net::AddrParseError, str::Utf8Error};

/// The wire field that was being read or validated when decoding failed.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[cfg_attr(not(feature = "always_exhaustive"), non_exhaustive)]
pub enum Field {
    /// The `PROXY ` prefix or the binary signature.
    Signature,
    /// The v1 `TCP4` / `TCP6` / `UNKNOWN` token.
    TransportProtocol,
    SourceAddress,
    DestinationAddress,
    SourcePort,
    DestinationPort,
    /// The four fixed v2 bytes following the signature.
    Preamble,
    Version,
    Command,
    AddressFamily,
    Length,
    /// The family-sized v2 address block.
    AddressBlock,
    /// Everything after the v2 address block, up to the declared length.
    Extensions,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::Signature => "signature",
            Field::TransportProtocol => "transport protocol",
            Field::SourceAddress => "source address",
            Field::DestinationAddress => "destination address",
            Field::SourcePort => "source port",
            Field::DestinationPort => "destination port",
            Field::Preamble => "v2 preamble",
            Field::Version => "version",
            Field::Command => "command",
            Field::AddressFamily => "address family",
            Field::Length => "length",
            Field::AddressBlock => "address block",
            Field::Extensions => "extensions",
        })
    }
}

/// Coarse classification of an [Error], for callers deciding on a policy.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[cfg_attr(not(feature = "always_exhaustive"), non_exhaustive)]
pub enum ErrorKind {
    UnrecognizedHeader,
    MalformedField,
    Timeout,
    IoFailure,
}

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
#[cfg_attr(not(feature = "always_exhaustive"), non_exhaustive)]
pub enum Error {
    /// The stream starts with neither the v1 prefix nor the v2 signature.
    ///
    /// No bytes have been consumed from the source.
    #[snafu(display("the stream does not start with a PROXY header"))]
    UnrecognizedHeader,

    /// A field is present but fails its grammar or range check.
    #[snafu(display("malformed {}: {}", field, source))]
    MalformedField { field: Field, source: Malformed },

    /// The read deadline expired while reading a field.
    #[snafu(display("timed out while reading the {}", field))]
    Timeout { field: Field },

    /// The underlying transport failed or was closed while reading a field.
    #[snafu(display("could not read the {}: {}", field, source))]
    Io { field: Field, source: io::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnrecognizedHeader => ErrorKind::UnrecognizedHeader,
            Error::MalformedField { .. } => ErrorKind::MalformedField,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Io { .. } => ErrorKind::IoFailure,
        }
    }

    /// The field being decoded when the error occurred, if any.
    pub fn field(&self) -> Option<Field> {
        match self {
            Error::UnrecognizedHeader => None,
            Error::MalformedField { field, .. }
            | Error::Timeout { field }
            | Error::Io { field, .. } => Some(*field),
        }
    }
}

/// Why a field failed validation.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
#[cfg_attr(test, derive(PartialEq, Eq))]
#[cfg_attr(not(feature = "always_exhaustive"), non_exhaustive)]
pub enum Malformed {
    #[snafu(display("the given input is not valid ascii text"))]
    NonAscii { source: Utf8Error },

    #[snafu(display("invalid ip address"))]
    InvalidAddress { source: AddrParseError },

    #[snafu(display("invalid port"))]
    InvalidPort,

    #[snafu(display("unknown token"))]
    UnknownToken,

    #[snafu(display("the line ended before all fields were read"))]
    UnexpectedEndOfLine,

    #[snafu(display("expected the end of the line"))]
    ExpectedEndOfLine,

    #[snafu(display("unsupported version: {}", version))]
    UnsupportedVersion { version: u8 },

    #[snafu(display("unknown command: {}", command))]
    UnknownCommand { command: u8 },

    #[snafu(display("unknown address family: {}", family))]
    UnknownAddressFamily { family: u8 },

    #[snafu(display("address family {} carries no usable source address", family))]
    UnsupportedAddressFamily { family: u8 },

    #[snafu(display("unknown transport protocol: {}", protocol))]
    UnknownTransportProtocol { protocol: u8 },

    #[snafu(display("insufficient length specified: {}, requires minimum {}", given, needs))]
    InsufficientLength { given: usize, needs: usize },

    #[snafu(display("no delimiter within {} bytes", limit))]
    TooLong { limit: usize },
}

/// Attaches the field being read to a failed [crate::PeekSource] operation.
pub(crate) trait WhileReading<T> {
    fn while_reading(self, field: Field) -> Result<T, Error>;
}

impl<T> WhileReading<T> for Result<T, ReadError> {
    fn while_reading(self, field: Field) -> Result<T, Error> {
        let err = match self {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match err {
            ReadError::Timeout => Timeout { field }.fail(),
            ReadError::Eof => {
                Err(io::Error::from(io::ErrorKind::UnexpectedEof)).context(Io { field })
            }
            ReadError::Io { source } => Err(source).context(Io { field }),
            ReadError::LimitExceeded { limit } => {
                TooLong { limit }.fail().context(MalformedField { field })
            }
        }
    }
}
