use crate::{
    error::{
        ExpectedEndOfLine, InvalidAddress, InvalidPort, MalformedField, NonAscii,
        UnexpectedEndOfLine, UnknownToken, WhileReading as _,
    },
    AddressFamily, Command, Config, Field, Header, Malformed, PeekSource, Result, Transport,
    TransportProtocol, Version,
};
use snafu::{ensure, OptionExt as _, ResultExt as _};
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr as _,
};

const SPACE: &[u8] = b" ";
const CRLF: &[u8] = b"\r\n";

/// Every field ends in one of these; which one is checked by the caller.
const DELIMITERS: &[&[u8]] = &[SPACE, CRLF];
const END_OF_LINE: usize = 1;

const TCP4: &[u8] = b"TCP4";
const TCP6: &[u8] = b"TCP6";
const UNKNOWN: &[u8] = b"UNKNOWN";

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Terminator {
    Space,
    EndOfLine,
}

/// Reads the next field, giving it a fresh deadline.
///
/// The field may not extend past the maximum header length.
async fn next_field<'s, S: PeekSource>(
    source: &'s mut S,
    config: &Config,
    field: Field,
) -> Result<(&'s [u8], Terminator)> {
    source.set_read_deadline(config.next_deadline());
    let limit = config.max_v1_length.saturating_sub(source.peeked());
    let (text, which) = source
        .peek_until(DELIMITERS, limit)
        .await
        .while_reading(field)?;

    let terminator = if which == END_OF_LINE {
        Terminator::EndOfLine
    } else {
        Terminator::Space
    };
    Ok((text, terminator))
}

fn check_terminator(found: Terminator, expected: Terminator) -> Result<(), Malformed> {
    match (found, expected) {
        (Terminator::EndOfLine, Terminator::Space) => UnexpectedEndOfLine.fail(),
        (Terminator::Space, Terminator::EndOfLine) => ExpectedEndOfLine.fail(),
        _ => Ok(()),
    }
}

/// Parses the protocol token. `None` is `UNKNOWN`.
fn parse_family(token: &[u8]) -> Result<Option<AddressFamily>, Malformed> {
    match token {
        TCP4 => Ok(Some(AddressFamily::Ipv4)),
        TCP6 => Ok(Some(AddressFamily::Ipv6)),
        UNKNOWN => Ok(None),
        _ => UnknownToken.fail(),
    }
}

fn parse_address(text: &[u8], family: AddressFamily) -> Result<IpAddr, Malformed> {
    let text = std::str::from_utf8(text).context(NonAscii)?;
    let address = match family {
        AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::from_str(text).context(InvalidAddress)?),
        _ => IpAddr::V6(Ipv6Addr::from_str(text).context(InvalidAddress)?),
    };
    Ok(address.to_canonical())
}

fn parse_port(text: &[u8]) -> Result<u16, Malformed> {
    // `u16::from_str` would also take a leading `+`.
    ensure!(
        !text.is_empty() && text.iter().all(u8::is_ascii_digit),
        InvalidPort
    );
    let text = std::str::from_utf8(text).context(NonAscii)?;
    text.parse().ok().context(InvalidPort)
}

/// Reads one field and validates it with `parse`.
async fn read_field<S: PeekSource, T>(
    source: &mut S,
    config: &Config,
    field: Field,
    terminator: Terminator,
    parse: impl FnOnce(&[u8]) -> Result<T, Malformed>,
) -> Result<T> {
    let (text, found) = next_field(source, config, field).await?;
    check_terminator(found, terminator).context(MalformedField { field })?;
    parse(text).context(MalformedField { field })
}

/// Parses the v1 header following `PROXY `.
///
/// > PROXY <TCP4|TCP6|UNKNOWN> <src ip> <dst ip> <src port> <dst port>\r\n
pub(crate) async fn parse<S: PeekSource>(source: &mut S, config: &Config) -> Result<Header> {
    let (token, terminator) = next_field(source, config, Field::TransportProtocol).await?;
    let family = parse_family(token).context(MalformedField {
        field: Field::TransportProtocol,
    })?;

    let family = match family {
        Some(family) => family,
        None => {
            // > the receiver must ignore anything presented before the CRLF is found.
            if terminator == Terminator::Space {
                source.set_read_deadline(config.next_deadline());
                let limit = config.max_v1_length.saturating_sub(source.peeked());
                source
                    .peek_until(&[CRLF], limit)
                    .await
                    .while_reading(Field::TransportProtocol)?;
            }
            return Ok(Header::unaddressed(Version::V1, Command::Proxy));
        }
    };
    check_terminator(terminator, Terminator::Space).context(MalformedField {
        field: Field::TransportProtocol,
    })?;

    let address = read_field(
        source,
        config,
        Field::SourceAddress,
        Terminator::Space,
        |text| parse_address(text, family),
    )
    .await?;

    // Only validated; the proxy needs the source identity alone.
    read_field(
        source,
        config,
        Field::DestinationAddress,
        Terminator::Space,
        |text| parse_address(text, family),
    )
    .await?;

    let port = read_field(source, config, Field::SourcePort, Terminator::Space, parse_port).await?;

    read_field(
        source,
        config,
        Field::DestinationPort,
        Terminator::EndOfLine,
        parse_port,
    )
    .await?;

    Ok(Header::proxied(
        Version::V1,
        TransportProtocol::new(family, Transport::Stream),
        SocketAddr::new(address, port),
    ))
}
