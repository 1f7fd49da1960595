use crate::{
    error::{
        InsufficientLength, MalformedField, UnknownAddressFamily, UnknownCommand,
        UnknownTransportProtocol, UnsupportedAddressFamily, UnsupportedVersion,
        WhileReading as _,
    },
    AddressFamily, Command, Config, Field, Header, Malformed, PeekSource, Result, Transport,
    TransportProtocol, Version,
};
use bytes::Buf as _;
use snafu::{ensure, ResultExt as _};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing::trace;

/// The families a v2 header may declare. Unix sockets are only recognised to
/// size the address block.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum ProxyAddressFamily {
    Unspec,
    Inet,
    Inet6,
    Unix,
}

impl ProxyAddressFamily {
    /// Size of the address block, both addresses and ports included.
    fn block_length(self) -> usize {
        // > union proxy_addr {
        // >     struct {        /* for TCP/UDP over IPv4, len = 12 */
        // >         uint32_t src_addr;
        // >         uint32_t dst_addr;
        // >         uint16_t src_port;
        // >         uint16_t dst_port;
        // >     } ipv4_addr;
        // >     struct {        /* for TCP/UDP over IPv6, len = 36 */
        // >          uint8_t  src_addr[16];
        // >          uint8_t  dst_addr[16];
        // >          uint16_t src_port;
        // >          uint16_t dst_port;
        // >     } ipv6_addr;
        // >     struct {        /* for AF_UNIX sockets, len = 216 */
        // >          uint8_t src_addr[108];
        // >          uint8_t dst_addr[108];
        // >     } unix_addr;
        // > };
        match self {
            ProxyAddressFamily::Unspec => 0,
            ProxyAddressFamily::Inet => 4 * 2 + 2 * 2,
            ProxyAddressFamily::Inet6 => 16 * 2 + 2 * 2,
            ProxyAddressFamily::Unix => 108 * 2,
        }
    }
}

fn parse_version(ver_cmd: u8) -> Result<(), Malformed> {
    // > The highest four bits contains the version. As of this specification,
    // > it must always be sent as \x2 and the receiver must only accept this
    // > value.
    let version = ver_cmd >> 4;
    ensure!(version == 2, UnsupportedVersion { version });
    Ok(())
}

fn parse_command(ver_cmd: u8) -> Result<Command, Malformed> {
    match ver_cmd & 0x0F {
        0 => Ok(Command::Local),
        1 => Ok(Command::Proxy),
        command => UnknownCommand { command }.fail(),
    }
}

fn parse_family(fam: u8) -> Result<ProxyAddressFamily, Malformed> {
    match fam >> 4 {
        0 => Ok(ProxyAddressFamily::Unspec),
        1 => Ok(ProxyAddressFamily::Inet),
        2 => Ok(ProxyAddressFamily::Inet6),
        3 => Ok(ProxyAddressFamily::Unix),
        family => UnknownAddressFamily { family }.fail(),
    }
}

fn parse_transport(fam: u8) -> Result<Transport, Malformed> {
    match fam & 0x0F {
        0 => Ok(Transport::Unspecified),
        1 => Ok(Transport::Stream),
        2 => Ok(Transport::Datagram),
        protocol => UnknownTransportProtocol { protocol }.fail(),
    }
}

fn check_length(given: usize, needs: usize) -> Result<(), Malformed> {
    ensure!(given >= needs, InsufficientLength { given, needs });
    Ok(())
}

/// Moves past `len` bytes without interpreting them.
async fn skip<S: PeekSource>(source: &mut S, config: &Config, len: usize) -> Result<()> {
    if len > 0 {
        source.set_read_deadline(config.next_deadline());
        source
            .peek_exact(len)
            .await
            .while_reading(Field::Extensions)?;
    }
    Ok(())
}

/// Parses the v2 header following the 12 byte signature.
///
/// Exactly `16 + len` bytes from the start of the signature are read,
/// whatever the command and whatever follows the address block.
pub(crate) async fn parse<S: PeekSource>(source: &mut S, config: &Config) -> Result<Header> {
    // > struct proxy_hdr_v2 {
    // >     uint8_t sig[12];  /* hex 0D 0A 0D 0A 00 0D 0A 51 55 49 54 0A */
    // >     uint8_t ver_cmd;  /* protocol version and command */
    // >     uint8_t fam;      /* protocol family and address */
    // >     uint16_t len;     /* number of following bytes part of the header */
    // > };
    source.set_read_deadline(config.next_deadline());
    let mut preamble = source.peek_exact(4).await.while_reading(Field::Preamble)?;
    let ver_cmd = preamble.get_u8();
    let fam = preamble.get_u8();
    let length = preamble.get_u16() as usize;

    parse_version(ver_cmd).context(MalformedField {
        field: Field::Version,
    })?;
    let command = parse_command(ver_cmd).context(MalformedField {
        field: Field::Command,
    })?;
    trace!(%command, fam, length, "read v2 preamble");

    if command == Command::Local {
        // > The receiver must accept this connection as valid and must use the
        // > real connection endpoints and discard the protocol block including
        // > the family which is ignored.
        skip(source, config, length).await?;
        return Ok(Header::unaddressed(Version::V2, Command::Local));
    }

    let family = parse_family(fam).context(MalformedField {
        field: Field::AddressFamily,
    })?;
    let transport = parse_transport(fam).context(MalformedField {
        field: Field::TransportProtocol,
    })?;

    let needs = family.block_length();
    check_length(length, needs).context(MalformedField {
        field: Field::Length,
    })?;
    let family = match family {
        ProxyAddressFamily::Inet => AddressFamily::Ipv4,
        ProxyAddressFamily::Inet6 => AddressFamily::Ipv6,
        ProxyAddressFamily::Unspec | ProxyAddressFamily::Unix => {
            return UnsupportedAddressFamily { family: fam >> 4 }
                .fail()
                .context(MalformedField {
                    field: Field::AddressFamily,
                });
        }
    };

    source.set_read_deadline(config.next_deadline());
    let mut block = source
        .peek_exact(needs)
        .await
        .while_reading(Field::AddressBlock)?;

    let address = if family == AddressFamily::Ipv4 {
        let ip = Ipv4Addr::from(block.get_u32());
        block.advance(4); // Destination.
        IpAddr::V4(ip)
    } else {
        let ip = Ipv6Addr::from(block.get_u128());
        block.advance(16); // Destination.
        IpAddr::V6(ip).to_canonical()
    };
    let port = block.get_u16();

    // TLVs are not interpreted, but belong to the header all the same.
    skip(source, config, length - needs).await?;

    Ok(Header::proxied(
        Version::V2,
        TransportProtocol::new(family, transport),
        SocketAddr::new(address, port),
    ))
}

#[cfg(test)]
mod parse_tests {
    use super::*;
    use crate::{Error, ErrorKind, PeekableStream};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    const PROXY: u8 = (2 << 4) | 1;
    const LOCAL: u8 = 2 << 4;

    /// Parses `input` as the remainder of a header after the signature,
    /// returning the header and the number of bytes consumed.
    async fn parse_rest(input: &[u8]) -> (Result<Header>, usize) {
        let mut stream = PeekableStream::new(input);
        let header = parse(&mut stream, &Config::default()).await;
        let consumed = stream.peeked();
        stream.consume(consumed);

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, &input[consumed..]);
        (header, consumed)
    }

    fn with_length(ver_cmd: u8, fam: u8, body: &[u8]) -> Vec<u8> {
        let mut data = vec![ver_cmd, fam];
        data.extend_from_slice(&(body.len() as u16).to_be_bytes());
        data.extend_from_slice(body);
        data
    }

    fn malformed(header: Result<Header>) -> (Field, Malformed) {
        match header {
            Err(Error::MalformedField { field, source }) => (field, source),
            other => panic!("expected a malformed field, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ipv4() {
        let mut input = with_length(
            PROXY,
            (1 << 4) | 1,
            &[
                // Source IP
                127, 0, 0, 1, //
                // Destination IP
                192, 168, 0, 1, //
                // Source port: 65535
                255, 255, //
                // Destination port: 257
                1, 1, //
                // An empty TLV
                69, 0, 0,
            ],
        );
        input.extend_from_slice(b"payload");

        let (header, consumed) = parse_rest(&input).await;
        assert_eq!(
            header.unwrap(),
            Header::proxied(
                Version::V2,
                TransportProtocol::new(AddressFamily::Ipv4, Transport::Stream),
                "127.0.0.1:65535".parse().unwrap(),
            ),
        );
        assert_eq!(consumed, 4 + 15);
    }

    #[tokio::test]
    async fn test_ipv6() {
        let mut body = vec![0xFF; 16];
        body.extend_from_slice(&[0; 16]);
        body.extend_from_slice(&[255, 255, 1, 1]);
        let input = with_length(PROXY, (2 << 4) | 2, &body);

        let (header, consumed) = parse_rest(&input).await;
        let header = header.unwrap();
        assert_eq!(
            header.source_address(),
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(u128::MAX)), 65535)),
        );
        assert_eq!(
            header.transport_protocol(),
            TransportProtocol::new(AddressFamily::Ipv6, Transport::Datagram),
        );
        assert_eq!(consumed, 4 + 36);
    }

    #[tokio::test]
    async fn test_unspecified_transport() {
        let input = with_length(PROXY, 1 << 4, &[10, 0, 0, 1, 10, 0, 0, 2, 0, 80, 0, 81]);
        let (header, _) = parse_rest(&input).await;
        assert_eq!(
            header.unwrap().transport_protocol(),
            TransportProtocol::new(AddressFamily::Ipv4, Transport::Unspecified),
        );
    }

    #[tokio::test]
    async fn test_local_consumes_declared_length() {
        for len in [0usize, 7, 12, 300] {
            let body = vec![0xAB; len];
            // The family is ignored for LOCAL, even when it is nonsense.
            let mut input = with_length(LOCAL, 0xFF, &body);
            input.extend_from_slice(b"after");

            let (header, consumed) = parse_rest(&input).await;
            let header = header.unwrap();
            assert_eq!(header.command(), Command::Local);
            assert_eq!(header.source_address(), None);
            assert_eq!(header.transport_protocol(), TransportProtocol::UNSPECIFIED);
            assert_eq!(consumed, 4 + len);
        }
    }

    #[tokio::test]
    async fn test_large_tlv_section() {
        let mut body = vec![127, 0, 0, 1, 127, 0, 0, 1, 0, 1, 0, 2];
        body.resize(u16::MAX as usize, 0x20);
        let input = with_length(PROXY, 0x11, &body);

        let (header, consumed) = parse_rest(&input).await;
        assert!(header.is_ok());
        assert_eq!(consumed, 4 + u16::MAX as usize);
    }

    #[tokio::test]
    async fn test_insufficient_length() {
        // 3 bytes is clearly too few if we expect 2 IPv4s and ports.
        let mut input = vec![PROXY, (1 << 4) | 1, 0, 3];
        input.extend_from_slice(&[0; 64]);
        let (header, consumed) = parse_rest(&input).await;
        assert_eq!(
            malformed(header),
            (
                Field::Length,
                Malformed::InsufficientLength {
                    given: 3,
                    needs: 4 * 2 + 2 * 2,
                },
            ),
        );
        // Nothing past the preamble was read.
        assert_eq!(consumed, 4);

        let input = with_length(PROXY, (2 << 4) | 1, &[0; 12]);
        let (header, _) = parse_rest(&input).await;
        assert_eq!(
            malformed(header),
            (
                Field::Length,
                Malformed::InsufficientLength {
                    given: 12,
                    needs: 36,
                },
            ),
        );

        let input = with_length(PROXY, (3 << 4) | 1, &[0; 200]);
        let (header, _) = parse_rest(&input).await;
        assert_eq!(
            malformed(header),
            (
                Field::Length,
                Malformed::InsufficientLength {
                    given: 200,
                    needs: 216,
                },
            ),
        );
    }

    #[tokio::test]
    async fn test_unsupported_families() {
        let (header, _) = parse_rest(&with_length(PROXY, 0x01, &[])).await;
        assert_eq!(
            malformed(header),
            (
                Field::AddressFamily,
                Malformed::UnsupportedAddressFamily { family: 0 },
            ),
        );

        let (header, _) = parse_rest(&with_length(PROXY, 0x31, &[0; 216])).await;
        assert_eq!(
            malformed(header),
            (
                Field::AddressFamily,
                Malformed::UnsupportedAddressFamily { family: 3 },
            ),
        );

        let (header, _) = parse_rest(&with_length(PROXY, 0x41, &[0; 12])).await;
        assert_eq!(
            malformed(header),
            (
                Field::AddressFamily,
                Malformed::UnknownAddressFamily { family: 4 },
            ),
        );

        let (header, _) = parse_rest(&with_length(PROXY, 0x13, &[0; 12])).await;
        assert_eq!(
            malformed(header),
            (
                Field::TransportProtocol,
                Malformed::UnknownTransportProtocol { protocol: 3 },
            ),
        );
    }

    #[tokio::test]
    async fn test_invalid_version_and_command() {
        let (header, _) = parse_rest(&with_length(0x31, 0x11, &[0; 12])).await;
        assert_eq!(
            malformed(header),
            (Field::Version, Malformed::UnsupportedVersion { version: 3 }),
        );

        let (header, _) = parse_rest(&with_length(0x22, 0x11, &[0; 12])).await;
        assert_eq!(
            malformed(header),
            (Field::Command, Malformed::UnknownCommand { command: 2 }),
        );
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let mut input = with_length(PROXY, 0x11, &[0; 12]);
        input.truncate(4 + 6);
        let (header, _) = parse_rest(&input).await;
        let err = header.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert_eq!(err.field(), Some(Field::AddressBlock));

        let mut input = with_length(LOCAL, 0, &[0; 9]);
        input.truncate(4 + 3);
        let (header, _) = parse_rest(&input).await;
        assert_eq!(header.unwrap_err().field(), Some(Field::Extensions));

        let (header, _) = parse_rest(&[PROXY, 0x11]).await;
        assert_eq!(header.unwrap_err().field(), Some(Field::Preamble));
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_segment_has_its_own_deadline() {
        let (mut client, server) = tokio::io::duplex(1024);
        let config = Config::default().with_read_timeout(Duration::from_secs(5));

        // Each segment arrives within its own deadline, though the whole
        // header takes longer than a single one.
        let writer = tokio::spawn(async move {
            client.write_all(&[PROXY, 0x11, 0, 16]).await.unwrap();
            tokio::time::sleep(Duration::from_secs(4)).await;
            client
                .write_all(&[1, 2, 3, 4, 5, 6, 7, 8, 0, 9, 0, 10])
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(4)).await;
            client.write_all(&[0; 4]).await.unwrap();
            client
        });

        let mut stream = PeekableStream::new(server);
        let header = parse(&mut stream, &config).await.unwrap();
        assert_eq!(header.source_address(), Some("1.2.3.4:9".parse().unwrap()));
        drop(writer.await.unwrap());

        // A stalled TLV section times out.
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(&[PROXY, 0x11, 0, 16]).await.unwrap();
        client
            .write_all(&[1, 2, 3, 4, 5, 6, 7, 8, 0, 9, 0, 10])
            .await
            .unwrap();
        let mut stream = PeekableStream::new(server);
        let err = parse(&mut stream, &config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.field(), Some(Field::Extensions));
        drop(client);
    }
}
