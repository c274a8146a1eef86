//! linkfront/src/protocol.rs
//! SOCKS5 wire format: method sub-negotiation, request parsing, replies.
//! Implements the RFC 1928 subset the proxy speaks: CONNECT only, no
//! authentication.

use crate::request::Request;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::error;

pub const SOCKS_VERSION: u8 = 0x05;

/// Largest greeting/request packet the server will read in one pass.
pub const MAX_PACKET: usize = 2048;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Reply codes sent in the second byte of the server reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    ServerFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// A request the state machine cannot serve. Each variant maps to the reply
/// code sent back before the session closes.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed SOCKS packet received from client")]
    Malformed,
    #[error("SOCKS version '{0}' not supported")]
    BadVersion(u8),
    #[error("SOCKS command '{0}' not supported")]
    BadCommand(u8),
    #[error("SOCKS address type '{0}' not supported")]
    BadAddressType(u8),
}

impl ProtocolError {
    pub fn reply(&self) -> Reply {
        match self {
            ProtocolError::Malformed => Reply::ServerFailure,
            ProtocolError::BadVersion(_) => Reply::ConnectionRefused,
            ProtocolError::BadCommand(_) => Reply::CommandNotSupported,
            ProtocolError::BadAddressType(_) => Reply::AddressTypeNotSupported,
        }
    }
}

/// Picks the method byte to answer a client greeting with: no-auth when the
/// client offers it, `0xFF` otherwise.
pub fn choose_method(packet: &[u8]) -> u8 {
    if packet.len() < 2 {
        error!("Malformed SOCKS packet received from client.");
        return METHOD_NO_ACCEPTABLE;
    }
    let version = packet[0];
    let nmethods = packet[1] as usize;
    let methods = &packet[2..];

    if version != SOCKS_VERSION {
        error!("SOCKS version '{version}' not supported.");
        return METHOD_NO_ACCEPTABLE;
    }
    if nmethods != methods.len() {
        error!("Malformed SOCKS packet received from client.");
        return METHOD_NO_ACCEPTABLE;
    }
    if methods.contains(&METHOD_NO_AUTH) {
        METHOD_NO_AUTH
    } else {
        METHOD_NO_ACCEPTABLE
    }
}

/// Runs the method sub-negotiation against the client. Returns `Ok(true)`
/// when no-auth was agreed; `Ok(false)` when the greeting was rejected (the
/// `0xFF` reply has already been sent).
pub async fn sub_negotiation<S>(stream: &mut S) -> io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; MAX_PACKET];
    let n = stream.read(&mut buf).await?;
    let method = choose_method(&buf[..n]);
    stream.write_all(&[SOCKS_VERSION, method]).await?;
    Ok(method != METHOD_NO_ACCEPTABLE)
}

/// Parses a CONNECT request packet into its destination.
pub fn parse_request(packet: &[u8]) -> Result<Request, ProtocolError> {
    if packet.len() < 4 {
        return Err(ProtocolError::Malformed);
    }
    let version = packet[0];
    let command = packet[1];
    let atyp = packet[3];

    if version != SOCKS_VERSION {
        return Err(ProtocolError::BadVersion(version));
    }
    if command != CMD_CONNECT {
        return Err(ProtocolError::BadCommand(command));
    }

    let (domain, port_offset) = match atyp {
        ATYP_IPV4 => {
            let octets: [u8; 4] = packet
                .get(4..8)
                .ok_or(ProtocolError::Malformed)?
                .try_into()
                .map_err(|_| ProtocolError::Malformed)?;
            (Ipv4Addr::from(octets).to_string(), 8)
        }
        ATYP_DOMAIN => {
            let len = *packet.get(4).ok_or(ProtocolError::Malformed)? as usize;
            let raw = packet.get(5..5 + len).ok_or(ProtocolError::Malformed)?;
            let domain = std::str::from_utf8(raw).map_err(|_| ProtocolError::Malformed)?;
            (domain.to_string(), 5 + len)
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = packet
                .get(4..20)
                .ok_or(ProtocolError::Malformed)?
                .try_into()
                .map_err(|_| ProtocolError::Malformed)?;
            (Ipv6Addr::from(octets).to_string(), 20)
        }
        other => return Err(ProtocolError::BadAddressType(other)),
    };

    let port_bytes: [u8; 2] = packet
        .get(port_offset..port_offset + 2)
        .ok_or(ProtocolError::Malformed)?
        .try_into()
        .map_err(|_| ProtocolError::Malformed)?;
    Ok(Request::new(domain, u16::from_be_bytes(port_bytes)))
}

/// Sends a server reply. BND.ADDR and BND.PORT are intentionally zeroed;
/// this server never exposes a bound address to the client.
pub async fn send_reply<S>(stream: &mut S, reply: Reply) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let packet = [
        SOCKS_VERSION,
        reply as u8,
        0x00,
        ATYP_IPV4,
        0x00,
        0x00,
        0x00,
        0x00,
        0x00,
        0x00,
    ];
    stream.write_all(&packet).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chooses_no_auth_when_offered() {
        assert_eq!(choose_method(&[0x05, 0x01, 0x00]), METHOD_NO_AUTH);
        assert_eq!(choose_method(&[0x05, 0x02, 0x02, 0x00]), METHOD_NO_AUTH);
    }

    #[test]
    fn rejects_bad_greetings() {
        // wrong version
        assert_eq!(choose_method(&[0x04, 0x01, 0x00]), METHOD_NO_ACCEPTABLE);
        // nmethods does not match the method list
        assert_eq!(choose_method(&[0x05, 0x02, 0x00]), METHOD_NO_ACCEPTABLE);
        // no-auth not offered
        assert_eq!(choose_method(&[0x05, 0x01, 0x02]), METHOD_NO_ACCEPTABLE);
        // truncated
        assert_eq!(choose_method(&[0x05]), METHOD_NO_ACCEPTABLE);
    }

    #[test]
    fn parses_an_ipv4_request() {
        let packet = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        assert_eq!(parse_request(&packet).unwrap(), Request::new("127.0.0.1", 80));
    }

    #[test]
    fn parses_a_domain_request() {
        let mut packet = vec![0x05, 0x01, 0x00, 0x03, 0x0B];
        packet.extend_from_slice(b"example.com");
        packet.extend_from_slice(&[0x00, 0x50]);
        assert_eq!(parse_request(&packet).unwrap(), Request::new("example.com", 80));
    }

    #[test]
    fn parses_an_ipv6_request() {
        let mut packet = vec![0x05, 0x01, 0x00, 0x04];
        packet.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        packet.extend_from_slice(&[0x1F, 0x90]);
        assert_eq!(parse_request(&packet).unwrap(), Request::new("::1", 8080));
    }

    #[test]
    fn rejects_unsupported_commands_and_address_types() {
        let bind = [0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        assert!(matches!(
            parse_request(&bind),
            Err(ProtocolError::BadCommand(0x02))
        ));
        let bad_atyp = [0x05, 0x01, 0x00, 0x05, 127, 0, 0, 1, 0x00, 0x50];
        assert!(matches!(
            parse_request(&bad_atyp),
            Err(ProtocolError::BadAddressType(0x05))
        ));
        let bad_version = [0x04, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        assert!(matches!(
            parse_request(&bad_version),
            Err(ProtocolError::BadVersion(0x04))
        ));
    }

    #[test]
    fn rejects_truncated_requests() {
        assert!(matches!(parse_request(&[0x05]), Err(ProtocolError::Malformed)));
        // domain length runs past the packet
        let packet = [0x05, 0x01, 0x00, 0x03, 0x20, b'a', 0x00, 0x50];
        assert!(matches!(parse_request(&packet), Err(ProtocolError::Malformed)));
        // missing port bytes
        let packet = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        assert!(matches!(parse_request(&packet), Err(ProtocolError::Malformed)));
    }
}
