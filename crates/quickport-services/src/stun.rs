//! Minimal STUN client (RFC 5389): a single Binding request used to learn
//! the public address a NAT maps our UDP traffic to.
//!
//! Only what the rendezvous needs is implemented: the request carries no
//! attributes and only XOR-MAPPED-ADDRESS is read from the response.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use rand::RngCore;
use static_assertions::assert_eq_size;
use tokio::net::UdpSocket;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// STUN message header. Network byte order.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct StunHeader {
    msg_type: U16<BigEndian>,
    /// Attribute bytes following the header.
    length: U16<BigEndian>,
    cookie: U32<BigEndian>,
    transaction_id: [u8; 12],
}

assert_eq_size!(StunHeader, [u8; 20]);

const HEADER_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum StunError {
    #[error("STUN I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not resolve STUN server {0}")]
    Resolve(String),
    #[error("STUN server did not answer within {0:?}")]
    Timeout(Duration),
    #[error("STUN response too short ({0} bytes)")]
    TooShort(usize),
    #[error("STUN response has wrong magic cookie")]
    BadCookie,
    #[error("STUN response is not a binding success (type {0:#06x})")]
    NotSuccess(u16),
    #[error("STUN response transaction id does not match request")]
    TransactionMismatch,
    #[error("STUN response carries no XOR-MAPPED-ADDRESS")]
    MissingMappedAddress,
}

/// Build a Binding request with the given transaction id.
pub fn binding_request(transaction_id: [u8; 12]) -> Vec<u8> {
    StunHeader {
        msg_type: U16::new(BINDING_REQUEST),
        length: U16::new(0),
        cookie: U32::new(MAGIC_COOKIE),
        transaction_id,
    }
    .as_bytes()
    .to_vec()
}

/// Extract the XOR-mapped address from a Binding success response.
pub fn parse_binding_response(buf: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr, StunError> {
    let header = StunHeader::read_from_prefix(buf).ok_or(StunError::TooShort(buf.len()))?;
    if header.cookie.get() != MAGIC_COOKIE {
        return Err(StunError::BadCookie);
    }
    if header.msg_type.get() != BINDING_SUCCESS {
        return Err(StunError::NotSuccess(header.msg_type.get()));
    }
    if &header.transaction_id != transaction_id {
        return Err(StunError::TransactionMismatch);
    }

    let end = (HEADER_LEN + header.length.get() as usize).min(buf.len());
    let mut offset = HEADER_LEN;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_len > end {
            break;
        }
        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            if let Some(addr) = decode_xor_address(&buf[offset..offset + attr_len], transaction_id) {
                return Ok(addr);
            }
        }
        // Attributes are padded to a 4-byte boundary.
        offset += attr_len.div_ceil(4) * 4;
    }
    Err(StunError::MissingMappedAddress)
}

fn decode_xor_address(value: &[u8], transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    let cookie = MAGIC_COOKIE.to_be_bytes();

    match value[1] {
        FAMILY_IPV4 if value.len() >= 8 => {
            let mut ip = [0u8; 4];
            for (i, b) in ip.iter_mut().enumerate() {
                *b = value[4 + i] ^ cookie[i];
            }
            Some(SocketAddr::new(Ipv4Addr::from(ip).into(), port))
        }
        FAMILY_IPV6 if value.len() >= 20 => {
            let key: Vec<u8> = cookie.iter().chain(transaction_id.iter()).copied().collect();
            let mut ip = [0u8; 16];
            for (i, b) in ip.iter_mut().enumerate() {
                *b = value[4 + i] ^ key[i];
            }
            Some(SocketAddr::new(Ipv6Addr::from(ip).into(), port))
        }
        _ => None,
    }
}

/// Ask `server` which public address our traffic appears to come from.
/// Uses a throwaway socket.
pub async fn query_mapped_address(server: &str, timeout: Duration) -> Result<SocketAddr, StunError> {
    let server_addr = tokio::net::lookup_host(server)
        .await
        .map_err(|_| StunError::Resolve(server.to_string()))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| StunError::Resolve(server.to_string()))?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);

    socket.send_to(&binding_request(transaction_id), server_addr).await?;
    tracing::debug!(server = %server_addr, txid = %hex::encode(transaction_id), "STUN binding request sent");

    let mut buf = [0u8; 512];
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let (len, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| StunError::Timeout(timeout))??;
        if from != server_addr {
            tracing::trace!(%from, "ignoring datagram from non-STUN source");
            continue;
        }
        let mapped = parse_binding_response(&buf[..len], &transaction_id)?;
        tracing::debug!(server = %server_addr, %mapped, "STUN mapped address");
        return Ok(mapped);
    }
}
