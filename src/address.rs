//! 주소 문자열 파싱

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::{Error, Result};

/// `"host:port"` 파싱. 호스트가 비어 있거나 `localhost`면 루프백
pub fn parse_address(address: &str) -> Result<SocketAddrV4> {
    let invalid = || Error::InvalidAddress(address.to_string());

    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.trim().parse().map_err(|_| invalid())?;

    let ip = match host.trim() {
        "" | "localhost" => Ipv4Addr::LOCALHOST,
        host => host.parse().map_err(|_| invalid())?,
    };

    Ok(SocketAddrV4::new(ip, port))
}
