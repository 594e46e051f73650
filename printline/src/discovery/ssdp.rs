//! SSDP printer search.
//!
//! The printer listens for `M-SEARCH` on a vendor port rather than 1900 and
//! answers with its serial in `USN` and its address in `Location`.

use super::DeviceLocator;
use crate::errors::PrintlineError;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info};

const SSDP_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const SSDP_PORT: u16 = 2021;
const SEARCH_TARGET: &str = "urn:bambulab-com:device:3dprinter:1";

/// The `M-SEARCH` datagram.
#[must_use]
pub fn search_request() -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\nHOST: {SSDP_GROUP}:{SSDP_PORT}\r\nMAN: \"ssdp:discover\"\r\nMX: 3\r\nST: {SEARCH_TARGET}\r\n\r\n"
    )
}

/// Extracts the printer address from one response.
///
/// Returns `None` for responses from other device types, and for responses
/// whose `USN` names a different serial when `serial` is non-empty. The
/// address comes from `Location` when it holds one, otherwise from the
/// sender.
#[must_use]
pub fn parse_response(datagram: &str, from: IpAddr, serial: &str) -> Option<IpAddr> {
    let lowered = datagram.to_ascii_lowercase();
    if !lowered.contains("bambu") && !lowered.contains("3dprinter") {
        return None;
    }

    let header = |name: &str| {
        datagram.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    };

    if !serial.is_empty() {
        if let Some(usn) = header("USN") {
            if !usn.eq_ignore_ascii_case(serial) {
                return None;
            }
        }
    }

    let location = header("Location").and_then(|value| location_ip(&value));
    Some(location.unwrap_or(from))
}

/// Accepts a bare address or a URL such as `http://10.0.0.9:80/desc.xml`.
fn location_ip(value: &str) -> Option<IpAddr> {
    let rest = value.split_once("://").map_or(value, |(_, rest)| rest);
    let authority = rest.split('/').next()?;
    authority
        .parse::<IpAddr>()
        .ok()
        .or_else(|| authority.parse::<SocketAddr>().ok().map(|s| s.ip()))
}

/// Sends one search and waits for a matching answer.
#[derive(Debug, Clone)]
pub struct SsdpLocator {
    target: SocketAddr,
}

impl Default for SsdpLocator {
    fn default() -> Self {
        Self {
            target: SocketAddr::from((SSDP_GROUP, SSDP_PORT)),
        }
    }
}

impl SsdpLocator {
    /// Searches by sending to `target` instead of the multicast group.
    #[must_use]
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

#[async_trait]
impl DeviceLocator for SsdpLocator {
    async fn locate(&self, serial: &str, window: Duration) -> Result<Option<IpAddr>, PrintlineError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_multicast_ttl_v4(2)?;
        socket
            .send_to(search_request().as_bytes(), self.target)
            .await?;
        debug!(target = %self.target, serial, "ssdp search sent");

        let deadline = Instant::now() + window;
        let mut buf = [0u8; 4096];
        loop {
            let Ok(received) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await else {
                debug!(serial, "no printer answered ssdp search");
                return Ok(None);
            };
            let (len, from) = received?;
            let datagram = String::from_utf8_lossy(&buf[..len]);
            if let Some(addr) = parse_response(&datagram, from.ip(), serial) {
                info!(printer = %addr, serial, "printer located");
                return Ok(Some(addr));
            }
            debug!(from = %from, "ignoring ssdp response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RESPONSE: &str = "HTTP/1.1 200 OK\r\n\
        Server: Buildroot/2018.02-rc3 UPnP/1.0 ssdpd/1.8\r\n\
        Location: 192.168.1.77\r\n\
        ST: urn:bambulab-com:device:3dprinter:1\r\n\
        USN: 01S00C123456789\r\n\
        DevModel.bambu.com: C12\r\n\
        DevName.bambu.com: P1S\r\n\r\n";

    fn sender() -> IpAddr {
        IpAddr::from([192, 168, 1, 2])
    }

    #[test]
    fn test_search_request_targets_printers() {
        let request = search_request();
        assert!(request.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(request.contains("HOST: 239.255.255.250:2021\r\n"));
        assert!(request.contains("ST: urn:bambulab-com:device:3dprinter:1\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_location_header_wins_over_sender() {
        let addr = parse_response(RESPONSE, sender(), "01S00C123456789");
        assert_eq!(addr, Some(IpAddr::from([192, 168, 1, 77])));
    }

    #[test]
    fn test_other_serial_is_ignored() {
        assert_eq!(parse_response(RESPONSE, sender(), "01P00A000000000"), None);
        assert!(parse_response(RESPONSE, sender(), "").is_some());
    }

    #[test]
    fn test_other_devices_are_ignored() {
        let tv = "HTTP/1.1 200 OK\r\nST: urn:dial-multiscreen-org:service:dial:1\r\nLocation: http://192.168.1.30:8008/dd.xml\r\n\r\n";
        assert_eq!(parse_response(tv, sender(), ""), None);
    }

    #[test]
    fn test_url_location_and_sender_fallback() {
        let url = "NOTIFY * HTTP/1.1\r\nNT: urn:bambulab-com:device:3dprinter:1\r\nLocation: http://10.0.0.9:80/desc.xml\r\n\r\n";
        assert_eq!(parse_response(url, sender(), ""), Some(IpAddr::from([10, 0, 0, 9])));

        let bare = "NOTIFY * HTTP/1.1\r\nNT: urn:bambulab-com:device:3dprinter:1\r\n\r\n";
        assert_eq!(parse_response(bare, sender(), ""), Some(sender()));
    }

    #[tokio::test]
    async fn test_locate_answers_from_responder() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = responder.local_addr().unwrap();
        let answer = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (len, from) = responder.recv_from(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..len]).starts_with("M-SEARCH"));
            responder
                .send_to(b"HTTP/1.1 200 OK\r\nST: urn:dial-multiscreen-org:service:dial:1\r\n\r\n", from)
                .await
                .unwrap();
            responder.send_to(RESPONSE.as_bytes(), from).await.unwrap();
        });

        let addr = SsdpLocator::new(target)
            .locate("01S00C123456789", Duration::from_secs(5))
            .await
            .unwrap();
        answer.await.unwrap();
        assert_eq!(addr, Some(IpAddr::from([192, 168, 1, 77])));
    }

    #[tokio::test]
    async fn test_locate_silence_is_none() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = SsdpLocator::new(responder.local_addr().unwrap())
            .locate("", Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(addr, None);
    }
}
