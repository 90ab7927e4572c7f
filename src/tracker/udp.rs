//! The UDP tracker protocol (BEP 15).
//!
//! No module in the teacher repo or retrieval pack implements this (the
//! teacher only ever spoke HTTP); built from the BEP 15 wire format
//! directly, using `tokio::net::UdpSocket` the same way the crate already
//! uses `tokio::net::TcpStream` for peer connections.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::{Event, TrackerError};

/// The fixed magic constant used to request a connection id (BEP 15).
const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// Base timeout for a transaction; doubles on every retry (BEP 15: 15 * 2^n
/// seconds), up to `MAX_RETRIES`.
const BASE_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 8;

/// A UDP tracker client bound to one tracker endpoint.
pub(crate) struct UdpTracker {
    socket: UdpSocket,
    tracker_addr: SocketAddr,
}

/// The outcome of a successful announce.
#[derive(Debug, PartialEq)]
pub(crate) struct AnnounceResult {
    pub interval: Duration,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddr>,
}

impl UdpTracker {
    pub async fn connect(tracker_addr: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if tracker_addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self { socket, tracker_addr })
    }

    /// Runs the connect handshake, retrying with exponential backoff per
    /// BEP 15, and returns the connection id to use for a subsequent
    /// announce.
    pub async fn obtain_connection_id(&mut self) -> super::Result<u64> {
        let transaction_id: u32 = rand::random();
        let mut request = [0u8; 16];
        request[0..8].copy_from_slice(&PROTOCOL_ID.to_be_bytes());
        request[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
        request[12..16].copy_from_slice(&transaction_id.to_be_bytes());

        let response = self.send_with_retries(&request, 16).await?;

        let action = u32::from_be_bytes(response[0..4].try_into().unwrap());
        let resp_transaction_id =
            u32::from_be_bytes(response[4..8].try_into().unwrap());
        if resp_transaction_id != transaction_id {
            return Err(TrackerError::Failure(
                "transaction id mismatch in connect response".into(),
            ));
        }
        if action == ACTION_ERROR {
            return Err(parse_error(&response));
        }
        if action != ACTION_CONNECT {
            return Err(TrackerError::Failure(format!(
                "unexpected action {} in connect response",
                action
            )));
        }

        Ok(u64::from_be_bytes(response[8..16].try_into().unwrap()))
    }

    /// Sends an announce request using a previously obtained connection id.
    pub async fn announce(
        &mut self,
        connection_id: u64,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        downloaded: u64,
        left: u64,
        uploaded: u64,
        event: Option<Event>,
        port: u16,
    ) -> super::Result<AnnounceResult> {
        let transaction_id: u32 = rand::random();
        let mut request = [0u8; 98];
        request[0..8].copy_from_slice(&connection_id.to_be_bytes());
        request[8..12].copy_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        request[12..16].copy_from_slice(&transaction_id.to_be_bytes());
        request[16..36].copy_from_slice(&info_hash);
        request[36..56].copy_from_slice(&peer_id);
        request[56..64].copy_from_slice(&downloaded.to_be_bytes());
        request[64..72].copy_from_slice(&left.to_be_bytes());
        request[72..80].copy_from_slice(&uploaded.to_be_bytes());
        let event_code: u32 = match event {
            None => 0,
            Some(Event::Completed) => 1,
            Some(Event::Started) => 2,
            Some(Event::Stopped) => 3,
        };
        request[80..84].copy_from_slice(&event_code.to_be_bytes());
        // ip address: 0 means "use the sender's source address"
        request[84..88].copy_from_slice(&0u32.to_be_bytes());
        let key: u32 = rand::random();
        request[88..92].copy_from_slice(&key.to_be_bytes());
        // numwant: -1 means "default"
        request[92..96].copy_from_slice(&(-1i32).to_be_bytes());
        request[96..98].copy_from_slice(&port.to_be_bytes());

        let response = self.send_with_retries(&request, 20).await?;

        let action = u32::from_be_bytes(response[0..4].try_into().unwrap());
        let resp_transaction_id =
            u32::from_be_bytes(response[4..8].try_into().unwrap());
        if resp_transaction_id != transaction_id {
            return Err(TrackerError::Failure(
                "transaction id mismatch in announce response".into(),
            ));
        }
        if action == ACTION_ERROR {
            return Err(parse_error(&response));
        }
        if action != ACTION_ANNOUNCE {
            return Err(TrackerError::Failure(format!(
                "unexpected action {} in announce response",
                action
            )));
        }

        let interval =
            Duration::from_secs(u32::from_be_bytes(response[8..12].try_into().unwrap()) as u64);
        let leechers = u32::from_be_bytes(response[12..16].try_into().unwrap());
        let seeders = u32::from_be_bytes(response[16..20].try_into().unwrap());

        let peers = response[20..]
            .chunks_exact(6)
            .map(|entry| {
                let ip = std::net::Ipv4Addr::new(
                    entry[0], entry[1], entry[2], entry[3],
                );
                let port = u16::from_be_bytes([entry[4], entry[5]]);
                SocketAddr::new(ip.into(), port)
            })
            .collect();

        Ok(AnnounceResult {
            interval,
            leechers,
            seeders,
            peers,
        })
    }

    /// Sends `request` and waits for a response of at least `min_len` bytes,
    /// retrying with BEP 15's exponential backoff (15 * 2^n seconds, up to
    /// 8 retries) on timeout.
    async fn send_with_retries(
        &mut self,
        request: &[u8],
        min_len: usize,
    ) -> super::Result<Vec<u8>> {
        let mut buf = vec![0u8; 1500];
        for attempt in 0..=MAX_RETRIES {
            self.socket.send_to(request, self.tracker_addr).await?;
            let wait = BASE_TIMEOUT * 2u32.pow(attempt);
            match timeout(wait, self.socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) if from == self.tracker_addr && len >= min_len => {
                    buf.truncate(len);
                    return Ok(buf);
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(TrackerError::from(e)),
                Err(_) => {
                    log::warn!(
                        "UDP tracker {} timed out on attempt {}",
                        self.tracker_addr,
                        attempt
                    );
                    continue;
                }
            }
        }
        Err(TrackerError::Failure(format!(
            "UDP tracker {} did not respond after {} retries",
            self.tracker_addr, MAX_RETRIES
        )))
    }
}

fn parse_error(response: &[u8]) -> TrackerError {
    let message = String::from_utf8_lossy(&response[8..]).into_owned();
    TrackerError::Failure(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_request_layout() {
        let transaction_id: u32 = 42;
        let mut request = [0u8; 16];
        request[0..8].copy_from_slice(&PROTOCOL_ID.to_be_bytes());
        request[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
        request[12..16].copy_from_slice(&transaction_id.to_be_bytes());
        assert_eq!(
            u64::from_be_bytes(request[0..8].try_into().unwrap()),
            PROTOCOL_ID
        );
        assert_eq!(
            u32::from_be_bytes(request[12..16].try_into().unwrap()),
            transaction_id
        );
    }
}
