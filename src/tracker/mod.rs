//! HTTP tracker announce/scrape (BEP 3), plus the UDP tracker protocol
//! (BEP 15) in the `udp` submodule.
//!
//! Grounded on `coleleavitt-cratetorrent`'s fork of this exact module
//! (`tracker/mod.rs`): the `Announce`/`Response` shapes and the compact
//! peer string deserializer are carried over near-verbatim, with the
//! feature-gated spoofing/injection/ratio knobs (not present in the
//! original cratetorrent and out of scope here) stripped out.

pub(crate) mod udp;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Buf;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, Url};
use serde::{de, Deserialize};

pub(crate) type Result<T> = std::result::Result<T, TrackerError>;

/// Errors that may occur while contacting an HTTP tracker.
#[derive(Debug)]
#[non_exhaustive]
pub enum TrackerError {
    Bencode(serde_bencode::Error),
    Http(reqwest::Error),
    /// A UDP tracker transport failure (BEP 15).
    Io(std::io::Error),
    /// The tracker responded with a `failure reason` field.
    Failure(String),
}

impl From<serde_bencode::Error> for TrackerError {
    fn from(e: serde_bencode::Error) -> Self {
        TrackerError::Bencode(e)
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        TrackerError::Http(e)
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(e: std::io::Error) -> Self {
        TrackerError::Io(e)
    }
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::Bencode(e) => write!(f, "bencode error: {}", e),
            TrackerError::Http(e) => write!(f, "http error: {}", e),
            TrackerError::Io(e) => write!(f, "udp tracker io error: {}", e),
            TrackerError::Failure(reason) => {
                write!(f, "tracker returned failure: {}", reason)
            }
        }
    }
}

impl std::error::Error for TrackerError {}

/// The event accompanying an announce, per BEP 3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    Started,
    Completed,
    Stopped,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Completed => "completed",
            Event::Stopped => "stopped",
        }
    }
}

/// Parameters for an announce request.
#[derive(Clone)]
pub(crate) struct Announce {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub ip: Option<IpAddr>,
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub peer_count: Option<usize>,
    pub tracker_id: Option<String>,
    pub event: Option<Event>,
}

/// The bencoded tracker announce response (BEP 3).
#[derive(Debug, Deserialize, PartialEq)]
pub(crate) struct Response {
    #[serde(rename = "tracker id")]
    pub tracker_id: Option<String>,
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,
    #[serde(rename = "warning message")]
    pub warning_message: Option<String>,

    #[serde(default, deserialize_with = "deserialize_seconds")]
    pub interval: Option<Duration>,

    #[serde(
        default,
        rename = "min interval",
        deserialize_with = "deserialize_seconds"
    )]
    pub min_interval: Option<Duration>,

    #[serde(rename = "complete")]
    pub seeder_count: Option<usize>,
    #[serde(rename = "incomplete")]
    pub leecher_count: Option<usize>,

    #[serde(default, deserialize_with = "deserialize_peers")]
    pub peers: Vec<SocketAddr>,
}

/// An HTTP tracker client bound to one announce URL.
#[derive(Clone)]
pub(crate) struct HttpTracker {
    client: Client,
    url: Url,
}

impl HttpTracker {
    pub fn new(url: Url) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }

    /// Sends an announce request and parses the bencoded response,
    /// returning `TrackerError::Failure` if the tracker reported one.
    pub async fn announce(&self, params: Announce) -> Result<Response> {
        let mut url = self.url.clone();
        {
            let mut q = url.query_pairs_mut();
            q.append_pair(
                "info_hash",
                &percent_encoding::percent_encode(
                    &params.info_hash,
                    URL_ENCODE_RESERVED,
                )
                .to_string(),
            );
            q.append_pair(
                "peer_id",
                &percent_encoding::percent_encode(
                    &params.peer_id,
                    URL_ENCODE_RESERVED,
                )
                .to_string(),
            );
            q.append_pair("port", &params.port.to_string());
            q.append_pair("downloaded", &params.downloaded.to_string());
            q.append_pair("uploaded", &params.uploaded.to_string());
            q.append_pair("left", &params.left.to_string());
            q.append_pair("compact", "1");

            if let Some(numwant) = params.peer_count {
                q.append_pair("numwant", &numwant.to_string());
            }
            if let Some(ip) = params.ip {
                q.append_pair("ip", &ip.to_string());
            }
            if let Some(event) = params.event {
                q.append_pair("event", event.as_str());
            }
            if let Some(tracker_id) = &params.tracker_id {
                q.append_pair("trackerid", tracker_id);
            }
        }

        log::info!("Announcing to tracker {}", self.url);
        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let resp: Response = serde_bencode::from_bytes(&bytes)?;
        if let Some(reason) = resp.failure_reason {
            return Err(TrackerError::Failure(reason));
        }
        Ok(resp)
    }
}

impl fmt::Display for HttpTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HttpTracker({})", self.url)
    }
}

/// The outcome of an announce, normalized across the HTTP (BEP 3) and UDP
/// (BEP 15) transports so callers don't need to care which protocol a given
/// tier's tracker speaks.
pub(crate) struct AnnounceOutcome {
    pub interval: Option<Duration>,
    pub min_interval: Option<Duration>,
    pub seeder_count: Option<usize>,
    pub leecher_count: Option<usize>,
    pub peers: Vec<SocketAddr>,
}

impl From<Response> for AnnounceOutcome {
    fn from(resp: Response) -> Self {
        Self {
            interval: resp.interval,
            min_interval: resp.min_interval,
            seeder_count: resp.seeder_count,
            leecher_count: resp.leecher_count,
            peers: resp.peers,
        }
    }
}

impl From<udp::AnnounceResult> for AnnounceOutcome {
    fn from(result: udp::AnnounceResult) -> Self {
        Self {
            interval: Some(result.interval),
            min_interval: None,
            seeder_count: Some(result.seeders as usize),
            leecher_count: Some(result.leechers as usize),
            peers: result.peers,
        }
    }
}

/// A single tracker endpoint, speaking either BEP 3 (HTTP/HTTPS) or BEP 15
/// (UDP), as used within one `announce-list` tier (BEP 12).
pub(crate) enum TrackerClient {
    Http(HttpTracker),
    /// The UDP tracker's socket is opened fresh for each announce rather
    /// than kept alive between them, since announces are many minutes apart
    /// and a stale `connection_id` expires after two minutes anyway.
    Udp(Url),
}

impl TrackerClient {
    /// Builds a client for `url`, or `None` if its scheme isn't a tracker
    /// protocol this crate speaks.
    pub fn from_url(url: Url) -> Option<Self> {
        match url.scheme() {
            "http" | "https" => Some(TrackerClient::Http(HttpTracker::new(url))),
            "udp" => Some(TrackerClient::Udp(url)),
            _ => None,
        }
    }

    pub async fn announce(&self, params: Announce) -> Result<AnnounceOutcome> {
        match self {
            TrackerClient::Http(tracker) => {
                tracker.announce(params).await.map(AnnounceOutcome::from)
            }
            TrackerClient::Udp(url) => {
                let host = url.host_str().ok_or_else(|| {
                    TrackerError::Failure("udp tracker url has no host".to_string())
                })?;
                let port = url.port().ok_or_else(|| {
                    TrackerError::Failure("udp tracker url has no port".to_string())
                })?;
                let addr = tokio::net::lookup_host((host, port))
                    .await?
                    .next()
                    .ok_or_else(|| {
                        TrackerError::Failure(format!(
                            "udp tracker host {} did not resolve",
                            host
                        ))
                    })?;
                let mut tracker = udp::UdpTracker::connect(addr).await?;
                let connection_id = tracker.obtain_connection_id().await?;
                let result = tracker
                    .announce(
                        connection_id,
                        params.info_hash,
                        params.peer_id,
                        params.downloaded,
                        params.left,
                        params.uploaded,
                        params.event,
                        params.port,
                    )
                    .await?;
                Ok(AnnounceOutcome::from(result))
            }
        }
    }
}

impl fmt::Display for TrackerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerClient::Http(tracker) => write!(f, "{}", tracker),
            TrackerClient::Udp(url) => write!(f, "UdpTracker({})", url),
        }
    }
}

const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn deserialize_seconds<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let opt: Option<u64> = Option::deserialize(deserializer)?;
    Ok(opt.map(Duration::from_secs))
}

/// Accepts either the compact peer string (6 bytes per peer: 4-byte IPv4 +
/// 2-byte port) or the older list-of-dicts format.
fn deserialize_peers<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct PeersVisitor;

    impl<'de> de::Visitor<'de> for PeersVisitor {
        type Value = Vec<SocketAddr>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a compact peer string or a list of peer dicts")
        }

        fn visit_bytes<E>(
            self,
            mut bytes: &[u8],
        ) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            const ENTRY_LEN: usize = 6;
            if bytes.len() % ENTRY_LEN != 0 {
                return Err(de::Error::custom(
                    "compact peers length must be a multiple of 6",
                ));
            }
            let mut peers = Vec::with_capacity(bytes.len() / ENTRY_LEN);
            while !bytes.is_empty() {
                let ip = Ipv4Addr::from(bytes.get_u32());
                let port = bytes.get_u16();
                peers.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
            Ok(peers)
        }

        fn visit_seq<A>(
            self,
            mut seq: A,
        ) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct RawPeer {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(RawPeer { ip, port }) = seq.next_element()? {
                if let Ok(addr) = ip.parse() {
                    peers.push(SocketAddr::new(addr, port));
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeersVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_compact_peers() {
        #[derive(Deserialize)]
        struct Wrapper(
            #[serde(deserialize_with = "deserialize_peers")] Vec<SocketAddr>,
        );

        let mut raw = Vec::new();
        raw.extend_from_slice(&[127, 0, 0, 1]);
        raw.extend_from_slice(&6881u16.to_be_bytes());
        raw.extend_from_slice(&[10, 0, 0, 1]);
        raw.extend_from_slice(&6882u16.to_be_bytes());

        let encoded = serde_bencode::to_bytes(&serde_bytes::Bytes::new(&raw))
            .unwrap();
        let wrapper: Wrapper = serde_bencode::from_bytes(&encoded).unwrap();
        assert_eq!(wrapper.0.len(), 2);
        assert_eq!(wrapper.0[0].port(), 6881);
        assert_eq!(wrapper.0[1].port(), 6882);
    }

    #[test]
    fn test_response_parses_failure_reason() {
        let bencoded =
            b"d14:failure reason18:no such info_hashe".to_vec();
        let resp: Response = serde_bencode::from_bytes(&bencoded).unwrap();
        assert_eq!(
            resp.failure_reason.as_deref(),
            Some("no such info_hash")
        );
    }
}
