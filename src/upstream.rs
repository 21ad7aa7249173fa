//! Upstream resolvers.
//!
//! A miss is resolved by sending the raw query to every configured upstream
//! at once and keeping whichever answer arrives first.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UdpSocket, lookup_host};
use tokio::sync::mpsc;
use tracing::debug;

use crate::dns::HEADER_LEN;
use crate::error::{Error, Result};

/// Port assumed when an upstream is given without one.
pub const DEFAULT_DNS_PORT: u16 = 53;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Append the default DNS port to an upstream that has none.
///
/// `8.8.8.8` becomes `8.8.8.8:53`, `::1` and `[::1]` become `[::1]:53`,
/// `dns.google` becomes `dns.google:53`. Anything carrying a port is returned
/// as is.
pub fn normalize_upstream(server: &str) -> String {
    let server = server.trim();

    if let Ok(ip) = server.parse::<IpAddr>() {
        return SocketAddr::new(ip, DEFAULT_DNS_PORT).to_string();
    }
    if server.starts_with('[') && server.ends_with(']') {
        return format!("{server}:{DEFAULT_DNS_PORT}");
    }
    if server.contains(':') {
        return server.to_owned();
    }
    format!("{server}:{DEFAULT_DNS_PORT}")
}

/// Send `query` to a single upstream and wait for its reply.
///
/// Resolution, connect and the read all count against `timeout`.
pub async fn exchange(upstream: &str, query: &[u8], timeout: Duration) -> Result<Vec<u8>> {
    match tokio::time::timeout(timeout, exchange_inner(upstream, query)).await {
        Ok(result) => result.map_err(|source| Error::UpstreamUnreachable {
            upstream: upstream.to_owned(),
            source,
        }),
        Err(_) => Err(Error::UpstreamTimeout {
            upstream: upstream.to_owned(),
            after: timeout,
        }),
    }
}

async fn exchange_inner(upstream: &str, query: &[u8]) -> io::Result<Vec<u8>> {
    let addr = lookup_host(upstream)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address for upstream"))?;

    let local: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    socket.send(query).await?;

    let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
    let len = socket.recv(&mut buf).await?;
    buf.truncate(len);

    Ok(buf)
}

/// The first usable answer of a race.
#[derive(Debug, Clone)]
pub struct RaceWinner {
    pub upstream: String,
    pub response: Vec<u8>,
}

/// Race `query` against every upstream and return the first answer.
///
/// Each upstream gets its own task bounded by `upstream_timeout`. Answers go
/// to a channel with one slot per upstream, so a slow resolver never blocks a
/// fast one and losers finish without waiting on anybody. Returns `None` when
/// `query_timeout` elapses first or every upstream has failed.
pub async fn race(
    upstreams: &[String],
    query: &[u8],
    upstream_timeout: Duration,
    query_timeout: Duration,
) -> Option<RaceWinner> {
    if upstreams.is_empty() {
        return None;
    }

    let (tx, mut rx) = mpsc::channel(upstreams.len());
    let query: Arc<[u8]> = Arc::from(query);

    for upstream in upstreams {
        let tx = tx.clone();
        let query = query.clone();
        let upstream = upstream.clone();

        tokio::spawn(async move {
            debug!(%upstream, "forwarding query");
            match exchange(&upstream, &query, upstream_timeout).await {
                Ok(response) if response.len() < HEADER_LEN => {
                    debug!(%upstream, bytes = response.len(), "discarding runt reply");
                }
                Ok(response) => {
                    debug!(%upstream, bytes = response.len(), "upstream answered");
                    // Fails only once the coordinator has given up.
                    let _ = tx.try_send(RaceWinner { upstream, response });
                }
                Err(e) => debug!(error = %e, "upstream query failed"),
            }
        });
    }
    drop(tx);

    match tokio::time::timeout(query_timeout, rx.recv()).await {
        Ok(winner) => winner,
        Err(_) => None,
    }
}
