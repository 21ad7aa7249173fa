//! shiftdns - a caching DNS forwarder.
//!
//! Queries arriving on a UDP socket are answered from an in-memory cache when
//! possible. Misses are raced against every configured upstream resolver and
//! the first reply is returned to the client and cached.
//!
//! ```no_run
//! use shiftdns::{Proxy, normalize_upstream};
//!
//! # async fn example() -> shiftdns::Result<()> {
//! let upstreams = vec![normalize_upstream("8.8.8.8"), normalize_upstream("1.1.1.1")];
//! let proxy = Proxy::new("127.0.0.1", 5353, upstreams);
//! proxy.start()?;
//! // ...
//! proxy.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod dns;
pub mod error;
mod proxy;
pub mod stats;
pub mod upstream;

pub use cache::DnsCache;
pub use dns::QuerySignature;
pub use error::{Error, Result};
pub use proxy::{Proxy, ProxyConfig};
pub use stats::StatsSnapshot;
pub use upstream::normalize_upstream;
