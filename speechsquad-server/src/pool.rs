//! Channel pool with power-of-two-choices balancing.
//!
//! Each downstream service gets a fixed set of persistent channels. A new
//! stream context leases one channel; the pool picks the less loaded of two
//! random candidates, where load is an explicit per-channel in-flight count
//! (every live lease holds the counter up).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::ServerError;

/// Readiness deadline for every channel at startup.
const WARMUP_TIMEOUT: Duration = Duration::from_secs(10);

struct PooledChannel {
    channel: Channel,
    in_flight: Arc<AtomicUsize>,
}

/// A leased channel. The in-flight count stays raised until the lease drops,
/// so holding the lease for the lifetime of a call is what makes the P2C
/// pick meaningful.
pub struct ChannelLease {
    channel: Channel,
    in_flight: Arc<AtomicUsize>,
}

impl ChannelLease {
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct ChannelPool {
    uri: String,
    channels: Vec<PooledChannel>,
}

impl ChannelPool {
    /// Open `count` persistent channels to `uri` and wait for each to become
    /// ready. Failure here is fatal at startup.
    pub async fn connect(uri: &str, count: usize) -> Result<Self, ServerError> {
        let endpoint = endpoint_for(uri)?;
        let mut channels = Vec::with_capacity(count);
        for i in 0..count {
            debug!("establishing downstream connection {} of {} to {}", i + 1, count, uri);
            let channel = tokio::time::timeout(WARMUP_TIMEOUT, endpoint.connect())
                .await
                .map_err(|_| ServerError::Unavailable(format!("timed out connecting to {uri}")))?
                .map_err(|e| ServerError::Unavailable(format!("failed to connect to {uri}: {e}")))?;
            channels.push(PooledChannel {
                channel,
                in_flight: Arc::new(AtomicUsize::new(0)),
            });
        }
        Ok(Self {
            uri: uri.to_string(),
            channels,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Lease a channel, picking the less loaded of two distinct random
    /// candidates (P2C). With a single channel there is nothing to choose.
    pub fn lease(&self) -> ChannelLease {
        let index = match self.channels.len() {
            1 => 0,
            n => {
                let mut rng = rand::thread_rng();
                let r1 = rng.gen_range(0..n);
                let mut r2 = rng.gen_range(0..n - 1);
                if r2 >= r1 {
                    r2 += 1;
                }
                let load1 = self.channels[r1].in_flight.load(Ordering::Relaxed);
                let load2 = self.channels[r2].in_flight.load(Ordering::Relaxed);
                if load1 <= load2 { r1 } else { r2 }
            }
        };
        let slot = &self.channels[index];
        slot.in_flight.fetch_add(1, Ordering::Relaxed);
        ChannelLease {
            channel: slot.channel.clone(),
            in_flight: Arc::clone(&slot.in_flight),
        }
    }

    #[cfg(test)]
    fn with_channels(uri: &str, channels: Vec<Channel>) -> Self {
        Self {
            uri: uri.to_string(),
            channels: channels
                .into_iter()
                .map(|channel| PooledChannel {
                    channel,
                    in_flight: Arc::new(AtomicUsize::new(0)),
                })
                .collect(),
        }
    }

    #[cfg(test)]
    fn loads(&self) -> Vec<usize> {
        self.channels
            .iter()
            .map(|c| c.in_flight.load(Ordering::Relaxed))
            .collect()
    }
}

/// Flag values are `host:port`; tonic endpoints want a scheme.
pub fn endpoint_for(uri: &str) -> Result<Endpoint, ServerError> {
    let dst = if uri.contains("://") {
        uri.to_string()
    } else {
        format!("http://{uri}")
    };
    Endpoint::from_shared(dst)
        .map_err(|e| ServerError::InvalidArg(format!("bad downstream uri {uri}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_pool(count: usize) -> ChannelPool {
        let channels = (0..count)
            .map(|_| endpoint_for("localhost:19999").unwrap().connect_lazy())
            .collect();
        ChannelPool::with_channels("localhost:19999", channels)
    }

    #[tokio::test]
    async fn test_single_channel_fast_path() {
        let pool = lazy_pool(1);
        let lease = pool.lease();
        assert_eq!(pool.loads(), vec![1]);
        drop(lease);
        assert_eq!(pool.loads(), vec![0]);
    }

    #[tokio::test]
    async fn test_lease_guard_tracks_in_flight() {
        let pool = lazy_pool(4);
        let leases: Vec<_> = (0..8).map(|_| pool.lease()).collect();
        assert_eq!(pool.loads().iter().sum::<usize>(), 8);
        drop(leases);
        assert_eq!(pool.loads().iter().sum::<usize>(), 0);
    }

    #[tokio::test]
    async fn test_p2c_avoids_the_hottest_channel() {
        // Pin one channel far above the other; with two channels the two
        // distinct picks always see both, so the hot one must never win.
        let pool = lazy_pool(2);
        pool.channels[0].in_flight.fetch_add(1000, Ordering::Relaxed);
        let leases: Vec<_> = (0..32).map(|_| pool.lease()).collect();
        assert_eq!(pool.loads(), vec![1000, 32]);
        drop(leases);
    }

    #[test]
    fn test_endpoint_requires_parseable_uri() {
        assert!(endpoint_for("localhost:50051").is_ok());
        assert!(endpoint_for("http://localhost:50051").is_ok());
    }
}
