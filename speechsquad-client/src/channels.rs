//! Client channel set.
//!
//! A handful of persistent channels to the squad service, picked per task by
//! power-of-two-choices: every live task holds an `Arc` onto its channel, so
//! the strong count approximates the number of streams in flight there.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::error::ClientError;

const WARMUP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ChannelSet {
    channels: Vec<Arc<Channel>>,
}

impl ChannelSet {
    /// Open `count` channels and wait for readiness; any failure aborts the
    /// run before load starts.
    pub async fn connect(uri: &str, count: usize) -> Result<Self, ClientError> {
        let dst = if uri.contains("://") {
            uri.to_string()
        } else {
            format!("http://{uri}")
        };
        let endpoint = Endpoint::from_shared(dst)
            .map_err(|e| ClientError::InvalidArg(format!("bad uri {uri}: {e}")))?;
        let mut channels = Vec::with_capacity(count);
        for i in 0..count {
            debug!("opening channel {} of {count} to {uri}", i + 1);
            let channel = tokio::time::timeout(WARMUP_TIMEOUT, endpoint.connect())
                .await
                .map_err(|_| {
                    ClientError::Unavailable(format!("cannot create grpc channel at uri {uri}"))
                })?
                .map_err(|e| {
                    ClientError::Unavailable(format!(
                        "cannot create grpc channel at uri {uri}: {e}"
                    ))
                })?;
            channels.push(Arc::new(channel));
        }
        Ok(Self { channels })
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Less-referenced of two distinct random channels; a single channel is
    /// returned directly.
    pub fn pick(&self) -> Arc<Channel> {
        if self.channels.len() == 1 {
            return Arc::clone(&self.channels[0]);
        }
        let n = self.channels.len();
        let mut rng = rand::thread_rng();
        let r1 = rng.gen_range(0..n);
        let mut r2 = rng.gen_range(0..n - 1);
        if r2 >= r1 {
            r2 += 1;
        }
        if Arc::strong_count(&self.channels[r1]) < Arc::strong_count(&self.channels[r2]) {
            Arc::clone(&self.channels[r1])
        } else {
            Arc::clone(&self.channels[r2])
        }
    }

    #[cfg(test)]
    pub(crate) fn lazy(uri: &str, count: usize) -> Self {
        let endpoint = Endpoint::from_shared(format!("http://{uri}")).unwrap();
        Self {
            channels: (0..count).map(|_| Arc::new(endpoint.connect_lazy())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pick_prefers_less_referenced_channel() {
        let set = ChannelSet::lazy("localhost:19999", 2);
        // Pin extra references onto the first channel.
        let _hot: Vec<_> = (0..8).map(|_| Arc::clone(&set.channels[0])).collect();
        for _ in 0..16 {
            let picked = set.pick();
            assert!(Arc::ptr_eq(&picked, &set.channels[1]));
        }
    }

    #[tokio::test]
    async fn test_single_channel_returned_directly() {
        let set = ChannelSet::lazy("localhost:19999", 1);
        let picked = set.pick();
        assert!(Arc::ptr_eq(&picked, &set.channels[0]));
    }
}
