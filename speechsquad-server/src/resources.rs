//! Shared server resources: one channel pool per downstream service plus
//! the ASR model name passed through to recognition configs.

use tracing::info;

use crate::pool::{ChannelLease, ChannelPool};
use crate::ServerError;

pub struct SquadResources {
    asr: ChannelPool,
    nlp: ChannelPool,
    tts: ChannelPool,
    asr_model: String,
}

impl SquadResources {
    /// Connect every downstream pool. Any unreachable service is fatal.
    pub async fn connect(
        asr_url: &str,
        nlp_url: &str,
        tts_url: &str,
        channels: usize,
        asr_model: String,
    ) -> Result<Self, ServerError> {
        let asr = ChannelPool::connect(asr_url, channels).await?;
        info!("asr connection established to {asr_url}");
        let nlp = ChannelPool::connect(nlp_url, channels).await?;
        info!("nlp connection established to {nlp_url}");
        let tts = ChannelPool::connect(tts_url, channels).await?;
        info!("tts connection established to {tts_url}");
        Ok(Self {
            asr,
            nlp,
            tts,
            asr_model,
        })
    }

    pub fn asr_model(&self) -> &str {
        &self.asr_model
    }

    pub fn asr_lease(&self) -> ChannelLease {
        self.asr.lease()
    }

    pub fn nlp_lease(&self) -> ChannelLease {
        self.nlp.lease()
    }

    pub fn tts_lease(&self) -> ChannelLease {
        self.tts.lease()
    }
}
