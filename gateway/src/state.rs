use std::sync::Arc;

use crate::{auth::AuthVerifier, config::Config, relay::Relay, transcripts::TranscriptStore};

pub struct AppState {
    pub config: Config,
    pub relay: Arc<Relay>,
    pub auth: Arc<dyn AuthVerifier>,
    pub transcripts: Arc<dyn TranscriptStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        auth: Arc<dyn AuthVerifier>,
        transcripts: Arc<dyn TranscriptStore>,
    ) -> Self {
        Self {
            config,
            relay: Arc::new(Relay::new()),
            auth,
            transcripts,
        }
    }
}
