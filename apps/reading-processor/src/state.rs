use crate::ingest::Ingestor;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub ingestor: Ingestor,
    pub history_limit: usize,
    pub mqtt_connected: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(ingestor: Ingestor, history_limit: usize) -> Self {
        Self {
            ingestor,
            history_limit,
            mqtt_connected: Arc::new(AtomicBool::new(false)),
        }
    }
}
