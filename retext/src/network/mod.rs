mod engine_client;

pub use engine_client::{EngineClient, EngineEvent, NetworkError, NetworkEvent};
