use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use crate::assistant::PageAssistant;
use crate::config::AppSettings;
use crate::metrics::RuntimeMetrics;
use crate::network::NetworkEvent;
use crate::orchestrator::RevisionOrchestrator;
use crate::preferences::PreferenceStore;
use crate::session::{InferenceSession, ModelService, RecoveryCounter, SessionError};
use crate::transport::Transport;

pub struct RuntimeState<M, T> {
    pub settings: AppSettings,
    pub session: Arc<Mutex<InferenceSession<M>>>,
    pub recovery: RecoveryCounter,
    pub preferences: Mutex<PreferenceStore>,
    pub metrics: Arc<Mutex<RuntimeMetrics>>,
    pub orchestrator: RevisionOrchestrator<M, T>,
    pub assistant: Mutex<PageAssistant<M, T>>,
    pub network_events: broadcast::Sender<NetworkEvent>,
}

pub struct AppState<M, T> {
    runtime: Arc<RuntimeState<M, T>>,
}

impl<M, T> Clone for AppState<M, T> {
    fn clone(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
        }
    }
}

impl<M, T> AppState<M, T>
where
    M: ModelService,
    T: Transport + Clone,
{
    /// `recovery` must outlive tool reloads, so the host passes in the
    /// counter it keeps for the whole process. `make_service` builds the
    /// first service and every replacement after a device loss.
    pub fn new(
        settings: AppSettings,
        mut make_service: impl FnMut() -> M + Send + 'static,
        transport: T,
        preferences: PreferenceStore,
        recovery: RecoveryCounter,
        network_events: broadcast::Sender<NetworkEvent>,
    ) -> Self {
        let service = make_service();
        let session = Arc::new(Mutex::new(
            InferenceSession::new(service, recovery.clone()).with_rebuild(make_service),
        ));
        let metrics = Arc::new(Mutex::new(RuntimeMetrics::new()));
        let orchestrator =
            RevisionOrchestrator::new(Arc::clone(&session), transport.clone(), Arc::clone(&metrics))
                .with_rewrite_temperature(settings.rewrite_temperature);
        let mut assistant = PageAssistant::new(Arc::clone(&session), transport).with_limits(
            settings.page_char_budget,
            settings.chat_max_tokens,
            settings.chat_temperature,
        );
        assistant.set_auto_load_model(Self::pick_default_model(&settings, &preferences));

        let runtime = RuntimeState {
            settings,
            session,
            recovery,
            preferences: Mutex::new(preferences),
            metrics,
            orchestrator,
            assistant: Mutex::new(assistant),
            network_events,
        };
        Self {
            runtime: Arc::new(runtime),
        }
    }

    pub fn runtime(&self) -> Arc<RuntimeState<M, T>> {
        Arc::clone(&self.runtime)
    }

    /// Explicit choice first, then the first catalog model already fetched.
    pub async fn default_model(&self) -> Option<String> {
        let preferences = self.runtime.preferences.lock().await;
        Self::pick_default_model(&self.runtime.settings, &preferences)
    }

    pub async fn load_label(&self, model_id: &str) -> &'static str {
        self.runtime.preferences.lock().await.load_label(model_id)
    }

    /// Loads `model_id` and remembers it as fetched. A device loss while
    /// loading gets the one automatic reload the recovery counter allows.
    pub async fn load_model(&self, model_id: &str) -> Result<(), SessionError> {
        self.runtime
            .session
            .lock()
            .await
            .load_with_recovery(model_id)
            .await?;

        let mut preferences = self.runtime.preferences.lock().await;
        match preferences.record_downloaded(model_id) {
            Ok(true) => info!(model_id, "model added to downloaded list"),
            Ok(false) => {}
            Err(err) => warn!(model_id, "failed to persist downloaded model: {err}"),
        }
        Ok(())
    }

    fn pick_default_model(settings: &AppSettings, preferences: &PreferenceStore) -> Option<String> {
        settings.model_id.clone().or_else(|| {
            preferences
                .default_model(&settings.model_catalog)
                .map(str::to_string)
        })
    }
}
