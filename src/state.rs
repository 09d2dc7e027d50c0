// 全局状态：配置存储、会话存储、调度器与编排器。

use crate::config::Config;
use crate::config_store::ConfigStore;
use crate::dispatcher::Dispatcher;
use crate::orchestrator::ChatOrchestrator;
use crate::poller::PollRunner;
use crate::storage::{build_storage, ConversationStore};
use anyhow::Result;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config_store: ConfigStore,
    pub store: Arc<dyn ConversationStore>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub poller: Arc<PollRunner>,
}

impl AppState {
    pub fn new(config_store: ConfigStore, config: Config) -> Result<Self> {
        let store = init_storage(&config)?;
        let dispatcher = Arc::new(Dispatcher::new(config.dispatch.clone()));
        let orchestrator = Arc::new(ChatOrchestrator::new(
            store.clone(),
            dispatcher,
            config.attachments.clone(),
        ));
        let poller = Arc::new(PollRunner::new(store.clone(), config.polling.clone()));
        Ok(Self {
            config_store,
            store,
            orchestrator,
            poller,
        })
    }
}

fn init_storage(config: &Config) -> Result<Arc<dyn ConversationStore>> {
    let storage = build_storage(&config.storage)?;
    storage.ensure_initialized()?;
    Ok(storage)
}
