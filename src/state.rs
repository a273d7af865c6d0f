use crate::config::AppConfig;
use crate::registry::SessionRegistry;
use std::sync::Arc;

/// 全局应用上下文
pub struct AppState {
    pub config: AppConfig,
    /// 会话注册表，后台任务与请求处理共享同一个实例
    pub registry: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let registry = Arc::new(SessionRegistry::from_config(&config));
        Self { config, registry }
    }
}

pub type SharedState = Arc<AppState>;
