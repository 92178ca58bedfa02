use std::sync::Arc;
use tracing::{debug, info};

use bulwark_config::{StoreBackend, StoreConfig};
use bulwark_domain::{Clock, Store};
use bulwark_errors::BulwarkResult;

use crate::{InMemoryStore, RedisStore};

/// 根据配置创建存储后端
pub struct StoreFactory;

impl StoreFactory {
    pub async fn create(
        config: &StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> BulwarkResult<Arc<dyn Store>> {
        debug!("Creating store with backend: {:?}", config.backend);

        match config.backend {
            StoreBackend::Memory => {
                info!("使用内存存储（仅适用于单实例部署）");
                Ok(Arc::new(InMemoryStore::new(clock)))
            }
            StoreBackend::Redis => {
                info!(url = %redact_url(&config.url), "初始化Redis存储");
                let store = RedisStore::connect(config).await?;
                Ok(Arc::new(store))
            }
        }
    }
}

/// 隐藏连接串中的密码
fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some("***")).is_err() {
                return "<invalid url>".to_string();
            }
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<invalid url>".to_string(),
    }
}
