//! 任务处理器与注册表

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::info;

use bulwark_domain::Task;
use bulwark_errors::{BulwarkError, BulwarkResult};

/// 按任务类型注册的处理逻辑
///
/// 返回错误即为一次失败的尝试，由死信队列决定重试或进入死信。
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, task: &Task) -> BulwarkResult<()>;
}

/// 把异步闭包包装成处理器
pub struct FnProcessor<F> {
    f: F,
}

impl<F> FnProcessor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskProcessor for FnProcessor<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = BulwarkResult<()>> + Send,
{
    async fn process(&self, task: &Task) -> BulwarkResult<()> {
        (self.f)(task.clone()).await
    }
}

/// 未注册任务类型的占位处理器，每次尝试都失败，最终在死信队列中可见
pub struct UnregisteredProcessor;

#[async_trait]
impl TaskProcessor for UnregisteredProcessor {
    async fn process(&self, task: &Task) -> BulwarkResult<()> {
        Err(BulwarkError::validation_error(format!(
            "没有为任务类型 {} 注册处理器",
            task.task_type
        )))
    }
}

#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<String, Arc<dyn TaskProcessor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册内置的`webhook`与`noop`处理器
    pub fn with_builtin(timeout: Duration) -> BulwarkResult<Self> {
        let registry = Self::new();
        registry.register("webhook", Arc::new(WebhookProcessor::new(timeout)?));
        registry.register("noop", Arc::new(NoopProcessor));
        Ok(registry)
    }

    pub fn register(&self, task_type: &str, processor: Arc<dyn TaskProcessor>) {
        self.processors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_type.to_string(), processor);
    }

    pub fn register_fn<F, Fut>(&self, task_type: &str, f: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BulwarkResult<()>> + Send + 'static,
    {
        self.register(task_type, Arc::new(FnProcessor::new(f)));
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskProcessor>> {
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_type)
            .cloned()
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

/// 什么也不做，用于联调与演练
pub struct NoopProcessor;

#[async_trait]
impl TaskProcessor for NoopProcessor {
    async fn process(&self, _task: &Task) -> BulwarkResult<()> {
        Ok(())
    }
}

/// webhook任务参数
#[derive(Debug, Deserialize)]
pub struct WebhookTaskParams {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// 未指定时发送整个payload
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

/// 把payload以JSON POST到指定URL，非2xx视为失败
pub struct WebhookProcessor {
    client: Client,
}

impl WebhookProcessor {
    pub fn new(timeout: Duration) -> BulwarkResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BulwarkError::config_error(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TaskProcessor for WebhookProcessor {
    async fn process(&self, task: &Task) -> BulwarkResult<()> {
        let params: WebhookTaskParams = serde_json::from_value(task.payload.clone())
            .map_err(|e| BulwarkError::validation_error(format!("解析webhook任务参数失败: {e}")))?;
        let body = params.body.clone().unwrap_or_else(|| task.payload.clone());

        info!(task.id = %task.id, url = %params.url, "执行webhook任务");

        let mut request = self.client.post(&params.url).json(&body);
        for (key, value) in &params.headers {
            request = request.header(key, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BulwarkError::downstream(&params.url, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(BulwarkError::downstream(
                &params.url,
                format!("HTTP请求失败，状态码: {}", status.as_u16()),
            ))
        }
    }
}
