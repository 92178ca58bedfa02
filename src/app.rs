use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bulwark_api::{create_app, AppState};
use bulwark_config::AppConfig;
use bulwark_core::{CircuitBreakerRegistry, ProtectionGateway, RateLimiter};
use bulwark_domain::{Clock, Store, SystemClock};
use bulwark_infrastructure::StoreFactory;
use bulwark_monitor::AlertMonitor;
use bulwark_observability::{build_channels, MetricsExporter};
use bulwark_queue::{DeadLetterQueue, ProcessorRegistry, RetryScheduler, TaskWorker};
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};
use tracing::{error, info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行管理API
    Api,
    /// 运行重试调度器、任务Worker和监控
    Workers,
    /// 运行所有组件
    All,
}

impl AppMode {
    fn runs_api(self) -> bool {
        matches!(self, AppMode::Api | AppMode::All)
    }

    fn runs_workers(self) -> bool {
        matches!(self, AppMode::Workers | AppMode::All)
    }
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "api" => Ok(AppMode::Api),
            "workers" => Ok(AppMode::Workers),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {s}")),
        }
    }
}

/// 主应用程序
pub struct Application {
    config: Arc<AppConfig>,
    mode: AppMode,
    store: Arc<dyn Store>,
    queue: Arc<DeadLetterQueue>,
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<RateLimiter>,
    gateway: Arc<ProtectionGateway>,
    processors: Arc<ProcessorRegistry>,
    monitor: Arc<AlertMonitor>,
    metrics: MetricsExporter,
}

impl Application {
    /// 按配置连接存储并安装Prometheus recorder
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = StoreFactory::create(&config.store, clock.clone())
            .await
            .context("初始化存储失败")?;

        let metrics = if config.observability.metrics_enabled {
            MetricsExporter::install().context("创建指标导出器失败")?
        } else {
            MetricsExporter::detached()
        };

        Self::with_store(config, mode, store, clock, metrics)
    }

    /// 使用给定的存储和时钟装配全部组件
    pub fn with_store(
        config: AppConfig,
        mode: AppMode,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        metrics: MetricsExporter,
    ) -> Result<Self> {
        if mode.runs_api() && !config.api.enabled {
            return Err(anyhow::anyhow!("API模式被禁用，请检查配置"));
        }

        let queue = Arc::new(DeadLetterQueue::new(
            store.clone(),
            clock.clone(),
            config.dead_letter.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            store.clone(),
            clock.clone(),
            config.circuit_breakers.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            clock.clone(),
            config.rate_limits.clone(),
        ));
        let gateway = Arc::new(ProtectionGateway::new(limiter.clone(), breakers.clone()));

        let channel_timeout = Duration::from_secs(config.monitor.channel_timeout_seconds);
        let processors = Arc::new(
            ProcessorRegistry::with_builtin(channel_timeout).context("注册内置任务处理器失败")?,
        );
        let channels =
            build_channels(&config.monitor.channels, channel_timeout).context("创建告警通道失败")?;
        let monitor = Arc::new(AlertMonitor::new(
            store.clone(),
            clock,
            queue.clone(),
            config.monitor.clone(),
            channels,
        ));

        Ok(Self {
            config: Arc::new(config),
            mode,
            store,
            queue,
            breakers,
            limiter,
            gateway,
            processors,
            monitor,
            metrics,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<DeadLetterQueue> {
        &self.queue
    }

    pub fn gateway(&self) -> &Arc<ProtectionGateway> {
        &self.gateway
    }

    /// 在`run`之前注册业务任务处理器
    pub fn processors(&self) -> &Arc<ProcessorRegistry> {
        &self.processors
    }

    pub fn monitor(&self) -> &Arc<AlertMonitor> {
        &self.monitor
    }

    pub fn api_state(&self) -> AppState {
        AppState {
            store: self.store.clone(),
            queue: self.queue.clone(),
            breakers: self.breakers.clone(),
            limiter: self.limiter.clone(),
            monitor: self.monitor.clone(),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
        }
    }

    /// 启动当前模式下的后台组件，直到收到关闭信号且全部组件退出
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);
        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        if self.mode.runs_workers() {
            let scheduler = RetryScheduler::new(self.queue.clone());
            let rx = shutdown_rx.resubscribe();
            handles.push((
                "retry_scheduler",
                tokio::spawn(async move { scheduler.run(rx).await }),
            ));

            let worker = Arc::new(TaskWorker::new(self.queue.clone(), self.processors.clone()));
            handles.push((
                "task_worker",
                tokio::spawn(worker.run(shutdown_rx.resubscribe())),
            ));

            if self.config.monitor.enabled {
                handles.push((
                    "alert_monitor",
                    tokio::spawn(self.monitor.clone().run(shutdown_rx.resubscribe())),
                ));
            } else {
                info!("告警监控已禁用");
            }
        }

        if self.mode.runs_api() {
            let listener = TcpListener::bind(&self.config.api.bind_address)
                .await
                .with_context(|| format!("绑定API地址失败: {}", self.config.api.bind_address))?;
            info!("API服务器启动在: {}", self.config.api.bind_address);

            let app = create_app(self.api_state());
            let mut rx = shutdown_rx.resubscribe();
            handles.push((
                "api_server",
                tokio::spawn(async move {
                    let shutdown = async move {
                        let _ = rx.recv().await;
                    };
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown)
                        .await
                    {
                        error!("API服务器运行失败: {e}");
                    }
                }),
            ));
        }

        if handles.is_empty() {
            warn!("当前模式下没有需要运行的组件");
        }

        for (name, handle) in handles {
            if let Err(e) = handle.await {
                error!(component = name, "组件异常退出: {e}");
            }
        }

        info!("所有组件已停止");
        Ok(())
    }
}
