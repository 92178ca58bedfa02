use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = CliApp::parse();
    cli.run().await
}

/// CLI应用程序主结构
#[derive(Parser, Debug)]
#[command(name = "bulwark-cli")]
#[command(version)]
#[command(about = "Bulwark - 命令行运维工具")]
#[command(long_about = "管理死信队列、熔断器和限流状态的命令行接口")]
struct CliApp {
    #[command(subcommand)]
    command: Commands,

    /// 管理API基础URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    api_url: String,

    /// 作为限流标识发送的API密钥
    #[arg(long)]
    api_key: Option<String>,

    /// 输出原始JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 死信队列
    Dlq(DlqCommands),
    /// 熔断器
    Breakers(BreakerCommands),
    /// 限流状态
    Limits(LimitCommands),
}

#[derive(Args, Debug)]
struct DlqCommands {
    #[command(subcommand)]
    action: DlqActions,
}

#[derive(Subcommand, Debug)]
enum DlqActions {
    /// 列出死信条目，未指定优先级时合并全部优先级
    List {
        /// 优先级 (high, normal, low)
        #[arg(short, long)]
        priority: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
        #[arg(short, long, default_value = "0")]
        offset: usize,
    },
    /// 死信统计
    Stats,
    /// 查看死信任务详情
    Show { task_id: String },
    /// 重新入队单个死信任务
    Retry {
        task_id: String,
        /// 保留已尝试次数
        #[arg(long)]
        keep_attempts: bool,
    },
    /// 批量重新入队
    RetryAll {
        #[arg(short, long)]
        priority: String,
        #[arg(short, long, default_value = "100")]
        limit: usize,
        #[arg(short = 't', long)]
        task_type: Option<String>,
    },
    /// 清理过期死信条目
    Purge {
        #[arg(short, long)]
        priority: Option<String>,
        /// 默认使用服务端配置的保留天数
        #[arg(long)]
        older_than_days: Option<u64>,
        /// 不询问确认
        #[arg(short, long)]
        force: bool,
    },
    /// 搜索死信条目
    Search {
        #[arg(short = 't', long)]
        task_type: Option<String>,
        /// 错误信息包含的文本，大小写不敏感
        #[arg(short, long)]
        error: Option<String>,
        /// RFC3339时间
        #[arg(long)]
        after: Option<String>,
        /// RFC3339时间
        #[arg(long)]
        before: Option<String>,
        #[arg(short, long)]
        priority: Option<String>,
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },
    /// 死信健康状态
    Health,
}

#[derive(Args, Debug)]
struct BreakerCommands {
    #[command(subcommand)]
    action: BreakerActions,
}

#[derive(Subcommand, Debug)]
enum BreakerActions {
    /// 列出所有熔断器
    List,
    /// 重置熔断器为关闭状态
    Reset { name: String },
}

#[derive(Args, Debug)]
struct LimitCommands {
    #[command(subcommand)]
    action: LimitActions,
}

#[derive(Subcommand, Debug)]
enum LimitActions {
    /// 查看标识的剩余配额
    Show { config: String, identifier: String },
    /// 清除标识的限流状态
    Reset {
        identifier: String,
        /// 只清除指定配置
        #[arg(short, long)]
        config: Option<String>,
    },
}

/// 管理API客户端
struct ApiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl ApiClient {
    fn new(base_url: String, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("创建HTTP客户端失败")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_key(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        }
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.send(self.client.get(self.url(path))).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(self.client.post(self.url(path)).json(body)).await
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        self.send(self.client.delete(self.url(path))).await
    }

    /// 非2xx时提取错误信息；`/dlq/health`的503仍返回正文
    async fn send(&self, builder: RequestBuilder) -> Result<Value> {
        let response = self
            .with_key(builder)
            .send()
            .await
            .context("请求管理API失败")?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if status.is_success() || body.get("data").is_some() {
            return Ok(body.get("data").cloned().unwrap_or(body));
        }

        let message = body["error"]["message"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string());
        match body["error"]["retry_after"].as_u64() {
            Some(secs) => Err(anyhow::anyhow!("{status}: {message}（{secs}秒后重试）")),
            None => Err(anyhow::anyhow!("{status}: {message}")),
        }
    }
}

impl CliApp {
    async fn run(self) -> Result<()> {
        let client = ApiClient::new(self.api_url, self.api_key)?;
        let output = match self.command {
            Commands::Dlq(cmd) => handle_dlq_commands(cmd, &client).await?,
            Commands::Breakers(cmd) => handle_breaker_commands(cmd, &client).await?,
            Commands::Limits(cmd) => handle_limit_commands(cmd, &client).await?,
        };

        match output {
            Output::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            Output::Table { value, .. } if self.json => {
                println!("{}", serde_json::to_string_pretty(&value)?)
            }
            Output::Table { rows, .. } => {
                for row in rows {
                    println!("{row}");
                }
            }
            Output::Message(message) => println!("{message}"),
        }
        Ok(())
    }
}

enum Output {
    Json(Value),
    Table { value: Value, rows: Vec<String> },
    Message(String),
}

async fn handle_dlq_commands(cmd: DlqCommands, client: &ApiClient) -> Result<Output> {
    match cmd.action {
        DlqActions::List {
            priority,
            limit,
            offset,
        } => {
            let (value, items) = match priority {
                Some(priority) => {
                    let page = client
                        .get(&format!("/dlq/{priority}?limit={limit}&offset={offset}"))
                        .await?;
                    let items = page["items"].clone();
                    (page, items)
                }
                None => {
                    let data = client.get(&format!("/dlq?limit={limit}")).await?;
                    let items = data["items"].clone();
                    (data, items)
                }
            };
            Ok(Output::Table {
                rows: dlq_rows(&items),
                value,
            })
        }
        DlqActions::Stats => Ok(Output::Json(client.get("/dlq/stats").await?)),
        DlqActions::Show { task_id } => {
            Ok(Output::Json(client.get(&format!("/dlq/task/{task_id}")).await?))
        }
        DlqActions::Retry {
            task_id,
            keep_attempts,
        } => {
            let task = client
                .post(
                    "/dlq/retry",
                    &json!({"task_id": task_id, "reset_attempts": !keep_attempts}),
                )
                .await?;
            Ok(Output::Message(format!(
                "任务 {} 已重新入队，已尝试次数: {}",
                task_id, task["attempts"]
            )))
        }
        DlqActions::RetryAll {
            priority,
            limit,
            task_type,
        } => {
            let report = client
                .post(
                    "/dlq/retry-all",
                    &json!({"priority": priority, "limit": limit, "task_type": task_type}),
                )
                .await?;
            Ok(Output::Json(report))
        }
        DlqActions::Purge {
            priority,
            older_than_days,
            force,
        } => {
            if !force {
                println!("确定要清理死信条目吗? (y/N)");
                let mut input = String::new();
                std::io::stdin().read_line(&mut input)?;
                if !input.trim().eq_ignore_ascii_case("y") {
                    return Ok(Output::Message("已取消清理操作".to_string()));
                }
            }

            let mut params = Vec::new();
            if let Some(priority) = priority {
                params.push(format!("priority={priority}"));
            }
            if let Some(days) = older_than_days {
                params.push(format!("older_than_days={days}"));
            }
            let path = if params.is_empty() {
                "/dlq/purge".to_string()
            } else {
                format!("/dlq/purge?{}", params.join("&"))
            };
            let result = client.delete(&path).await?;
            Ok(Output::Message(format!("已清理{}个死信条目", result["purged"])))
        }
        DlqActions::Search {
            task_type,
            error,
            after,
            before,
            priority,
            limit,
        } => {
            let filter = json!({
                "task_type": task_type,
                "error_contains": error,
                "failed_after": after,
                "failed_before": before,
                "priority": priority,
                "limit": limit,
            });
            let items = client.post("/dlq/search", &filter).await?;
            Ok(Output::Table {
                rows: dlq_rows(&items),
                value: items,
            })
        }
        DlqActions::Health => Ok(Output::Json(client.get("/dlq/health").await?)),
    }
}

async fn handle_breaker_commands(cmd: BreakerCommands, client: &ApiClient) -> Result<Output> {
    match cmd.action {
        BreakerActions::List => {
            let breakers = client.get("/breakers").await?;
            let mut rows = vec![format!(
                "{:<20} {:<10} {:>8} {:>8}",
                "名称", "状态", "失败数", "阈值"
            )];
            for breaker in breakers.as_array().into_iter().flatten() {
                rows.push(format!(
                    "{:<20} {:<10} {:>8} {:>8}",
                    breaker["name"].as_str().unwrap_or("N/A"),
                    breaker["state"].as_str().unwrap_or("N/A"),
                    breaker["fail_counter"],
                    breaker["fail_max"],
                ));
            }
            Ok(Output::Table {
                value: breakers,
                rows,
            })
        }
        BreakerActions::Reset { name } => {
            client.post(&format!("/breakers/{name}/reset"), &json!({})).await?;
            Ok(Output::Message(format!("熔断器 {name} 已重置")))
        }
    }
}

async fn handle_limit_commands(cmd: LimitCommands, client: &ApiClient) -> Result<Output> {
    match cmd.action {
        LimitActions::Show { config, identifier } => Ok(Output::Json(
            client
                .get(&format!("/rate-limits/{config}/{identifier}"))
                .await?,
        )),
        LimitActions::Reset { identifier, config } => {
            let path = match &config {
                Some(config) => format!("/rate-limits/{identifier}?config={config}"),
                None => format!("/rate-limits/{identifier}"),
            };
            let result = client.delete(&path).await?;
            Ok(Output::Message(format!(
                "已清除 {} 的{}个限流键",
                identifier, result["removed_keys"]
            )))
        }
    }
}

fn dlq_rows(items: &Value) -> Vec<String> {
    let mut rows = vec![format!(
        "{:<38} {:<20} {:<8} {:>4} {:<25} {}",
        "任务ID", "类型", "优先级", "次数", "失败时间", "错误"
    )];
    for item in items.as_array().into_iter().flatten() {
        rows.push(format!(
            "{:<38} {:<20} {:<8} {:>4} {:<25} {}",
            item["task_id"].as_str().unwrap_or("N/A"),
            item["task_type"].as_str().unwrap_or("N/A"),
            item["priority"].as_str().unwrap_or("N/A"),
            item["attempts"],
            item["failed_at"].as_str().unwrap_or("N/A"),
            item["last_error"].as_str().unwrap_or(""),
        ));
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dlq_retry_all() {
        let cli = CliApp::try_parse_from([
            "bulwark-cli",
            "dlq",
            "retry-all",
            "--priority",
            "high",
            "-t",
            "send_email",
        ])
        .unwrap();
        match cli.command {
            Commands::Dlq(DlqCommands {
                action:
                    DlqActions::RetryAll {
                        priority,
                        limit,
                        task_type,
                    },
            }) => {
                assert_eq!(priority, "high");
                assert_eq!(limit, 100);
                assert_eq!(task_type.as_deref(), Some("send_email"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_dlq_rows_header_and_items() {
        let rows = dlq_rows(&json!([{
            "task_id": "t-1",
            "task_type": "send_email",
            "priority": "low",
            "attempts": 4,
            "failed_at": "2024-01-01T00:00:00Z",
            "last_error": "timeout"
        }]));
        assert_eq!(rows.len(), 2);
        assert!(rows[1].starts_with("t-1"));
        assert!(rows[1].ends_with("timeout"));
    }
}
