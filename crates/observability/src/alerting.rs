//! 告警通知通道
//!
//! 每个通道独立发送，监控器负责并发扇出与超时控制。

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use bulwark_config::{ChannelsConfig, ChatWebhookChannelConfig, EmailChannelConfig, WebhookChannelConfig};
use bulwark_domain::{Alert, AlertSeverity};
use bulwark_errors::{BulwarkError, BulwarkResult};

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &Alert) -> BulwarkResult<()>;
}

/// 单行告警文本
pub fn format_alert(alert: &Alert) -> String {
    let mut text = format!(
        "[{}] {} ({}): {}",
        alert.severity.as_str().to_uppercase(),
        alert.alert_type,
        alert.source,
        alert.message
    );
    if let Some(trace_id) = &alert.trace_id {
        text.push_str(&format!(" trace_id={trace_id}"));
    }
    if let Some(host) = &alert.host {
        text.push_str(&format!(" host={host}"));
    }
    text
}

/// 当前主机名，告警中用于定位实例
pub fn host_name() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
}

pub struct LogNotificationChannel;

#[async_trait]
impl NotificationChannel for LogNotificationChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> BulwarkResult<()> {
        match alert.severity {
            AlertSeverity::High | AlertSeverity::Critical => warn!(
                channel = "log",
                alert.type = %alert.alert_type,
                alert.severity = alert.severity.as_str(),
                alert.source = %alert.source,
                trace_id = alert.trace_id.as_deref().unwrap_or(""),
                "ALERT: {}",
                alert.message
            ),
            _ => info!(
                channel = "log",
                alert.type = %alert.alert_type,
                alert.severity = alert.severity.as_str(),
                alert.source = %alert.source,
                trace_id = alert.trace_id.as_deref().unwrap_or(""),
                "ALERT: {}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// 最小化的SMTP客户端，用于内网中继
///
/// 只走明文SMTP：不发STARTTLS，也不做AUTH，告警内容和收件人都以明文传输。
/// 只应指向本机或可信内网里允许匿名投递的中继，需要加密或认证的外部
/// 邮件服务请改用webhook渠道。
pub struct EmailNotificationChannel {
    config: EmailChannelConfig,
}

impl EmailNotificationChannel {
    pub fn new(config: EmailChannelConfig) -> Self {
        Self { config }
    }

    fn error(message: impl Into<String>) -> BulwarkError {
        BulwarkError::notification("email", message)
    }

    async fn read_reply(
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    ) -> BulwarkResult<u16> {
        loop {
            let mut line = String::new();
            let read = reader
                .read_line(&mut line)
                .await
                .map_err(|e| Self::error(format!("读取SMTP应答失败: {e}")))?;
            if read == 0 {
                return Err(Self::error("SMTP服务器关闭了连接"));
            }
            if line.len() < 3 {
                return Err(Self::error(format!("无效的SMTP应答: {}", line.trim_end())));
            }
            let code = line[..3]
                .parse::<u16>()
                .map_err(|_| Self::error(format!("无效的SMTP应答: {}", line.trim_end())))?;
            // 多行应答以"250-"形式延续
            if line.as_bytes().get(3) != Some(&b'-') {
                return Ok(code);
            }
        }
    }

    async fn command(
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
        line: &str,
        expected: u16,
    ) -> BulwarkResult<()> {
        writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .map_err(|e| Self::error(format!("写入SMTP命令失败: {e}")))?;
        let code = Self::read_reply(reader).await?;
        if code != expected {
            return Err(Self::error(format!(
                "SMTP命令 {} 返回 {code}，期望 {expected}",
                line.split_whitespace().next().unwrap_or(line)
            )));
        }
        Ok(())
    }

    fn message_body(&self, alert: &Alert) -> String {
        let subject = format!(
            "[{}] {} - {}",
            alert.severity.as_str().to_uppercase(),
            alert.alert_type,
            alert.source
        );
        let payload = serde_json::to_string_pretty(&alert.payload).unwrap_or_default();
        let body = format!("{}\r\n\r\n{}", format_alert(alert), payload)
            .lines()
            // 以"."开头的行需要转义
            .map(|line| {
                if line.starts_with('.') {
                    format!(".{line}")
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\r\n");
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n.",
            self.config.from,
            self.config.to.join(", "),
            subject,
            alert.timestamp.to_rfc2822(),
            body
        )
    }
}

#[async_trait]
impl NotificationChannel for EmailNotificationChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, alert: &Alert) -> BulwarkResult<()> {
        let address = format!("{}:{}", self.config.smtp_host, self.config.smtp_port);
        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| Self::error(format!("无法连接SMTP服务器 {address}: {e}")))?;
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let greeting = Self::read_reply(&mut reader).await?;
        if greeting != 220 {
            return Err(Self::error(format!("SMTP问候码异常: {greeting}")));
        }
        let helo_host = host_name().unwrap_or_else(|| "localhost".to_string());
        Self::command(&mut writer, &mut reader, &format!("HELO {helo_host}"), 250).await?;
        Self::command(
            &mut writer,
            &mut reader,
            &format!("MAIL FROM:<{}>", self.config.from),
            250,
        )
        .await?;
        for recipient in &self.config.to {
            Self::command(&mut writer, &mut reader, &format!("RCPT TO:<{recipient}>"), 250).await?;
        }
        Self::command(&mut writer, &mut reader, "DATA", 354).await?;
        Self::command(&mut writer, &mut reader, &self.message_body(alert), 250).await?;
        Self::command(&mut writer, &mut reader, "QUIT", 221).await?;

        debug!(recipients = ?self.config.to, alert.id = %alert.id, "告警邮件已发送");
        Ok(())
    }
}

/// 聊天机器人Webhook（兼容Slack风格的`{"text": ...}`载荷）
pub struct ChatWebhookNotificationChannel {
    client: Client,
    config: ChatWebhookChannelConfig,
}

impl ChatWebhookNotificationChannel {
    pub fn new(client: Client, config: ChatWebhookChannelConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl NotificationChannel for ChatWebhookNotificationChannel {
    fn name(&self) -> &str {
        "chat_webhook"
    }

    async fn send(&self, alert: &Alert) -> BulwarkResult<()> {
        let mut body = json!({ "text": format_alert(alert) });
        if let Some(channel) = &self.config.channel {
            body["channel"] = json!(channel);
        }
        let response = self
            .client
            .post(&self.config.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BulwarkError::notification("chat_webhook", e.to_string()))?;
        if !response.status().is_success() {
            return Err(BulwarkError::notification(
                "chat_webhook",
                format!("HTTP {}", response.status()),
            ));
        }
        Ok(())
    }
}

/// 通用HTTP Webhook，POST完整告警JSON
pub struct WebhookNotificationChannel {
    client: Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl WebhookNotificationChannel {
    pub fn new(client: Client, config: WebhookChannelConfig) -> Self {
        Self {
            client,
            url: config.url,
            headers: config.headers,
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookNotificationChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> BulwarkResult<()> {
        let mut request = self.client.post(&self.url).json(alert);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| BulwarkError::notification("webhook", e.to_string()))?;
        if !response.status().is_success() {
            return Err(BulwarkError::notification(
                "webhook",
                format!("HTTP {}", response.status()),
            ));
        }
        Ok(())
    }
}

/// 按配置构造启用的通道
pub fn build_channels(
    config: &ChannelsConfig,
    timeout: Duration,
) -> BulwarkResult<Vec<Arc<dyn NotificationChannel>>> {
    let client = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| BulwarkError::config_error(format!("无法创建HTTP客户端: {e}")))?;

    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    if config.log {
        channels.push(Arc::new(LogNotificationChannel));
    }
    if let Some(email) = &config.email {
        channels.push(Arc::new(EmailNotificationChannel::new(email.clone())));
    }
    if let Some(chat) = &config.chat_webhook {
        channels.push(Arc::new(ChatWebhookNotificationChannel::new(
            client.clone(),
            chat.clone(),
        )));
    }
    if let Some(webhook) = &config.webhook {
        channels.push(Arc::new(WebhookNotificationChannel::new(
            client.clone(),
            webhook.clone(),
        )));
    }

    info!(
        channels = ?channels.iter().map(|c| c.name().to_string()).collect::<Vec<_>>(),
        "告警通道已配置"
    );
    Ok(channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn sample_alert() -> Alert {
        Alert::new(
            "task_dead_lettered",
            AlertSeverity::High,
            "send_email",
            "task t-1 failed",
            Utc::now(),
        )
        .with_trace_id(Some("abc".to_string()))
    }

    #[test]
    fn test_format_alert() {
        let text = format_alert(&sample_alert());
        assert_eq!(
            text,
            "[HIGH] task_dead_lettered (send_email): task t-1 failed trace_id=abc"
        );
    }

    #[test]
    fn test_build_channels_from_config() {
        let mut config = ChannelsConfig::default();
        config.webhook = Some(WebhookChannelConfig {
            url: "http://localhost:9/hook".to_string(),
            headers: BTreeMap::new(),
        });
        let channels = build_channels(&config, Duration::from_secs(1)).unwrap();
        let names: Vec<&str> = channels.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["log", "webhook"]);
    }

    #[tokio::test]
    async fn test_email_channel_speaks_smtp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut writer) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut transcript = Vec::new();
            writer.write_all(b"220 test ESMTP\r\n").await.unwrap();
            let mut in_data = false;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                let line = line.trim_end().to_string();
                if in_data {
                    if line == "." {
                        in_data = false;
                        writer.write_all(b"250 queued\r\n").await.unwrap();
                    }
                    transcript.push(line);
                    continue;
                }
                let reply: &[u8] = if line.starts_with("DATA") {
                    in_data = true;
                    b"354 go ahead\r\n"
                } else if line.starts_with("QUIT") {
                    b"221 bye\r\n"
                } else {
                    b"250 ok\r\n"
                };
                transcript.push(line.clone());
                writer.write_all(reply).await.unwrap();
                if line.starts_with("QUIT") {
                    break;
                }
            }
            transcript
        });

        let channel = EmailNotificationChannel::new(EmailChannelConfig {
            smtp_host: "127.0.0.1".to_string(),
            smtp_port: port,
            from: "bulwark@example.com".to_string(),
            to: vec!["ops@example.com".to_string()],
        });
        channel.send(&sample_alert()).await.unwrap();

        let transcript = server.await.unwrap();
        assert!(transcript.iter().any(|l| l == "MAIL FROM:<bulwark@example.com>"));
        assert!(transcript.iter().any(|l| l == "RCPT TO:<ops@example.com>"));
        assert!(transcript
            .iter()
            .any(|l| l.starts_with("Subject: [HIGH] task_dead_lettered")));
    }

    #[tokio::test]
    async fn test_email_channel_reports_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"554 no service\r\n").await.unwrap();
        });

        let channel = EmailNotificationChannel::new(EmailChannelConfig {
            smtp_host: "127.0.0.1".to_string(),
            smtp_port: port,
            from: "a@example.com".to_string(),
            to: vec!["b@example.com".to_string()],
        });
        let err = channel.send(&sample_alert()).await.unwrap_err();
        assert!(matches!(err, BulwarkError::Notification { .. }));
    }

    #[tokio::test]
    async fn test_webhook_channel_posts_alert_with_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buffer = vec![0u8; 16 * 1024];
            let mut received = Vec::new();
            // 读到请求体结束（含Content-Length）
            loop {
                let n = stream.read(&mut buffer).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buffer[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if received.len() >= header_end + 4 + length {
                        break;
                    }
                }
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&received).to_string()
        });

        let mut headers = BTreeMap::new();
        headers.insert("x-api-key".to_string(), "secret".to_string());
        let channel = WebhookNotificationChannel::new(
            Client::new(),
            WebhookChannelConfig {
                url: format!("http://127.0.0.1:{port}/alerts"),
                headers,
            },
        );
        channel.send(&sample_alert()).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /alerts"));
        assert!(request.to_ascii_lowercase().contains("x-api-key: secret"));
        assert!(request.contains("\"alert_type\":\"task_dead_lettered\""));
    }
}
