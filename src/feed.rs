use crate::command::{CommandFeed, FeedEvent};
use crate::config::FeedConfig;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Firebase Realtime Database 命令源 (REST streaming)
pub struct FirebaseFeed {
    client: reqwest::Client,
    database_url: String,
    auth: Option<String>,
}

impl FirebaseFeed {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            database_url: config.database_url.trim_end_matches('/').to_string(),
            auth: config.auth.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.database_url, path.trim_matches('/'))
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(auth) => request.query(&[("auth", auth)]),
            None => request,
        }
    }

    /// 建立一次流式连接，把收到的记录按到达顺序写入 `tx`
    ///
    /// # 返回
    /// - 服务器正常关闭连接时返回 Ok
    /// - 连接失败、读取出错或订阅被取消时返回错误
    pub async fn listen(&self, tx: &mpsc::Sender<FeedEvent>) -> anyhow::Result<()> {
        let request = self
            .client
            .get(self.url(""))
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let response = self
            .with_auth(request)
            .send()
            .await
            .context("failed to connect to command feed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("command feed returned {}", status);
        }
        info!("[Feed] Listening on {}", self.database_url);

        let mut parser = SseParser::default();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("command feed read failed")?;
            for message in parser.push(&chunk) {
                for event in decode(&message)? {
                    if tx.send(event).await.is_err() {
                        bail!("dispatcher is gone");
                    }
                }
            }
        }

        info!("[Feed] Stream closed by server.");
        Ok(())
    }
}

#[async_trait]
impl CommandFeed for FirebaseFeed {
    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let request = self.client.delete(self.url(key));
        let response = self.with_auth(request).send().await?;
        if !response.status().is_success() {
            bail!("delete [{}] returned {}", key, response.status());
        }
        Ok(())
    }
}

/// 一条 server-sent event
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SseMessage {
    pub event: String,
    pub data: String,
}

/// 增量解析 text/event-stream
#[derive(Default)]
pub struct SseParser {
    line: Vec<u8>,
    current: SseMessage,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        let mut messages = Vec::new();
        for &byte in chunk {
            if byte != b'\n' {
                self.line.push(byte);
                continue;
            }

            let raw = std::mem::take(&mut self.line);
            let line = String::from_utf8_lossy(&raw);
            let line = line.strip_suffix('\r').unwrap_or(&line);

            if line.is_empty() {
                // 空行结束一条消息
                let message = std::mem::take(&mut self.current);
                if !message.event.is_empty() || !message.data.is_empty() {
                    messages.push(message);
                }
            } else if let Some(value) = line.strip_prefix("event:") {
                self.current.event = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("data:") {
                if !self.current.data.is_empty() {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value.trim_start());
            }
        }
        messages
    }
}

#[derive(Deserialize)]
struct PathData {
    path: String,
    data: Value,
}

/// 把 put/patch 消息转换为顶层子节点的记录
pub fn decode(message: &SseMessage) -> anyhow::Result<Vec<FeedEvent>> {
    match message.event.as_str() {
        "put" | "patch" => {}
        "keep-alive" => return Ok(Vec::new()),
        "cancel" | "auth_revoked" => {
            return Err(anyhow!("command feed subscription ended: {}", message.event))
        }
        other => {
            debug!("[Feed] Ignoring event type {:?}", other);
            return Ok(Vec::new());
        }
    }

    let update: PathData =
        serde_json::from_str(&message.data).context("malformed feed payload")?;
    let segments: Vec<&str> = update.path.split('/').filter(|s| !s.is_empty()).collect();

    let events = match segments.as_slice() {
        // 根节点：data 的每个子节点各是一条记录
        [] => match update.data {
            Value::Object(children) => children
                .into_iter()
                .map(|(key, value)| FeedEvent {
                    key,
                    payload: (!value.is_null()).then_some(value),
                })
                .collect(),
            _ => Vec::new(),
        },
        // put 覆盖整个子节点；patch 只是局部字段更新
        [key] if message.event == "put" => vec![FeedEvent {
            key: key.to_string(),
            payload: (!update.data.is_null()).then_some(update.data),
        }],
        _ => {
            debug!("[Feed] Ignoring nested update at {}", update.path);
            Vec::new()
        }
    };
    Ok(events)
}
