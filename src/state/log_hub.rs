//! 日志通道管理
//!
//! 管理构建日志的广播通道，支持 SSE 订阅和自动清理

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

use crate::domain::build::LogLine;

/// 日志通道容量
const LOG_CHANNEL_CAPACITY: usize = 256;

struct LogChannel {
    /// 完成后置空，最后一个发送者释放时订阅者收到 Closed
    sender: Option<broadcast::Sender<LogLine>>,
    created_at: DateTime<Utc>,
}

/// 日志中心
pub struct LogHub {
    /// task_id -> LogChannel
    channels: RwLock<HashMap<String, LogChannel>>,
}

impl LogHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// 创建日志通道，已存在时返回现有的发送者
    pub async fn create(&self, task_id: &str) -> broadcast::Sender<LogLine> {
        let mut channels = self.channels.write().await;

        if let Some(sender) = channels.get(task_id).and_then(|c| c.sender.clone()) {
            return sender;
        }

        let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        channels.insert(
            task_id.to_string(),
            LogChannel {
                sender: Some(sender.clone()),
                created_at: Utc::now(),
            },
        );
        sender
    }

    /// 订阅日志通道；通道不存在或已完成返回 None
    pub async fn subscribe(&self, task_id: &str) -> Option<broadcast::Receiver<LogLine>> {
        let channels = self.channels.read().await;
        channels
            .get(task_id)
            .and_then(|c| c.sender.as_ref())
            .map(|s| s.subscribe())
    }

    /// 标记通道完成，释放中心持有的发送者
    pub async fn finish(&self, task_id: &str) {
        if let Some(channel) = self.channels.write().await.get_mut(task_id) {
            channel.sender = None;
        }
    }

    pub async fn is_finished(&self, task_id: &str) -> bool {
        let channels = self.channels.read().await;
        channels.get(task_id).map_or(true, |c| c.sender.is_none())
    }

    pub async fn exists(&self, task_id: &str) -> bool {
        self.channels.read().await.contains_key(task_id)
    }

    /// 清理已完成且创建超过 `max_age_hours` 的通道
    pub async fn cleanup_expired(&self, max_age_hours: i64) {
        let now = Utc::now();
        self.channels.write().await.retain(|_, channel| {
            channel.sender.is_some() || (now - channel.created_at).num_hours() < max_age_hours
        });
    }

    pub async fn count(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}
