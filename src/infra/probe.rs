//! 应用健康探测
//!
//! 通过反向代理按域名访问站点，确认路由和应用都已就绪

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// 单次探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// 应用已响应（非 5xx）
    Ready,
    /// 暂未就绪，附原因
    NotReady(String),
}

/// 健康探测器
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, domain: &str) -> ProbeOutcome;
}

/// 未配置探测地址时使用，只依赖容器健康状态
pub struct NoopProbe;

#[async_trait]
impl HealthProbe for NoopProbe {
    async fn probe(&self, _domain: &str) -> ProbeOutcome {
        ProbeOutcome::Ready
    }
}

/// 通过反向代理的 HTTP 探测
pub struct HttpProbe {
    client: Client,
    /// 代理入口，如 `http://127.0.0.1`
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, domain: &str) -> ProbeOutcome {
        let result = self
            .client
            .get(&self.url)
            .header(reqwest::header::HOST, domain)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_server_error() => {
                ProbeOutcome::NotReady(format!("HTTP {}", resp.status()))
            }
            Ok(resp) => {
                debug!(domain = %domain, status = %resp.status(), "Probe answered");
                ProbeOutcome::Ready
            }
            Err(e) => ProbeOutcome::NotReady(e.to_string()),
        }
    }
}
