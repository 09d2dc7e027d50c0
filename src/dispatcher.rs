// 外发调度：单次 POST webhook，显式 deadline，超时即中断在途请求。
use crate::config::DispatchConfig;
use crate::schemas::DispatchPayload;
use anyhow::{anyhow, Result};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// 调度失败的封闭分类，重试策略由调用方决定，这里从不自动重试。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchFailure {
    Timeout { timeout_s: u64 },
    Transport(String),
    NonSuccess { status: u16, body: String },
}

impl DispatchFailure {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchFailure::Timeout { .. } => "DISPATCH_TIMEOUT",
            DispatchFailure::Transport(_) => "DISPATCH_TRANSPORT_ERROR",
            DispatchFailure::NonSuccess { .. } => "DISPATCH_NON_SUCCESS",
        }
    }
}

impl std::fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchFailure::Timeout { timeout_s } => {
                write!(f, "webhook 在 {timeout_s}s 内未响应")
            }
            DispatchFailure::Transport(detail) => write!(f, "webhook 连接失败: {detail}"),
            DispatchFailure::NonSuccess { status, .. } => {
                write!(f, "webhook 返回非成功状态: {status}")
            }
        }
    }
}

impl std::error::Error for DispatchFailure {}

#[derive(Debug, Clone)]
pub struct DispatchSuccess {
    pub status: u16,
    /// 解码后的响应体；空 body 为 None，非 JSON 文本按字符串值保留。
    pub body: Option<Value>,
}

pub struct Dispatcher {
    http: Client,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        // 不依赖客户端默认超时，deadline 统一由 call 显式控制。
        let http = Client::builder().build().unwrap_or_default();
        Self { http, config }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// 解析目标地址：相对路径按配置基址拼接，绝对地址原样使用。
    pub fn resolve_endpoint(&self, target: &str) -> Result<String> {
        resolve_endpoint(&self.config.base_url, target)
    }

    /// 单次 POST，deadline 到期即丢弃请求 future，连接随之中断。
    pub async fn call(
        &self,
        endpoint: &str,
        payload: &DispatchPayload,
    ) -> Result<DispatchSuccess, DispatchFailure> {
        let timeout_s = self.config.timeout_s.max(1);
        let deadline = Duration::from_secs(timeout_s);
        let request = async {
            let response = self.http.post(endpoint).json(payload).send().await?;
            let status = response.status().as_u16();
            let success = response.status().is_success();
            let text = response.text().await.unwrap_or_default();
            Ok::<(u16, bool, String), reqwest::Error>((status, success, text))
        };
        let (status, success, text) = match tokio::time::timeout(deadline, request).await {
            Err(_) => {
                warn!("dispatch timeout: endpoint={endpoint}, timeout_s={timeout_s}");
                return Err(DispatchFailure::Timeout { timeout_s });
            }
            Ok(Err(err)) if err.is_timeout() => {
                return Err(DispatchFailure::Timeout { timeout_s });
            }
            Ok(Err(err)) => {
                warn!("dispatch transport error: endpoint={endpoint}, error={err}");
                return Err(DispatchFailure::Transport(err.to_string()));
            }
            Ok(Ok(parts)) => parts,
        };
        if !success {
            return Err(DispatchFailure::NonSuccess { status, body: text });
        }
        Ok(DispatchSuccess {
            status,
            body: decode_body(&text),
        })
    }
}

/// 纯函数：相对 target 按 base 解析，结果确定且无副作用。
pub fn resolve_endpoint(base: &str, target: &str) -> Result<String> {
    let target = target.trim();
    if target.is_empty() {
        return Err(anyhow!("dispatch target is empty"));
    }
    if target.starts_with("http://") || target.starts_with("https://") {
        return Ok(target.to_string());
    }
    let base = base.trim();
    if base.is_empty() {
        return Err(anyhow!("relative target {target} needs a configured base url"));
    }
    let parsed = Url::parse(base).map_err(|err| anyhow!("invalid base url {base}: {err}"))?;
    let joined = parsed
        .join(target)
        .map_err(|err| anyhow!("cannot resolve {target} against {base}: {err}"))?;
    Ok(joined.to_string())
}

fn decode_body(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Some(value),
        // 纯文本响应按字符串值处理，交给归一化层原样透传。
        Err(_) => Some(Value::String(text.to_string())),
    }
}
