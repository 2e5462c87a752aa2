//! レスポンス傍受
//!
//! ブラウザのネットワークレスポンスを受け取り、対象エンドポイントのものだけを
//! パースして `Collector` に追記する。クリック処理とは独立したタスクで動き、
//! 「直前にクリックした商品のレスポンスが次に届く」とは仮定しない。

use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::{Position, Url};

use crate::collector::Collector;
use crate::error::HarvestError;
use crate::types::RawItemPayload;

/// ブラウザから受け取ったレスポンス
#[derive(Debug)]
pub struct InterceptedResponse {
    pub url: String,
    /// ボディ取得に失敗した場合は Err
    pub body: Result<String, HarvestError>,
}

/// 対象エンドポイントの識別
///
/// スキーム・ホスト・パスの完全一致に加え、`operation` クエリが指定されていれば
/// その値も一致する必要がある。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSignature {
    base: String,
    operation: Option<String>,
}

impl EndpointSignature {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            operation: None,
        }
    }

    /// `https://host/path?operation=name` 形式から生成
    pub fn parse(locator: &str) -> Result<Self, HarvestError> {
        let url = Url::parse(locator)
            .map_err(|e| HarvestError::Payload(format!("エンドポイントURLが不正です {}: {}", locator, e)))?;
        let operation = url
            .query_pairs()
            .find(|(key, _)| key == "operation")
            .map(|(_, value)| value.into_owned());
        Ok(Self {
            base: url[..Position::AfterPath].to_string(),
            operation,
        })
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    pub fn matches(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        if parsed[..Position::AfterPath] != self.base {
            return false;
        }
        match &self.operation {
            Some(expected) => parsed
                .query_pairs()
                .any(|(key, value)| key == "operation" && value == expected.as_str()),
            None => true,
        }
    }
}

/// レスポンス内の商品名の位置（`data.items.0.name` のようなドット区切り）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPath(Vec<String>);

impl IdentityPath {
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('.')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// 空白を除いた空でない文字列があれば返す
    pub fn resolve(&self, body: &Value) -> Option<String> {
        let mut current = body;
        for segment in &self.0 {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        let identity = current.as_str()?.trim();
        if identity.is_empty() {
            None
        } else {
            Some(identity.to_string())
        }
    }
}

impl std::fmt::Display for IdentityPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// 1件のレスポンスの処理結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapOutcome {
    /// 対象外のエンドポイント
    Ignored,
    Inserted(String),
    Duplicate(String),
    Malformed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapStats {
    pub matched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub ignored: usize,
}

impl TapStats {
    fn record(&mut self, outcome: &TapOutcome) {
        if !matches!(outcome, TapOutcome::Ignored) {
            self.matched += 1;
        }
        match outcome {
            TapOutcome::Ignored => self.ignored += 1,
            TapOutcome::Inserted(_) => self.inserted += 1,
            TapOutcome::Duplicate(_) => self.duplicates += 1,
            TapOutcome::Malformed(_) => self.malformed += 1,
        }
    }
}

pub struct ResponseTap {
    signature: EndpointSignature,
    identity_path: IdentityPath,
    collector: Collector,
}

impl ResponseTap {
    pub fn new(signature: EndpointSignature, identity_path: IdentityPath, collector: Collector) -> Self {
        Self {
            signature,
            identity_path,
            collector,
        }
    }

    /// レスポンス1件を処理する。エラーは返さずログと結果に残す
    pub fn handle(&self, response: InterceptedResponse) -> TapOutcome {
        if !self.signature.matches(&response.url) {
            return TapOutcome::Ignored;
        }

        let text = match response.body {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to read response body from {}: {}", response.url, e);
                return TapOutcome::Malformed(e.to_string());
            }
        };

        let body: Value = match serde_json::from_str(&text) {
            Ok(body) => body,
            Err(e) => {
                warn!("Discarding unparseable item payload: {}", e);
                return TapOutcome::Malformed(format!("JSON parse error: {}", e));
            }
        };

        let Some(identity) = self.identity_path.resolve(&body) else {
            warn!("Discarding item payload without `{}`", self.identity_path);
            return TapOutcome::Malformed(format!("missing {}", self.identity_path));
        };

        let added = self.collector.try_add(RawItemPayload {
            identity: identity.clone(),
            body,
        });
        if added.inserted {
            info!("Captured item payload: {} (total {})", identity, self.collector.len());
            TapOutcome::Inserted(identity)
        } else {
            debug!("Duplicate item payload dropped: {}", identity);
            TapOutcome::Duplicate(identity)
        }
    }

    /// 独立したタスクとして傍受を開始する
    pub fn spawn(self, mut responses: BoxStream<'static, InterceptedResponse>) -> TapHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut stats = TapStats::default();
            loop {
                tokio::select! {
                    biased;
                    next = responses.next() => match next {
                        Some(response) => stats.record(&self.handle(response)),
                        None => {
                            debug!("Response stream closed");
                            break;
                        }
                    },
                    _ = &mut stop_rx => {
                        // 停止要求の時点で届いている分は処理する
                        while let Some(Some(response)) = responses.next().now_or_never() {
                            stats.record(&self.handle(response));
                        }
                        break;
                    }
                }
            }
            stats
        });

        TapHandle { stop: stop_tx, task }
    }
}

/// 実行中の傍受タスク
pub struct TapHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<TapStats>,
}

impl TapHandle {
    /// 傍受を停止して集計を返す
    pub async fn finish(self) -> TapStats {
        let _ = self.stop.send(());
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Response tap task ended abnormally: {}", e);
                TapStats::default()
            }
        }
    }
}
