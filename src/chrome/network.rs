//! ネットワークレスポンスの傍受
//!
//! `Network.responseReceived` で対象リクエストを記録し、`Network.loadingFinished`
//! を受けてからボディを取得する（受信完了前は getResponseBody が失敗するため）。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use base64::Engine;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventLoadingFinished, EventResponseReceived,
    GetResponseBodyParams, RequestId,
};
use chromiumoxide::Page;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::HarvestError;
use crate::tap::{EndpointSignature, InterceptedResponse};

/// 先に完了通知だけ届いたリクエストIDを覚えておく上限
const EARLY_FINISHED_CAPACITY: usize = 512;

/// 対象リクエストの受信・完了の突き合わせ
///
/// 2つのイベントは別々のチャネルで届くため、どちらが先でもボディ取得に進める。
#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    /// requestId -> URL（受信済み・未完了）
    received: HashMap<String, String>,
    /// 受信より先に完了したリクエスト
    finished_early: HashSet<String>,
    finished_order: VecDeque<String>,
}

impl PendingRequests {
    /// 対象レスポンスの受信。既に完了済みなら URL を返す
    pub(crate) fn on_received(&mut self, request_id: &str, url: &str) -> Option<String> {
        if self.finished_early.remove(request_id) {
            self.finished_order.retain(|id| id != request_id);
            return Some(url.to_string());
        }
        self.received.insert(request_id.to_string(), url.to_string());
        None
    }

    /// 読み込み完了。対象として受信済みなら URL を返す
    pub(crate) fn on_finished(&mut self, request_id: &str) -> Option<String> {
        if let Some(url) = self.received.remove(request_id) {
            return Some(url);
        }
        if self.finished_early.insert(request_id.to_string()) {
            self.finished_order.push_back(request_id.to_string());
            if self.finished_order.len() > EARLY_FINISHED_CAPACITY {
                if let Some(oldest) = self.finished_order.pop_front() {
                    self.finished_early.remove(&oldest);
                }
            }
        }
        None
    }

    /// 読み込み失敗。対象として受信済みなら URL を返す
    pub(crate) fn on_failed(&mut self, request_id: &str) -> Option<String> {
        self.received.remove(request_id)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.received.len()
    }
}

/// 傍受を開始し、レスポンスのストリームとリスナータスクを返す
pub(crate) async fn intercept(
    page: Arc<Page>,
    signature: EndpointSignature,
) -> Result<(BoxStream<'static, InterceptedResponse>, JoinHandle<()>), HarvestError> {
    page.execute(EnableParams::default())
        .await
        .map_err(|e| HarvestError::SessionLost(format!("Network.enable: {}", e)))?;

    let mut received = page
        .event_listener::<EventResponseReceived>()
        .await
        .map_err(|e| HarvestError::SessionLost(e.to_string()))?;
    let mut finished = page
        .event_listener::<EventLoadingFinished>()
        .await
        .map_err(|e| HarvestError::SessionLost(e.to_string()))?;
    let mut failed = page
        .event_listener::<EventLoadingFailed>()
        .await
        .map_err(|e| HarvestError::SessionLost(e.to_string()))?;

    let (tx, rx) = mpsc::unbounded();

    let listener = tokio::spawn(async move {
        let mut pending = PendingRequests::default();

        loop {
            let ready = tokio::select! {
                // 受信イベントを優先し、完了イベントより先に記録する
                biased;
                Some(event) = received.next() => {
                    if !signature.matches(&event.response.url) {
                        continue;
                    }
                    debug!("Item response received: {}", event.response.url);
                    pending
                        .on_received(event.request_id.inner(), &event.response.url)
                        .map(|url| (url, event.request_id.clone()))
                }
                Some(event) = finished.next() => {
                    pending
                        .on_finished(event.request_id.inner())
                        .map(|url| (url, event.request_id.clone()))
                }
                Some(event) = failed.next() => {
                    if let Some(url) = pending.on_failed(event.request_id.inner()) {
                        warn!("Item request failed: {} ({})", url, event.error_text);
                    }
                    None
                }
                else => break,
            };

            if let Some((url, request_id)) = ready {
                let body = fetch_body(&page, request_id).await;
                if tx.unbounded_send(InterceptedResponse { url, body }).is_err() {
                    break;
                }
            }

            if tx.is_closed() {
                break;
            }
        }
        debug!("Network listener stopped ({} requests in flight)", pending.in_flight());
    });

    Ok((rx.boxed(), listener))
}

async fn fetch_body(page: &Page, request_id: RequestId) -> Result<String, HarvestError> {
    let response = page
        .execute(GetResponseBodyParams::new(request_id))
        .await
        .map_err(|e| HarvestError::Payload(format!("Network.getResponseBody: {}", e)))?;

    if !response.base64_encoded {
        return Ok(response.body.clone());
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(response.body.as_bytes())
        .map_err(|e| HarvestError::Payload(format!("base64 decode failed: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| HarvestError::Payload(format!("body is not UTF-8: {}", e)))
}
