use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{GrantPermissionsParams, PermissionType};
use chromiumoxide::cdp::browser_protocol::emulation::SetGeolocationOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{DispatchKeyEventParams, DispatchKeyEventType};
use chromiumoxide::element::Element;
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::Handler;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Geolocation, HarvestConfig};
use crate::error::HarvestError;
use crate::segment::PageMetrics;
use crate::tap::{EndpointSignature, InterceptedResponse};
use crate::traits::{BrowserSession, Candidate};

use super::network;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetrics {
    scroll_height: f64,
    viewport_height: f64,
}

/// セッションが起動したバックグラウンドリスナー
#[derive(Debug, Default)]
struct ListenerSet {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ListenerSet {
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// 全リスナーを停止し、停止した数を返す
    fn abort_all(&self) -> usize {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in &tasks {
            task.abort();
        }
        tasks.len()
    }
}

/// chromiumoxide のページ1枚を操作するセッション
pub struct ChromeSession {
    browser: Browser,
    page: Arc<Page>,
    handler_task: JoinHandle<()>,
    /// ネットワーク傍受タスク（ページへの参照を持つ）
    listeners: ListenerSet,
    /// 接続先ブラウザは閉じずに切断だけ行う
    remote: bool,
}

impl ChromeSession {
    /// 設定に従ってブラウザを起動（`cdp_url` があれば接続）
    pub async fn launch(config: &HarvestConfig) -> Result<Self, HarvestError> {
        if let Some(url) = &config.cdp_url {
            return Self::connect(url, config).await;
        }

        info!("Launching browser...");

        // ユニークなユーザーデータディレクトリを生成
        let unique_id = format!(
            "{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        );
        let user_data_dir = std::env::temp_dir().join(format!("menu-harvester-{}", unique_id));

        let mut builder = BrowserConfig::builder()
            .user_data_dir(&user_data_dir)
            .window_size(config.window_width, config.window_height)
            .request_timeout(config.request_timeout)
            .no_sandbox()
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");

        if let Some(path) = &config.chrome_path {
            builder = builder.chrome_executable(path);
        }
        if !config.headless {
            builder = builder.with_head();
        }
        if config.debug {
            builder = builder.arg("--enable-logging=stderr").arg("--v=1");
        }

        let browser_config = builder
            .build()
            .map_err(|e| HarvestError::BrowserInit(format!("ブラウザ設定エラー: {}", e)))?;

        let (browser, handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| HarvestError::BrowserInit(e.to_string()))?;

        Self::open(browser, handler, config, false).await
    }

    /// 既存ブラウザの CDP WebSocket に接続
    pub async fn connect(url: &str, config: &HarvestConfig) -> Result<Self, HarvestError> {
        info!("Connecting to remote browser: {}", url);
        let (browser, handler) = Browser::connect(url)
            .await
            .map_err(|e| HarvestError::BrowserInit(format!("CDP接続エラー: {}", e)))?;
        Self::open(browser, handler, config, true).await
    }

    async fn open(
        browser: Browser,
        mut handler: Handler,
        config: &HarvestConfig,
        remote: bool,
    ) -> Result<Self, HarvestError> {
        // ブラウザイベントハンドラをバックグラウンドで実行
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                debug!("Browser event: {:?}", event);
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| HarvestError::BrowserInit(e.to_string()))?;

        if let Some(geolocation) = config.geolocation {
            override_geolocation(&browser, &page, geolocation).await?;
        }

        info!("Browser session ready");
        Ok(Self {
            browser,
            page: Arc::new(page),
            handler_task,
            listeners: ListenerSet::default(),
            remote,
        })
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    /// セッションを解放
    pub async fn close(mut self) -> Result<(), HarvestError> {
        info!("Closing browser session...");

        let stopped = self.listeners.abort_all();
        debug!("Stopped {} network listener(s)", stopped);

        // Page はハンドルなので複製を閉じれば同じタブが閉じる
        let page = Page::clone(&self.page);
        if let Err(e) = page.close().await {
            warn!("Failed to close page: {}", e);
        }

        if !self.remote {
            self.browser
                .close()
                .await
                .map_err(|e| HarvestError::SessionLost(format!("ブラウザ終了エラー: {}", e)))?;
            if let Err(e) = self.browser.wait().await {
                debug!("Failed to wait for browser exit: {}", e);
            }
        }

        self.handler_task.abort();
        info!("Browser session closed");
        Ok(())
    }

    async fn find(&self, selector: &str) -> Result<Element, HarvestError> {
        self.page
            .find_element(selector)
            .await
            .map_err(|e| HarvestError::ElementNotFound(format!("{}: {}", selector, e)))
    }
}

/// 住所モーダルを回避するため位置情報を許可して上書きする
async fn override_geolocation(
    browser: &Browser,
    page: &Page,
    geolocation: Geolocation,
) -> Result<(), HarvestError> {
    browser
        .execute(GrantPermissionsParams::new(vec![PermissionType::Geolocation]))
        .await
        .map_err(|e| HarvestError::BrowserInit(format!("位置情報の許可エラー: {}", e)))?;

    let params = SetGeolocationOverrideParams::builder()
        .latitude(geolocation.latitude)
        .longitude(geolocation.longitude)
        .accuracy(50.0)
        .build();
    page.execute(params)
        .await
        .map_err(|e| HarvestError::BrowserInit(format!("位置情報の設定エラー: {}", e)))?;

    debug!(
        "Geolocation overridden: {}, {}",
        geolocation.latitude, geolocation.longitude
    );
    Ok(())
}

/// 表示テキストの最初の行、なければ aria-label
async fn read_identity(element: &Element) -> Option<String> {
    if let Ok(Some(text)) = element.inner_text().await {
        if let Some(line) = text.lines().map(str::trim).find(|line| !line.is_empty()) {
            return Some(line.to_string());
        }
    }

    element
        .attribute("aria-label")
        .await
        .ok()
        .flatten()
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty())
}

/// 要素操作のエラーを分類
///
/// 接続・ターゲットが失われた場合は `SessionLost`（致命的）になる。
fn interaction_error(context: &str, error: CdpError) -> HarvestError {
    match error {
        CdpError::Ws(_) | CdpError::ChannelSendError(_) | CdpError::NoResponse => {
            HarvestError::SessionLost(format!("{}: {}", context, error))
        }
        CdpError::Timeout => HarvestError::Timeout(format!("{}: {}", context, error)),
        other => classify_failure(context, &other.to_string()),
    }
}

/// エラーメッセージからの分類
fn classify_failure(context: &str, message: &str) -> HarvestError {
    const SESSION_GONE: [&str; 5] = [
        "target closed",
        "session closed",
        "no target with given id",
        "receiver is gone",
        "channel closed",
    ];
    const STALE: [&str; 3] = ["detached", "no node", "could not find node"];

    let lower = message.to_lowercase();
    let detail = format!("{}: {}", context, message);
    if SESSION_GONE.iter().any(|m| lower.contains(m)) {
        HarvestError::SessionLost(detail)
    } else if STALE.iter().any(|m| lower.contains(m)) {
        HarvestError::StaleElement(detail)
    } else {
        HarvestError::Interaction(detail)
    }
}

fn selector_literal(selector: &str) -> String {
    serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string())
}

#[async_trait]
impl BrowserSession for ChromeSession {
    type Element = Element;

    async fn navigate(&self, url: &str) -> Result<(), HarvestError> {
        info!("Navigating to {}", url);
        self.page
            .goto(url)
            .await
            .map_err(|e| HarvestError::Navigation(e.to_string()))?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|e| HarvestError::Navigation(e.to_string()))?;
        Ok(())
    }

    async fn page_metrics(&self) -> Result<PageMetrics, HarvestError> {
        let metrics: RawMetrics = self
            .page
            .evaluate(
                r#"
                ({
                    scrollHeight: Math.max(document.body.scrollHeight, document.documentElement.scrollHeight),
                    viewportHeight: window.innerHeight
                })
                "#,
            )
            .await
            .map_err(|e| HarvestError::SessionLost(e.to_string()))?
            .into_value()
            .map_err(|e| HarvestError::SessionLost(format!("page metrics: {}", e)))?;

        Ok(PageMetrics {
            scroll_height: metrics.scroll_height,
            viewport_height: metrics.viewport_height,
        })
    }

    async fn scroll_to(&self, offset: f64) -> Result<(), HarvestError> {
        self.page
            .evaluate(format!("window.scrollTo(0, {})", offset))
            .await
            .map_err(|e| HarvestError::SessionLost(e.to_string()))?;
        Ok(())
    }

    async fn count_matching(&self, selector: &str) -> Result<usize, HarvestError> {
        self.page
            .evaluate(format!(
                "document.querySelectorAll({}).length",
                selector_literal(selector)
            ))
            .await
            .map_err(|e| HarvestError::JavaScript(e.to_string()))?
            .into_value::<usize>()
            .map_err(|e| HarvestError::JavaScript(e.to_string()))
    }

    async fn candidates(&self, selector: &str) -> Result<Vec<Candidate<Element>>, HarvestError> {
        let elements = self
            .page
            .find_elements(selector)
            .await
            .map_err(|e| HarvestError::SessionLost(format!("{}: {}", selector, e)))?;

        let mut candidates = Vec::with_capacity(elements.len());
        for element in elements {
            let display_identity = read_identity(&element).await;
            candidates.push(Candidate {
                element,
                display_identity,
            });
        }
        Ok(candidates)
    }

    async fn click(&self, element: &Element) -> Result<(), HarvestError> {
        element
            .click()
            .await
            .map_err(|e| interaction_error("click", e))?;
        Ok(())
    }

    async fn dismiss(&self) -> Result<(), HarvestError> {
        for event_type in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let params = DispatchKeyEventParams::builder()
                .r#type(event_type)
                .key("Escape")
                .code("Escape")
                .windows_virtual_key_code(27)
                .build()
                .map_err(HarvestError::Interaction)?;
            self.page
                .execute(params)
                .await
                .map_err(|e| interaction_error("escape", e))?;
        }
        Ok(())
    }

    async fn exists(&self, selector: &str) -> Result<bool, HarvestError> {
        self.page
            .evaluate(format!(
                "document.querySelector({}) !== null",
                selector_literal(selector)
            ))
            .await
            .map_err(|e| HarvestError::JavaScript(e.to_string()))?
            .into_value::<bool>()
            .map_err(|e| HarvestError::JavaScript(e.to_string()))
    }

    async fn click_selector(&self, selector: &str) -> Result<(), HarvestError> {
        self.find(selector)
            .await?
            .click()
            .await
            .map_err(|e| interaction_error(selector, e))?;
        Ok(())
    }

    async fn type_into(&self, selector: &str, text: &str) -> Result<(), HarvestError> {
        self.find(selector)
            .await?
            .click()
            .await
            .map_err(|e| interaction_error(selector, e))?
            .type_str(text)
            .await
            .map_err(|e| interaction_error(selector, e))?;
        Ok(())
    }

    async fn intercept(
        &self,
        signature: &EndpointSignature,
    ) -> Result<BoxStream<'static, InterceptedResponse>, HarvestError> {
        let (stream, listener) = network::intercept(self.page.clone(), signature.clone()).await?;
        self.listeners.track(listener);
        Ok(stream)
    }

    async fn screenshot(&self) -> Result<Vec<u8>, HarvestError> {
        self.page
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
            .map_err(|e| HarvestError::Interaction(format!("screenshot: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvester::Harvester;
    use std::time::Duration;

    #[test]
    fn test_interaction_error_classification() {
        assert!(matches!(
            classify_failure("click", "Node is detached from document"),
            HarvestError::StaleElement(_)
        ));
        assert!(matches!(
            classify_failure("click", "Element is not clickable at point (10, 20)"),
            HarvestError::Interaction(_)
        ));
        assert!(matches!(
            interaction_error("click", CdpError::msg("Could not find node with given id")),
            HarvestError::StaleElement(_)
        ));
    }

    #[test]
    fn test_lost_connection_is_fatal() {
        let lost = interaction_error("click", CdpError::NoResponse);
        assert!(matches!(lost, HarvestError::SessionLost(_)));
        assert!(lost.is_fatal());

        let closed = interaction_error("click", CdpError::msg("Target closed"));
        assert!(matches!(closed, HarvestError::SessionLost(_)));
        assert!(classify_failure("escape", "Session closed. Most likely the page has been closed.").is_fatal());

        assert!(matches!(
            interaction_error("click", CdpError::Timeout),
            HarvestError::Timeout(_)
        ));
    }

    #[tokio::test]
    async fn test_listener_set_aborts_running_tasks() {
        let listeners = ListenerSet::default();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        listeners.track(task);
        listeners.track(tokio::spawn(std::future::pending::<()>()));

        assert_eq!(listeners.abort_all(), 2);
        // 中断されたタスクが保持していた送信側が破棄される
        assert!(rx.await.is_err());
        assert_eq!(listeners.abort_all(), 0);
    }

    #[test]
    fn test_selector_literal_escapes_quotes() {
        assert_eq!(
            selector_literal(r#"[data-anchor-id="MenuItem"]"#),
            r#""[data-anchor-id=\"MenuItem\"]""#
        );
    }

    #[tokio::test]
    #[ignore] // 実環境テスト用: cargo test test_live_harvest -- --ignored --nocapture
    async fn test_live_harvest() {
        tracing_subscriber::fmt()
            .with_env_filter("info,menu_harvester=debug")
            .init();

        let url = std::env::var("HARVEST_URL").expect("HARVEST_URL not set");
        let config = HarvestConfig::from_env().with_drain_window(Duration::from_secs(3));

        let session = ChromeSession::launch(&config).await.expect("Failed to launch browser");
        let result = Harvester::new(config).harvest(&session, &url).await;
        session.close().await.expect("Failed to close browser");

        match result {
            Ok(result) => {
                println!("\n=== Harvest Result ===");
                println!("Items: {}", result.items.len());
                for name in result.identities() {
                    println!("  - {}", name);
                }
            }
            Err(e) => panic!("Harvest failed: {:?}", e),
        }
    }
}
