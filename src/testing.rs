//! テスト用の疑似ブラウザセッション
//!
//! スクロール位置ごとに表示される商品カードを定義しておき、クリックされると
//! 対応するレスポンスを傍受ストリームに流す。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::json;

use crate::address::AddressSelectors;
use crate::config::{HarvestConfig, DEFAULT_ENDPOINT};
use crate::error::HarvestError;
use crate::segment::PageMetrics;
use crate::tap::{EndpointSignature, InterceptedResponse};
use crate::traits::{BrowserSession, Candidate};

const NOISE_URL: &str = "https://www.doordash.com/graphql/storepageFeed?operation=storepageFeed";

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

pub(crate) fn fast_config() -> HarvestConfig {
    HarvestConfig::default()
        .with_settle(ms(5), ms(200), ms(10))
        .with_interaction_timing(ms(50), ms(1), ms(1))
        .with_drain_window(ms(20))
        .with_address_retries(2, ms(1))
        .with_geolocation(None)
}

pub(crate) fn item_body(name: &str) -> String {
    json!({
        "data": {
            "itemPage": {
                "itemHeader": { "name": name, "unitAmount": 1049 },
                "optionLists": []
            }
        }
    })
    .to_string()
}

#[derive(Debug, Clone)]
pub(crate) struct FakeCard {
    identity: Option<String>,
    payload: Option<String>,
    fail: bool,
    hang: bool,
    lose_session: bool,
    /// レスポンスがクリックより遅れて届くまでの時間
    delay: Option<Duration>,
}

impl FakeCard {
    pub(crate) fn item(name: &str) -> Self {
        Self {
            identity: Some(name.to_string()),
            payload: Some(item_body(name.trim())),
            fail: false,
            hang: false,
            lose_session: false,
            delay: None,
        }
    }

    pub(crate) fn anonymous() -> Self {
        Self {
            identity: None,
            payload: None,
            fail: false,
            hang: false,
            lose_session: false,
            delay: None,
        }
    }

    pub(crate) fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub(crate) fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// クリック中にブラウザとの接続が切れる
    pub(crate) fn losing_session(mut self) -> Self {
        self.lose_session = true;
        self
    }

    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 表示名と異なる商品名のレスポンスを返す
    pub(crate) fn with_payload_name(mut self, name: &str) -> Self {
        self.payload = Some(item_body(name));
        self
    }

    pub(crate) fn with_raw_payload(mut self, body: &str) -> Self {
        self.payload = Some(body.to_string());
        self
    }
}

#[derive(Default)]
pub(crate) struct FakeSessionBuilder {
    sections: Vec<(f64, Vec<FakeCard>)>,
    viewport_height: Option<f64>,
    heights: Vec<f64>,
    lose_at: Option<f64>,
    count_unavailable: bool,
    count_hangs: bool,
    address_failures: Option<u32>,
    navigation_fails: bool,
}

impl FakeSessionBuilder {
    pub(crate) fn with_section(mut self, offset: f64, cards: Vec<FakeCard>) -> Self {
        self.sections.push((offset, cards));
        self
    }

    /// `page_metrics` が順に返す高さ（最後の値を返し続ける）
    pub(crate) fn with_page(mut self, heights: Vec<f64>, viewport_height: f64) -> Self {
        self.heights = heights;
        self.viewport_height = Some(viewport_height);
        self
    }

    pub(crate) fn losing_session_at(mut self, offset: f64) -> Self {
        self.lose_at = Some(offset);
        self
    }

    pub(crate) fn without_card_count(mut self) -> Self {
        self.count_unavailable = true;
        self
    }

    /// 要素数の問い合わせが応答しない
    pub(crate) fn hanging_card_count(mut self) -> Self {
        self.count_hangs = true;
        self
    }

    /// 住所モーダルを表示し、最初の `failures` 回は開くボタンが押せない
    pub(crate) fn with_address_modal(mut self, failures: u32) -> Self {
        self.address_failures = Some(failures);
        self
    }

    pub(crate) fn failing_navigation(mut self) -> Self {
        self.navigation_fails = true;
        self
    }

    pub(crate) fn build(self) -> FakeSession {
        let viewport_height = self.viewport_height.unwrap_or(1000.0);
        let heights = if self.heights.is_empty() {
            let last = self.sections.iter().map(|(offset, _)| *offset).fold(0.0, f64::max);
            vec![last + viewport_height]
        } else {
            self.heights
        };

        FakeSession {
            sections: self.sections,
            viewport_height,
            heights: Mutex::new(heights.into()),
            lose_at: self.lose_at,
            count_unavailable: self.count_unavailable,
            count_hangs: self.count_hangs,
            address_modal: self.address_failures.is_some(),
            address_failures: Mutex::new(self.address_failures.unwrap_or(0)),
            navigation_fails: self.navigation_fails,
            current: Mutex::new(0.0),
            scrolls: Mutex::new(Vec::new()),
            clicked: Mutex::new(Vec::new()),
            navigations: Mutex::new(Vec::new()),
            address_actions: Mutex::new(Vec::new()),
            sender: Mutex::new(None),
        }
    }
}

pub(crate) struct FakeSession {
    sections: Vec<(f64, Vec<FakeCard>)>,
    viewport_height: f64,
    heights: Mutex<VecDeque<f64>>,
    lose_at: Option<f64>,
    count_unavailable: bool,
    count_hangs: bool,
    address_modal: bool,
    address_failures: Mutex<u32>,
    navigation_fails: bool,
    current: Mutex<f64>,
    scrolls: Mutex<Vec<f64>>,
    clicked: Mutex<Vec<String>>,
    navigations: Mutex<Vec<String>>,
    address_actions: Mutex<Vec<String>>,
    sender: Mutex<Option<UnboundedSender<InterceptedResponse>>>,
}

impl FakeSession {
    pub(crate) fn builder() -> FakeSessionBuilder {
        FakeSessionBuilder::default()
    }

    pub(crate) fn clicked(&self) -> Vec<String> {
        self.clicked.lock().unwrap().clone()
    }

    pub(crate) fn scrolls(&self) -> Vec<f64> {
        self.scrolls.lock().unwrap().clone()
    }

    pub(crate) fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }

    pub(crate) fn address_actions(&self) -> Vec<String> {
        self.address_actions.lock().unwrap().clone()
    }

    pub(crate) fn address_failures_remaining(&self) -> u32 {
        *self.address_failures.lock().unwrap()
    }

    fn visible_cards(&self) -> Vec<FakeCard> {
        let current = *self.current.lock().unwrap();
        self.sections
            .iter()
            .find(|(offset, _)| (offset - current).abs() < 0.5)
            .map(|(_, cards)| cards.clone())
            .unwrap_or_default()
    }

    fn emit(&self, url: &str, body: &str) {
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            let _ = sender.unbounded_send(response(url, body));
        }
    }

    /// `delay` 後に別タスクからレスポンスを流す
    fn emit_later(&self, delay: Duration, url: &str, body: &str) {
        let Some(sender) = self.sender.lock().unwrap().clone() else {
            return;
        };
        let response = response(url, body);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.unbounded_send(response);
        });
    }
}

fn response(url: &str, body: &str) -> InterceptedResponse {
    InterceptedResponse {
        url: url.to_string(),
        body: Ok(body.to_string()),
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    type Element = FakeCard;

    async fn navigate(&self, url: &str) -> Result<(), HarvestError> {
        if self.navigation_fails {
            return Err(HarvestError::Navigation(format!("net::ERR_NAME_NOT_RESOLVED {}", url)));
        }
        self.navigations.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn page_metrics(&self) -> Result<PageMetrics, HarvestError> {
        let mut heights = self.heights.lock().unwrap();
        let scroll_height = if heights.len() > 1 {
            heights.pop_front().unwrap_or_default()
        } else {
            heights.front().copied().unwrap_or_default()
        };
        Ok(PageMetrics {
            scroll_height,
            viewport_height: self.viewport_height,
        })
    }

    async fn scroll_to(&self, offset: f64) -> Result<(), HarvestError> {
        if self.lose_at == Some(offset) {
            return Err(HarvestError::SessionLost("Target closed".to_string()));
        }
        self.scrolls.lock().unwrap().push(offset);
        *self.current.lock().unwrap() = offset;
        Ok(())
    }

    async fn count_matching(&self, _selector: &str) -> Result<usize, HarvestError> {
        if self.count_hangs {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.count_unavailable {
            return Err(HarvestError::JavaScript("Execution context was destroyed".to_string()));
        }
        Ok(self.visible_cards().len())
    }

    async fn candidates(&self, _selector: &str) -> Result<Vec<Candidate<FakeCard>>, HarvestError> {
        Ok(self
            .visible_cards()
            .into_iter()
            .map(|card| Candidate {
                display_identity: card.identity.clone(),
                element: card,
            })
            .collect())
    }

    async fn click(&self, element: &FakeCard) -> Result<(), HarvestError> {
        if element.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if element.fail {
            return Err(HarvestError::StaleElement("Node is detached from document".to_string()));
        }
        if element.lose_session {
            return Err(HarvestError::SessionLost("click: Target closed".to_string()));
        }
        self.clicked
            .lock()
            .unwrap()
            .push(element.identity.clone().unwrap_or_default());
        self.emit(NOISE_URL, "{}");
        match (&element.payload, element.delay) {
            (Some(payload), Some(delay)) => self.emit_later(delay, DEFAULT_ENDPOINT, payload),
            (Some(payload), None) => self.emit(DEFAULT_ENDPOINT, payload),
            (None, _) => {}
        }
        Ok(())
    }

    async fn dismiss(&self) -> Result<(), HarvestError> {
        Ok(())
    }

    async fn exists(&self, selector: &str) -> Result<bool, HarvestError> {
        Ok(self.address_modal && selector == AddressSelectors::default().open_button)
    }

    async fn click_selector(&self, selector: &str) -> Result<(), HarvestError> {
        if selector == AddressSelectors::default().open_button {
            let mut failures = self.address_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(HarvestError::ElementNotFound(selector.to_string()));
            }
        }
        self.address_actions.lock().unwrap().push(format!("click {}", selector));
        Ok(())
    }

    async fn type_into(&self, selector: &str, text: &str) -> Result<(), HarvestError> {
        self.address_actions
            .lock()
            .unwrap()
            .push(format!("type {} {}", selector, text));
        Ok(())
    }

    async fn intercept(
        &self,
        _signature: &EndpointSignature,
    ) -> Result<BoxStream<'static, InterceptedResponse>, HarvestError> {
        let (tx, rx) = mpsc::unbounded();
        *self.sender.lock().unwrap() = Some(tx);
        Ok(rx.boxed())
    }
}
