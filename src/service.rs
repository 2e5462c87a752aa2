use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::Service;
use tracing::{info, warn};

use crate::chrome::ChromeSession;
use crate::config::HarvestConfig;
use crate::harvester::{HarvestAbort, HarvestState, Harvester};
use crate::types::HarvestResult;

/// 収集リクエスト
#[derive(Debug, Clone)]
pub struct HarvestRequest {
    pub start_url: String,
    pub headless: bool,
    pub address: Option<String>,
    pub cdp_url: Option<String>,
}

impl HarvestRequest {
    pub fn new(start_url: impl Into<String>) -> Self {
        Self {
            start_url: start_url.into(),
            headless: true,
            address: None,
            cdp_url: None,
        }
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_cdp_url(mut self, url: impl Into<String>) -> Self {
        self.cdp_url = Some(url.into());
        self
    }

    fn apply(&self, base: &HarvestConfig) -> HarvestConfig {
        let mut config = base.clone().with_headless(self.headless);
        if let Some(address) = &self.address {
            config = config.with_address(address.clone());
        }
        if let Some(url) = &self.cdp_url {
            config = config.with_cdp_url(url.clone());
        }
        config
    }
}

impl From<HarvestRequest> for HarvestConfig {
    fn from(req: HarvestRequest) -> Self {
        req.apply(&HarvestConfig::default())
    }
}

/// tower::Serviceを実装したハーベスターサービス
///
/// 1リクエストごとにブラウザセッションを確保し、成功・失敗にかかわらず解放する。
#[derive(Debug, Clone, Default)]
pub struct HarvestService {
    base: HarvestConfig,
}

impl HarvestService {
    pub fn new() -> Self {
        Self::default()
    }

    /// リクエストで上書きされない項目の既定値
    pub fn with_config(base: HarvestConfig) -> Self {
        Self { base }
    }
}

impl Service<HarvestRequest> for HarvestService {
    type Response = HarvestResult;
    type Error = HarvestAbort;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: HarvestRequest) -> Self::Future {
        info!("Harvest request received: {}", req.start_url);
        let config = req.apply(&self.base);

        Box::pin(async move {
            let session = ChromeSession::launch(&config)
                .await
                .map_err(|source| HarvestAbort {
                    stage: HarvestState::Idle,
                    source,
                    partial: None,
                })?;

            let outcome = Harvester::new(config).harvest(&session, &req.start_url).await;

            if let Err(e) = session.close().await {
                warn!("Failed to release browser session: {}", e);
            }

            if let Ok(result) = &outcome {
                info!(
                    "Harvest complete: items={}, clicked={}",
                    result.items.len(),
                    result.report.clicked
                );
            }
            outcome
        })
    }
}
