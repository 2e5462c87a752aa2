//! 収集全体の制御
//!
//! Idle → AddressConfigured → Scanning → Finalized の順に進む。
//! 致命的なエラーはその時点の状態と、取得済みの部分結果を付けて返す。

use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::address::SelectorAddressSetup;
use crate::collector::{Collector, SeenIdentities};
use crate::config::HarvestConfig;
use crate::error::HarvestError;
use crate::section::SectionProcessor;
use crate::segment::compute_segments;
use crate::tap::ResponseTap;
use crate::traits::{AddressSetup, BrowserSession};
use crate::types::{HarvestReport, HarvestResult, RawItemPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HarvestState {
    Idle,
    AddressConfigured,
    Scanning,
    Finalized,
}

impl std::fmt::Display for HarvestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HarvestState::Idle => "idle",
            HarvestState::AddressConfigured => "address-configured",
            HarvestState::Scanning => "scanning",
            HarvestState::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

/// 収集の中断
#[derive(Error, Debug)]
#[error("収集を中断しました ({stage}): {source}")]
pub struct HarvestAbort {
    pub stage: HarvestState,
    #[source]
    pub source: HarvestError,
    /// 傍受開始後に中断した場合の部分結果
    pub partial: Option<HarvestResult>,
}

pub struct Harvester<A = SelectorAddressSetup> {
    config: HarvestConfig,
    address_setup: A,
    state: HarvestState,
}

impl Harvester<SelectorAddressSetup> {
    pub fn new(config: HarvestConfig) -> Self {
        let address_setup = SelectorAddressSetup::from_config(&config);
        Self::with_address_setup(config, address_setup)
    }
}

impl<A: AddressSetup> Harvester<A> {
    pub fn with_address_setup(config: HarvestConfig, address_setup: A) -> Self {
        Self {
            config,
            address_setup,
            state: HarvestState::Idle,
        }
    }

    pub fn state(&self) -> HarvestState {
        self.state
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    fn transition(&mut self, next: HarvestState) {
        info!("Harvest state: {} -> {}", self.state, next);
        self.state = next;
    }

    /// `start_url` を開いてメニュー全体を収集する
    pub async fn harvest<S: BrowserSession>(
        &mut self,
        session: &S,
        start_url: &str,
    ) -> Result<HarvestResult, HarvestAbort> {
        self.state = HarvestState::Idle;
        let mut report = HarvestReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        info!("Starting harvest: {}", start_url);

        if let Err(e) = session.navigate(start_url).await {
            return Err(self.abort(session, e, None).await);
        }

        if let Err(e) = self.address_setup.configure(session).await {
            return Err(self.abort(session, e, None).await);
        }
        self.transition(HarvestState::AddressConfigured);

        let responses = match session.intercept(&self.config.endpoint).await {
            Ok(responses) => responses,
            Err(e) => return Err(self.abort(session, e, None).await),
        };
        let collector = Collector::new();
        let tap = ResponseTap::new(
            self.config.endpoint.clone(),
            self.config.identity_path.clone(),
            collector.clone(),
        )
        .spawn(responses);
        self.transition(HarvestState::Scanning);

        let mut seen = SeenIdentities::new();
        let mut clicked = Vec::new();
        let scan = self.scan(session, &mut seen, &mut clicked, &mut report).await;

        if scan.is_ok() {
            debug!("Draining in-flight responses for {:?}", self.config.drain_window);
            sleep(self.config.drain_window).await;
        }
        report.tap = tap.finish().await;

        let items = collector.snapshot();
        cross_check(&clicked, &items, &mut report);
        report.finished_at = Some(Utc::now());
        let result = HarvestResult { items, report };

        if let Err(e) = scan {
            return Err(self.abort(session, e, Some(result)).await);
        }

        self.transition(HarvestState::Finalized);
        info!(
            "Harvest finished: {} items from {} sections ({} clicked, {} failed) in {}ms",
            result.items.len(),
            result.report.segments_scanned,
            result.report.clicked,
            result.report.failed_interactions,
            result
                .report
                .elapsed()
                .map(|d| d.num_milliseconds())
                .unwrap_or_default()
        );
        Ok(result)
    }

    /// 全セクションを昇順に処理する
    ///
    /// 走査後にページが伸びていれば、追加分のセクションだけを処理する。
    async fn scan<S: BrowserSession>(
        &self,
        session: &S,
        seen: &mut SeenIdentities,
        clicked: &mut Vec<String>,
        report: &mut HarvestReport,
    ) -> Result<(), HarvestError> {
        let metrics = session.page_metrics().await?;
        let viewport = metrics.viewport_height;
        if !(viewport > 0.0) || !viewport.is_finite() {
            return Err(HarvestError::InvalidViewport(viewport));
        }

        let processor = SectionProcessor::from_config(&self.config);
        let mut segments = compute_segments(metrics.scroll_height, viewport);
        info!(
            "Page height {} / viewport {} -> {} sections",
            metrics.scroll_height,
            viewport,
            segments.len()
        );

        let mut processed = 0;
        let mut rounds = 0;
        loop {
            for segment in segments.iter().skip(processed) {
                let section = processor.process(session, segment, seen).await?;
                report.segments_scanned += 1;
                report.candidates_seen += section.candidates;
                report.clicked += section.clicked.len();
                report.skipped_duplicate += section.skipped_duplicate;
                report.skipped_anonymous += section.skipped_anonymous;
                report.failed_interactions += section.failed;
                clicked.extend(section.clicked);
                processed += 1;
            }

            if rounds >= self.config.max_extension_rounds {
                break;
            }
            let refreshed = session.page_metrics().await?;
            let extended = compute_segments(refreshed.scroll_height, viewport);
            if extended.len() <= processed {
                break;
            }
            info!(
                "Page grew to {}, scanning {} more sections",
                refreshed.scroll_height,
                extended.len() - processed
            );
            segments = extended;
            rounds += 1;
        }

        Ok(())
    }

    async fn abort<S: BrowserSession>(
        &mut self,
        session: &S,
        source: HarvestError,
        partial: Option<HarvestResult>,
    ) -> HarvestAbort {
        error!("Harvest aborted during {}: {}", self.state, source);

        if self.config.debug {
            match session.screenshot().await {
                Ok(png) => {
                    use base64::Engine;
                    let encoded = base64::engine::general_purpose::STANDARD.encode(&png);
                    debug!("Abort screenshot: data:image/png;base64,{}", encoded);
                }
                Err(e) => debug!("Failed to capture abort screenshot: {}", e),
            }
        }

        HarvestAbort {
            stage: self.state,
            source,
            partial,
        }
    }
}

fn normalize(identity: &str) -> String {
    identity.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// 表示名とレスポンスの商品名の突き合わせ
///
/// 重複排除はレスポンス側の商品名だけで行い、ここでは食い違いを記録するのみ。
fn cross_check(clicked: &[String], items: &[RawItemPayload], report: &mut HarvestReport) {
    let clicked_names: HashSet<String> = clicked.iter().map(|c| normalize(c)).collect();
    let payload_names: HashSet<String> = items.iter().map(|i| normalize(&i.identity)).collect();

    report.clicked_without_payload = clicked
        .iter()
        .filter(|c| !payload_names.contains(&normalize(c)))
        .cloned()
        .collect();
    report.payload_without_click = items
        .iter()
        .filter(|i| !clicked_names.contains(&normalize(&i.identity)))
        .map(|i| i.identity.clone())
        .collect();

    if !report.clicked_without_payload.is_empty() {
        warn!(
            "{} clicked items produced no captured payload: {:?}",
            report.clicked_without_payload.len(),
            report.clicked_without_payload
        );
    }
    if !report.payload_without_click.is_empty() {
        warn!(
            "{} payloads do not match any clicked card name: {:?}",
            report.payload_without_click.len(),
            report.payload_without_click
        );
    }
}
