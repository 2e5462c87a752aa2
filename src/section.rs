//! セクション処理
//!
//! スクロール位置ひとつ分について、描画完了を待ってから未処理の商品カードを
//! 順にクリックし、詳細表示を閉じる。カード単位の失敗はログに残して次へ進む。

use std::time::{Duration, Instant};

use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::collector::SeenIdentities;
use crate::config::HarvestConfig;
use crate::error::HarvestError;
use crate::segment::ViewportSegment;
use crate::traits::{BrowserSession, Candidate};

/// 連続して要素数が変わらなければ描画完了とみなす回数
const REQUIRED_STABLE_CHECKS: u32 = 2;

/// 描画待機の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    Stable,
    TimedOut,
    /// 要素数が取得できず固定時間待った
    Fallback,
}

/// セクション1つ分の処理結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionReport {
    pub index: usize,
    pub candidates: usize,
    /// クリックした表示名（DOM 順）
    pub clicked: Vec<String>,
    pub skipped_duplicate: usize,
    pub skipped_anonymous: usize,
    pub failed: usize,
}

pub struct SectionProcessor {
    item_selector: String,
    settle_poll_interval: Duration,
    settle_timeout: Duration,
    settle_fallback: Duration,
    interaction_timeout: Duration,
    detail_delay: Duration,
    dismiss_delay: Duration,
}

impl SectionProcessor {
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            item_selector: config.item_selector.clone(),
            settle_poll_interval: config.settle_poll_interval,
            settle_timeout: config.settle_timeout,
            settle_fallback: config.settle_fallback,
            interaction_timeout: config.interaction_timeout,
            detail_delay: config.detail_delay,
            dismiss_delay: config.dismiss_delay,
        }
    }

    /// スクロール・列挙の失敗、およびカード操作中の致命的エラーは呼び出し元へ返す
    pub async fn process<S: BrowserSession>(
        &self,
        session: &S,
        segment: &ViewportSegment,
        seen: &mut SeenIdentities,
    ) -> Result<SectionReport, HarvestError> {
        debug!(
            "Processing section {} at offset {}",
            segment.index, segment.scroll_offset
        );

        session.scroll_to(segment.scroll_offset).await?;
        let settle = self.settle(session).await;
        debug!("Section {} settle: {:?}", segment.index, settle);

        let candidates = session.candidates(&self.item_selector).await?;
        let mut report = SectionReport {
            index: segment.index,
            candidates: candidates.len(),
            ..Default::default()
        };

        for candidate in &candidates {
            let Some(identity) = display_identity(candidate) else {
                debug!("Skipping item card without a readable name");
                report.skipped_anonymous += 1;
                continue;
            };

            if !seen.insert_if_absent(&identity) {
                report.skipped_duplicate += 1;
                continue;
            }

            match self.interact(session, &candidate.element).await {
                Ok(()) => {
                    debug!("Opened item: {}", identity);
                    report.clicked.push(identity);
                }
                Err(e) if e.is_fatal() => {
                    warn!("Session lost while opening {}: {}", identity, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Item interaction failed for {}: {}", identity, e);
                    report.failed += 1;
                    // 詳細表示が開いたままの可能性があるので閉じておく
                    if let Err(e) = session.dismiss().await {
                        debug!("Dismiss after failure failed: {}", e);
                    }
                }
            }
        }

        info!(
            "Section {} done: {} cards, {} clicked, {} already seen, {} failed",
            report.index,
            report.candidates,
            report.clicked.len(),
            report.skipped_duplicate,
            report.failed
        );
        Ok(report)
    }

    async fn interact<S: BrowserSession>(&self, session: &S, element: &S::Element) -> Result<(), HarvestError> {
        timeout(self.interaction_timeout, session.click(element))
            .await
            .map_err(|_| HarvestError::Timeout(format!("click did not complete within {:?}", self.interaction_timeout)))??;

        sleep(self.detail_delay).await;

        timeout(self.interaction_timeout, session.dismiss())
            .await
            .map_err(|_| HarvestError::Timeout(format!("dismiss did not complete within {:?}", self.interaction_timeout)))??;

        sleep(self.dismiss_delay).await;
        Ok(())
    }

    /// 遅延描画の完了を待つ
    ///
    /// 商品カード数が `REQUIRED_STABLE_CHECKS` 回連続で変わらなければ完了。
    /// 一度も数えられなかった場合のみ固定時間待つ。
    /// 各問い合わせも `settle_timeout` の残り時間で打ち切る。
    pub async fn settle<S: BrowserSession>(&self, session: &S) -> Settle {
        let start = Instant::now();
        let mut last_count: Option<usize> = None;
        let mut stable_count = 0;
        let mut observed = false;

        while start.elapsed() < self.settle_timeout {
            let remaining = self.settle_timeout.saturating_sub(start.elapsed());
            let Ok(polled) = timeout(remaining, session.count_matching(&self.item_selector)).await else {
                debug!("Card count check did not answer within {:?}", remaining);
                break;
            };

            match polled {
                Ok(count) => {
                    observed = true;
                    match last_count {
                        Some(last) if last == count => {
                            stable_count += 1;
                            if stable_count >= REQUIRED_STABLE_CHECKS {
                                debug!("Section stable after {:?} ({} cards)", start.elapsed(), count);
                                return Settle::Stable;
                            }
                        }
                        _ => stable_count = 0,
                    }
                    last_count = Some(count);
                }
                Err(e) => {
                    debug!("Card count check error: {}", e);
                    stable_count = 0;
                }
            }

            sleep(self.settle_poll_interval).await;
        }

        if !observed {
            warn!(
                "Card count unavailable, falling back to fixed wait of {:?}",
                self.settle_fallback
            );
            sleep(self.settle_fallback).await;
            return Settle::Fallback;
        }

        warn!("Section settle timeout after {:?}, proceeding anyway", start.elapsed());
        Settle::TimedOut
    }
}

fn display_identity<E>(candidate: &Candidate<E>) -> Option<String> {
    let identity = candidate.display_identity.as_deref()?.trim();
    if identity.is_empty() {
        None
    } else {
        Some(identity.to_string())
    }
}
