//! 収集結果の型定義

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tap::TapStats;

/// 傍受したレスポンス1件分の商品データ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItemPayload {
    /// レスポンス内の商品名（重複排除のキー）
    pub identity: String,
    /// パース済みレスポンス全体
    pub body: serde_json::Value,
}

/// 1回の収集の集計
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestReport {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub segments_scanned: usize,
    pub candidates_seen: usize,
    pub clicked: usize,
    pub skipped_duplicate: usize,
    pub skipped_anonymous: usize,
    pub failed_interactions: usize,
    pub tap: TapStats,
    /// クリックしたがレスポンスが捕捉できなかった表示名
    pub clicked_without_payload: Vec<String>,
    /// クリックした表示名と一致しないレスポンスの商品名
    pub payload_without_click: Vec<String>,
}

impl HarvestReport {
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// 収集結果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestResult {
    /// 商品名で一意、到着順
    pub items: Vec<RawItemPayload>,
    pub report: HarvestReport,
}

impl HarvestResult {
    pub fn identities(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.identity.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
