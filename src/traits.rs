use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::HarvestError;
use crate::segment::PageMetrics;
use crate::tap::{EndpointSignature, InterceptedResponse};

/// 描画中の商品カード
///
/// ページ側で再描画されると無効になるため、セクションをまたいで保持しない。
#[derive(Debug, Clone)]
pub struct Candidate<E> {
    pub element: E,
    /// 表示テキストまたは属性から得た名前（取得できない場合は None）
    pub display_identity: Option<String>,
}

/// ブラウザ操作
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// 要素ハンドル
    type Element: Send + Sync;

    /// URLに遷移
    async fn navigate(&self, url: &str) -> Result<(), HarvestError>;

    /// ページ全体の高さとビューポートの高さ
    async fn page_metrics(&self) -> Result<PageMetrics, HarvestError>;

    /// 縦方向のスクロール位置を設定
    async fn scroll_to(&self, offset: f64) -> Result<(), HarvestError>;

    /// セレクタに一致する要素数
    async fn count_matching(&self, selector: &str) -> Result<usize, HarvestError>;

    /// セレクタに一致する要素を DOM 順で列挙
    async fn candidates(&self, selector: &str) -> Result<Vec<Candidate<Self::Element>>, HarvestError>;

    /// 要素をクリック
    async fn click(&self, element: &Self::Element) -> Result<(), HarvestError>;

    /// 詳細表示を閉じる（Escape キー）
    async fn dismiss(&self) -> Result<(), HarvestError>;

    async fn exists(&self, selector: &str) -> Result<bool, HarvestError>;

    async fn click_selector(&self, selector: &str) -> Result<(), HarvestError>;

    async fn type_into(&self, selector: &str, text: &str) -> Result<(), HarvestError>;

    /// 対象エンドポイントのレスポンスをストリームで受け取る
    async fn intercept(
        &self,
        signature: &EndpointSignature,
    ) -> Result<BoxStream<'static, InterceptedResponse>, HarvestError>;

    /// デバッグ用スクリーンショット (PNG)
    async fn screenshot(&self) -> Result<Vec<u8>, HarvestError> {
        Err(HarvestError::Interaction("screenshot not supported".to_string()))
    }
}

/// 住所設定（ストアフロントの表示に必要な前処理）
///
/// 実装側で独自のリトライを行い、最終的に失敗した場合のみ Err を返す。
#[async_trait]
pub trait AddressSetup: Send + Sync {
    async fn configure<S: BrowserSession>(&self, session: &S) -> Result<(), HarvestError>;
}
