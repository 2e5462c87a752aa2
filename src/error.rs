use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("ブラウザ初期化エラー: {0}")]
    BrowserInit(String),

    #[error("ブラウザセッション喪失: {0}")]
    SessionLost(String),

    #[error("ナビゲーションエラー: {0}")]
    Navigation(String),

    #[error("住所設定に失敗しました ({retries}回リトライ): {message}")]
    AddressSetup { retries: u32, message: String },

    #[error("ビューポートの高さが不正です: {0}")]
    InvalidViewport(f64),

    #[error("要素が見つかりません: {0}")]
    ElementNotFound(String),

    #[error("要素が切り離されています: {0}")]
    StaleElement(String),

    #[error("操作エラー: {0}")]
    Interaction(String),

    #[error("タイムアウト: {0}")]
    Timeout(String),

    #[error("レスポンス解析エラー: {0}")]
    Payload(String),

    #[error("JavaScript実行エラー: {0}")]
    JavaScript(String),
}

impl HarvestError {
    /// 実行全体を中断すべきエラーか
    ///
    /// 要素単位の失敗（切り離し・クリック失敗・タイムアウト・不正なレスポンス）は
    /// その場でログに残して処理を継続する。
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarvestError::BrowserInit(_)
                | HarvestError::SessionLost(_)
                | HarvestError::Navigation(_)
                | HarvestError::AddressSetup { .. }
                | HarvestError::InvalidViewport(_)
        )
    }

    /// 住所設定のリトライ対象か
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HarvestError::ElementNotFound(_)
                | HarvestError::Interaction(_)
                | HarvestError::Timeout(_)
                | HarvestError::JavaScript(_)
        )
    }
}
