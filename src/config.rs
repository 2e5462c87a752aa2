use std::time::Duration;

use crate::address::AddressSelectors;
use crate::tap::{EndpointSignature, IdentityPath};

/// 商品カードのセレクタ（DoorDash ストアページ）
pub const DEFAULT_ITEM_SELECTOR: &str = r#"[data-anchor-id="MenuItem"]"#;
/// 商品詳細を返す GraphQL エンドポイント
pub const DEFAULT_ENDPOINT: &str = "https://www.doordash.com/graphql/itemPage?operation=itemPage";
/// レスポンス内の商品名の位置
pub const DEFAULT_IDENTITY_PATH: &str = "data.itemPage.itemHeader.name";

/// 位置情報の上書き設定
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geolocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl Geolocation {
    /// サンフランシスコ
    pub const SAN_FRANCISCO: Geolocation = Geolocation {
        latitude: 37.77493,
        longitude: -122.41942,
    };
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// ヘッドレスモード
    pub headless: bool,
    /// デバッグモード（中断時にスクリーンショットをログ出力）
    pub debug: bool,
    /// Chrome 実行ファイルのパス
    pub chrome_path: Option<String>,
    /// 既存ブラウザの CDP WebSocket URL（指定時は起動せず接続する）
    pub cdp_url: Option<String>,
    pub window_width: u32,
    pub window_height: u32,
    /// CDPリクエストタイムアウト
    pub request_timeout: Duration,
    pub geolocation: Option<Geolocation>,
    /// 住所モーダルが出た場合に入力する住所
    pub address: Option<String>,
    pub address_selectors: AddressSelectors,
    pub address_max_retries: u32,
    pub address_initial_backoff: Duration,
    pub item_selector: String,
    pub endpoint: EndpointSignature,
    pub identity_path: IdentityPath,
    pub settle_poll_interval: Duration,
    pub settle_timeout: Duration,
    /// 描画状況が観測できない場合の固定待機
    pub settle_fallback: Duration,
    pub interaction_timeout: Duration,
    /// クリック後、詳細表示を閉じるまでの待機
    pub detail_delay: Duration,
    pub dismiss_delay: Duration,
    /// 走査終了後に遅れて届くレスポンスを待つ時間
    pub drain_window: Duration,
    /// ページが伸びた場合に追加走査する最大回数
    pub max_extension_rounds: u32,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            headless: true,
            debug: false,
            chrome_path: None,
            cdp_url: None,
            window_width: 1280,
            window_height: 800,
            request_timeout: Duration::from_secs(60),
            geolocation: Some(Geolocation::SAN_FRANCISCO),
            address: None,
            address_selectors: AddressSelectors::default(),
            address_max_retries: 3,
            address_initial_backoff: Duration::from_millis(1000),
            item_selector: DEFAULT_ITEM_SELECTOR.to_string(),
            endpoint: EndpointSignature::parse(DEFAULT_ENDPOINT)
                .unwrap_or_else(|_| EndpointSignature::new("https://www.doordash.com/graphql/itemPage")),
            identity_path: IdentityPath::parse(DEFAULT_IDENTITY_PATH),
            settle_poll_interval: Duration::from_millis(250),
            settle_timeout: Duration::from_secs(4),
            settle_fallback: Duration::from_millis(1500),
            interaction_timeout: Duration::from_secs(5),
            detail_delay: Duration::from_millis(800),
            dismiss_delay: Duration::from_millis(200),
            drain_window: Duration::from_secs(2),
            max_extension_rounds: 3,
        }
    }
}

impl HarvestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 環境変数で上書きした設定
    ///
    /// `CHROME_PATH` / `CHROMIUM_PATH`, `CDP_URL`, `HEADLESS`, `HARVEST_ADDRESS`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("CHROME_PATH").or_else(|_| std::env::var("CHROMIUM_PATH")) {
            config.chrome_path = Some(path);
        }
        if let Ok(url) = std::env::var("CDP_URL") {
            if !url.trim().is_empty() {
                config.cdp_url = Some(url.trim().to_string());
            }
        }
        if let Ok(headless) = std::env::var("HEADLESS") {
            config.headless = headless != "false" && headless != "0";
        }
        if let Ok(address) = std::env::var("HARVEST_ADDRESS") {
            if !address.trim().is_empty() {
                config.address = Some(address.trim().to_string());
            }
        }

        config
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_chrome_path(mut self, path: impl Into<String>) -> Self {
        self.chrome_path = Some(path.into());
        self
    }

    pub fn with_cdp_url(mut self, url: impl Into<String>) -> Self {
        self.cdp_url = Some(url.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_geolocation(mut self, geolocation: Option<Geolocation>) -> Self {
        self.geolocation = geolocation;
        self
    }

    pub fn with_item_selector(mut self, selector: impl Into<String>) -> Self {
        self.item_selector = selector.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: EndpointSignature) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_identity_path(mut self, path: IdentityPath) -> Self {
        self.identity_path = path;
        self
    }

    pub fn with_settle(mut self, poll_interval: Duration, timeout: Duration, fallback: Duration) -> Self {
        self.settle_poll_interval = poll_interval;
        self.settle_timeout = timeout;
        self.settle_fallback = fallback;
        self
    }

    pub fn with_interaction_timing(mut self, timeout: Duration, detail_delay: Duration, dismiss_delay: Duration) -> Self {
        self.interaction_timeout = timeout;
        self.detail_delay = detail_delay;
        self.dismiss_delay = dismiss_delay;
        self
    }

    pub fn with_drain_window(mut self, drain_window: Duration) -> Self {
        self.drain_window = drain_window;
        self
    }

    pub fn with_address_retries(mut self, max_retries: u32, initial_backoff: Duration) -> Self {
        self.address_max_retries = max_retries;
        self.address_initial_backoff = initial_backoff;
        self
    }

    pub fn with_max_extension_rounds(mut self, rounds: u32) -> Self {
        self.max_extension_rounds = rounds;
        self
    }
}
