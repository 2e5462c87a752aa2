//! メニューハーベスター
//!
//! ストアフロントをビューポート単位でスクロールしながら商品カードをクリックし、
//! 商品詳細 API のレスポンスを傍受して、商品名で重複排除した一覧を返す。
//!
//! # 使用例
//!
//! ```rust,ignore
//! use menu_harvester::{HarvestRequest, HarvestService};
//! use tower::Service;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut service = HarvestService::new();
//!
//!     let request = HarvestRequest::new("https://www.doordash.com/store/panda-express-san-francisco-980938/12722988/")
//!         .with_headless(false);
//!
//!     let result = service.call(request).await.unwrap();
//!     println!("Items: {}", result.items.len());
//! }
//! ```
//!
//! # セッションを自分で管理する場合
//!
//! ```rust,ignore
//! use menu_harvester::{ChromeSession, HarvestConfig, Harvester};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = HarvestConfig::from_env();
//!     let session = ChromeSession::launch(&config).await.unwrap();
//!
//!     let result = Harvester::new(config).harvest(&session, "https://...").await;
//!     session.close().await.unwrap();
//!     println!("{:?}", result.map(|r| r.items.len()));
//! }
//! ```

pub mod address;
pub mod chrome;
pub mod collector;
pub mod config;
pub mod error;
pub mod harvester;
pub mod section;
pub mod segment;
pub mod service;
pub mod tap;
pub mod traits;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// 主要な型をリエクスポート
pub use address::{AddressSelectors, SelectorAddressSetup};
pub use chrome::ChromeSession;
pub use collector::{Collector, SeenIdentities, TryAdd};
pub use config::{Geolocation, HarvestConfig};
pub use error::HarvestError;
pub use harvester::{HarvestAbort, HarvestState, Harvester};
pub use section::{SectionProcessor, SectionReport};
pub use segment::{compute_segments, PageMetrics, ViewportSegment};
pub use service::{HarvestRequest, HarvestService};
pub use tap::{EndpointSignature, IdentityPath, InterceptedResponse, ResponseTap, TapStats};
pub use traits::{AddressSetup, BrowserSession, Candidate};
pub use types::{HarvestReport, HarvestResult, RawItemPayload};
