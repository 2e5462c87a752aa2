//! 住所設定
//!
//! 位置情報の上書きで住所モーダルが出ない場合は何もしない。
//! モーダルが出ている場合は住所を入力して最初の候補を選ぶ。

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::HarvestConfig;
use crate::error::HarvestError;
use crate::traits::{AddressSetup, BrowserSession};

/// 住所入力に使うセレクタ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSelectors {
    /// 住所入力を開くボタン
    pub open_button: String,
    pub input: String,
    pub first_suggestion: String,
    /// 保存ボタン（ない場合は候補選択で確定）
    pub save_button: String,
}

impl Default for AddressSelectors {
    fn default() -> Self {
        Self {
            open_button: r#"[data-testid="addressTextButton"]"#.to_string(),
            input: r#"input[data-testid="AddressAutocompleteField"]"#.to_string(),
            first_suggestion: r#"[data-testid="AddressAutocompleteSuggestion-0"]"#.to_string(),
            save_button: r#"[data-anchor-id="AddressEditSave"]"#.to_string(),
        }
    }
}

/// セレクタ操作による住所設定
pub struct SelectorAddressSetup {
    selectors: AddressSelectors,
    address: Option<String>,
    max_retries: u32,
    initial_backoff: Duration,
    step_delay: Duration,
}

impl SelectorAddressSetup {
    pub fn new(selectors: AddressSelectors, address: Option<String>) -> Self {
        Self {
            selectors,
            address,
            max_retries: 3,
            initial_backoff: Duration::from_millis(1000),
            step_delay: Duration::from_millis(1000),
        }
    }

    pub fn from_config(config: &HarvestConfig) -> Self {
        Self::new(config.address_selectors.clone(), config.address.clone())
            .with_retries(config.address_max_retries, config.address_initial_backoff)
    }

    pub fn with_retries(mut self, max_retries: u32, initial_backoff: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn with_step_delay(mut self, step_delay: Duration) -> Self {
        self.step_delay = step_delay;
        self
    }

    async fn attempt<S: BrowserSession>(&self, session: &S) -> Result<(), HarvestError> {
        if !session.exists(&self.selectors.open_button).await? {
            debug!("Address control not present, storefront already unlocked");
            return Ok(());
        }

        let Some(address) = &self.address else {
            info!("Address control present but no address configured, relying on geolocation");
            return Ok(());
        };

        session.click_selector(&self.selectors.open_button).await?;
        sleep(self.step_delay).await;

        session.type_into(&self.selectors.input, address).await?;
        sleep(self.step_delay).await;

        session.click_selector(&self.selectors.first_suggestion).await?;
        sleep(self.step_delay).await;

        if session.exists(&self.selectors.save_button).await? {
            session.click_selector(&self.selectors.save_button).await?;
            sleep(self.step_delay).await;
        }

        info!("Delivery address set: {}", address);
        Ok(())
    }
}

#[async_trait]
impl AddressSetup for SelectorAddressSetup {
    async fn configure<S: BrowserSession>(&self, session: &S) -> Result<(), HarvestError> {
        let mut last_error = None;

        for attempt in 0..self.max_retries {
            match self.attempt(session).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    let backoff = self.initial_backoff * 2u32.pow(attempt);
                    warn!(
                        "Address setup attempt {} failed, retrying in {:?}: {}",
                        attempt + 1,
                        backoff,
                        e
                    );
                    last_error = Some(e);
                    if attempt + 1 < self.max_retries {
                        sleep(backoff).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(HarvestError::AddressSetup {
            retries: self.max_retries,
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Max retries exceeded".to_string()),
        })
    }
}
