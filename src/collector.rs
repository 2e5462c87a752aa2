//! 収集結果の集約
//!
//! - `Collector`: 商品名で重複排除した到着順のリスト（書き込みはレスポンス傍受側のみ）
//! - `SeenIdentities`: クリック済みの表示名（書き込みはセクション処理側のみ）

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::RawItemPayload;

/// `Collector::try_add` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryAdd {
    pub inserted: bool,
}

#[derive(Debug, Default)]
struct CollectorInner {
    items: Vec<RawItemPayload>,
    identities: HashSet<String>,
}

/// 追記のみ・順序保持・商品名で一意なリスト
///
/// クローンは同じリストを共有する。
#[derive(Debug, Clone, Default)]
pub struct Collector {
    inner: Arc<Mutex<CollectorInner>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CollectorInner> {
        // 追記中に panic しても既存の要素は壊れないのでそのまま使う
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 未登録の商品名なら末尾に追加する。登録済みなら何もしない
    pub fn try_add(&self, item: RawItemPayload) -> TryAdd {
        let mut inner = self.lock();
        if inner.identities.contains(&item.identity) {
            return TryAdd { inserted: false };
        }
        inner.identities.insert(item.identity.clone());
        inner.items.push(item);
        TryAdd { inserted: true }
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.lock().identities.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<RawItemPayload> {
        self.lock().items.clone()
    }
}

/// 1回の収集の間にクリックした表示名
#[derive(Debug, Default)]
pub struct SeenIdentities {
    seen: HashSet<String>,
    order: Vec<String>,
}

impl SeenIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    /// 未登録なら登録して `true`
    pub fn insert_if_absent(&mut self, identity: &str) -> bool {
        if self.seen.contains(identity) {
            return false;
        }
        self.seen.insert(identity.to_string());
        self.order.push(identity.to_string());
        true
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.seen.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// 登録順
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}
