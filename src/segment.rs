//! ビューポート分割
//!
//! ページ全体の高さをビューポート単位のスクロール位置に分割する。

use tracing::warn;

/// 1ページで走査する区間数の上限
pub const MAX_SEGMENTS: usize = 10_000;

/// スクロール位置ひとつ分の区間
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportSegment {
    pub index: usize,
    pub scroll_offset: f64,
}

/// ページの高さとビューポートの高さ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageMetrics {
    pub scroll_height: f64,
    pub viewport_height: f64,
}

/// `[0, scroll_height)` を覆うスクロール位置を昇順で返す
///
/// 最後の区間はページ末尾を越えてもよい（ブラウザ側で末尾に丸められる）。
/// `scroll_height <= viewport_height` の場合、または高さが有限でない場合は
/// 位置 0 の区間ひとつ。区間数は `MAX_SEGMENTS` で打ち切る。
pub fn compute_segments(scroll_height: f64, viewport_height: f64) -> Vec<ViewportSegment> {
    let count = segment_count(scroll_height, viewport_height);
    (0..count)
        .map(|index| ViewportSegment {
            index,
            scroll_offset: index as f64 * viewport_height,
        })
        .collect()
}

fn segment_count(scroll_height: f64, viewport_height: f64) -> usize {
    if !(viewport_height > 0.0)
        || !viewport_height.is_finite()
        || !scroll_height.is_finite()
        || !(scroll_height > viewport_height)
    {
        return 1;
    }
    let count = (scroll_height / viewport_height).ceil();
    if count > MAX_SEGMENTS as f64 {
        warn!(
            "Page height {} over viewport {} needs {} segments, capping at {}",
            scroll_height, viewport_height, count, MAX_SEGMENTS
        );
        return MAX_SEGMENTS;
    }
    count as usize
}

impl PageMetrics {
    pub fn segments(&self) -> Vec<ViewportSegment> {
        compute_segments(self.scroll_height, self.viewport_height)
    }
}
