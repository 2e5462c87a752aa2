//! Chrome DevTools Protocol によるブラウザセッション
//!
//! ローカルで Chrome を起動するか、既存ブラウザの CDP WebSocket に接続する。

mod network;
mod session;

pub use session::ChromeSession;
