//! # viewer-wasm
//!
//! wasm-bindgen エクスポート：ブラウザのページからリモート可視化エンジンに
//! 接続するためのプロキシクライアント。
//!
//! ## 使用方法（TypeScript）
//!
//! ```typescript
//! import { ViewerProxy, initPanicHook, initLogging } from './viewer-wasm-pkg/viewer_wasm';
//!
//! // パニック時のスタックトレースとログ出力を有効化（開発時）
//! initPanicHook();
//! initLogging("info");
//!
//! const proxy = new ViewerProxy();
//!
//! // クエリ結果が画像を指したら描画する
//! proxy.setImageSink((id, obj) => renderer.update(id, obj), renderer);
//!
//! // typeName ごとの更新通知
//! proxy.registerCallback("QueryAttributes", (id, obj) => console.log(id, obj), null);
//!
//! // 接続（bootstrap → リダイレクト → セッションヘッダー交換は自動）
//! proxy.connect("viz.example.org", 9000, "secret");
//!
//! // RPC: 制御オブジェクト 0 にフィールドを積んで丸ごと送る
//! proxy.setField(0, "windowId", 1);
//! proxy.setField(0, "RPCType", 91);
//! proxy.invoke(0);
//!
//! // 終了
//! proxy.disconnectClient();
//! ```

use wasm_bindgen::prelude::*;

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;

pub use client::{ClientStats, ViewerClient};
pub use config::ClientConfig;
pub use error::ClientError;
pub use proxy::ViewerProxy;

/// パニック時にブラウザコンソールにスタックトレースを出力する
///
/// 開発時に必ず呼び出すこと。本番ビルドでは feature flag で無効化可能。
#[wasm_bindgen(js_name = "initPanicHook")]
pub fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// tracing のログをブラウザコンソールに出す
///
/// # 引数
/// - `filter`: `EnvFilter` 構文。省略時は `"info"`
#[wasm_bindgen(js_name = "initLogging")]
pub fn init_logging(filter: Option<String>) -> Result<(), JsError> {
    let filter = filter.unwrap_or_else(|| "info".to_string());
    logging::install(&filter).map_err(|e| JsError::new(&format!("Invalid log filter: {}", e)))
}
