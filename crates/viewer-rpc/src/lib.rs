//! # viewer-rpc
//!
//! エンジンへのコマンド送信。
//!
//! ## 「オブジェクト丸ごと送信」規約
//!
//! ```text
//! 1. mirror.set_field(0, "RPCType", code)   // 制御オブジェクトに積む
//! 2. mirror.set_field(0, "windowId", ...)   // 必要なら引数も積む
//! 3. dispatcher.invoke(&mirror, 0, ...)     // id 0 の contents 全体を output へ送る
//! ```
//!
//! 要求 id による応答の対応付けは無い。一回の invoke に対して
//! 0 個以上の更新フレームが非同期に届き、id でのみ照合される。
//! 利用側はミラーのコールバックかポーリングで観測すること。

pub mod dispatcher;
pub mod error;

pub use dispatcher::{RpcDispatcher, RpcStats};
pub use error::RpcError;

/// よく使う RPC コード
pub mod rpc_type {
    /// エンジンを終了させる
    pub const CLOSE: i64 = 0;
    /// クライアントの切り離し（エンジンは動き続ける）
    pub const DETACH: i64 = 1;
}
