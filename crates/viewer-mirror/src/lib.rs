//! # viewer-mirror
//!
//! リモートエンジンの「viewer state」「viewer API」をブラウザ側に写し取るミラー。
//!
//! ## キーコンセプト
//!
//! - **ApiDescriptor**: id ごとのシンボル名 → 位置インデックス表。一度届けば消えない
//! - **StateObject**: id ごとの位置インデックス → 値。受信のたびに深いマージ
//! - **制御オブジェクト**: id 0。RPC コードを書き込んで丸ごと送る
//!
//! シンボル名によるアクセスは、同じ id の ApiDescriptor が先に届いている必要がある。
//! 無ければ `LookupError` になる。

pub mod callback;
pub mod error;
pub mod mirror;
pub mod object;

pub use callback::{CallbackId, ImageSink};
pub use error::{LookupError, MirrorError};
pub use mirror::{IngestOutcome, MirrorStats, StateMirror};
pub use object::{deep_merge, ApiDescriptor, StateObject};
