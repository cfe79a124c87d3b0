//! # viewer-proto
//!
//! リモート可視化エンジンとブラウザ間のプロキシプロトコルの
//! JSON エンベロープ定義と解析ユーティリティ。
//!
//! ## メッセージの種類
//!
//! - **ハンドシェイク**: パスワード認証 → リダイレクト → セッションヘッダー交換
//! - **ApiDescriptor 更新**: オブジェクト id ごとのシンボル名 → 位置インデックス表
//! - **StateObject 更新**: オブジェクト id ごとの位置インデックス → 値（浅いマージ）
//!
//! スキーマはコンパイル時には存在しない。フィールド名の解決は
//! 別途届く ApiDescriptor を介して実行時に行う。

pub mod envelope;
pub mod error;
pub mod handshake;

pub use envelope::{classify, ApiUpdate, Inbound, OutboundState, StateUpdate};
pub use error::ProtoError;
pub use handshake::{BootstrapRequest, HeaderEcho, HeaderRequest, Redirect, SessionHeader};

/// リモートオブジェクトの id（エンジンが割り当てる。0 は制御オブジェクト）
pub type ObjectId = u64;

/// StateObject 内のフィールド位置
pub type FieldIndex = u32;

/// RPC 送信用の制御オブジェクト id（常に存在する）
pub const CONTROL_OBJECT_ID: ObjectId = 0;

/// 制御オブジェクトの typeName
pub const CONTROL_OBJECT_TYPE: &str = "ViewerRPC";

/// 制御オブジェクト上の RPC コードフィールド名
pub const RPC_TYPE_FIELD: &str = "RPCType";

/// クエリ結果オブジェクトの typeName
pub const QUERY_ATTRIBUTES_TYPE: &str = "QueryAttributes";

/// クエリ結果メッセージを格納するフィールド名
pub const RESULTS_MESSAGE_FIELD: &str = "resultsMessage";

/// 結果メッセージが画像データであることを示す値
pub const IMAGE_DATA_SENTINEL: &str = "ImageData";
