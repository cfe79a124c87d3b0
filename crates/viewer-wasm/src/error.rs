//! viewer-wasm エラー型

use thiserror::Error;
use viewer_handshake::{HandshakeError, HandshakeState};
use viewer_mirror::{LookupError, MirrorError};
use viewer_proto::ProtoError;
use viewer_rpc::RpcError;
use viewer_transport::TransportError;

/// クライアント操作のエラー
///
/// JS 境界では `Display` の文字列を持つ `JsError` に変換する。
#[derive(Debug, Error)]
pub enum ClientError {
    /// 接続していない状態で送信系の操作をした
    #[error("client is not connected")]
    NotConnected,
    /// セッションヘッダーの交換が済んでいない
    #[error("session is not ready for traffic (state: {0})")]
    NotReady(HandshakeState),
    /// 設定 JSON が不正
    #[error("invalid client config: {0}")]
    Config(String),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Mirror(#[from] MirrorError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}
