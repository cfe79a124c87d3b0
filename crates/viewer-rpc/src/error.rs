//! viewer-rpc エラー型

use thiserror::Error;
use viewer_mirror::{LookupError, MirrorError};
use viewer_proto::ProtoError;
use viewer_transport::TransportError;

/// RPC 送信のエラー
#[derive(Debug, Error)]
pub enum RpcError {
    /// 制御オブジェクトのフィールドが解決できない（ApiDescriptor 未着など）
    #[error("rpc lookup failed: {0}")]
    Lookup(#[from] LookupError),
    /// オブジェクトの JSON 化に失敗
    #[error("rpc encode failed: {0}")]
    Encode(#[from] ProtoError),
    /// output 接続が閉じている
    #[error("rpc send failed: {0}")]
    Transport(#[from] TransportError),
}

impl From<MirrorError> for RpcError {
    fn from(e: MirrorError) -> Self {
        match e {
            MirrorError::Lookup(e) => RpcError::Lookup(e),
            MirrorError::Proto(e) => RpcError::Encode(e),
        }
    }
}
