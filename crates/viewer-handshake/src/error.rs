//! ハンドシェイクのエラー型

use thiserror::Error;
use viewer_proto::ProtoError;

use crate::HandshakeState;

/// ハンドシェイク操作のエラー
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Disconnected 以外の状態で connect した
    #[error("handshake already in progress ({0})")]
    AlreadyConnected(HandshakeState),
    /// 現在の状態で想定していないフレーム・イベント
    ///
    /// 入出力ソケット間の順序入れ替わりで一時的に起こりうる。
    #[error("protocol desync while {state}: {reason}")]
    ProtocolDesync {
        state: HandshakeState,
        reason: String,
    },
    /// フレームの解析失敗
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

impl HandshakeError {
    pub(crate) fn desync(state: HandshakeState, reason: impl Into<String>) -> Self {
        HandshakeError::ProtocolDesync {
            state,
            reason: reason.into(),
        }
    }
}
