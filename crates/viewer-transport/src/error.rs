//! viewer-transport エラー型

use thiserror::Error;

use crate::SocketRole;

/// ソケットレベルのエラー
///
/// いずれも自動再接続はしない。ログに残して該当接続を終了扱いにする。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// 閉じたチャンネルへの送信
    #[error("{0} channel is closed")]
    ChannelClosed(SocketRole),
    /// open 前で、今送っても閉じるまでに届かない
    #[error("{0} channel is not open")]
    NotOpen(SocketRole),
    /// ソケットの error イベント
    #[error("{role} socket error: {message}")]
    Socket { role: SocketRole, message: String },
    /// こちらが閉じていないのにソケットが閉じた
    #[error("{role} socket closed unexpectedly (code {code}): {reason}")]
    UnexpectedClose {
        role: SocketRole,
        code: u16,
        reason: String,
    },
}
