//! # viewer-handshake
//!
//! 二段階ハンドシェイクの状態機械。
//!
//! ## 状態遷移
//!
//! ```text
//! Disconnected ──connect──→ AwaitingRedirect
//!   (bootstrap open: {"password", "canRender"} 送信)
//! AwaitingRedirect ──redirect 受信──→ AwaitingHeaderRequest
//!   (bootstrap を閉じ、input / output を開く)
//! AwaitingHeaderRequest ──socketKey 受信──→ AwaitingHeaderAck
//!   (input にセッションヘッダー送信)
//! AwaitingHeaderAck ──最初の通常フレーム──→ Ready
//!
//! 任意の状態 ──ソケットエラー / 想定外の close──→ Disconnected（再試行なし）
//! ```
//!
//! 専用の ACK は無い。ヘッダー送信後のトラフィックはすべて通常フレームとして扱う。

pub mod error;
pub mod manager;
pub mod session;

pub use error::HandshakeError;
pub use manager::HandshakeManager;
pub use session::Session;

/// ヘッダー要求前に届いたフレームを保持する上限
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 256;

/// ハンドシェイクの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Disconnected,
    AwaitingRedirect,
    AwaitingHeaderRequest,
    AwaitingHeaderAck,
    Ready,
}

impl HandshakeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandshakeState::Disconnected => "disconnected",
            HandshakeState::AwaitingRedirect => "awaiting-redirect",
            HandshakeState::AwaitingHeaderRequest => "awaiting-header-request",
            HandshakeState::AwaitingHeaderAck => "awaiting-header-ack",
            HandshakeState::Ready => "ready",
        }
    }

    /// ヘッダー送信済みで通常トラフィックを処理できるか
    pub fn accepts_traffic(&self) -> bool {
        matches!(self, HandshakeState::AwaitingHeaderAck | HandshakeState::Ready)
    }
}

impl core::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
