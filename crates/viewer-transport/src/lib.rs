//! # viewer-transport
//!
//! WebSocket トランスポート層の抽象化。
//!
//! 実ソケットは扱わない（sans-IO）。上位レイヤーは `Channel` に送信フレームを積み、
//! I/O ドライバー（`viewer-wasm`）が `TransportCommand` を取り出して
//! `web_sys::WebSocket` に反映する。
//!
//! ## 論理接続
//!
//! ```text
//! Bootstrap : パスワード認証とリダイレクト受信のみ。リダイレクト後に閉じる
//! Input     : セッションヘッダーを送る接続
//! Output    : ヘッダー要求を受け、RPC を送る接続
//! ```
//!
//! 同一ソケット上の順序は保証されるが、Input / Output 間の順序は保証されない。

pub mod channel;
pub mod endpoint;
pub mod error;

pub use channel::{Channel, ChannelState, Channels, TransportCommand};
pub use endpoint::Endpoint;
pub use error::TransportError;

/// 論理接続の種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SocketRole {
    Bootstrap,
    Input,
    Output,
}

impl SocketRole {
    pub const ALL: [SocketRole; 3] = [SocketRole::Bootstrap, SocketRole::Input, SocketRole::Output];

    pub fn as_str(&self) -> &'static str {
        match self {
            SocketRole::Bootstrap => "bootstrap",
            SocketRole::Input => "input",
            SocketRole::Output => "output",
        }
    }
}

impl core::fmt::Display for SocketRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
