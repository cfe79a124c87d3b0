//! 送信フレームチャンネル実装

use std::collections::VecDeque;

use tracing::debug;

use crate::error::TransportError;
use crate::SocketRole;

/// チャンネルのライフサイクル
///
/// ```text
/// Idle → Connecting → Open → Closed
///   └────────┴──────────────→ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// まだ接続要求していない
    Idle,
    /// 接続要求済み、open イベント待ち
    Connecting,
    /// 送信可能
    Open,
    /// 閉じた（終端）
    Closed,
}

/// 一つの論理接続の送信側バッファ
///
/// ## 責任
/// - open 前に積まれたフレームを保持し、open 時にまとめて解放する
/// - close を冪等にする（二度目以降の close は何もしない）
/// - 閉じたチャンネルへの送信をエラーにする
pub struct Channel {
    role: SocketRole,
    state: ChannelState,
    /// open 前に積まれたフレーム
    backlog: VecDeque<String>,
    /// 送出したフレーム数（統計用）
    sent_frames: u64,
    /// 送出したバイト数（統計用）
    sent_bytes: u64,
}

impl Channel {
    pub fn new(role: SocketRole) -> Self {
        Channel {
            role,
            state: ChannelState::Idle,
            backlog: VecDeque::new(),
            sent_frames: 0,
            sent_bytes: 0,
        }
    }

    pub fn role(&self) -> SocketRole {
        self.role
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    /// 接続要求を出した状態にする
    ///
    /// 接続要求より前に積まれたフレームは前の接続のものなので捨てる。
    pub fn begin_connect(&mut self) {
        if matches!(self.state, ChannelState::Idle | ChannelState::Closed) && !self.backlog.is_empty() {
            debug!(role = %self.role, dropped = self.backlog.len(), "discarding frames queued before connect");
            self.backlog.clear();
        }
        self.state = ChannelState::Connecting;
    }

    /// フレームを送信する
    ///
    /// # 戻り値
    /// - `Ok(Some(text))`: 今すぐソケットに書き込むべきフレーム
    /// - `Ok(None)`: open 前なのでバックログに積んだ
    ///
    /// # エラー
    /// - `TransportError::ChannelClosed`: 既に閉じている
    pub fn send(&mut self, text: String) -> Result<Option<String>, TransportError> {
        match self.state {
            ChannelState::Closed => Err(TransportError::ChannelClosed(self.role)),
            ChannelState::Open => {
                self.count(&text);
                Ok(Some(text))
            }
            ChannelState::Idle | ChannelState::Connecting => {
                self.backlog.push_back(text);
                Ok(None)
            }
        }
    }

    /// open イベントを反映し、バックログを送出順に返す
    pub fn open(&mut self) -> Vec<String> {
        if self.state == ChannelState::Closed {
            return Vec::new();
        }
        self.state = ChannelState::Open;
        let frames: Vec<String> = self.backlog.drain(..).collect();
        for frame in &frames {
            self.sent_frames += 1;
            self.sent_bytes += frame.len() as u64;
        }
        frames
    }

    /// チャンネルを閉じる
    ///
    /// # 戻り値
    /// この呼び出しで Closed に遷移したら true。既に閉じていれば false。
    pub fn close(&mut self) -> bool {
        if self.state == ChannelState::Closed {
            return false;
        }
        if !self.backlog.is_empty() {
            debug!(role = %self.role, dropped = self.backlog.len(), "discarding unsent frames on close");
            self.backlog.clear();
        }
        self.state = ChannelState::Closed;
        true
    }

    /// open 待ちのフレーム数
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn sent_frames(&self) -> u64 {
        self.sent_frames
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes
    }

    fn count(&mut self, text: &str) {
        self.sent_frames += 1;
        self.sent_bytes += text.len() as u64;
    }
}

/// I/O ドライバーが実行するソケット操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// WebSocket を開く
    Open { role: SocketRole, url: String },
    /// テキストフレームを送る
    Send { role: SocketRole, text: String },
    /// WebSocket を閉じる
    Close { role: SocketRole },
}

/// 三つの論理接続と、ドライバー向けコマンド列
///
/// コマンドは発行順に並ぶので、同じ role の Open → Send → Close の順序は保たれる。
pub struct Channels {
    bootstrap: Channel,
    input: Channel,
    output: Channel,
    commands: VecDeque<TransportCommand>,
}

impl Channels {
    pub fn new() -> Self {
        Channels {
            bootstrap: Channel::new(SocketRole::Bootstrap),
            input: Channel::new(SocketRole::Input),
            output: Channel::new(SocketRole::Output),
            commands: VecDeque::new(),
        }
    }

    pub fn get(&self, role: SocketRole) -> &Channel {
        match role {
            SocketRole::Bootstrap => &self.bootstrap,
            SocketRole::Input => &self.input,
            SocketRole::Output => &self.output,
        }
    }

    pub fn get_mut(&mut self, role: SocketRole) -> &mut Channel {
        match role {
            SocketRole::Bootstrap => &mut self.bootstrap,
            SocketRole::Input => &mut self.input,
            SocketRole::Output => &mut self.output,
        }
    }

    /// 接続要求を発行する
    pub fn open(&mut self, role: SocketRole, url: String) {
        self.get_mut(role).begin_connect();
        debug!(%role, %url, "opening socket");
        self.commands.push_back(TransportCommand::Open { role, url });
    }

    /// open イベントを反映し、バックログを Send コマンドとして流す
    pub fn on_open(&mut self, role: SocketRole) {
        let frames = self.get_mut(role).open();
        for text in frames {
            self.commands.push_back(TransportCommand::Send { role, text });
        }
    }

    /// フレームを送信する（open 前ならバックログへ）
    pub fn send(&mut self, role: SocketRole, text: String) -> Result<(), TransportError> {
        if let Some(text) = self.get_mut(role).send(text)? {
            self.commands.push_back(TransportCommand::Send { role, text });
        }
        Ok(())
    }

    /// チャンネルを閉じる（冪等）
    ///
    /// 接続要求済みのものだけ Close コマンドを発行する。
    pub fn close(&mut self, role: SocketRole) -> bool {
        let channel = self.get_mut(role);
        let was_requested = matches!(channel.state(), ChannelState::Connecting | ChannelState::Open);
        let transitioned = channel.close();
        if transitioned && was_requested {
            self.commands.push_back(TransportCommand::Close { role });
        }
        transitioned
    }

    /// ソケット側から閉じられたチャンネルを Closed にする（Close コマンドは出さない）
    pub fn mark_closed(&mut self, role: SocketRole) -> bool {
        self.get_mut(role).close()
    }

    pub fn close_all(&mut self) {
        for role in SocketRole::ALL {
            self.close(role);
        }
    }

    /// 次の接続に備えて全チャンネルを初期状態に戻す（未実行コマンドは保持）
    pub fn reset(&mut self) {
        self.bootstrap = Channel::new(SocketRole::Bootstrap);
        self.input = Channel::new(SocketRole::Input);
        self.output = Channel::new(SocketRole::Output);
    }

    /// 溜まったコマンドをすべて取り出す
    pub fn drain_commands(&mut self) -> Vec<TransportCommand> {
        self.commands.drain(..).collect()
    }

    pub fn has_pending_commands(&self) -> bool {
        !self.commands.is_empty()
    }
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}
