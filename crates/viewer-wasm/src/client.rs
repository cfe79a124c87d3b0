//! ViewerClient: ハンドシェイク・ミラー・RPC を統合した sans-IO クライアント
//!
//! 実ソケットは持たない。ソケットイベントを `on_open` / `on_message` /
//! `on_error` / `on_close` で受け取り、実行すべきソケット操作を
//! `drain_commands` で返す。ブラウザでは `ViewerProxy` がこれを駆動する。
//!
//! ## データフロー
//!
//! ```text
//! socket → on_message ─┬→ HandshakeManager（bootstrap / ヘッダー要求）
//!                      └→ StateMirror.ingest ─┬→ ヘッダー形状 → HandshakeManager.rederive
//!                                             └→ マージ → コールバック / 画像通知
//! set_field → invoke → RpcDispatcher → Channels(output) → drain_commands → socket
//! ```

use serde_json::Value;
use tracing::{debug, error, info, warn};
use viewer_handshake::{HandshakeError, HandshakeManager, HandshakeState, Session};
use viewer_mirror::{
    CallbackId, ImageSink, IngestOutcome, MirrorStats, StateMirror, StateObject,
};
use viewer_proto::{ObjectId, SessionHeader};
use viewer_rpc::{RpcDispatcher, RpcStats};
use viewer_transport::{Channels, SocketRole, TransportCommand, TransportError};

use crate::config::ClientConfig;
use crate::error::ClientError;

/// ブラウザ側プロキシクライアントの状態一式
///
/// ```text
/// ViewerClient
///   ├── HandshakeManager (viewer-handshake) - 二段階ハンドシェイク / Session
///   ├── StateMirror      (viewer-mirror)    - viewer state / viewer API のミラー
///   ├── RpcDispatcher    (viewer-rpc)       - オブジェクト丸ごと送信
///   └── Channels         (viewer-transport) - 三つの論理接続の送信バッファ
/// ```
///
/// Session とミラーの内容は接続ごとに作られ、切断で破棄される。
/// 登録済みコールバックは次の接続に引き継ぐ。
pub struct ViewerClient {
    handshake: HandshakeManager,
    mirror: StateMirror,
    rpc: RpcDispatcher,
    channels: Channels,
    /// 受信フレーム数（統計用）
    frames_received: u64,
    /// ヘッダー要求前に届いて退避したフレーム数（統計用）
    desync_frames: u64,
    /// 最後に接続を終了させた理由
    last_error: Option<String>,
}

impl ViewerClient {
    pub fn new() -> Self {
        ViewerClient {
            handshake: HandshakeManager::new(),
            mirror: StateMirror::new(),
            rpc: RpcDispatcher::new(),
            channels: Channels::new(),
            frames_received: 0,
            desync_frames: 0,
            last_error: None,
        }
    }

    /// bootstrap 接続を開始する
    ///
    /// # エラー
    /// - `HandshakeError::AlreadyConnected`: 接続中に呼ばれた
    pub fn connect(&mut self, config: &ClientConfig) -> Result<(), ClientError> {
        if self.handshake.state() != HandshakeState::Disconnected {
            return Err(HandshakeError::AlreadyConnected(self.handshake.state()).into());
        }
        self.handshake = HandshakeManager::with_max_pending(config.max_pending_frames);
        let url = self.handshake.connect(config.endpoint(), config.password.clone())?;

        self.mirror.clear();
        self.channels.reset();
        self.frames_received = 0;
        self.desync_frames = 0;
        self.last_error = None;
        self.channels.open(SocketRole::Bootstrap, url);
        Ok(())
    }

    /// ソケットの open イベント
    pub fn on_open(&mut self, role: SocketRole) {
        if self.channels.get(role).is_closed() {
            debug!(%role, "open event for closed channel ignored");
            return;
        }
        self.channels.on_open(role);
        debug!(%role, "socket open");

        if role == SocketRole::Bootstrap {
            let request = self
                .handshake
                .on_bootstrap_open()
                .map_err(ClientError::from)
                .and_then(|req| Ok(req.to_json()?));
            match request {
                Ok(text) => {
                    if let Err(e) = self.channels.send(SocketRole::Bootstrap, text) {
                        self.terminate(&e.to_string());
                    }
                }
                Err(e) => warn!(error = %e, "bootstrap open outside handshake"),
            }
        }
    }

    /// ソケットのテキストフレーム受信
    ///
    /// # エラー
    /// 受信フレームを処理できなかった場合。接続を終了させたかどうかは
    /// `state()` で確認できる。ソケット間の順序入れ替わりによる一時的な
    /// 不整合はエラーにせず、フレームを退避して後で取り込む。
    pub fn on_message(&mut self, role: SocketRole, text: &str) -> Result<(), ClientError> {
        if self.channels.get(role).is_closed() {
            debug!(%role, "frame on closed channel ignored");
            return Ok(());
        }
        self.frames_received += 1;

        match role {
            SocketRole::Bootstrap => self.on_bootstrap_frame(text),
            SocketRole::Input | SocketRole::Output => self.on_session_frame(role, text),
        }
    }

    /// ソケットの error イベント（再試行しない）
    pub fn on_error(&mut self, role: SocketRole, message: &str) {
        if self.channels.get(role).is_closed() {
            debug!(%role, %message, "error on closed channel ignored");
            return;
        }
        let err = TransportError::Socket {
            role,
            message: message.to_string(),
        };
        self.terminate(&err.to_string());
    }

    /// ソケットの close イベント
    ///
    /// こちらが閉じたチャンネルなら何もしない。それ以外は接続終了。
    pub fn on_close(&mut self, role: SocketRole, code: u16, reason: &str) {
        if self.channels.get(role).is_closed() {
            debug!(%role, code, "socket closed");
            return;
        }
        if self.handshake.state() == HandshakeState::Disconnected {
            // ソケットは既に閉じているので Close コマンドは出さない
            self.channels.mark_closed(role);
            return;
        }
        let err = TransportError::UnexpectedClose {
            role,
            code,
            reason: reason.to_string(),
        };
        self.terminate(&err.to_string());
    }

    /// シンボル名のフィールド値
    pub fn get_field(&self, id: ObjectId, name: &str) -> Result<&Value, ClientError> {
        Ok(self.mirror.get_field(id, name)?)
    }

    /// シンボル名のフィールドに値を積む（送信はしない）
    pub fn set_field(&mut self, id: ObjectId, name: &str, value: Value) -> Result<(), ClientError> {
        self.mirror.set_field(id, name, value)?;
        Ok(())
    }

    /// StateObject[id] を丸ごと output に送る
    ///
    /// # エラー
    /// - `ClientError::NotReady`: セッションヘッダーをまだ送っていない
    pub fn invoke(&mut self, id: ObjectId) -> Result<(), ClientError> {
        self.ensure_ready()?;
        self.rpc.invoke(&self.mirror, id, &mut self.channels)?;
        Ok(())
    }

    /// 制御オブジェクトに RPC コードを積んで送る
    pub fn call_rpc(&mut self, rpc_type: i64) -> Result<(), ClientError> {
        self.ensure_ready()?;
        self.rpc.call(&mut self.mirror, rpc_type, &mut self.channels)?;
        Ok(())
    }

    /// 切り離しコマンドを送ってからソケットを閉じる
    ///
    /// コマンドを送れなくてもソケットは必ず閉じる。送れなかったことはエラーで返す。
    pub fn disconnect_client(&mut self) -> Result<(), ClientError> {
        let state = self.handshake.state();
        if state == HandshakeState::Disconnected {
            return Err(ClientError::NotConnected);
        }
        let result = match self.ensure_ready() {
            Ok(()) => self
                .rpc
                .disconnect_client(&mut self.mirror, &mut self.channels)
                .map_err(ClientError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!(error = %e, %state, "detach command not sent");
        }
        self.stop();
        result
    }

    /// 明示的な停止。Session とミラーの内容を破棄する
    pub fn stop(&mut self) {
        if self.handshake.state() != HandshakeState::Disconnected {
            info!("stopping client");
        }
        self.handshake.reset();
        self.channels.close_all();
        self.mirror.clear();
    }

    pub fn register_callback<F>(&mut self, type_name: impl Into<String>, callback: F) -> CallbackId
    where
        F: FnMut(&StateObject) + 'static,
    {
        self.mirror.register_callback(type_name, callback)
    }

    pub fn register_object_callback<F>(&mut self, id: ObjectId, callback: F) -> CallbackId
    where
        F: FnMut(&StateObject) + 'static,
    {
        self.mirror.register_object_callback(id, callback)
    }

    pub fn unregister_callback(&mut self, id: CallbackId) -> bool {
        self.mirror.unregister_callback(id)
    }

    pub fn set_image_sink(&mut self, sink: Box<dyn ImageSink>) {
        self.mirror.set_image_sink(sink);
    }

    /// 溜まったソケット操作をすべて取り出す
    pub fn drain_commands(&mut self) -> Vec<TransportCommand> {
        self.channels.drain_commands()
    }

    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn session(&self) -> Option<&Session> {
        self.handshake.session()
    }

    pub fn mirror(&self) -> &StateMirror {
        &self.mirror
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            state: self.handshake.state(),
            frames_received: self.frames_received,
            desync_frames: self.desync_frames,
            pending_frames: self.handshake.pending_len(),
            rederived_headers: self.handshake.rederived_count(),
            mirror: self.mirror.stats(),
            rpc: self.rpc.stats(),
        }
    }

    // ===== Private メソッド =====

    /// ヘッダー送信後でなければ通常トラフィックを出さない
    fn ensure_ready(&self) -> Result<(), ClientError> {
        match self.handshake.state() {
            HandshakeState::Disconnected => Err(ClientError::NotConnected),
            state if state.accepts_traffic() => Ok(()),
            state => Err(ClientError::NotReady(state)),
        }
    }

    /// bootstrap 接続のフレーム（リダイレクト応答）
    fn on_bootstrap_frame(&mut self, text: &str) -> Result<(), ClientError> {
        match self.handshake.on_redirect(text) {
            Ok(endpoint) => {
                let url = endpoint.url();
                self.channels.close(SocketRole::Bootstrap);
                self.channels.open(SocketRole::Input, url.clone());
                self.channels.open(SocketRole::Output, url);
                Ok(())
            }
            Err(e) => {
                self.terminate(&e.to_string());
                Err(e.into())
            }
        }
    }

    /// input / output 接続のフレーム
    ///
    /// ヘッダー要求は output の最初のフレームとしてだけ受け付ける。
    fn on_session_frame(&mut self, role: SocketRole, text: &str) -> Result<(), ClientError> {
        match self.handshake.state() {
            HandshakeState::AwaitingHeaderRequest if role == SocketRole::Input => {
                self.defer_frame(role, "input frame before header request", text);
                Ok(())
            }
            HandshakeState::AwaitingHeaderRequest => match self.handshake.on_header_request(text) {
                Ok(header) => {
                    debug!(%role, "header request received");
                    self.send_header(header)?;
                    self.replay_pending();
                    Ok(())
                }
                Err(HandshakeError::ProtocolDesync { reason, .. }) => {
                    // 通常フレームがヘッダー要求より先に届いた
                    self.defer_frame(role, &reason, text);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            HandshakeState::AwaitingHeaderAck | HandshakeState::Ready => self.ingest(text),
            state => Err(HandshakeError::ProtocolDesync {
                state,
                reason: format!("{} frame before redirect", role),
            }
            .into()),
        }
    }

    /// 通常フレームをミラーに取り込む
    fn ingest(&mut self, text: &str) -> Result<(), ClientError> {
        match self.mirror.ingest(text)? {
            IngestOutcome::Header(echo) => {
                let header = self.handshake.rederive(&echo)?;
                self.send_header(header)?;
            }
            IngestOutcome::Api(_) | IngestOutcome::State(_) => self.handshake.on_traffic(),
        }
        Ok(())
    }

    fn defer_frame(&mut self, role: SocketRole, reason: &str, text: &str) {
        self.desync_frames += 1;
        warn!(%role, %reason, "frame before header request, deferring");
        self.handshake.buffer_frame(text.to_string());
    }

    fn send_header(&mut self, header: SessionHeader) -> Result<(), ClientError> {
        let text = header.to_json()?;
        self.channels.send(SocketRole::Input, text)?;
        Ok(())
    }

    /// ヘッダー要求前に退避したフレームを到着順に取り込む
    fn replay_pending(&mut self) {
        for frame in self.handshake.take_pending() {
            if let Err(e) = self.ingest(&frame) {
                warn!(error = %e, "dropping deferred frame");
            }
        }
    }

    /// 接続を終了させる（自動再接続はしない）
    fn terminate(&mut self, reason: &str) {
        error!(%reason, state = %self.handshake.state(), "terminating connection");
        self.last_error = Some(reason.to_string());
        self.handshake.fail(reason);
        self.channels.close_all();
        self.mirror.clear();
    }
}

impl Default for ViewerClient {
    fn default() -> Self {
        Self::new()
    }
}

/// クライアント統計情報
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub state: HandshakeState,
    /// 受信フレーム数
    pub frames_received: u64,
    /// ヘッダー要求前に届いて退避したフレーム数
    pub desync_frames: u64,
    /// 現在退避中のフレーム数
    pub pending_frames: usize,
    /// ヘッダー再送の回数
    pub rederived_headers: u64,
    pub mirror: MirrorStats,
    pub rpc: RpcStats,
}

impl ClientStats {
    /// JS 向けの JSON 文字列
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "state": self.state.as_str(),
            "frames_received": self.frames_received,
            "desync_frames": self.desync_frames,
            "pending_frames": self.pending_frames,
            "rederived_headers": self.rederived_headers,
            "objects": self.mirror.objects,
            "descriptors": self.mirror.descriptors,
            "state_merges": self.mirror.state_merges,
            "api_merges": self.mirror.api_merges,
            "image_notifications": self.mirror.image_notifications,
            "callbacks": self.mirror.callbacks,
            "rpc_invocations": self.rpc.invocations,
            "rpc_bytes_sent": self.rpc.bytes_sent,
        })
        .to_string()
    }
}
