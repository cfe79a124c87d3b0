//! ハンドシェイク状態機械
//!
//! 実ソケットは扱わない。各イベントの戻り値として「送るべきメッセージ」や
//! 「開くべき接続先」を返し、呼び出し側（`viewer-wasm`）がチャンネルに流す。

use std::collections::VecDeque;

use tracing::{debug, error, info, warn};
use viewer_proto::{BootstrapRequest, HeaderEcho, HeaderRequest, ProtoError, Redirect, SessionHeader};
use viewer_transport::Endpoint;

use crate::error::HandshakeError;
use crate::session::Session;
use crate::{HandshakeState, DEFAULT_MAX_PENDING_FRAMES};

/// 二段階ハンドシェイクの管理
pub struct HandshakeManager {
    state: HandshakeState,
    /// bootstrap 接続先（connect 時に設定）
    bootstrap: Option<Endpoint>,
    /// bootstrap で送るパスワード（Session 生成時に移す）
    password: Option<String>,
    /// リダイレクト受信後のセッション
    session: Option<Session>,
    /// ヘッダー要求前に届いた通常フレーム
    pending: VecDeque<String>,
    max_pending: usize,
    /// ヘッダー再送の回数（統計用）
    rederived: u64,
}

impl HandshakeManager {
    pub fn new() -> Self {
        Self::with_max_pending(DEFAULT_MAX_PENDING_FRAMES)
    }

    pub fn with_max_pending(max_pending: usize) -> Self {
        HandshakeManager {
            state: HandshakeState::Disconnected,
            bootstrap: None,
            password: None,
            session: None,
            pending: VecDeque::new(),
            max_pending: max_pending.max(1),
            rederived: 0,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.state == HandshakeState::Ready
    }

    /// ヘッダー再送の回数
    pub fn rederived_count(&self) -> u64 {
        self.rederived
    }

    /// bootstrap 接続を開始する
    ///
    /// # 戻り値
    /// bootstrap WebSocket の URL（`ws://host:port`）
    ///
    /// # エラー
    /// - `HandshakeError::AlreadyConnected`: Disconnected 以外で呼ばれた
    pub fn connect(
        &mut self,
        endpoint: Endpoint,
        password: impl Into<String>,
    ) -> Result<String, HandshakeError> {
        if self.state != HandshakeState::Disconnected {
            return Err(HandshakeError::AlreadyConnected(self.state));
        }
        let url = endpoint.url();
        info!(%url, "connecting to bootstrap endpoint");
        self.bootstrap = Some(endpoint);
        self.password = Some(password.into());
        self.state = HandshakeState::AwaitingRedirect;
        Ok(url)
    }

    /// bootstrap 接続の open イベント
    ///
    /// # 戻り値
    /// bootstrap に送る `{"password", "canRender": true}`
    pub fn on_bootstrap_open(&self) -> Result<BootstrapRequest, HandshakeError> {
        match (&self.state, &self.password) {
            (HandshakeState::AwaitingRedirect, Some(password)) => {
                Ok(BootstrapRequest::new(password.clone()))
            }
            _ => Err(HandshakeError::desync(self.state, "bootstrap opened unexpectedly")),
        }
    }

    /// bootstrap 接続でリダイレクト応答を受け取る
    ///
    /// Session を生成し、入出力接続の接続先を返す。
    /// 呼び出し側は bootstrap を閉じ、input / output を開くこと。
    ///
    /// # エラー
    /// - `HandshakeError::ProtocolDesync`: AwaitingRedirect 以外で呼ばれた
    /// - `HandshakeError::Proto`: host / port / version / securityKey が揃っていない
    pub fn on_redirect(&mut self, text: &str) -> Result<Endpoint, HandshakeError> {
        if self.state != HandshakeState::AwaitingRedirect {
            return Err(HandshakeError::desync(self.state, "redirect outside bootstrap phase"));
        }
        let redirect = Redirect::parse(text)?;
        let password = self.password.take().unwrap_or_default();
        let secure = self.bootstrap.as_ref().is_some_and(|ep| ep.secure);

        let session = Session::from_redirect(password, redirect);
        let endpoint = session.endpoint(secure);
        info!(
            url = %endpoint.url(),
            version = %session.protocol_version,
            "redirected to session endpoint"
        );
        self.session = Some(session);
        self.state = HandshakeState::AwaitingHeaderRequest;
        Ok(endpoint)
    }

    /// 入出力接続でヘッダー要求（`socketKey`）を受け取る
    ///
    /// # 戻り値
    /// input 接続に送るセッションヘッダー
    ///
    /// # エラー
    /// - `HandshakeError::ProtocolDesync`: socketKey を持たないフレーム、または状態不一致。
    ///   ソケット間の順序入れ替わりで起こりうるので、呼び出し側は
    ///   `buffer_frame` で退避して次のフレームを待つ
    pub fn on_header_request(&mut self, text: &str) -> Result<SessionHeader, HandshakeError> {
        if self.state != HandshakeState::AwaitingHeaderRequest {
            return Err(HandshakeError::desync(self.state, "header request outside handshake"));
        }
        let request = match HeaderRequest::parse(text) {
            Ok(request) => request,
            Err(ProtoError::MissingField(field)) => {
                return Err(HandshakeError::desync(
                    self.state,
                    format!("expected header request, frame lacks `{}`", field),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        let Some(session) = self.session.as_mut() else {
            return Err(HandshakeError::desync(self.state, "no session for header request"));
        };

        if let Some(version) = &request.version {
            if *version != session.protocol_version {
                warn!(
                    expected = %session.protocol_version,
                    got = %version,
                    "header request carries a different protocol version"
                );
            }
        }
        session.socket_key = Some(request.socket_key);
        let header = session.header().ok_or_else(|| {
            HandshakeError::desync(HandshakeState::AwaitingHeaderRequest, "socket key missing")
        })?;

        debug!("sending session header");
        self.state = HandshakeState::AwaitingHeaderAck;
        Ok(header)
    }

    /// ヘッダー形状のフレームを後から受け取ったときの再送パス
    ///
    /// エコーの version / socketKey を採用し、securityKey はエコーに無ければ
    /// Session のものを使う。Session が無くてもエコーが securityKey を持てば
    /// ヘッダーを組み立てられる。
    pub fn rederive(&mut self, echo: &HeaderEcho) -> Result<SessionHeader, HandshakeError> {
        let security_key = match (&echo.security_key, &self.session) {
            (Some(key), _) => key.clone(),
            (None, Some(session)) => session.security_key.clone(),
            (None, None) => {
                return Err(HandshakeError::desync(
                    self.state,
                    "header echo without session or securityKey",
                ))
            }
        };

        if let Some(session) = self.session.as_mut() {
            session.socket_key = Some(echo.socket_key.clone());
        }
        if self.state == HandshakeState::AwaitingHeaderRequest {
            self.state = HandshakeState::AwaitingHeaderAck;
        }
        self.rederived += 1;
        warn!(state = %self.state, count = self.rederived, "re-deriving session header");

        Ok(SessionHeader {
            version: echo.version.clone(),
            security_key,
            socket_key: echo.socket_key.clone(),
        })
    }

    /// ヘッダー送信後の通常フレームを観測した
    pub fn on_traffic(&mut self) {
        if self.state == HandshakeState::AwaitingHeaderAck {
            debug!("session ready");
            self.state = HandshakeState::Ready;
        }
    }

    /// ヘッダー要求前に届いたフレームを退避する
    ///
    /// 上限を超えたら最も古いものを捨てる。
    pub fn buffer_frame(&mut self, text: String) {
        if self.pending.len() >= self.max_pending {
            warn!(limit = self.max_pending, "pending frame buffer full, dropping oldest");
            self.pending.pop_front();
        }
        self.pending.push_back(text);
    }

    /// 退避したフレームを到着順に取り出す
    pub fn take_pending(&mut self) -> Vec<String> {
        self.pending.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 致命的なエラーで終了する（再試行しない）
    pub fn fail(&mut self, reason: &str) {
        if self.state != HandshakeState::Disconnected {
            error!(state = %self.state, %reason, "connection failed");
        }
        self.reset();
    }

    /// Disconnected に戻し、Session を破棄する
    pub fn reset(&mut self) {
        self.state = HandshakeState::Disconnected;
        self.bootstrap = None;
        self.password = None;
        self.session = None;
        self.pending.clear();
    }
}

impl Default for HandshakeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REDIRECT: &str = r#"{"host":"h","port":9003,"version":"1.0","securityKey":"k"}"#;

    fn redirected() -> HandshakeManager {
        let mut hs = HandshakeManager::new();
        hs.connect(Endpoint::new("boot", 9000), "bob").unwrap();
        hs.on_redirect(REDIRECT).unwrap();
        hs
    }

    #[test]
    fn test_full_handshake() {
        let mut hs = HandshakeManager::new();
        let url = hs.connect(Endpoint::new("boot", 9000), "bob").unwrap();
        assert_eq!(url, "ws://boot:9000");
        assert_eq!(hs.state(), HandshakeState::AwaitingRedirect);

        let req = hs.on_bootstrap_open().unwrap();
        assert_eq!(req.to_json().unwrap(), r#"{"password":"bob","canRender":true}"#);

        let endpoint = hs.on_redirect(REDIRECT).unwrap();
        assert_eq!(endpoint.url(), "ws://h:9003");
        assert_eq!(hs.state(), HandshakeState::AwaitingHeaderRequest);
        assert_eq!(hs.session().unwrap().password, "bob");

        let header = hs.on_header_request(r#"{"socketKey":"sk"}"#).unwrap();
        assert_eq!(
            header.to_json().unwrap(),
            r#"{"version":"1.0","securityKey":"k","socketKey":"sk"}"#
        );
        assert_eq!(hs.state(), HandshakeState::AwaitingHeaderAck);

        hs.on_traffic();
        assert!(hs.is_ready());
    }

    #[test]
    fn test_connect_twice_rejected() {
        let mut hs = HandshakeManager::new();
        hs.connect(Endpoint::new("boot", 9000), "bob").unwrap();
        let err = hs.connect(Endpoint::new("boot", 9000), "bob").unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::AlreadyConnected(HandshakeState::AwaitingRedirect)
        ));
    }

    #[test]
    fn test_secure_bootstrap_keeps_scheme() {
        let mut hs = HandshakeManager::new();
        hs.connect(Endpoint::new("boot", 443).with_secure(true), "bob").unwrap();
        let endpoint = hs.on_redirect(REDIRECT).unwrap();
        assert_eq!(endpoint.url(), "wss://h:9003");
    }

    #[test]
    fn test_incomplete_redirect_is_error() {
        let mut hs = HandshakeManager::new();
        hs.connect(Endpoint::new("boot", 9000), "bob").unwrap();
        let err = hs.on_redirect(r#"{"host":"h","port":9003}"#).unwrap_err();
        assert!(matches!(err, HandshakeError::Proto(ProtoError::MissingField("version"))));
        // 状態は変わらない（呼び出し側が fail する）
        assert_eq!(hs.state(), HandshakeState::AwaitingRedirect);
    }

    #[test]
    fn test_header_request_without_socket_key_is_desync() {
        let mut hs = redirected();
        let err = hs.on_header_request(r#"{"id":3,"contents":{}}"#).unwrap_err();
        assert!(matches!(err, HandshakeError::ProtocolDesync { .. }));
        assert_eq!(hs.state(), HandshakeState::AwaitingHeaderRequest);
    }

    #[test]
    fn test_rederive_uses_session_security_key() {
        let mut hs = redirected();
        hs.on_header_request(r#"{"socketKey":"sk"}"#).unwrap();
        hs.on_traffic();

        let echo = HeaderEcho {
            version: "1.0".into(),
            socket_key: "sk2".into(),
            security_key: None,
        };
        let header = hs.rederive(&echo).unwrap();
        assert_eq!(header.security_key, "k");
        assert_eq!(header.socket_key, "sk2");
        assert_eq!(hs.session().unwrap().socket_key.as_deref(), Some("sk2"));
        assert_eq!(hs.rederived_count(), 1);
        assert!(hs.is_ready());
    }

    #[test]
    fn test_rederive_during_header_phase_advances_state() {
        let mut hs = redirected();
        let echo = HeaderEcho {
            version: "1.0".into(),
            socket_key: "sk".into(),
            security_key: None,
        };
        hs.rederive(&echo).unwrap();
        assert_eq!(hs.state(), HandshakeState::AwaitingHeaderAck);
    }

    #[test]
    fn test_rederive_without_session() {
        let mut hs = HandshakeManager::new();
        let echo = HeaderEcho {
            version: "1.0".into(),
            socket_key: "sk".into(),
            security_key: None,
        };
        assert!(matches!(
            hs.rederive(&echo),
            Err(HandshakeError::ProtocolDesync { .. })
        ));

        let echo = HeaderEcho {
            security_key: Some("k9".into()),
            ..echo
        };
        let header = hs.rederive(&echo).unwrap();
        assert_eq!(header.security_key, "k9");
    }

    #[test]
    fn test_pending_buffer_bounded() {
        let mut hs = HandshakeManager::with_max_pending(2);
        hs.buffer_frame("a".into());
        hs.buffer_frame("b".into());
        hs.buffer_frame("c".into());
        assert_eq!(hs.take_pending(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(hs.pending_len(), 0);
    }

    #[test]
    fn test_fail_destroys_session() {
        let mut hs = redirected();
        hs.buffer_frame("x".into());
        hs.fail("socket error");
        assert_eq!(hs.state(), HandshakeState::Disconnected);
        assert!(hs.session().is_none());
        assert_eq!(hs.pending_len(), 0);

        // 再接続可能
        assert!(hs.connect(Endpoint::new("boot", 9000), "bob").is_ok());
    }
}
