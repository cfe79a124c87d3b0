//! クライアント設定
//!
//! JS からは JSON 文字列で渡す:
//!
//! ```json
//! {"host": "viz.example.org", "port": 9000, "password": "bob", "secure": true}
//! ```

use serde::Deserialize;
use viewer_handshake::DEFAULT_MAX_PENDING_FRAMES;
use viewer_transport::Endpoint;

use crate::error::ClientError;

/// 接続設定
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// bootstrap 接続先ホスト
    pub host: String,
    /// bootstrap 接続先ポート
    pub port: u16,
    /// エンジンのパスワード
    pub password: String,
    /// wss:// を使うか（リダイレクト先にも適用）
    #[serde(default)]
    pub secure: bool,
    /// ヘッダー要求前に退避するフレーム数の上限
    #[serde(default = "default_max_pending_frames")]
    pub max_pending_frames: usize,
}

fn default_max_pending_frames() -> usize {
    DEFAULT_MAX_PENDING_FRAMES
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        ClientConfig {
            host: host.into(),
            port,
            password: password.into(),
            secure: false,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ClientError> {
        let config: ClientConfig =
            serde_json::from_str(text).map_err(|e| ClientError::Config(e.to_string()))?;
        if config.host.trim().is_empty() {
            return Err(ClientError::Config("host must not be empty".into()));
        }
        Ok(config)
    }

    /// bootstrap 接続先
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port).with_secure(self.secure)
    }
}
