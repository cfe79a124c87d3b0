//! セッション情報
//!
//! リダイレクト受信時に生成され、切断または明示的な停止で破棄される。
//! クライアントインスタンスごとに高々一つ。

use viewer_proto::{Redirect, SessionHeader};
use viewer_transport::Endpoint;

/// 確立中・確立済みのセッション
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// bootstrap で使ったパスワード
    pub password: String,
    /// リダイレクト先ホスト
    pub host: String,
    /// リダイレクト先ポート
    pub port: u16,
    /// エンジンのプロトコルバージョン
    pub protocol_version: String,
    /// bootstrap で受け取ったセキュリティ鍵
    pub security_key: String,
    /// output 接続で受け取ったソケット鍵（ヘッダー要求前は None）
    pub socket_key: Option<String>,
}

impl Session {
    pub fn from_redirect(password: String, redirect: Redirect) -> Self {
        Session {
            password,
            host: redirect.host,
            port: redirect.port,
            protocol_version: redirect.version,
            security_key: redirect.security_key,
            socket_key: None,
        }
    }

    /// 入出力接続の接続先
    pub fn endpoint(&self, secure: bool) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port).with_secure(secure)
    }

    /// ソケット鍵が揃っていればセッションヘッダーを組み立てる
    pub fn header(&self) -> Option<SessionHeader> {
        let socket_key = self.socket_key.clone()?;
        Some(SessionHeader {
            version: self.protocol_version.clone(),
            security_key: self.security_key.clone(),
            socket_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redirect() -> Redirect {
        Redirect::parse(r#"{"host":"h","port":9003,"version":"1.0","securityKey":"k"}"#).unwrap()
    }

    #[test]
    fn test_header_requires_socket_key() {
        let mut session = Session::from_redirect("bob".into(), redirect());
        assert!(session.header().is_none());

        session.socket_key = Some("sk".into());
        let header = session.header().unwrap();
        assert_eq!(header.version, "1.0");
        assert_eq!(header.security_key, "k");
        assert_eq!(header.socket_key, "sk");
    }

    #[test]
    fn test_endpoint_from_redirect() {
        let session = Session::from_redirect("bob".into(), redirect());
        assert_eq!(session.endpoint(false).url(), "ws://h:9003");
        assert_eq!(session.endpoint(true).url(), "wss://h:9003");
    }
}
