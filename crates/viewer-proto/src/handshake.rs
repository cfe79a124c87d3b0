//! ハンドシェイク用メッセージ
//!
//! ## 二段階ハンドシェイクの Wire Format
//!
//! ```text
//! bootstrap (ws://host:port)
//!   client → engine : {"password": "...", "canRender": true}
//!   engine → client : {"host": "...", "port": 9003, "version": "...", "securityKey": "..."}
//!
//! input / output (ws://<redirect host>:<redirect port>)
//!   engine → client (output) : {"socketKey": "..."}
//!   client → engine (input)  : {"version": "...", "securityKey": "...", "socketKey": "..."}
//! ```

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ProtoError;

/// bootstrap 接続で最初に送るパスワード認証メッセージ
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequest {
    pub password: String,
    /// クライアント側で描画できるか（画像ではなくジオメトリを受け取れる）
    pub can_render: bool,
}

impl BootstrapRequest {
    pub fn new(password: impl Into<String>) -> Self {
        BootstrapRequest {
            password: password.into(),
            can_render: true,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// bootstrap 接続の応答（リダイレクト先とセッション鍵）
///
/// エンジンは追加フィールドを付けることがあるが、ここでは無視する。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Redirect {
    pub host: String,
    /// 数値でも数字文字列でも受け付ける
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub port: u16,
    pub version: String,
    pub security_key: String,
}

impl Redirect {
    /// JSON テキストからリダイレクト情報を取り出す
    ///
    /// # エラー
    /// - `ProtoError::MissingField`: host / port / version / securityKey のいずれかが無い
    /// - `ProtoError::Json`: JSON 不正、または型不一致
    pub fn parse(text: &str) -> Result<Self, ProtoError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let map = value.as_object().ok_or(ProtoError::NotAnObject)?;
        for field in ["host", "port", "version", "securityKey"] {
            if !map.contains_key(field) {
                return Err(ProtoError::MissingField(field));
            }
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// input 接続で送るセッションヘッダー
///
/// シリアライズ時のキー順は version, securityKey, socketKey で固定。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHeader {
    pub version: String,
    pub security_key: String,
    pub socket_key: String,
}

impl SessionHeader {
    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// output 接続で最初に届くヘッダー要求
///
/// `socketKey` のみ必須。エンジンによっては version も付けて送ってくる。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderRequest {
    pub socket_key: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub security_key: Option<String>,
}

impl HeaderRequest {
    /// JSON テキストからヘッダー要求を取り出す
    ///
    /// `socketKey` を持たないフレームは `MissingField("socketKey")`。
    pub fn parse(text: &str) -> Result<Self, ProtoError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let map = value.as_object().ok_or(ProtoError::NotAnObject)?;
        if !map.contains_key("socketKey") {
            return Err(ProtoError::MissingField("socketKey"));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// 定常通信中に届いたヘッダー形状のフレーム（version + socketKey）
///
/// 入出力ソケット間の到着順は保証されないため、ハンドシェイク完了後にも
/// 届くことがある。受け取ったらヘッダーを再送する。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderEcho {
    pub version: String,
    pub socket_key: String,
    #[serde(default)]
    pub security_key: Option<String>,
}

fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Number(u64),
        Text(String),
    }

    let port = match RawPort::deserialize(deserializer)? {
        RawPort::Number(n) => n,
        RawPort::Text(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| D::Error::custom(format!("port `{}` is not numeric", s)))?,
    };
    u16::try_from(port).map_err(|_| D::Error::custom(format!("port {} out of range", port)))
}
