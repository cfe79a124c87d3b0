//! viewer-proto エラー型

use thiserror::Error;

/// JSON フレームの解析エラー
///
/// 受信フレームが想定したエンベロープ形状のどれにも一致しない場合に返る。
/// 呼び出し側はハンドシェイク状態に応じて ProtocolDesync として扱う。
#[derive(Debug, Error)]
pub enum ProtoError {
    /// JSON として解析できない
    #[error("malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    /// トップレベルが JSON オブジェクトではない
    #[error("frame is not a JSON object")]
    NotAnObject,
    /// 必須フィールドが欠けている
    #[error("frame is missing required field `{0}`")]
    MissingField(&'static str),
    /// フィールドの型・値が不正
    #[error("field `{field}` is invalid: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

impl ProtoError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ProtoError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}
