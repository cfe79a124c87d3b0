//! 定常通信のエンベロープ解析
//!
//! ## Envelope の Wire Format
//!
//! ```text
//! {"id": 38, "typeName": "QueryAttributes",
//!  "api":      {"resultsMessage": 3, ...}          // ApiDescriptor 更新
//!  "contents": {"data": {"3": "ImageData", ...}}}  // StateObject 更新
//! ```
//!
//! `api` を持つフレームは ApiDescriptor、それ以外は StateObject への差分。
//! `version` と `socketKey` を両方持つフレームはヘッダー再送要求として扱う。

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::ProtoError;
use crate::handshake::HeaderEcho;
use crate::{FieldIndex, ObjectId};

/// ApiDescriptor への差分（シンボル名 → 位置インデックス）
#[derive(Debug, Clone, PartialEq)]
pub struct ApiUpdate {
    pub id: ObjectId,
    pub type_name: Option<String>,
    pub fields: BTreeMap<String, FieldIndex>,
}

/// StateObject への差分（位置インデックス → 値）
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub id: ObjectId,
    pub type_name: Option<String>,
    pub data: BTreeMap<FieldIndex, Value>,
}

/// 受信フレームの分類結果
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// ヘッダー形状（version + socketKey）。ハンドシェイク層へ回す
    Header(HeaderEcho),
    /// ApiDescriptor の更新
    Api(ApiUpdate),
    /// StateObject の更新
    State(StateUpdate),
}

/// 受信した JSON テキストフレームを分類する
///
/// 判定順:
/// 1. `version` と `socketKey` の両方を持つ → `Inbound::Header`
/// 2. `id` が無い → `ProtoError::MissingField("id")`
/// 3. `api` を持つ → `Inbound::Api`
/// 4. それ以外 → `Inbound::State`
pub fn classify(text: &str) -> Result<Inbound, ProtoError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(map) = value else {
        return Err(ProtoError::NotAnObject);
    };

    if map.contains_key("version") && map.contains_key("socketKey") {
        let echo: HeaderEcho = serde_json::from_value(Value::Object(map))?;
        return Ok(Inbound::Header(echo));
    }

    let id = parse_id(&map)?;
    let type_name = match map.get("typeName") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(ProtoError::invalid(
                "typeName",
                format!("expected string, got {}", other),
            ))
        }
    };

    if let Some(api) = map.get("api") {
        return Ok(Inbound::Api(ApiUpdate {
            id,
            type_name,
            fields: parse_api_fields(api)?,
        }));
    }

    let data = match map.get("contents") {
        Some(contents) => parse_contents(contents)?,
        None => BTreeMap::new(),
    };
    Ok(Inbound::State(StateUpdate {
        id,
        type_name,
        data,
    }))
}

fn parse_id(map: &Map<String, Value>) -> Result<ObjectId, ProtoError> {
    match map.get("id") {
        None => Err(ProtoError::MissingField("id")),
        Some(v) => v
            .as_u64()
            .ok_or_else(|| ProtoError::invalid("id", format!("expected unsigned integer, got {}", v))),
    }
}

/// `api` ブロックからシンボル名 → インデックスの表を取り出す
///
/// 平坦な `{name: index}` と `{"data": {name: index}}` の両方を受け付ける。
/// インデックスが非負整数でないエントリは読み飛ばす。
pub fn parse_api_fields(api: &Value) -> Result<BTreeMap<String, FieldIndex>, ProtoError> {
    let map = api
        .as_object()
        .ok_or_else(|| ProtoError::invalid("api", "expected object"))?;
    let map = match map.get("data") {
        Some(Value::Object(inner)) if map.len() == 1 => inner,
        _ => map,
    };

    let mut fields = BTreeMap::new();
    for (name, index) in map {
        match index.as_u64().and_then(|i| FieldIndex::try_from(i).ok()) {
            Some(i) => {
                fields.insert(name.clone(), i);
            }
            None => debug!(field = %name, value = %index, "skipping api entry without numeric index"),
        }
    }
    Ok(fields)
}

/// `contents` ブロックから位置インデックス → 値の表を取り出す
///
/// `contents.data` はインデックス文字列をキーとするオブジェクト、
/// または配列（位置がインデックス）のどちらでもよい。
/// `data` が無い場合は `contents` 自体をインデックス表とみなす。
pub fn parse_contents(contents: &Value) -> Result<BTreeMap<FieldIndex, Value>, ProtoError> {
    let block = match contents {
        Value::Object(map) => map.get("data").unwrap_or(contents),
        _ => return Err(ProtoError::invalid("contents", "expected object")),
    };

    let mut data = BTreeMap::new();
    match block {
        Value::Object(map) => {
            for (key, value) in map {
                let index = key.parse::<FieldIndex>().map_err(|_| {
                    ProtoError::invalid("contents", format!("non-numeric index `{}`", key))
                })?;
                data.insert(index, value.clone());
            }
        }
        Value::Array(items) => {
            for (pos, value) in items.iter().enumerate() {
                let index = FieldIndex::try_from(pos)
                    .map_err(|_| ProtoError::invalid("contents", "too many entries"))?;
                data.insert(index, value.clone());
            }
        }
        other => {
            return Err(ProtoError::invalid(
                "contents",
                format!("expected object or array in data, got {}", other),
            ))
        }
    }
    Ok(data)
}

/// 送信用の StateObject 全体表現
///
/// ```text
/// {"id": 0, "typeName": "ViewerRPC", "contents": {"data": {"0": ..., "1": ...}}}
/// ```
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundState<'a> {
    pub id: ObjectId,
    pub type_name: &'a str,
    pub contents: OutboundContents<'a>,
}

#[derive(Debug, Serialize)]
pub struct OutboundContents<'a> {
    pub data: &'a BTreeMap<FieldIndex, Value>,
}

impl<'a> OutboundState<'a> {
    pub fn new(id: ObjectId, type_name: &'a str, data: &'a BTreeMap<FieldIndex, Value>) -> Self {
        OutboundState {
            id,
            type_name,
            contents: OutboundContents { data },
        }
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_header_shape() {
        let inbound = classify(r#"{"version":"1.0","socketKey":"sk","id":5}"#).unwrap();
        match inbound {
            Inbound::Header(echo) => {
                assert_eq!(echo.version, "1.0");
                assert_eq!(echo.socket_key, "sk");
                assert_eq!(echo.security_key, None);
            }
            other => panic!("ヘッダーとして分類されるべき: {:?}", other),
        }
    }

    #[test]
    fn test_classify_api_update() {
        let inbound =
            classify(r#"{"id":38,"typeName":"QueryAttributes","api":{"resultsMessage":3,"bogus":"x"}}"#)
                .unwrap();
        let Inbound::Api(update) = inbound else {
            panic!("api フレームのはず");
        };
        assert_eq!(update.id, 38);
        assert_eq!(update.type_name.as_deref(), Some("QueryAttributes"));
        assert_eq!(update.fields.get("resultsMessage"), Some(&3));
        assert!(!update.fields.contains_key("bogus"));
    }

    #[test]
    fn test_classify_api_wrapped_in_data() {
        let Inbound::Api(update) = classify(r#"{"id":0,"api":{"data":{"RPCType":0}}}"#).unwrap()
        else {
            panic!("api フレームのはず");
        };
        assert_eq!(update.fields.get("RPCType"), Some(&0));
    }

    #[test]
    fn test_classify_state_update_object_and_array() {
        let Inbound::State(update) =
            classify(r#"{"id":7,"contents":{"data":{"0":1,"4":{"a":true}}}}"#).unwrap()
        else {
            panic!("state フレームのはず");
        };
        assert_eq!(update.data.get(&0), Some(&json!(1)));
        assert_eq!(update.data.get(&4), Some(&json!({"a": true})));

        let Inbound::State(update) = classify(r#"{"id":7,"contents":{"data":["x","y"]}}"#).unwrap()
        else {
            panic!("state フレームのはず");
        };
        assert_eq!(update.data.get(&1), Some(&json!("y")));
    }

    #[test]
    fn test_classify_rejects_missing_id_and_non_object() {
        assert!(matches!(
            classify(r#"{"typeName":"X"}"#),
            Err(ProtoError::MissingField("id"))
        ));
        assert!(matches!(classify("[1,2]"), Err(ProtoError::NotAnObject)));
        assert!(matches!(classify("not json"), Err(ProtoError::Json(_))));
    }

    #[test]
    fn test_non_numeric_content_key_rejected() {
        let err = classify(r#"{"id":1,"contents":{"data":{"name":1}}}"#).unwrap_err();
        assert!(matches!(err, ProtoError::InvalidField { field: "contents", .. }));
    }

    #[test]
    fn test_outbound_state_shape() {
        let mut data = BTreeMap::new();
        data.insert(10, json!(91));
        data.insert(2, json!("w"));
        let json = OutboundState::new(0, "ViewerRPC", &data).to_json().unwrap();
        assert_eq!(
            json,
            r#"{"id":0,"typeName":"ViewerRPC","contents":{"data":{"2":"w","10":91}}}"#
        );
    }
}
