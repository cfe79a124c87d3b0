//! ミラー対象のオブジェクト
//!
//! - `ApiDescriptor`: シンボル名 → 位置インデックスの表。セッション中は削除されない
//! - `StateObject`: 位置インデックス → 値。マージは上書き・追加のみで、
//!   フィールド数が暗黙に減ることはない

use std::collections::BTreeMap;

use serde_json::Value;
use viewer_proto::{ApiUpdate, FieldIndex, ObjectId, OutboundState, ProtoError, StateUpdate};

/// リモートオブジェクトの API 記述
#[derive(Debug, Clone, PartialEq)]
pub struct ApiDescriptor {
    pub id: ObjectId,
    pub type_name: String,
    pub fields: BTreeMap<String, FieldIndex>,
}

impl ApiDescriptor {
    pub fn new(id: ObjectId) -> Self {
        ApiDescriptor {
            id,
            type_name: String::new(),
            fields: BTreeMap::new(),
        }
    }

    /// 差分を取り込む（同名フィールドは上書き）
    pub fn merge(&mut self, update: ApiUpdate) {
        if let Some(type_name) = update.type_name {
            self.type_name = type_name;
        }
        self.fields.extend(update.fields);
    }

    /// シンボル名を位置インデックスに解決する
    pub fn resolve(&self, name: &str) -> Option<FieldIndex> {
        self.fields.get(name).copied()
    }
}

/// リモートオブジェクトの状態スナップショット
#[derive(Debug, Clone, PartialEq)]
pub struct StateObject {
    pub id: ObjectId,
    pub type_name: String,
    pub contents: BTreeMap<FieldIndex, Value>,
}

impl StateObject {
    pub fn new(id: ObjectId, type_name: impl Into<String>) -> Self {
        StateObject {
            id,
            type_name: type_name.into(),
            contents: BTreeMap::new(),
        }
    }

    /// 差分を取り込む
    ///
    /// 既存値と受信値がともにオブジェクトなら再帰的にマージし、
    /// それ以外は受信値で上書きする。
    pub fn merge(&mut self, update: StateUpdate) {
        if let Some(type_name) = update.type_name {
            self.type_name = type_name;
        }
        for (index, incoming) in update.data {
            match self.contents.get_mut(&index) {
                Some(existing) => deep_merge(existing, incoming),
                None => {
                    self.contents.insert(index, incoming);
                }
            }
        }
    }

    pub fn get(&self, index: FieldIndex) -> Option<&Value> {
        self.contents.get(&index)
    }

    /// 送信用 JSON（`{"id", "typeName", "contents": {"data": {...}}}`）
    pub fn to_json(&self) -> Result<String, ProtoError> {
        OutboundState::new(self.id, &self.type_name, &self.contents).to_json()
    }
}

/// JSON 値の深いマージ
///
/// 両方がオブジェクトのときだけキーごとに再帰する。配列は置き換え。
pub fn deep_merge(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(current), Value::Object(patch)) => {
            for (key, value) in patch {
                match current.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        current.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
