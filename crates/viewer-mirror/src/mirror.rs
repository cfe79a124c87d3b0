//! StateMirror 実装
//!
//! 受信フレームを ApiDescriptor / StateObject の表に取り込む。
//! 単一スレッドのイベントループ上で使う前提で、ロックは持たない。

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, trace};
use viewer_proto::{
    classify, ApiUpdate, FieldIndex, HeaderEcho, Inbound, ObjectId, StateUpdate,
    CONTROL_OBJECT_ID, CONTROL_OBJECT_TYPE, IMAGE_DATA_SENTINEL, QUERY_ATTRIBUTES_TYPE,
    RESULTS_MESSAGE_FIELD,
};

use crate::callback::{CallbackId, CallbackRegistry, ImageSink};
use crate::error::{LookupError, MirrorError};
use crate::object::{ApiDescriptor, StateObject};

/// `ingest` の結果
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// ヘッダー形状のフレーム。ミラーには取り込まず、ハンドシェイク層へ回す
    Header(HeaderEcho),
    /// ApiDescriptor を更新した
    Api(ObjectId),
    /// StateObject を更新した
    State(ObjectId),
}

/// リモートオブジェクトのミラー
///
/// ```text
/// StateMirror
///   ├── descriptors : id → ApiDescriptor（シンボル名 → インデックス）
///   ├── objects     : id → StateObject（インデックス → 値）
///   ├── callbacks   : typeName / id → マージ完了通知
///   └── image_sink  : 画像データ通知先
/// ```
///
/// 制御オブジェクト（id 0）は常に存在する。
pub struct StateMirror {
    descriptors: BTreeMap<ObjectId, ApiDescriptor>,
    objects: BTreeMap<ObjectId, StateObject>,
    callbacks: CallbackRegistry,
    image_sink: Option<Box<dyn ImageSink>>,
    stats: MirrorStats,
}

impl StateMirror {
    pub fn new() -> Self {
        let mut mirror = StateMirror {
            descriptors: BTreeMap::new(),
            objects: BTreeMap::new(),
            callbacks: CallbackRegistry::new(),
            image_sink: None,
            stats: MirrorStats::default(),
        };
        mirror.insert_control_object();
        mirror
    }

    /// 受信した JSON テキストフレームを取り込む
    ///
    /// 処理フロー:
    /// 1. JSON を解析して分類
    /// 2. ヘッダー形状なら取り込まずに `IngestOutcome::Header` を返す
    /// 3. `api` があれば ApiDescriptor にマージ
    /// 4. それ以外は StateObject にマージし、画像通知とコールバックを発火
    ///
    /// # エラー
    /// - `MirrorError::Proto`: JSON 不正、`id` 欠落など
    pub fn ingest(&mut self, text: &str) -> Result<IngestOutcome, MirrorError> {
        let inbound = classify(text)?;
        Ok(self.apply(inbound))
    }

    /// 分類済みのフレームを取り込む
    pub fn apply(&mut self, inbound: Inbound) -> IngestOutcome {
        self.stats.frames += 1;
        match inbound {
            Inbound::Header(echo) => IngestOutcome::Header(echo),
            Inbound::Api(update) => {
                let id = update.id;
                self.merge_api(update);
                IngestOutcome::Api(id)
            }
            Inbound::State(update) => {
                let id = update.id;
                self.merge_state(update);
                IngestOutcome::State(id)
            }
        }
    }

    /// シンボル名のフィールド値を返す
    ///
    /// # エラー
    /// - `LookupError::NoDescriptor` / `NoField`: 名前が解決できない
    /// - `LookupError::NoObject`: StateObject がまだ無い
    /// - `LookupError::Unset`: 値が一度も届いていない
    pub fn get_field(&self, id: ObjectId, name: &str) -> Result<&Value, LookupError> {
        let index = self.resolve(id, name)?;
        let object = self.objects.get(&id).ok_or(LookupError::NoObject(id))?;
        object.get(index).ok_or_else(|| LookupError::Unset {
            id,
            name: name.to_string(),
            index,
        })
    }

    /// シンボル名のフィールドに値を書き込む（ローカル変更のみ。送信はしない）
    ///
    /// # 戻り値
    /// 上書き前の値
    pub fn set_field(
        &mut self,
        id: ObjectId,
        name: &str,
        value: Value,
    ) -> Result<Option<Value>, LookupError> {
        let index = self.resolve(id, name)?;
        let object = self.objects.get_mut(&id).ok_or(LookupError::NoObject(id))?;
        trace!(id, field = name, index, "staging field");
        Ok(object.contents.insert(index, value))
    }

    /// シンボル名を位置インデックスに解決する
    pub fn resolve(&self, id: ObjectId, name: &str) -> Result<FieldIndex, LookupError> {
        let descriptor = self
            .descriptors
            .get(&id)
            .ok_or(LookupError::NoDescriptor(id))?;
        descriptor.resolve(name).ok_or_else(|| LookupError::NoField {
            id,
            name: name.to_string(),
        })
    }

    pub fn object(&self, id: ObjectId) -> Option<&StateObject> {
        self.objects.get(&id)
    }

    pub fn descriptor(&self, id: ObjectId) -> Option<&ApiDescriptor> {
        self.descriptors.get(&id)
    }

    /// StateObject の id 一覧（昇順）
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.objects.keys().copied().collect()
    }

    /// StateObject 全体を送信用 JSON にする
    pub fn to_envelope(&self, id: ObjectId) -> Result<String, MirrorError> {
        let object = self.objects.get(&id).ok_or(LookupError::NoObject(id))?;
        Ok(object.to_json()?)
    }

    /// typeName のオブジェクトがマージされるたびに呼ばれるコールバックを登録する
    pub fn register_callback<F>(&mut self, type_name: impl Into<String>, callback: F) -> CallbackId
    where
        F: FnMut(&StateObject) + 'static,
    {
        self.callbacks.on_type(type_name, Box::new(callback))
    }

    /// id のオブジェクトがマージされるたびに呼ばれるコールバックを登録する
    pub fn register_object_callback<F>(&mut self, id: ObjectId, callback: F) -> CallbackId
    where
        F: FnMut(&StateObject) + 'static,
    {
        self.callbacks.on_object(id, Box::new(callback))
    }

    pub fn unregister_callback(&mut self, id: CallbackId) -> bool {
        self.callbacks.remove(id)
    }

    pub fn set_image_sink(&mut self, sink: Box<dyn ImageSink>) {
        self.image_sink = Some(sink);
    }

    /// 全オブジェクトを破棄する（セッション終了時）
    ///
    /// コールバックと画像通知先は次のセッションに引き継ぐ。
    pub fn clear(&mut self) {
        self.descriptors.clear();
        self.objects.clear();
        self.stats = MirrorStats::default();
        self.insert_control_object();
    }

    pub fn stats(&self) -> MirrorStats {
        MirrorStats {
            objects: self.objects.len(),
            descriptors: self.descriptors.len(),
            callbacks: self.callbacks.len(),
            ..self.stats.clone()
        }
    }

    // ===== Private メソッド =====

    fn insert_control_object(&mut self) {
        self.objects.insert(
            CONTROL_OBJECT_ID,
            StateObject::new(CONTROL_OBJECT_ID, CONTROL_OBJECT_TYPE),
        );
    }

    fn merge_api(&mut self, update: ApiUpdate) {
        let id = update.id;
        debug!(id, fields = update.fields.len(), "merging api descriptor");
        self.descriptors
            .entry(id)
            .or_insert_with(|| ApiDescriptor::new(id))
            .merge(update);
        self.stats.api_merges += 1;
    }

    fn merge_state(&mut self, update: StateUpdate) {
        let id = update.id;
        // 新規オブジェクトの typeName は ApiDescriptor から補う
        let fallback_type = self
            .descriptors
            .get(&id)
            .map(|d| d.type_name.clone())
            .unwrap_or_default();
        self.objects
            .entry(id)
            .or_insert_with(|| StateObject::new(id, fallback_type))
            .merge(update);
        self.stats.state_merges += 1;

        let Some(object) = self.objects.get(&id) else {
            return;
        };
        trace!(id, type_name = %object.type_name, "merged state object");

        if self.is_image_update(object) {
            debug!(id, "image data available");
            self.stats.image_notifications += 1;
            if let Some(sink) = self.image_sink.as_mut() {
                sink.image_updated(id, object);
            }
        }
        self.callbacks.fire(object);
    }

    /// クエリ結果オブジェクトの結果メッセージが画像データを指しているか
    fn is_image_update(&self, object: &StateObject) -> bool {
        if object.type_name != QUERY_ATTRIBUTES_TYPE {
            return false;
        }
        let Ok(index) = self.resolve(object.id, RESULTS_MESSAGE_FIELD) else {
            debug!(id = object.id, "query result without results field descriptor");
            return false;
        };
        object.get(index).and_then(Value::as_str) == Some(IMAGE_DATA_SENTINEL)
    }
}

impl Default for StateMirror {
    fn default() -> Self {
        Self::new()
    }
}

/// ミラー統計情報
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorStats {
    /// 取り込んだフレーム数
    pub frames: u64,
    /// ApiDescriptor のマージ回数
    pub api_merges: u64,
    /// StateObject のマージ回数
    pub state_merges: u64,
    /// 画像更新通知の回数
    pub image_notifications: u64,
    /// StateObject 数
    pub objects: usize,
    /// ApiDescriptor 数
    pub descriptors: usize,
    /// 登録中のコールバック数
    pub callbacks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    const RPC_API: &str = r#"{"id":0,"typeName":"ViewerRPC","api":{"RPCType":0,"windowId":1}}"#;

    #[test]
    fn test_control_object_always_present() {
        let mut mirror = StateMirror::new();
        assert!(mirror.object(CONTROL_OBJECT_ID).is_some());
        mirror.clear();
        assert_eq!(mirror.object(0).unwrap().type_name, CONTROL_OBJECT_TYPE);
    }

    #[test]
    fn test_ingest_routes_by_shape() {
        let mut mirror = StateMirror::new();
        assert_eq!(mirror.ingest(RPC_API).unwrap(), IngestOutcome::Api(0));
        assert_eq!(
            mirror.ingest(r#"{"id":3,"contents":{"data":{"0":1}}}"#).unwrap(),
            IngestOutcome::State(3)
        );
        let outcome = mirror
            .ingest(r#"{"version":"1.0","socketKey":"sk","securityKey":"k"}"#)
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Header(_)));
        // ヘッダーはミラーに取り込まない
        assert_eq!(mirror.object_ids(), vec![0, 3]);
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let mut mirror = StateMirror::new();
        mirror.ingest(RPC_API).unwrap();
        assert_eq!(mirror.set_field(0, "RPCType", json!(91)).unwrap(), None);
        assert_eq!(mirror.get_field(0, "RPCType").unwrap(), &json!(91));
        assert_eq!(
            mirror.set_field(0, "RPCType", json!(92)).unwrap(),
            Some(json!(91))
        );
    }

    #[test]
    fn test_lookup_errors_are_explicit() {
        let mut mirror = StateMirror::new();
        assert_eq!(
            mirror.get_field(0, "RPCType"),
            Err(LookupError::NoDescriptor(0))
        );
        assert_eq!(
            mirror.set_field(0, "RPCType", json!(1)),
            Err(LookupError::NoDescriptor(0))
        );

        mirror.ingest(RPC_API).unwrap();
        assert_eq!(
            mirror.get_field(0, "nope"),
            Err(LookupError::NoField {
                id: 0,
                name: "nope".into()
            })
        );
        assert_eq!(
            mirror.get_field(0, "windowId"),
            Err(LookupError::Unset {
                id: 0,
                name: "windowId".into(),
                index: 1
            })
        );

        // 記述子はあるがオブジェクトが無い
        mirror.ingest(r#"{"id":12,"api":{"x":0}}"#).unwrap();
        assert_eq!(mirror.get_field(12, "x"), Err(LookupError::NoObject(12)));
    }

    #[test]
    fn test_repeated_ingest_unions_keys() {
        let mut mirror = StateMirror::new();
        mirror.ingest(r#"{"id":4,"contents":{"data":{"0":"a","1":"b"}}}"#).unwrap();
        mirror.ingest(r#"{"id":4,"contents":{"data":{"1":"c","2":"d"}}}"#).unwrap();
        mirror.ingest(r#"{"id":4,"contents":{"data":{"0":"e"}}}"#).unwrap();

        let obj = mirror.object(4).unwrap();
        assert_eq!(obj.contents.len(), 3);
        assert_eq!(obj.get(0), Some(&json!("e")));
        assert_eq!(obj.get(1), Some(&json!("c")));
        assert_eq!(obj.get(2), Some(&json!("d")));
    }

    #[test]
    fn test_new_object_inherits_descriptor_type_name() {
        let mut mirror = StateMirror::new();
        mirror.ingest(r#"{"id":8,"typeName":"Plot","api":{"x":0}}"#).unwrap();
        mirror.ingest(r#"{"id":8,"contents":{"data":{"0":1}}}"#).unwrap();
        assert_eq!(mirror.object(8).unwrap().type_name, "Plot");
    }

    #[test]
    fn test_image_sink_notified_only_for_query_results() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut mirror = StateMirror::new();
        let s = seen.clone();
        mirror.set_image_sink(Box::new(move |id: ObjectId, _: &StateObject| {
            s.borrow_mut().push(id)
        }));

        mirror
            .ingest(r#"{"id":38,"typeName":"QueryAttributes","api":{"resultsMessage":3}}"#)
            .unwrap();
        mirror
            .ingest(r#"{"id":38,"typeName":"QueryAttributes","contents":{"data":{"3":"ImageData"}}}"#)
            .unwrap();
        assert_eq!(*seen.borrow(), vec![38]);

        // 他の typeName では通知しない
        mirror
            .ingest(r#"{"id":40,"typeName":"Other","api":{"resultsMessage":3}}"#)
            .unwrap();
        mirror
            .ingest(r#"{"id":40,"typeName":"Other","contents":{"data":{"3":"ImageData"}}}"#)
            .unwrap();
        // 画像以外の結果でも通知しない
        mirror
            .ingest(r#"{"id":38,"contents":{"data":{"3":"Volume = 4"}}}"#)
            .unwrap();
        assert_eq!(*seen.borrow(), vec![38]);
        assert_eq!(mirror.stats().image_notifications, 1);
    }

    #[test]
    fn test_callbacks_fire_on_state_merge_only() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut mirror = StateMirror::new();
        let c = calls.clone();
        let handle = mirror.register_callback("Plot", move |obj| c.borrow_mut().push(obj.id));
        let c = calls.clone();
        mirror.register_object_callback(3, move |obj| c.borrow_mut().push(obj.id * 100));

        mirror.ingest(r#"{"id":3,"typeName":"Plot","api":{"a":0}}"#).unwrap();
        assert!(calls.borrow().is_empty());

        mirror
            .ingest(r#"{"id":3,"typeName":"Plot","contents":{"data":{"0":1}}}"#)
            .unwrap();
        assert_eq!(*calls.borrow(), vec![3, 300]);

        assert!(mirror.unregister_callback(handle));
        mirror.ingest(r#"{"id":3,"contents":{"data":{"0":2}}}"#).unwrap();
        assert_eq!(*calls.borrow(), vec![3, 300, 300]);
    }

    #[test]
    fn test_clear_keeps_callbacks() {
        let mut mirror = StateMirror::new();
        mirror.register_callback("Plot", |_| {});
        mirror.ingest(RPC_API).unwrap();
        mirror.clear();
        let stats = mirror.stats();
        assert_eq!(stats.descriptors, 0);
        assert_eq!(stats.objects, 1);
        assert_eq!(stats.callbacks, 1);
        assert_eq!(stats.frames, 0);
    }

    #[test]
    fn test_envelope_contains_staged_fields() {
        let mut mirror = StateMirror::new();
        mirror.ingest(RPC_API).unwrap();
        mirror.set_field(0, "windowId", json!(2)).unwrap();
        mirror.set_field(0, "RPCType", json!(91)).unwrap();
        assert_eq!(
            mirror.to_envelope(0).unwrap(),
            r#"{"id":0,"typeName":"ViewerRPC","contents":{"data":{"0":91,"1":2}}}"#
        );
        assert!(matches!(
            mirror.to_envelope(77),
            Err(MirrorError::Lookup(LookupError::NoObject(77)))
        ));
    }
}
