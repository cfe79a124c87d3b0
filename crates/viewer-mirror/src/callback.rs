//! マージ完了通知
//!
//! このプロトコルには要求と応答の対応付けが無いので、利用側は
//! typeName または id ごとにコールバックを登録して更新を観測する。

use viewer_proto::ObjectId;

use crate::object::StateObject;

/// 登録解除用のハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// 画像更新の通知先（描画は外部コラボレーター）
pub trait ImageSink {
    /// クエリ結果オブジェクトが画像データを指したときに呼ばれる
    fn image_updated(&mut self, id: ObjectId, object: &StateObject);
}

impl<F> ImageSink for F
where
    F: FnMut(ObjectId, &StateObject),
{
    fn image_updated(&mut self, id: ObjectId, object: &StateObject) {
        self(id, object)
    }
}

pub type Callback = Box<dyn FnMut(&StateObject)>;

enum Key {
    TypeName(String),
    Object(ObjectId),
}

struct Entry {
    id: CallbackId,
    key: Key,
    callback: Callback,
}

/// typeName / id ごとのコールバック表
#[derive(Default)]
pub struct CallbackRegistry {
    next_id: u64,
    entries: Vec<Entry>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_type(&mut self, type_name: impl Into<String>, callback: Callback) -> CallbackId {
        self.push(Key::TypeName(type_name.into()), callback)
    }

    pub fn on_object(&mut self, id: ObjectId, callback: Callback) -> CallbackId {
        self.push(Key::Object(id), callback)
    }

    /// 登録を解除する。存在しなければ false
    pub fn remove(&mut self, id: CallbackId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 該当するコールバックを登録順に呼び、呼んだ数を返す
    pub fn fire(&mut self, object: &StateObject) -> usize {
        let mut fired = 0;
        for entry in &mut self.entries {
            let matches = match &entry.key {
                Key::TypeName(name) => *name == object.type_name,
                Key::Object(id) => *id == object.id,
            };
            if matches {
                (entry.callback)(object);
                fired += 1;
            }
        }
        fired
    }

    fn push(&mut self, key: Key, callback: Callback) -> CallbackId {
        let id = CallbackId(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry { id, key, callback });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_fire_by_type_and_object() {
        let hits = Rc::new(Cell::new(0));
        let mut registry = CallbackRegistry::new();

        let h = hits.clone();
        registry.on_type("Plot", Box::new(move |_| h.set(h.get() + 1)));
        let h = hits.clone();
        registry.on_object(9, Box::new(move |_| h.set(h.get() + 10)));

        assert_eq!(registry.fire(&StateObject::new(9, "Plot")), 2);
        assert_eq!(hits.get(), 11);

        assert_eq!(registry.fire(&StateObject::new(1, "Other")), 0);
        assert_eq!(hits.get(), 11);
    }

    #[test]
    fn test_remove() {
        let mut registry = CallbackRegistry::new();
        let id = registry.on_type("Plot", Box::new(|_| {}));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }
}
