//! viewer-mirror エラー型

use thiserror::Error;
use viewer_proto::{FieldIndex, ObjectId, ProtoError};

/// シンボル名によるフィールド参照の失敗
///
/// 呼び出し側のプログラミングエラー。黙って None にせず必ず表に出す。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    /// id に対応する ApiDescriptor がまだ届いていない
    #[error("no api descriptor for object {0}")]
    NoDescriptor(ObjectId),
    /// ApiDescriptor にシンボル名が無い
    #[error("object {id} has no field named `{name}`")]
    NoField { id: ObjectId, name: String },
    /// id に対応する StateObject がまだ届いていない
    #[error("no state for object {0}")]
    NoObject(ObjectId),
    /// インデックスは解決できたが値が一度も届いていない
    #[error("field `{name}` (index {index}) of object {id} has no value yet")]
    Unset {
        id: ObjectId,
        name: String,
        index: FieldIndex,
    },
}

/// ミラー操作のエラー
#[derive(Debug, Error)]
pub enum MirrorError {
    /// 受信フレームの解析失敗
    #[error(transparent)]
    Proto(#[from] ProtoError),
    /// フィールド・オブジェクト参照の失敗
    #[error(transparent)]
    Lookup(#[from] LookupError),
}
