//! ViewerProxy wasm-bindgen エクスポート
//!
//! ブラウザのページから呼び出すプロキシクライアントの主エントリポイント。
//! `ViewerClient`（sans-IO）を `web_sys::WebSocket` で駆動する。
//!
//! ## 再入の扱い
//!
//! JS のコールバックは `ViewerClient` の借用を解放してから呼ぶ。
//! コールバック内で `setField` や `invoke` を呼んでも安全。

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::{Rc, Weak};

use js_sys::{Function, JSON};
use tracing::{debug, warn};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{CloseEvent, Event, MessageEvent, WebSocket};

use viewer_mirror::{CallbackId, StateObject};
use viewer_proto::ObjectId;
use viewer_transport::{SocketRole, TransportCommand};

use crate::client::ViewerClient;
use crate::config::ClientConfig;

/// コア借用中に発生した JS 向け通知
enum Notification {
    Callback {
        handle: u32,
        id: ObjectId,
        json: String,
    },
    Image {
        id: ObjectId,
        json: String,
    },
}

type NotificationQueue = Rc<RefCell<VecDeque<Notification>>>;

/// 一本の WebSocket と、そのイベントハンドラー
///
/// ハンドラーを外してから drop すること（`shutdown`）。
struct SocketHandle {
    role: SocketRole,
    ws: WebSocket,
    _on_open: Closure<dyn FnMut(Event)>,
    _on_message: Closure<dyn FnMut(MessageEvent)>,
    _on_error: Closure<dyn FnMut(Event)>,
    _on_close: Closure<dyn FnMut(CloseEvent)>,
}

impl SocketHandle {
    /// ハンドラーを外してからソケットを閉じる
    fn shutdown(&self) {
        self.ws.set_onopen(None);
        self.ws.set_onmessage(None);
        self.ws.set_onerror(None);
        self.ws.set_onclose(None);
        if let Err(e) = self.ws.close() {
            debug!(role = %self.role, error = %describe(&e), "close failed");
        }
    }
}

struct JsCallback {
    core_id: CallbackId,
    function: Function,
    context: JsValue,
}

struct Inner {
    core: RefCell<ViewerClient>,
    sockets: RefCell<BTreeMap<SocketRole, SocketHandle>>,
    /// 閉じたソケットのハンドル。実行中のハンドラーを drop しないよう次のイベントで破棄する
    retired: RefCell<Vec<SocketHandle>>,
    notifications: NotificationQueue,
    callbacks: RefCell<HashMap<u32, JsCallback>>,
    image_sink: RefCell<Option<(Function, JsValue)>>,
    next_handle: Cell<u32>,
}

/// リモート可視化エンジンへのプロキシクライアント
///
/// ## 内部アーキテクチャ
///
/// ```text
/// ViewerProxy
///   ├── ViewerClient   (sans-IO) - ハンドシェイク / ミラー / RPC
///   ├── WebSocket × 3  (web-sys) - bootstrap / input / output
///   └── 通知キュー               - JS コールバックの遅延呼び出し
/// ```
///
/// ## スレッド安全性
///
/// WASM はシングルスレッドのため、`!Send + !Sync` を満たす。
/// JS からは単一スレッドで呼び出される前提。
#[wasm_bindgen]
pub struct ViewerProxy {
    inner: Rc<Inner>,
}

impl Default for ViewerProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[wasm_bindgen]
impl ViewerProxy {
    #[wasm_bindgen(constructor)]
    pub fn new() -> ViewerProxy {
        let notifications: NotificationQueue = Rc::new(RefCell::new(VecDeque::new()));
        let mut core = ViewerClient::new();

        let queue = notifications.clone();
        core.set_image_sink(Box::new(move |id: ObjectId, object: &StateObject| {
            match object.to_json() {
                Ok(json) => queue.borrow_mut().push_back(Notification::Image { id, json }),
                Err(e) => warn!(id, error = %e, "image notification dropped"),
            }
        }));

        ViewerProxy {
            inner: Rc::new(Inner {
                core: RefCell::new(core),
                sockets: RefCell::new(BTreeMap::new()),
                retired: RefCell::new(Vec::new()),
                notifications,
                callbacks: RefCell::new(HashMap::new()),
                image_sink: RefCell::new(None),
                next_handle: Cell::new(1),
            }),
        }
    }

    /// bootstrap 接続を開始する
    ///
    /// # 例（TypeScript）
    /// ```typescript
    /// proxy.connect("viz.example.org", 9000, "secret");
    /// ```
    #[wasm_bindgen]
    pub fn connect(&self, host: &str, port: u16, password: &str) -> Result<(), JsError> {
        self.connect_config(&ClientConfig::new(host, port, password))
    }

    /// JSON 設定で接続する
    ///
    /// ```json
    /// {"host": "viz.example.org", "port": 9000, "password": "secret", "secure": true}
    /// ```
    #[wasm_bindgen(js_name = "connectWithConfig")]
    pub fn connect_with_config(&self, config_json: &str) -> Result<(), JsError> {
        let config = ClientConfig::from_json(config_json).map_err(to_js_error)?;
        self.connect_config(&config)
    }

    /// シンボル名のフィールド値を返す
    ///
    /// # エラー
    /// ApiDescriptor・フィールド・StateObject のいずれかが無い
    #[wasm_bindgen(js_name = "getField")]
    pub fn get_field(&self, id: f64, name: &str) -> Result<JsValue, JsError> {
        let id = object_id(id)?;
        let json = {
            let core = self.inner.core.borrow();
            core.get_field(id, name).map_err(to_js_error)?.to_string()
        };
        parse_js(&json)
    }

    /// シンボル名のフィールドに値を積む（送信はしない）
    #[wasm_bindgen(js_name = "setField")]
    pub fn set_field(&self, id: f64, name: &str, value: JsValue) -> Result<(), JsError> {
        let id = object_id(id)?;
        let text: String = JSON::stringify(&value)
            .map_err(|_| JsError::new("value is not JSON-serializable"))?
            .into();
        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| JsError::new(&format!("value is not JSON-serializable: {}", e)))?;
        self.inner
            .core
            .borrow_mut()
            .set_field(id, name, value)
            .map_err(to_js_error)
    }

    /// StateObject[id] を丸ごと output に送る
    #[wasm_bindgen]
    pub fn invoke(&self, id: f64) -> Result<(), JsError> {
        let id = object_id(id)?;
        let result = self.inner.core.borrow_mut().invoke(id);
        Inner::pump(&self.inner);
        result.map_err(to_js_error)
    }

    /// 制御オブジェクト 0 に RPCType を積んで送る
    #[wasm_bindgen(js_name = "callRpc")]
    pub fn call_rpc(&self, rpc_type: i32) -> Result<(), JsError> {
        let result = self.inner.core.borrow_mut().call_rpc(i64::from(rpc_type));
        Inner::pump(&self.inner);
        result.map_err(to_js_error)
    }

    /// 切り離しコマンドを送ってからソケットを閉じる
    #[wasm_bindgen(js_name = "disconnectClient")]
    pub fn disconnect_client(&self) -> Result<(), JsError> {
        let result = self.inner.core.borrow_mut().disconnect_client();
        Inner::pump(&self.inner);
        result.map_err(to_js_error)
    }

    /// 切り離しコマンドを送らずにソケットを閉じる
    #[wasm_bindgen]
    pub fn stop(&self) {
        self.inner.core.borrow_mut().stop();
        Inner::pump(&self.inner);
    }

    /// typeName のオブジェクトがマージされるたびに `callback.call(context, id, object)` を呼ぶ
    ///
    /// # 戻り値
    /// `unregisterCallback` に渡すハンドル
    #[wasm_bindgen(js_name = "registerCallback")]
    pub fn register_callback(&self, type_name: &str, callback: Function, context: JsValue) -> u32 {
        let handle = self.inner.next_handle();
        let queue = self.inner.notifications.clone();
        let core_id = self
            .inner
            .core
            .borrow_mut()
            .register_callback(type_name, move |object| enqueue_callback(&queue, handle, object));
        self.inner.callbacks.borrow_mut().insert(
            handle,
            JsCallback {
                core_id,
                function: callback,
                context,
            },
        );
        handle
    }

    /// id のオブジェクトがマージされるたびに `callback.call(context, id, object)` を呼ぶ
    #[wasm_bindgen(js_name = "registerObjectCallback")]
    pub fn register_object_callback(
        &self,
        id: f64,
        callback: Function,
        context: JsValue,
    ) -> Result<u32, JsError> {
        let id = object_id(id)?;
        let handle = self.inner.next_handle();
        let queue = self.inner.notifications.clone();
        let core_id = self
            .inner
            .core
            .borrow_mut()
            .register_object_callback(id, move |object| enqueue_callback(&queue, handle, object));
        self.inner.callbacks.borrow_mut().insert(
            handle,
            JsCallback {
                core_id,
                function: callback,
                context,
            },
        );
        Ok(handle)
    }

    #[wasm_bindgen(js_name = "unregisterCallback")]
    pub fn unregister_callback(&self, handle: u32) -> bool {
        let Some(entry) = self.inner.callbacks.borrow_mut().remove(&handle) else {
            return false;
        };
        self.inner.core.borrow_mut().unregister_callback(entry.core_id)
    }

    /// 画像データ通知先 `callback.call(context, id, object)` を設定する
    #[wasm_bindgen(js_name = "setImageSink")]
    pub fn set_image_sink(&self, callback: Function, context: JsValue) {
        *self.inner.image_sink.borrow_mut() = Some((callback, context));
    }

    /// StateObject 全体（`{"id", "typeName", "contents": {"data": {...}}}`）
    #[wasm_bindgen(js_name = "getObject")]
    pub fn get_object(&self, id: f64) -> Result<JsValue, JsError> {
        let id = object_id(id)?;
        let json = self
            .inner
            .core
            .borrow()
            .mirror()
            .to_envelope(id)
            .map_err(to_js_error)?;
        parse_js(&json)
    }

    /// StateObject の id 一覧
    #[wasm_bindgen(js_name = "objectIds")]
    pub fn object_ids(&self) -> js_sys::Array {
        self.inner
            .core
            .borrow()
            .mirror()
            .object_ids()
            .into_iter()
            .map(|id| JsValue::from_f64(id as f64))
            .collect()
    }

    /// ハンドシェイク状態（"disconnected", "ready" など）
    #[wasm_bindgen]
    pub fn state(&self) -> String {
        self.inner.core.borrow().state().as_str().to_string()
    }

    /// 最後に接続を終了させた理由
    #[wasm_bindgen(js_name = "lastError")]
    pub fn last_error(&self) -> Option<String> {
        self.inner.core.borrow().last_error().map(str::to_string)
    }

    /// セッション統計を JSON 文字列で返す
    ///
    /// # 戻り値
    /// ```json
    /// {
    ///   "state": "ready",
    ///   "frames_received": 120,
    ///   "desync_frames": 1,
    ///   "pending_frames": 0,
    ///   "rederived_headers": 0,
    ///   "objects": 42,
    ///   "descriptors": 41,
    ///   "state_merges": 80,
    ///   "api_merges": 41,
    ///   "image_notifications": 3,
    ///   "callbacks": 2,
    ///   "rpc_invocations": 5,
    ///   "rpc_bytes_sent": 2048
    /// }
    /// ```
    #[wasm_bindgen(js_name = "getStats")]
    pub fn get_stats(&self) -> String {
        self.inner.core.borrow().stats().to_json()
    }
}

impl ViewerProxy {
    fn connect_config(&self, config: &ClientConfig) -> Result<(), JsError> {
        let result = self.inner.core.borrow_mut().connect(config);
        Inner::pump(&self.inner);
        result.map_err(to_js_error)
    }
}

impl Inner {
    fn next_handle(&self) -> u32 {
        let handle = self.next_handle.get();
        self.next_handle.set(handle.wrapping_add(1));
        handle
    }

    /// ソケットイベントを処理した後の共通処理
    fn after_event(inner: &Rc<Inner>) {
        Inner::pump(inner);
        Inner::dispatch_notifications(inner);
        Inner::pump(inner);
    }

    /// 溜まったソケット操作を実行する
    ///
    /// 実行中に新しい操作が生まれることがあるので空になるまで繰り返す。
    fn pump(inner: &Rc<Inner>) {
        loop {
            let commands = inner.core.borrow_mut().drain_commands();
            if commands.is_empty() {
                break;
            }
            for command in commands {
                Inner::execute(inner, command);
            }
        }
    }

    fn execute(inner: &Rc<Inner>, command: TransportCommand) {
        match command {
            TransportCommand::Open { role, url } => match Inner::open_socket(inner, role, &url) {
                Ok(handle) => {
                    if let Some(old) = inner.sockets.borrow_mut().insert(role, handle) {
                        old.shutdown();
                        inner.retired.borrow_mut().push(old);
                    }
                }
                Err(e) => {
                    let message = describe(&e);
                    inner.core.borrow_mut().on_error(role, &message);
                }
            },
            TransportCommand::Send { role, text } => {
                let sent = match inner.sockets.borrow().get(&role) {
                    Some(handle) => handle.ws.send_with_str(&text).map_err(|e| describe(&e)),
                    None => Err("socket not open".to_string()),
                };
                if let Err(message) = sent {
                    inner.core.borrow_mut().on_error(role, &message);
                }
            }
            TransportCommand::Close { role } => {
                let removed = inner.sockets.borrow_mut().remove(&role);
                if let Some(handle) = removed {
                    handle.shutdown();
                    inner.retired.borrow_mut().push(handle);
                }
            }
        }
    }

    fn open_socket(inner: &Rc<Inner>, role: SocketRole, url: &str) -> Result<SocketHandle, JsValue> {
        let ws = WebSocket::new(url)?;
        let weak = Rc::downgrade(inner);

        let on_open = {
            let weak = weak.clone();
            Closure::<dyn FnMut(Event)>::new(move |_: Event| {
                Inner::with_live(&weak, |inner| inner.core.borrow_mut().on_open(role));
            })
        };
        let on_message = {
            let weak = weak.clone();
            Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
                let Some(text) = event.data().as_string() else {
                    debug!(%role, "non-text frame ignored");
                    return;
                };
                Inner::with_live(&weak, |inner| {
                    let result = inner.core.borrow_mut().on_message(role, &text);
                    if let Err(e) = result {
                        warn!(%role, error = %e, "frame not processed");
                    }
                });
            })
        };
        let on_error = {
            let weak = weak.clone();
            Closure::<dyn FnMut(Event)>::new(move |event: Event| {
                let message = format!("{} event", event.type_());
                Inner::with_live(&weak, |inner| inner.core.borrow_mut().on_error(role, &message));
            })
        };
        let on_close = Closure::<dyn FnMut(CloseEvent)>::new(move |event: CloseEvent| {
            let (code, reason) = (event.code(), event.reason());
            Inner::with_live(&weak, |inner| {
                inner.core.borrow_mut().on_close(role, code, &reason)
            });
        });

        ws.set_onopen(Some(on_open.as_ref().unchecked_ref()));
        ws.set_onmessage(Some(on_message.as_ref().unchecked_ref()));
        ws.set_onerror(Some(on_error.as_ref().unchecked_ref()));
        ws.set_onclose(Some(on_close.as_ref().unchecked_ref()));

        Ok(SocketHandle {
            role,
            ws,
            _on_open: on_open,
            _on_message: on_message,
            _on_error: on_error,
            _on_close: on_close,
        })
    }

    /// プロキシが生きていればイベントを処理する
    fn with_live(weak: &Weak<Inner>, f: impl FnOnce(&Rc<Inner>)) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        // 前回までに閉じたソケットのハンドラーはもう呼ばれない
        inner.retired.borrow_mut().clear();
        f(&inner);
        Inner::after_event(&inner);
    }

    /// コア借用の外で JS コールバックを呼ぶ
    fn dispatch_notifications(inner: &Rc<Inner>) {
        loop {
            let Some(notification) = inner.notifications.borrow_mut().pop_front() else {
                break;
            };
            match notification {
                Notification::Callback { handle, id, json } => {
                    let target = inner
                        .callbacks
                        .borrow()
                        .get(&handle)
                        .map(|cb| (cb.function.clone(), cb.context.clone()));
                    if let Some((function, context)) = target {
                        call_js(&function, &context, id, &json);
                    }
                }
                Notification::Image { id, json } => {
                    let target = inner.image_sink.borrow().clone();
                    if let Some((function, context)) = target {
                        call_js(&function, &context, id, &json);
                    }
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for handle in self.sockets.get_mut().values() {
            handle.shutdown();
        }
    }
}

fn enqueue_callback(queue: &NotificationQueue, handle: u32, object: &StateObject) {
    match object.to_json() {
        Ok(json) => queue.borrow_mut().push_back(Notification::Callback {
            handle,
            id: object.id,
            json,
        }),
        Err(e) => warn!(id = object.id, error = %e, "callback notification dropped"),
    }
}

fn call_js(function: &Function, context: &JsValue, id: ObjectId, json: &str) {
    let object = JSON::parse(json).unwrap_or(JsValue::NULL);
    if let Err(e) = function.call2(context, &JsValue::from_f64(id as f64), &object) {
        warn!(id, error = %describe(&e), "js callback threw");
    }
}

/// JS の数値をオブジェクト id に変換する
fn object_id(id: f64) -> Result<ObjectId, JsError> {
    if id.is_finite() && id >= 0.0 && id.fract() == 0.0 && id <= (1u64 << 53) as f64 {
        Ok(id as ObjectId)
    } else {
        Err(JsError::new(&format!("Invalid object id: {}", id)))
    }
}

fn parse_js(json: &str) -> Result<JsValue, JsError> {
    JSON::parse(json).map_err(|e| JsError::new(&format!("JSON parse failed: {}", describe(&e))))
}

fn describe(value: &JsValue) -> String {
    value
        .as_string()
        .or_else(|| {
            value
                .dyn_ref::<js_sys::Error>()
                .map(|e| String::from(e.message()))
        })
        .unwrap_or_else(|| format!("{:?}", value))
}

fn to_js_error(e: impl std::fmt::Display) -> JsError {
    JsError::new(&e.to_string())
}
