//! RPC ディスパッチャー

use serde_json::Value;
use tracing::debug;
use viewer_mirror::StateMirror;
use viewer_proto::{ObjectId, CONTROL_OBJECT_ID, RPC_TYPE_FIELD};
use viewer_transport::{Channels, SocketRole, TransportError};

use crate::error::RpcError;
use crate::rpc_type;

/// RPC 送信の統計情報
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcStats {
    /// invoke の回数
    pub invocations: u64,
    /// 送信した JSON の総バイト数
    pub bytes_sent: u64,
    /// 最後に送った RPC コード
    pub last_rpc_type: Option<i64>,
}

/// ミラー上のオブジェクトを output 接続へ送る
#[derive(Debug, Default)]
pub struct RpcDispatcher {
    stats: RpcStats,
}

impl RpcDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// StateObject[id] の contents 全体を id / typeName 付きで output に送る
    ///
    /// output が open 前ならチャンネルのバックログに積まれ、open 時に送られる。
    ///
    /// # エラー
    /// - `RpcError::Lookup`: StateObject が無い
    /// - `RpcError::Transport`: output が閉じている
    pub fn invoke(
        &mut self,
        mirror: &StateMirror,
        id: ObjectId,
        channels: &mut Channels,
    ) -> Result<(), RpcError> {
        let text = mirror.to_envelope(id)?;
        let len = text.len() as u64;
        channels.send(SocketRole::Output, text)?;

        self.stats.invocations += 1;
        self.stats.bytes_sent += len;
        debug!(id, bytes = len, "invoked");
        Ok(())
    }

    /// 制御オブジェクトに RPC コードを積んで送る
    pub fn call(
        &mut self,
        mirror: &mut StateMirror,
        rpc_type: i64,
        channels: &mut Channels,
    ) -> Result<(), RpcError> {
        mirror.set_field(CONTROL_OBJECT_ID, RPC_TYPE_FIELD, Value::from(rpc_type))?;
        self.invoke(mirror, CONTROL_OBJECT_ID, channels)?;
        self.stats.last_rpc_type = Some(rpc_type);
        Ok(())
    }

    /// 切り離しコマンドを送る
    ///
    /// ソケットを閉じる前に呼ぶこと。直後に閉じるのでバックログには積まない。
    ///
    /// # エラー
    /// - `RpcError::Transport(TransportError::NotOpen)`: output がまだ open していない
    pub fn disconnect_client(
        &mut self,
        mirror: &mut StateMirror,
        channels: &mut Channels,
    ) -> Result<(), RpcError> {
        if !channels.get(SocketRole::Output).is_open() {
            return Err(TransportError::NotOpen(SocketRole::Output).into());
        }
        self.call(mirror, rpc_type::DETACH, channels)
    }

    pub fn stats(&self) -> RpcStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use viewer_mirror::LookupError;
    use viewer_transport::TransportCommand;

    const RPC_API: &str = r#"{"id":0,"typeName":"ViewerRPC","api":{"RPCType":0,"windowId":1}}"#;

    fn open_channels() -> Channels {
        let mut channels = Channels::new();
        channels.open(SocketRole::Output, "ws://h:9003".into());
        channels.on_open(SocketRole::Output);
        channels.drain_commands();
        channels
    }

    fn sent(channels: &mut Channels) -> Vec<String> {
        channels
            .drain_commands()
            .into_iter()
            .filter_map(|cmd| match cmd {
                TransportCommand::Send {
                    role: SocketRole::Output,
                    text,
                } => Some(text),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_call_sends_whole_control_object() {
        let mut mirror = StateMirror::new();
        mirror.ingest(RPC_API).unwrap();
        mirror.set_field(0, "windowId", json!(1)).unwrap();

        let mut channels = open_channels();
        let mut rpc = RpcDispatcher::new();
        rpc.call(&mut mirror, 91, &mut channels).unwrap();

        assert_eq!(
            sent(&mut channels),
            vec![r#"{"id":0,"typeName":"ViewerRPC","contents":{"data":{"0":91,"1":1}}}"#.to_string()]
        );
        let stats = rpc.stats();
        assert_eq!(stats.invocations, 1);
        assert_eq!(stats.last_rpc_type, Some(91));
    }

    #[test]
    fn test_invoke_any_object() {
        let mut mirror = StateMirror::new();
        mirror
            .ingest(r#"{"id":5,"typeName":"View","contents":{"data":{"0":[1,2]}}}"#)
            .unwrap();
        let mut channels = open_channels();
        RpcDispatcher::new().invoke(&mirror, 5, &mut channels).unwrap();
        assert_eq!(
            sent(&mut channels),
            vec![r#"{"id":5,"typeName":"View","contents":{"data":{"0":[1,2]}}}"#.to_string()]
        );
    }

    #[test]
    fn test_call_without_descriptor_fails() {
        let mut mirror = StateMirror::new();
        let mut channels = open_channels();
        let err = RpcDispatcher::new()
            .call(&mut mirror, 91, &mut channels)
            .unwrap_err();
        assert!(matches!(err, RpcError::Lookup(LookupError::NoDescriptor(0))));
        assert!(sent(&mut channels).is_empty());
    }

    #[test]
    fn test_invoke_on_closed_output_fails() {
        let mirror = StateMirror::new();
        let mut channels = open_channels();
        channels.close(SocketRole::Output);
        let err = RpcDispatcher::new()
            .invoke(&mirror, 0, &mut channels)
            .unwrap_err();
        assert!(matches!(
            err,
            RpcError::Transport(TransportError::ChannelClosed(SocketRole::Output))
        ));
    }

    #[test]
    fn test_disconnect_stages_detach_code() {
        let mut mirror = StateMirror::new();
        mirror.ingest(RPC_API).unwrap();
        let mut channels = open_channels();
        RpcDispatcher::new()
            .disconnect_client(&mut mirror, &mut channels)
            .unwrap();
        assert_eq!(
            mirror.get_field(0, RPC_TYPE_FIELD).unwrap(),
            &json!(rpc_type::DETACH)
        );
        assert_eq!(sent(&mut channels).len(), 1);
    }

    #[test]
    fn test_detach_before_output_open_is_refused() {
        let mut mirror = StateMirror::new();
        mirror.ingest(RPC_API).unwrap();
        let mut channels = Channels::new();
        channels.open(SocketRole::Output, "ws://h:9003".into());

        let mut rpc = RpcDispatcher::new();
        let err = rpc.disconnect_client(&mut mirror, &mut channels).unwrap_err();
        assert!(matches!(
            err,
            RpcError::Transport(TransportError::NotOpen(SocketRole::Output))
        ));
        assert_eq!(channels.get(SocketRole::Output).backlog_len(), 0);
        assert_eq!(rpc.stats().invocations, 0);
    }
}
