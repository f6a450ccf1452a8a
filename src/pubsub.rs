//! Publish/subscribe: a dedicated connection that tracks its own
//! subscriptions and resubscribes transparently across reconnects.
use std::collections::HashMap;
use std::time::Duration;

use crate::aio::{connect, Connection};
use crate::cmd::cmd;
use crate::connection::ConnectionInfo;
use crate::types::{ErrorKind, RedisError, RedisResult, Value};

/// What kind of frame a pub/sub connection pushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    Message,
    PMessage,
}

/// One decoded pub/sub frame: either a subscribe/unsubscribe
/// acknowledgement (`data` is the server's post-op subscription count) or
/// a delivered `message`/`pmessage` (`data` is the payload).
#[derive(Clone, Debug)]
pub struct PubSubMessage {
    pub kind: MessageKind,
    pub channel: Vec<u8>,
    pub pattern: Option<Vec<u8>>,
    pub data: Value,
}

/// A handler invoked instead of surfacing a `message`/`pmessage` frame
/// from [`PubSub::get_message`].
pub type Handler = Box<dyn FnMut(&PubSubMessage) + Send>;

/// Owns one connection dedicated to subscriptions. `subscribe`/
/// `psubscribe` update the local channel/pattern maps and fire the
/// command immediately; the server's acknowledgement is picked up later
/// by [`PubSub::get_message`], same as any other pushed frame.
///
/// If the connection drops, the next `get_message` call reopens it and
/// replays `SUBSCRIBE`/`PSUBSCRIBE` for every entry still in the local
/// maps before resuming delivery.
pub struct PubSub {
    connection_info: ConnectionInfo,
    conn: Option<Connection>,
    channels: HashMap<Vec<u8>, Option<Handler>>,
    patterns: HashMap<Vec<u8>, Option<Handler>>,
}

impl PubSub {
    pub fn new(connection_info: ConnectionInfo) -> Self {
        PubSub { connection_info, conn: None, channels: HashMap::new(), patterns: HashMap::new() }
    }

    /// True once at least one channel or pattern has been subscribed to
    /// locally, regardless of whether the server's ack has arrived yet.
    pub fn subscribed(&self) -> bool {
        !self.channels.is_empty() || !self.patterns.is_empty()
    }

    async fn ensure_connected(&mut self) -> RedisResult<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let mut conn = connect(&self.connection_info, false).await?;
        if !self.channels.is_empty() {
            let mut resub = cmd("SUBSCRIBE");
            for channel in self.channels.keys() {
                resub.arg(channel.as_slice());
            }
            conn.send_command(&resub).await?;
        }
        if !self.patterns.is_empty() {
            let mut resub = cmd("PSUBSCRIBE");
            for pattern in self.patterns.keys() {
                resub.arg(pattern.as_slice());
            }
            conn.send_command(&resub).await?;
        }
        self.conn = Some(conn);
        Ok(())
    }

    /// Subscribes to `channels`. The map is updated only after connecting
    /// (or confirming the existing connection), so a fresh connect's own
    /// resubscribe pass never doubles up with the command sent here.
    pub async fn subscribe(&mut self, channels: &[&str]) -> RedisResult<()> {
        self.ensure_connected().await?;
        for channel in channels {
            self.channels.entry(channel.as_bytes().to_vec()).or_insert(None);
        }
        let mut command = cmd("SUBSCRIBE");
        for channel in channels {
            command.arg(*channel);
        }
        self.conn.as_mut().unwrap().send_command(&command).await
    }

    pub async fn psubscribe(&mut self, patterns: &[&str]) -> RedisResult<()> {
        self.ensure_connected().await?;
        for pattern in patterns {
            self.patterns.entry(pattern.as_bytes().to_vec()).or_insert(None);
        }
        let mut command = cmd("PSUBSCRIBE");
        for pattern in patterns {
            command.arg(*pattern);
        }
        self.conn.as_mut().unwrap().send_command(&command).await
    }

    /// Subscribes to `channel`, dispatching every `message` frame it
    /// receives to `handler` instead of returning it from `get_message`.
    pub async fn subscribe_with_handler<F>(&mut self, channel: &str, handler: F) -> RedisResult<()>
    where
        F: FnMut(&PubSubMessage) + Send + 'static,
    {
        self.ensure_connected().await?;
        self.channels.insert(channel.as_bytes().to_vec(), Some(Box::new(handler)));
        let mut command = cmd("SUBSCRIBE");
        command.arg(channel);
        self.conn.as_mut().unwrap().send_command(&command).await
    }

    /// Unsubscribes from `channels`, or every currently subscribed
    /// channel if `channels` is empty.
    pub async fn unsubscribe(&mut self, channels: &[&str]) -> RedisResult<()> {
        self.ensure_connected().await?;
        let mut command = cmd("UNSUBSCRIBE");
        for channel in channels {
            command.arg(*channel);
        }
        self.conn.as_mut().unwrap().send_command(&command).await?;
        if channels.is_empty() {
            self.channels.clear();
        } else {
            for channel in channels {
                self.channels.remove(channel.as_bytes());
            }
        }
        Ok(())
    }

    pub async fn punsubscribe(&mut self, patterns: &[&str]) -> RedisResult<()> {
        self.ensure_connected().await?;
        let mut command = cmd("PUNSUBSCRIBE");
        for pattern in patterns {
            command.arg(*pattern);
        }
        self.conn.as_mut().unwrap().send_command(&command).await?;
        if patterns.is_empty() {
            self.patterns.clear();
        } else {
            for pattern in patterns {
                self.patterns.remove(pattern.as_bytes());
            }
        }
        Ok(())
    }

    /// Reads and decodes one inbound frame, reconnecting and replaying
    /// subscriptions transparently if the connection had dropped.
    /// Returns `None` on `timeout` elapsing, or when a `message`/
    /// `pmessage` frame was consumed by a registered handler instead of
    /// being returned.
    pub async fn get_message(&mut self, timeout: Option<Duration>, ignore_subscribe_messages: bool) -> RedisResult<Option<PubSubMessage>> {
        loop {
            self.ensure_connected().await?;
            let read = self.conn.as_mut().unwrap().read_pushed_message();
            let outcome = match timeout {
                Some(d) => match tokio::time::timeout(d, read).await {
                    Ok(result) => result,
                    Err(_) => return Ok(None),
                },
                None => read.await,
            };
            let value = match outcome {
                Ok(value) => value,
                Err(err) if err.is_connection_dropped() => {
                    self.conn = None;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let message = parse_pushed_message(&value)?;
            match message.kind {
                MessageKind::Subscribe | MessageKind::Unsubscribe | MessageKind::PSubscribe | MessageKind::PUnsubscribe => {
                    if ignore_subscribe_messages {
                        continue;
                    }
                    return Ok(Some(message));
                }
                MessageKind::Message => {
                    if let Some(Some(handler)) = self.channels.get_mut(&message.channel) {
                        handler(&message);
                        continue;
                    }
                    return Ok(Some(message));
                }
                MessageKind::PMessage => {
                    let handled = match &message.pattern {
                        Some(pattern) => match self.patterns.get_mut(pattern) {
                            Some(Some(handler)) => {
                                handler(&message);
                                true
                            }
                            _ => false,
                        },
                        None => false,
                    };
                    if !handled {
                        return Ok(Some(message));
                    }
                }
            }
        }
    }
}

fn parse_pushed_message(value: &Value) -> RedisResult<PubSubMessage> {
    let items = value.as_bulk().ok_or_else(|| RedisError::from((ErrorKind::TypeError, "pub/sub frame was not an array")))?;
    let kind_name = items
        .first()
        .and_then(Value::as_data)
        .map(|d| String::from_utf8_lossy(d).to_lowercase())
        .unwrap_or_default();

    match kind_name.as_str() {
        "subscribe" | "unsubscribe" | "psubscribe" | "punsubscribe" => {
            let kind = match kind_name.as_str() {
                "subscribe" => MessageKind::Subscribe,
                "unsubscribe" => MessageKind::Unsubscribe,
                "psubscribe" => MessageKind::PSubscribe,
                _ => MessageKind::PUnsubscribe,
            };
            let channel = items.get(1).and_then(Value::as_data).map(|d| d.to_vec()).unwrap_or_default();
            let data = items.get(2).cloned().unwrap_or(Value::Nil);
            Ok(PubSubMessage { kind, channel, pattern: None, data })
        }
        "message" => {
            let channel = items.get(1).and_then(Value::as_data).map(|d| d.to_vec()).unwrap_or_default();
            let data = items.get(2).cloned().unwrap_or(Value::Nil);
            Ok(PubSubMessage { kind: MessageKind::Message, channel, pattern: None, data })
        }
        "pmessage" => {
            let pattern = items.get(1).and_then(Value::as_data).map(|d| d.to_vec()).unwrap_or_default();
            let channel = items.get(2).and_then(Value::as_data).map(|d| d.to_vec()).unwrap_or_default();
            let data = items.get(3).cloned().unwrap_or(Value::Nil);
            Ok(PubSubMessage { kind: MessageKind::PMessage, channel, pattern: Some(pattern), data })
        }
        _ => Err(RedisError::from((ErrorKind::ResponseError, "unrecognized pub/sub frame type"))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::connection::ConnectionAddr;
    use crate::parser::ValueDecoder;

    use super::*;

    fn info_for(addr: std::net::SocketAddr) -> ConnectionInfo {
        let mut info = ConnectionInfo::default();
        info.addr = ConnectionAddr::Tcp(addr.ip().to_string(), addr.port());
        info
    }

    /// A mock server that acks every `SUBSCRIBE`/`PSUBSCRIBE` with one
    /// frame per argument, then pushes one `message` on channel `news`
    /// after the first subscribe ack.
    async fn spawn_pubsub_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut decoder = ValueDecoder::new();
            let mut buf = BytesMut::new();
            let mut chunk = [0u8; 4096];
            let ack_count = StdArc::new(AtomicUsize::new(0));
            loop {
                let n = match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                while let Ok(Some(value)) = decoder.decode(&mut buf) {
                    let items = match value.as_bulk() {
                        Some(items) => items,
                        None => continue,
                    };
                    let name = items.first().and_then(Value::as_data).map(|d| String::from_utf8_lossy(d).to_uppercase()).unwrap_or_default();
                    let kind = name.to_lowercase();
                    for arg in &items[1..] {
                        let channel = arg.as_data().unwrap_or(b"").to_vec();
                        let n = ack_count.fetch_add(1, Ordering::SeqCst) + 1;
                        let frame = format!(
                            "*3\r\n${}\r\n{}\r\n${}\r\n{}\r\n:{}\r\n",
                            kind.len(),
                            kind,
                            channel.len(),
                            String::from_utf8_lossy(&channel),
                            n
                        );
                        if socket.write_all(frame.as_bytes()).await.is_err() {
                            return;
                        }
                        if name == "SUBSCRIBE" && channel == b"news" {
                            let push = b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n";
                            if socket.write_all(push).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn subscribe_ack_and_message_round_trip() {
        let addr = spawn_pubsub_server().await;
        let mut pubsub = PubSub::new(info_for(addr));
        pubsub.subscribe(&["news"]).await.unwrap();

        let ack = pubsub.get_message(Some(Duration::from_secs(1)), false).await.unwrap().unwrap();
        assert_eq!(ack.kind, MessageKind::Subscribe);
        assert_eq!(ack.channel, b"news");

        let message = pubsub.get_message(Some(Duration::from_secs(1)), false).await.unwrap().unwrap();
        assert_eq!(message.kind, MessageKind::Message);
        assert_eq!(message.channel, b"news");
        assert_eq!(message.data.as_data(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn ignore_subscribe_messages_skips_straight_to_the_payload() {
        let addr = spawn_pubsub_server().await;
        let mut pubsub = PubSub::new(info_for(addr));
        pubsub.subscribe(&["news"]).await.unwrap();

        let message = pubsub.get_message(Some(Duration::from_secs(1)), true).await.unwrap().unwrap();
        assert_eq!(message.kind, MessageKind::Message);
    }

    #[tokio::test]
    async fn registered_handler_consumes_the_message_instead_of_returning_it() {
        let addr = spawn_pubsub_server().await;
        let mut pubsub = PubSub::new(info_for(addr));
        let seen = StdArc::new(std::sync::Mutex::new(None));
        let seen_clone = seen.clone();
        pubsub
            .subscribe_with_handler("news", move |message| {
                *seen_clone.lock().unwrap() = Some(message.data.clone());
            })
            .await
            .unwrap();

        // subscribe ack, then the message is routed to the handler.
        let first = pubsub.get_message(Some(Duration::from_secs(1)), false).await.unwrap();
        assert_eq!(first.unwrap().kind, MessageKind::Subscribe);
        let second = pubsub.get_message(Some(Duration::from_millis(200)), false).await.unwrap();
        assert!(second.is_none());
        assert!(seen.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn get_message_times_out_with_no_pending_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _socket = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });
        let mut pubsub = PubSub::new(info_for(addr));
        pubsub.subscribe(&["quiet"]).await.unwrap();
        let result = pubsub.get_message(Some(Duration::from_millis(200)), false).await.unwrap();
        assert!(result.is_none());
    }
}
