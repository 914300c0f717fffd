//! WebSocket backend: speaks the gateway's terminal protocol and adapts
//! it to the exec channel the session layer drives.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use porthole_core::exec::{ExecChannel, ExecReader, ExecWriter, Geometry, RemoteExec, TargetRef};
use porthole_core::protocol::ControlMessage;
use porthole_core::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials the gateway's `/ws/:namespace/:name` endpoint on each attach.
pub struct GatewayExec {
    base: Url,
    user: String,
}

impl GatewayExec {
    pub fn new(base: Url, user: impl Into<String>) -> Self {
        Self {
            base,
            user: user.into(),
        }
    }

    fn endpoint(&self, target: &TargetRef) -> Url {
        let mut url = self.base.clone();
        url.set_path(&format!("/ws/{}/{}", target.namespace, target.name));
        url.query_pairs_mut()
            .clear()
            .append_pair("user", &self.user);
        url
    }
}

#[async_trait]
impl RemoteExec for GatewayExec {
    async fn attach(&self, target: &TargetRef, _geometry: Geometry) -> Result<ExecChannel> {
        // the size travels in-band: the session sends a resize control
        // frame as its first write
        let url = self.endpoint(target);
        debug!("dialing {}", url);
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| connect_error(target, err))?;
        let (sink, stream) = stream.split();
        Ok(ExecChannel {
            reader: Box::new(WsReader { stream }),
            writer: Box::new(WsWriter { sink }),
        })
    }
}

fn connect_error(target: &TargetRef, err: WsError) -> Error {
    if let WsError::Http(response) = &err {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Error::PermissionDenied {
                target: target.to_string(),
            };
        }
    }
    Error::TargetUnreachable {
        target: target.to_string(),
        message: err.to_string(),
    }
}

fn broken(err: WsError) -> Error {
    Error::TransportBroken(err.to_string())
}

struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl ExecReader for WsReader {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text.into_bytes()))),
                Some(Ok(Message::Close(frame))) => {
                    // normal closure is the gateway settling the session;
                    // anything else is a failure worth reconnecting over
                    let clean = frame
                        .as_ref()
                        .map(|f| f.code == CloseCode::Normal)
                        .unwrap_or(false);
                    if clean {
                        debug!("gateway settled the session");
                        return Ok(None);
                    }
                    let detail = frame
                        .map(|f| f.reason.into_owned())
                        .unwrap_or_else(|| "connection dropped".to_string());
                    return Err(Error::TransportBroken(detail));
                }
                // pings and pongs keep the connection warm
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(broken(err)),
                None => return Err(Error::TransportBroken("connection reset".to_string())),
            }
        }
    }
}

struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl ExecWriter for WsWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(broken)
    }

    async fn resize(&mut self, geometry: Geometry) -> Result<()> {
        let control = ControlMessage::Resize {
            cols: geometry.cols,
            rows: geometry.rows,
        };
        self.sink
            .send(Message::Text(control.to_json()?))
            .await
            .map_err(broken)
    }

    async fn shutdown(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "client detached".into(),
        };
        // best effort: the connection may already be gone
        let _ = self.sink.send(Message::Close(Some(frame))).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

    async fn attach_once<F, Fut>(
        handler: F,
    ) -> (ExecChannel, oneshot::Receiver<String>, tokio::task::JoinHandle<()>)
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (uri_tx, uri_rx) = oneshot::channel();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
                let _ = uri_tx.send(req.uri().to_string());
                Ok(resp)
            })
            .await
            .unwrap();
            handler(ws).await;
        });

        let backend = GatewayExec::new(Url::parse(&format!("ws://{addr}")).unwrap(), "tester");
        let channel = backend
            .attach(&TargetRef::new("default", "web-0"), Geometry::default())
            .await
            .expect("attach should succeed");
        (channel, uri_rx, server)
    }

    #[tokio::test]
    async fn attach_dials_the_target_endpoint() {
        let (mut channel, uri_rx, server) = attach_once(|mut ws| async move {
            let frame = ws.next().await.unwrap().unwrap();
            assert_eq!(frame, Message::Binary(b"hi".to_vec()));
            ws.send(Message::Binary(b"hello".to_vec())).await.unwrap();
        })
        .await;

        assert_eq!(uri_rx.await.unwrap(), "/ws/default/web-0?user=tester");
        channel.writer.write(b"hi").await.unwrap();
        let chunk = channel.reader.read().await.unwrap();
        assert_eq!(chunk, Some(Bytes::from_static(b"hello")));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn resize_rides_as_a_control_frame() {
        let (mut channel, _uri_rx, server) = attach_once(|mut ws| async move {
            let frame = ws.next().await.unwrap().unwrap();
            let Message::Text(text) = frame else {
                panic!("expected a text frame, got {frame:?}");
            };
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["type"], "resize");
            assert_eq!(value["cols"], 120);
            assert_eq!(value["rows"], 40);
        })
        .await;

        channel.writer.resize(Geometry::new(120, 40)).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_sends_a_normal_close() {
        let (mut channel, _uri_rx, server) = attach_once(|mut ws| async move {
            let frame = ws.next().await.unwrap().unwrap();
            let Message::Close(Some(frame)) = frame else {
                panic!("expected a close frame, got {frame:?}");
            };
            assert_eq!(frame.code, CloseCode::Normal);
        })
        .await;

        channel.writer.shutdown().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn normal_close_reads_as_end_of_stream() {
        let (mut channel, _uri_rx, server) = attach_once(|mut ws| async move {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "remote exited".into(),
            };
            ws.send(Message::Close(Some(frame))).await.unwrap();
        })
        .await;

        assert_eq!(channel.reader.read().await.unwrap(), None);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn error_close_reads_as_transport_failure() {
        let (mut channel, _uri_rx, server) = attach_once(|mut ws| async move {
            let frame = CloseFrame {
                code: CloseCode::Error,
                reason: "shell died".into(),
            };
            ws.send(Message::Close(Some(frame))).await.unwrap();
        })
        .await;

        let err = channel.reader.read().await.unwrap_err();
        assert!(matches!(err, Error::TransportBroken(ref detail) if detail == "shell died"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_gateway_fails_the_attach() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = GatewayExec::new(Url::parse(&format!("ws://{addr}")).unwrap(), "tester");
        let err = backend
            .attach(&TargetRef::new("default", "web-0"), Geometry::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TargetUnreachable { .. }));
    }
}
