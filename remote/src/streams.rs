//! Length-delimited framed streams carrying bincode messages.
//!
//! Generic over the underlying reader/writer so the same framing works for
//! TCP halves and in-memory duplex pipes in tests.

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Framed send stream for length-delimited messages.
#[derive(Debug)]
pub struct SendStream<W = OwnedWriteHalf> {
    framed: tokio_util::codec::FramedWrite<W, tokio_util::codec::LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> SendStream<W> {
    pub fn new(stream: W) -> Self {
        let framed = tokio_util::codec::FramedWrite::new(
            stream,
            tokio_util::codec::LengthDelimitedCodec::new(),
        );
        Self { framed }
    }

    /// Serialize one object into a frame and flush it.
    pub async fn send_message<T: serde::Serialize>(&mut self, obj: &T) -> anyhow::Result<()> {
        let bytes = bincode::serialize(obj)?;
        self.framed.send(bytes::Bytes::from(bytes)).await?;
        self.framed.flush().await?;
        Ok(())
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        self.framed.close().await?;
        Ok(())
    }
}

/// Framed receive stream for length-delimited messages.
#[derive(Debug)]
pub struct RecvStream<R = OwnedReadHalf> {
    framed: tokio_util::codec::FramedRead<R, tokio_util::codec::LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> RecvStream<R> {
    pub fn new(stream: R) -> Self {
        let framed = tokio_util::codec::FramedRead::new(
            stream,
            tokio_util::codec::LengthDelimitedCodec::new(),
        );
        Self { framed }
    }

    /// Receive one object; `None` means the peer closed the stream.
    pub async fn recv_object<T: serde::de::DeserializeOwned>(
        &mut self,
    ) -> anyhow::Result<Option<T>> {
        if let Some(frame) = futures::StreamExt::next(&mut self.framed).await {
            let bytes = frame?;
            let obj = bincode::deserialize(&bytes)?;
            Ok(Some(obj))
        } else {
            Ok(None)
        }
    }
}

/// Bidirectional control connection over one TCP stream.
#[derive(Debug)]
pub struct ControlConnection {
    send: SendStream,
    recv: RecvStream,
}

impl ControlConnection {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            send: SendStream::new(write_half),
            recv: RecvStream::new(read_half),
        }
    }

    pub async fn connect(addr: std::net::SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    pub fn send_mut(&mut self) -> &mut SendStream {
        &mut self.send
    }

    pub fn recv_mut(&mut self) -> &mut RecvStream {
        &mut self.recv
    }

    /// Send one request and wait for the matching reply.
    pub async fn call(
        &mut self,
        request: &crate::protocol::Request,
    ) -> anyhow::Result<crate::protocol::Reply> {
        self.send.send_message(request).await?;
        match self.recv.recv_object::<crate::protocol::Reply>().await? {
            Some(reply) => Ok(reply),
            None => Err(anyhow::anyhow!("connection closed while awaiting reply")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Reply, Request, Response};

    #[tokio::test]
    async fn framed_messages_round_trip_over_duplex() -> anyhow::Result<()> {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, client_write) = tokio::io::split(client);
        let mut send = SendStream::new(client_write);
        let mut recv = RecvStream::new(server_read);
        send.send_message(&Request::Authenticate {
            token: "t".to_string(),
        })
        .await?;
        send.send_message(&Request::ReadChunk).await?;
        let first: Request = recv.recv_object().await?.unwrap();
        assert_eq!(first.method(), "authenticate");
        let second: Request = recv.recv_object().await?.unwrap();
        assert_eq!(second.method(), "readChunk");
        Ok(())
    }

    #[tokio::test]
    async fn control_connection_round_trips_over_tcp() -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = ControlConnection::new(stream);
            let request: Request = conn.recv_mut().recv_object().await.unwrap().unwrap();
            assert_eq!(request.method(), "getVersion");
            conn.send_mut()
                .send_message(&Reply::Ok(Response::Version(crate::PROTOCOL_VERSION)))
                .await
                .unwrap();
        });
        let mut conn = ControlConnection::connect(addr).await?;
        match conn.call(&Request::GetVersion).await? {
            Reply::Ok(Response::Version(v)) => assert_eq!(v, crate::PROTOCOL_VERSION),
            other => panic!("unexpected reply: {other:?}"),
        }
        server.await?;
        Ok(())
    }
}
