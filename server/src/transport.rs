//! Framing for the two supported transports
//!
//! - WebSocket: one text message per frame, boundaries come from the protocol.
//! - Lines: raw byte stream with one JSON document per `\n` terminated line.
//!
//! Both are generic over the underlying stream so they run on `TcpStream` in
//! production and on in-memory pipes in tests.

use crate::connection::{FrameSink, FrameSource};
use crate::error::{SyncError, SyncResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

/// Longest line accepted on the lines transport, newline included.
pub const MAX_LINE_BYTES: u64 = 64 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Newline-delimited JSON
// ─────────────────────────────────────────────────────────────────────────────

/// Splits a byte stream into line-framed halves.
pub fn lines<T>(stream: T) -> (LineSource<ReadHalf<T>>, LineSink<WriteHalf<T>>)
where
    T: AsyncRead + AsyncWrite + Send,
{
    let (read, write) = tokio::io::split(stream);
    (LineSource::new(read), LineSink::new(write))
}

pub struct LineSource<R> {
    reader: BufReader<R>,
    /// Bytes of a line that has not been terminated yet
    pending: String,
}

impl<R: AsyncRead + Unpin + Send> LineSource<R> {
    pub fn new(read: R) -> Self {
        Self {
            reader: BufReader::new(read),
            pending: String::new(),
        }
    }
}

impl<R: AsyncRead + Unpin + Send> FrameSource for LineSource<R> {
    async fn next_frame(&mut self) -> SyncResult<Option<String>> {
        loop {
            let budget = MAX_LINE_BYTES.saturating_sub(self.pending.len() as u64);
            let read = (&mut self.reader)
                .take(budget)
                .read_line(&mut self.pending)
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::InvalidData => SyncError::protocol(e),
                    _ => SyncError::Transport(e),
                })?;

            let terminated = self.pending.ends_with('\n');
            if !terminated && self.pending.len() as u64 >= MAX_LINE_BYTES {
                return Err(SyncError::Protocol(format!(
                    "line exceeds {} bytes",
                    MAX_LINE_BYTES
                )));
            }
            if read == 0 && self.pending.is_empty() {
                return Ok(None);
            }
            if !terminated && read != 0 {
                // Partial line, keep buffering.
                continue;
            }

            // Either a full line, or the last unterminated line before EOF.
            let line = std::mem::take(&mut self.pending);
            let frame = line.trim();
            if frame.is_empty() {
                continue;
            }
            return Ok(Some(frame.to_owned()));
        }
    }
}

pub struct LineSink<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> LineSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: AsyncWrite + Unpin + Send> FrameSink for LineSink<W> {
    async fn send_frame(&mut self, frame: &str) -> SyncResult<()> {
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket
// ─────────────────────────────────────────────────────────────────────────────

/// Runs the server side of the WebSocket handshake and splits the result.
pub async fn websocket<T>(stream: T) -> SyncResult<(WsSource<T>, WsSink<T>)>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    Ok(split_websocket(ws_stream))
}

/// Splits an established WebSocket into frame halves.
pub fn split_websocket<T>(ws_stream: WebSocketStream<T>) -> (WsSource<T>, WsSink<T>)
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (write, read) = ws_stream.split();
    (WsSource { read }, WsSink { write })
}

pub struct WsSource<T> {
    read: SplitStream<WebSocketStream<T>>,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> FrameSource for WsSource<T> {
    async fn next_frame(&mut self) -> SyncResult<Option<String>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes)
                        .map(Some)
                        .map_err(SyncError::protocol);
                }
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Ping replies are queued by tungstenite itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(tungstenite::Error::ConnectionClosed)) | None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

pub struct WsSink<T> {
    write: SplitSink<WebSocketStream<T>, Message>,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> FrameSink for WsSink<T> {
    async fn send_frame(&mut self, frame: &str) -> SyncResult<()> {
        self.write.send(Message::Text(frame.to_owned())).await?;
        Ok(())
    }

    async fn close(&mut self) -> SyncResult<()> {
        match self.write.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_lines_reassembles_split_reads() {
        let mock = Builder::new()
            .read(b"{\"x\": 1")
            .read(b"0, \"y\": 2}\n{\"dir")
            .read(b"ection\": 90}\n")
            .build();
        let mut source = LineSource::new(mock);

        assert_eq!(
            source.next_frame().await.unwrap().as_deref(),
            Some(r#"{"x": 10, "y": 2}"#)
        );
        assert_eq!(
            source.next_frame().await.unwrap().as_deref(),
            Some(r#"{"direction": 90}"#)
        );
        assert_eq!(source.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lines_skips_blank_lines_and_handles_crlf() {
        let mock = Builder::new().read(b"\n\r\n{\"x\": 1}\r\n").build();
        let mut source = LineSource::new(mock);

        assert_eq!(
            source.next_frame().await.unwrap().as_deref(),
            Some(r#"{"x": 1}"#)
        );
        assert_eq!(source.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lines_unterminated_tail_before_eof() {
        let mock = Builder::new().read(b"{\"y\": 3}").build();
        let mut source = LineSource::new(mock);

        assert_eq!(
            source.next_frame().await.unwrap().as_deref(),
            Some(r#"{"y": 3}"#)
        );
        assert_eq!(source.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lines_rejects_oversized_line() {
        let huge = vec![b'a'; MAX_LINE_BYTES as usize];
        let mock = Builder::new().read(&huge).build();
        let mut source = LineSource::new(mock);

        assert!(source.next_frame().await.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_lines_rejects_invalid_utf8() {
        let mock = Builder::new().read(b"\xff\xfe\n").build();
        let mut source = LineSource::new(mock);

        assert!(source.next_frame().await.unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_lines_sink_terminates_frames() {
        let mock = Builder::new().write(b"{}").write(b"\n").build();
        let mut sink = LineSink::new(mock);

        sink.send_frame("{}").await.unwrap();
    }

    #[tokio::test]
    async fn test_lines_over_duplex_pipe() {
        let (server_side, client_side) = duplex(1024);
        let (mut source, mut sink) = lines(server_side);
        let (mut client_source, mut client_sink) = lines(client_side);

        client_sink.send_frame(r#"{"x": 5}"#).await.unwrap();
        assert_eq!(
            source.next_frame().await.unwrap().as_deref(),
            Some(r#"{"x": 5}"#)
        );

        sink.send_frame(r#"{"1": {"x": 5.0, "y": 100.0, "direction": 0.0}}"#)
            .await
            .unwrap();
        assert!(client_source
            .next_frame()
            .await
            .unwrap()
            .unwrap()
            .starts_with(r#"{"1""#));

        client_sink.close().await.unwrap();
        assert_eq!(source.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_websocket_text_and_close() {
        let (server_side, client_side) = duplex(4096);

        let client = tokio::spawn(async move {
            let (mut ws, _) = tokio_tungstenite::client_async("ws://localhost/", client_side)
                .await
                .unwrap();
            ws.send(Message::Text(r#"{"x": 1}"#.to_string()))
                .await
                .unwrap();
            ws.send(Message::Binary(br#"{"y": 2}"#.to_vec()))
                .await
                .unwrap();
            let reply = ws.next().await.unwrap().unwrap();
            ws.close(None).await.unwrap();
            // Drain until the server acknowledges the close.
            while let Some(Ok(_)) = ws.next().await {}
            reply
        });

        let (mut source, mut sink) = websocket(server_side).await.unwrap();

        assert_eq!(
            source.next_frame().await.unwrap().as_deref(),
            Some(r#"{"x": 1}"#)
        );
        assert_eq!(
            source.next_frame().await.unwrap().as_deref(),
            Some(r#"{"y": 2}"#)
        );

        sink.send_frame("{}").await.unwrap();
        assert_eq!(source.next_frame().await.unwrap(), None);
        drop(sink);
        drop(source);

        assert_eq!(client.await.unwrap(), Message::Text("{}".to_string()));
    }

    #[tokio::test]
    async fn test_websocket_binary_frame_must_be_utf8() {
        let (server_side, client_side) = duplex(4096);

        let client = tokio::spawn(async move {
            let (mut ws, _) = tokio_tungstenite::client_async("ws://localhost/", client_side)
                .await
                .unwrap();
            ws.send(Message::Binary(vec![b'{', 0xff, 0xfe, b'}']))
                .await
                .unwrap();
            ws
        });

        let (mut source, _sink) = websocket(server_side).await.unwrap();

        let err = source.next_frame().await.unwrap_err();
        assert!(err.is_protocol());
        drop(client.await.unwrap());
    }
}
