use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::error::{DirectoryError, Result};
use crate::protocol::{ClientFrame, Endpoint, ServerFrame};
use crate::transport::codec::JsonCodec;

/// Maximum frame body size (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Async framed TCP transport for directory sessions.
///
/// Frames are sent with a 4-byte length prefix (big-endian u32) followed by
/// the JSON-encoded body:
///
/// ```text
/// [4-byte length] [JSON data]
/// ```
///
/// All methods are generic over the stream halves so the session driver can
/// split a socket into an owned reader and writer.
///
/// # Example
///
/// ```no_run
/// use svcdir_common::transport::FramedTransport;
/// use svcdir_common::{ClientFrame, Endpoint};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut stream = FramedTransport::connect(&Endpoint::new("127.0.0.1", 2013)).await?;
/// FramedTransport::send_client_frame(&mut stream, &ClientFrame::Ping).await?;
/// let reply = FramedTransport::receive_server_frame(&mut stream).await?;
/// # Ok(())
/// # }
/// ```
pub struct FramedTransport;

impl FramedTransport {
    /// Connects to a directory server endpoint.
    ///
    /// No timeout is applied here; callers bound the whole handshake instead.
    pub async fn connect(endpoint: &Endpoint) -> Result<TcpStream> {
        let stream = TcpStream::connect(endpoint.socket_addr_string())
            .await
            .map_err(|e| DirectoryError::ConnectionLoss(format!("connect to {endpoint}: {e}")))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    pub async fn send_client_frame<W>(writer: &mut W, frame: &ClientFrame) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = JsonCodec::encode(frame)?;
        Self::send_message(writer, &encoded).await
    }

    pub async fn receive_server_frame<R>(reader: &mut R) -> Result<ServerFrame>
    where
        R: AsyncRead + Unpin,
    {
        let data = Self::receive_message(reader).await?;
        JsonCodec::decode(&data)
    }

    pub async fn send_server_frame<W>(writer: &mut W, frame: &ServerFrame) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = JsonCodec::encode(frame)?;
        Self::send_message(writer, &encoded).await
    }

    pub async fn receive_client_frame<R>(reader: &mut R) -> Result<ClientFrame>
    where
        R: AsyncRead + Unpin,
    {
        let data = Self::receive_message(reader).await?;
        JsonCodec::decode(&data)
    }

    /// Sends a message with length prefix.
    ///
    /// Wire format: `[4-byte length as u32 big-endian] + [data]`
    pub async fn send_message<W>(writer: &mut W, data: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if data.len() > MAX_FRAME_SIZE {
            return Err(DirectoryError::Protocol(format!(
                "Frame too large: {} bytes (max {} bytes)",
                data.len(),
                MAX_FRAME_SIZE
            )));
        }
        let len = data.len() as u32;

        writer
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| Self::map_io_error(e, "writing length prefix"))?;
        writer
            .write_all(data)
            .await
            .map_err(|e| Self::map_io_error(e, "writing data"))?;
        writer
            .flush()
            .await
            .map_err(|e| Self::map_io_error(e, "flushing stream"))?;

        Ok(())
    }

    /// Receives a message with length prefix.
    ///
    /// Not cancel-safe: a partially read frame is lost if the future is
    /// dropped, so callers must own the read loop.
    pub async fn receive_message<R>(reader: &mut R) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        reader
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| Self::map_io_error(e, "reading length prefix"))?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(DirectoryError::Protocol(format!(
                "Frame too large: {} bytes (max {} bytes)",
                len, MAX_FRAME_SIZE
            )));
        }

        let mut buf = vec![0u8; len];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| Self::map_io_error(e, "reading data"))?;

        Ok(buf)
    }

    /// Map IO errors to appropriate DirectoryError variants
    ///
    /// - Peer went away -> `ConnectionLoss`
    /// - Other IO errors -> `Io`
    fn map_io_error(err: std::io::Error, context: &str) -> DirectoryError {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected => {
                DirectoryError::ConnectionLoss(format!("{}: {}", context, err))
            }
            _ => DirectoryError::Io(err),
        }
    }
}
