use crate::bmp::{BmpCodec, BmpFrame};
use crate::error::Result;
use bytes::BytesMut;
use std::io;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;

#[derive(Debug)]
pub struct BmpConn {
    stream: TcpStream,
    buffer: BytesMut,
    codec: BmpCodec,
}

impl BmpConn {
    pub fn new(stream: TcpStream) -> BmpConn {
        BmpConn {
            stream,
            buffer: BytesMut::with_capacity(64 * 1024),
            codec: BmpCodec::default(),
        }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// A common header was received but not the whole message.
    pub fn reading_body(&self) -> bool {
        self.codec.reading_body()
    }

    /// Reads the next BMP message. `None` is returned when the exporter closes
    /// the connection between two messages. Cancelling the returned future
    /// loses no data.
    pub async fn read_frame(&mut self) -> Result<Option<BmpFrame>> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() && !self.codec.reading_body() {
                    return Ok(None);
                }
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
    }
}
