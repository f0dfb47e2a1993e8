use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::error::PeerError;
use super::message::Pdu;

const READ_BUF_CAPACITY: usize = 8 * 1024;

/// Receiving direction of a peer connection.
///
/// Owns the read half of the stream and a reassembly buffer; PDUs are
/// decoded incrementally as bytes arrive.
pub struct TransportReader {
    half: OwnedReadHalf,
    read_buf: BytesMut,
}

/// Sending direction of a peer connection.
pub struct TransportWriter {
    half: OwnedWriteHalf,
}

/// Splits a connected stream into its two transport directions so the
/// receive and send workers can own them independently.
pub fn split(stream: TcpStream) -> (TransportReader, TransportWriter) {
    let (read, write) = stream.into_split();
    (
        TransportReader {
            half: read,
            read_buf: BytesMut::with_capacity(READ_BUF_CAPACITY),
        },
        TransportWriter { half: write },
    )
}

impl TransportReader {
    /// Receives the next PDU, reading from the socket as needed.
    ///
    /// A clean EOF between frames yields [`PeerError::ConnectionClosed`];
    /// an EOF inside a frame is a protocol error.
    pub async fn recv(&mut self) -> Result<Pdu, PeerError> {
        loop {
            if let Some(pdu) = Pdu::decode(&mut self.read_buf)? {
                return Ok(pdu);
            }

            let n = self.half.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Err(PeerError::ConnectionClosed);
                }
                return Err(PeerError::Protocol("EOF inside a frame".into()));
            }
        }
    }
}

impl TransportWriter {
    /// Sends one PDU. A frame is written in full or the connection is
    /// considered broken.
    pub async fn send(&mut self, pdu: &Pdu) -> Result<(), PeerError> {
        let data = pdu.encode();
        self.half.write_all(&data).await?;
        Ok(())
    }

    /// Flushes and shuts down the sending direction.
    pub async fn shutdown(&mut self) {
        let _ = self.half.shutdown().await;
    }
}
