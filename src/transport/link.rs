//! Raw frame I/O over TCP halves and UDP sockets.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::trace;

use super::error::TransportError;
use super::frame::{Frame, FrameDecoder};
use crate::core::{MAX_DATAGRAM_SIZE, STREAM_READ_CHUNK};

/// Writes whole frames to the socket.
#[derive(Debug)]
pub(crate) enum FrameWriter {
    Stream(OwnedWriteHalf),
    /// `peer` is `None` for a connected socket.
    Datagram {
        socket: Arc<UdpSocket>,
        peer: Option<SocketAddr>,
    },
}

impl FrameWriter {
    pub(crate) async fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        match self {
            FrameWriter::Stream(half) => {
                half.write_all(&frame.encode_stream()).await?;
                Ok(())
            }
            FrameWriter::Datagram { socket, peer } => {
                let datagram = frame.encode_datagram();
                let sent = match peer {
                    Some(addr) => socket.send_to(&datagram, *addr).await,
                    None => socket.send(&datagram).await,
                };
                sent.map(|_| ()).map_err(TransportError::DatagramSend)
            }
        }
    }
}

/// Reads whole frames, re-arming the socket read after every completion.
#[derive(Debug)]
pub(crate) enum FrameReader {
    Stream {
        half: OwnedReadHalf,
        decoder: FrameDecoder,
        buf: Vec<u8>,
    },
    /// Client-side datagrams from a connected socket.
    Connected { socket: Arc<UdpSocket>, buf: Vec<u8> },
    /// Server-side datagrams routed by the listener's demultiplexer. The
    /// peer counts as gone after `idle` without a datagram.
    Demuxed {
        rx: mpsc::Receiver<Vec<u8>>,
        idle: Duration,
    },
}

impl FrameReader {
    /// Next frame, or `None` once the peer (or listener) is gone.
    ///
    /// Malformed datagrams are dropped; a malformed stream is an error.
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        match self {
            FrameReader::Stream { half, decoder, buf } => loop {
                if let Some(frame) = decoder.next_frame()? {
                    return Ok(Some(frame));
                }
                let n = half.read(buf).await?;
                if n == 0 {
                    if decoder.buffered() > 0 {
                        return Err(TransportError::ConnectionLost(format!(
                            "stream ended inside a frame ({} bytes buffered)",
                            decoder.buffered()
                        )));
                    }
                    return Ok(None);
                }
                decoder.push(&buf[..n]);
            },
            FrameReader::Connected { socket, buf } => loop {
                match socket.recv(buf).await {
                    Ok(n) => {
                        if let Some(frame) = decode_datagram(&buf[..n]) {
                            return Ok(Some(frame));
                        }
                    }
                    // ICMP port unreachable from an earlier send; the peer
                    // may come up later.
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        trace!("datagram peer unreachable");
                    }
                    Err(e) => return Err(e.into()),
                }
            },
            FrameReader::Demuxed { rx, idle } => loop {
                match timeout(*idle, rx.recv()).await {
                    Ok(Some(datagram)) => {
                        if let Some(frame) = decode_datagram(&datagram) {
                            return Ok(Some(frame));
                        }
                    }
                    Ok(None) => return Ok(None),
                    Err(_) => {
                        return Err(TransportError::ConnectionLost(format!(
                            "peer silent for {idle:?}"
                        )));
                    }
                }
            },
        }
    }
}

fn decode_datagram(data: &[u8]) -> Option<Frame> {
    match Frame::decode_datagram(data) {
        Ok(frame) => Some(frame),
        Err(e) => {
            trace!(error = %e, "dropping malformed datagram");
            None
        }
    }
}

/// Split a connected TCP stream into frame halves.
pub(crate) fn stream_halves(stream: TcpStream, max_frame_size: usize) -> (FrameWriter, FrameReader) {
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    (
        FrameWriter::Stream(write),
        FrameReader::Stream {
            half: read,
            decoder: FrameDecoder::new(max_frame_size),
            buf: vec![0u8; STREAM_READ_CHUNK],
        },
    )
}

/// Frame halves over a socket connected to one peer.
pub(crate) fn connected_datagram_halves(socket: UdpSocket) -> (FrameWriter, FrameReader) {
    let socket = Arc::new(socket);
    (
        FrameWriter::Datagram {
            socket: Arc::clone(&socket),
            peer: None,
        },
        FrameReader::Connected {
            socket,
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
        },
    )
}

/// Frame halves for one peer of a shared listening socket.
pub(crate) fn demuxed_datagram_halves(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbound: mpsc::Receiver<Vec<u8>>,
    idle: Duration,
) -> (FrameWriter, FrameReader) {
    (
        FrameWriter::Datagram {
            socket,
            peer: Some(peer),
        },
        FrameReader::Demuxed { rx: inbound, idle },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::FrameType;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_stream_halves_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (mut writer, _client_reader) = stream_halves(client, 1024);
        let (_server_writer, mut reader) = stream_halves(server, 1024);

        for payload in [&b"one"[..], b"", b"three"] {
            writer.write_frame(&Frame::data(payload.to_vec(), false)).await.unwrap();
        }
        drop(writer);

        for payload in [&b"one"[..], b"", b"three"] {
            let frame = reader.read_frame().await.unwrap().unwrap();
            assert_eq!(frame.frame_type, FrameType::Data);
            assert_eq!(frame.body, payload);
        }
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_stream_frame_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (mut writer, _r) = stream_halves(client, 1024);
        let (_w, mut reader) = stream_halves(server, 16);

        writer.write_frame(&Frame::data(vec![0; 64], false)).await.unwrap();
        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::Frame(_))
        ));
    }

    #[tokio::test]
    async fn test_connected_datagram_skips_garbage() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server_addr).await.unwrap();
        let client_addr = client.local_addr().unwrap();

        let (_w, mut reader) = connected_datagram_halves(client);

        server.send_to(&[0xEE], client_addr).await.unwrap();
        server
            .send_to(&Frame::data(b"state".to_vec(), false).encode_datagram(), client_addr)
            .await
            .unwrap();

        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.body, b"state");
    }

    #[tokio::test]
    async fn test_demuxed_reader_ends_with_listener() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, rx) = mpsc::channel(4);
        let (_w, mut reader) = demuxed_datagram_halves(
            socket,
            "127.0.0.1:9".parse().unwrap(),
            rx,
            Duration::from_secs(5),
        );

        tx.send(Frame::keep_alive().encode_datagram()).await.unwrap();
        drop(tx);

        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::KeepAlive);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_silent_demuxed_peer_is_lost() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, rx) = mpsc::channel(4);
        let (_w, mut reader) = demuxed_datagram_halves(
            socket,
            "127.0.0.1:9".parse().unwrap(),
            rx,
            Duration::from_millis(40),
        );

        tx.send(Frame::data(b"hi".to_vec(), false).encode_datagram())
            .await
            .unwrap();
        assert_eq!(reader.read_frame().await.unwrap().unwrap().body, b"hi");

        // The sender is still alive; only silence ends the reader.
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionLost(_)));
        drop(tx);
    }
}
