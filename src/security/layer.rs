//! The secure decorator over raw frame I/O.
//!
//! [`RecordWriter`] and [`RecordReader`] expose the same send/receive
//! contract whether or not a handshake produced record keys; the
//! connection driver never branches on security after `ready`.

use tokio::time::timeout;
use tracing::{debug, trace};

use super::config::{SecurityConfig, SecurityMetadata};
use super::error::SecurityError;
use super::handshake::{self, InitiatorHandshake};
use super::record::{RecordOpener, RecordSealer};
use crate::transport::link::{FrameReader, FrameWriter};
use crate::transport::{Frame, FrameError, FrameFlags, FrameType, TransportError, TransportKind};

/// What the reader hands the connection driver.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Inbound {
    Data { payload: Vec<u8>, is_final: bool },
    KeepAlive,
    /// The initiator resent its first message; our reply was lost.
    HandshakeRetry,
}

/// Outgoing half: seals frames when keys are present.
#[derive(Debug)]
pub(crate) struct RecordWriter {
    frames: FrameWriter,
    sealer: Option<RecordSealer>,
    /// Reply cached by a datagram responder for retransmission.
    handshake_reply: Option<Vec<u8>>,
}

impl RecordWriter {
    pub(crate) fn plain(frames: FrameWriter) -> Self {
        Self {
            frames,
            sealer: None,
            handshake_reply: None,
        }
    }

    /// Send a data or keep-alive frame.
    pub(crate) async fn send(
        &mut self,
        frame_type: FrameType,
        flags: FrameFlags,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let body = match &mut self.sealer {
            Some(sealer) => sealer.seal(frame_type.as_byte(), flags.as_byte(), &payload)?,
            None => payload,
        };
        self.frames
            .write_frame(&Frame::new(frame_type, flags, body))
            .await
    }

    /// Resend the cached handshake reply, if this side has one.
    pub(crate) async fn resend_handshake_reply(&mut self) -> Result<(), TransportError> {
        if let Some(reply) = &self.handshake_reply {
            trace!("resending handshake reply");
            let frame = Frame::new(FrameType::HandshakeResp, FrameFlags::NONE, reply.clone());
            self.frames.write_frame(&frame).await?;
        }
        Ok(())
    }
}

/// Incoming half: opens sealed frames and filters control traffic.
#[derive(Debug)]
pub(crate) struct RecordReader {
    frames: FrameReader,
    opener: Option<RecordOpener>,
    kind: TransportKind,
    /// First message a datagram responder answered.
    handshake_init: Option<Vec<u8>>,
}

impl RecordReader {
    pub(crate) fn plain(frames: FrameReader, kind: TransportKind) -> Self {
        Self {
            frames,
            opener: None,
            kind,
            handshake_init: None,
        }
    }

    /// Next inbound item, or `None` when the peer is gone.
    ///
    /// Datagram records failing authentication or replay checks are dropped
    /// silently. On a stream they end the connection.
    pub(crate) async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        loop {
            let Some(frame) = self.frames.read_frame().await? else {
                return Ok(None);
            };

            match frame.frame_type {
                FrameType::Data | FrameType::KeepAlive => {
                    let payload = match &mut self.opener {
                        Some(opener) => match opener.open(
                            frame.frame_type.as_byte(),
                            frame.flags.as_byte(),
                            &frame.body,
                        ) {
                            Ok(plaintext) => plaintext,
                            Err(e) if self.kind == TransportKind::Datagram => {
                                debug!(error = %e, "dropping datagram record");
                                continue;
                            }
                            Err(e) => return Err(e.into()),
                        },
                        None => frame.body,
                    };

                    return Ok(Some(match frame.frame_type {
                        FrameType::KeepAlive => Inbound::KeepAlive,
                        _ => Inbound::Data {
                            payload,
                            is_final: frame.flags.is_final(),
                        },
                    }));
                }
                FrameType::HandshakeInit
                    if self.handshake_init.as_deref() == Some(frame.body.as_slice()) =>
                {
                    return Ok(Some(Inbound::HandshakeRetry));
                }
                other if self.kind == TransportKind::Datagram => {
                    trace!(frame_type = ?other, "ignoring stray handshake datagram");
                }
                other => return Err(FrameError::Unexpected(other).into()),
            }
        }
    }
}

/// Run the initiator side and wrap both halves.
///
/// On datagram transports the first message is resent every
/// `handshake_retransmit` until a reply arrives; the caller's connect
/// timeout bounds the whole exchange.
pub(crate) async fn initiate(
    mut writer: FrameWriter,
    mut reader: FrameReader,
    config: &SecurityConfig,
    kind: TransportKind,
) -> Result<(RecordWriter, RecordReader, SecurityMetadata), TransportError> {
    let handshake = InitiatorHandshake::start(config)?;
    let hello = Frame::new(
        FrameType::HandshakeInit,
        FrameFlags::NONE,
        handshake.message().to_vec(),
    );
    writer.write_frame(&hello).await?;

    let response = loop {
        let next = match kind {
            TransportKind::Stream => reader.read_frame().await?,
            TransportKind::Datagram => {
                match timeout(config.handshake_retransmit, reader.read_frame()).await {
                    Ok(frame) => frame?,
                    Err(_) => {
                        trace!("handshake reply overdue, retransmitting");
                        writer.write_frame(&hello).await?;
                        continue;
                    }
                }
            }
        };

        match next {
            Some(frame) if frame.frame_type == FrameType::HandshakeResp => break frame.body,
            Some(frame) if kind == TransportKind::Datagram => {
                trace!(frame_type = ?frame.frame_type, "ignoring datagram before handshake reply");
            }
            Some(frame) => return Err(FrameError::Unexpected(frame.frame_type).into()),
            None => {
                return Err(SecurityError::Handshake("peer closed during handshake".into()).into());
            }
        }
    };

    let established = handshake.finish(&response, config, kind)?;
    debug!(
        version = %established.metadata.version,
        cipher = established.metadata.cipher_suite,
        "security handshake complete"
    );

    Ok((
        RecordWriter {
            frames: writer,
            sealer: Some(established.sealer),
            handshake_reply: None,
        },
        RecordReader {
            frames: reader,
            opener: Some(established.opener),
            kind,
            handshake_init: None,
        },
        established.metadata,
    ))
}

/// Run the responder side and wrap both halves.
pub(crate) async fn respond(
    mut writer: FrameWriter,
    mut reader: FrameReader,
    config: &SecurityConfig,
    kind: TransportKind,
) -> Result<(RecordWriter, RecordReader, SecurityMetadata), TransportError> {
    let init = loop {
        match reader.read_frame().await? {
            Some(frame) if frame.frame_type == FrameType::HandshakeInit => break frame.body,
            Some(frame) if kind == TransportKind::Datagram => {
                trace!(frame_type = ?frame.frame_type, "ignoring datagram before handshake");
            }
            Some(frame) => return Err(FrameError::Unexpected(frame.frame_type).into()),
            None => {
                return Err(SecurityError::Handshake("peer closed during handshake".into()).into());
            }
        }
    };

    let response = handshake::respond(config, kind, &init)?;
    let reply = Frame::new(FrameType::HandshakeResp, FrameFlags::NONE, response.reply);
    writer.write_frame(&reply).await?;
    let established = response.outcome?;

    let datagram = kind == TransportKind::Datagram;
    Ok((
        RecordWriter {
            frames: writer,
            sealer: Some(established.sealer),
            handshake_reply: datagram.then_some(reply.body),
        },
        RecordReader {
            frames: reader,
            opener: Some(established.opener),
            kind,
            handshake_init: datagram.then_some(init),
        },
        established.metadata,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{Identity, TrustPolicy};
    use crate::transport::link::{connected_datagram_halves, stream_halves};
    use tokio::net::{TcpListener, TcpStream, UdpSocket};

    async fn tcp_pair() -> ((FrameWriter, FrameReader), (FrameWriter, FrameReader)) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (stream_halves(client, 4096), stream_halves(server, 4096))
    }

    #[tokio::test]
    async fn test_secure_stream_exchange() {
        let identity = Identity::generate().unwrap();
        let client_config = SecurityConfig::client(TrustPolicy::Pinned(identity.certificate()));
        let server_config = SecurityConfig::server(identity);
        let ((cw, cr), (sw, sr)) = tcp_pair().await;

        let server = tokio::spawn(async move {
            respond(sw, sr, &server_config, TransportKind::Stream).await
        });
        let (mut cw, _cr, meta) = initiate(cw, cr, &client_config, TransportKind::Stream)
            .await
            .unwrap();
        let (_sw, mut sr, _) = server.await.unwrap().unwrap();

        assert_eq!(meta.peer_certificates.len(), 1);
        cw.send(FrameType::Data, FrameFlags::NONE.with_final(), b"sealed".to_vec())
            .await
            .unwrap();
        assert_eq!(
            sr.recv().await.unwrap(),
            Some(Inbound::Data {
                payload: b"sealed".to_vec(),
                is_final: true
            })
        );
    }

    #[tokio::test]
    async fn test_rejected_certificate_fails_initiator() {
        let identity = Identity::generate().unwrap();
        let stranger = Identity::generate().unwrap();
        let client_config = SecurityConfig::client(TrustPolicy::Pinned(stranger.certificate()));
        let server_config = SecurityConfig::server(identity);
        let ((cw, cr), (sw, sr)) = tcp_pair().await;

        let _server = tokio::spawn(async move {
            respond(sw, sr, &server_config, TransportKind::Stream).await
        });
        let err = initiate(cw, cr, &client_config, TransportKind::Stream)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Security(SecurityError::CertificateRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_datagram_handshake_retransmits() {
        let identity = Identity::generate().unwrap();
        let client_config = SecurityConfig::client(TrustPolicy::Pinned(identity.certificate()))
            .handshake_retransmit(std::time::Duration::from_millis(20));
        let server_config = SecurityConfig::server(identity);

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();
        let (cw, cr) = connected_datagram_halves(a);
        let (sw, mut sr) = connected_datagram_halves(b);

        // Swallow the first hello so the initiator has to resend it.
        let server = tokio::spawn(async move {
            let _lost = sr.read_frame().await.unwrap();
            respond(sw, sr, &server_config, TransportKind::Datagram).await
        });

        let (mut cw, _cr, _) = initiate(cw, cr, &client_config, TransportKind::Datagram)
            .await
            .unwrap();
        let (_sw, mut sr, _) = server.await.unwrap().unwrap();

        cw.send(FrameType::Data, FrameFlags::NONE, b"pos".to_vec())
            .await
            .unwrap();
        // Further retransmitted hellos may be queued ahead of the data.
        loop {
            match sr.recv().await.unwrap() {
                Some(Inbound::HandshakeRetry) => continue,
                other => {
                    assert_eq!(
                        other,
                        Some(Inbound::Data {
                            payload: b"pos".to_vec(),
                            is_final: false
                        })
                    );
                    break;
                }
            }
        }
    }
}
