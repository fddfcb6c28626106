//! CSTP over TLS: the mandatory channel
//!
//! The read pump turns frames from the gateway into inbound payloads and
//! answers DPD requests; the write pump frames outbound payloads. Either pump
//! failing tears the whole session down.

use super::supervisor::read_deadline;
use crate::error::{Result, VpnError};
use crate::protocol::constants::TLS_HEADER_LEN;
use crate::protocol::framing::parse_tls_header;
use crate::protocol::{decode_tls, encode_tls, Payload, PayloadType};
use crate::session::ConnSession;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

/// Read one complete frame into `pl`, returning its type byte
async fn read_frame<R>(reader: &mut R, pl: &mut Payload) -> Result<u8>
where
    R: AsyncRead + Unpin,
{
    reader.read_exact(&mut pl.data[..TLS_HEADER_LEN]).await?;
    let (type_byte, length) = parse_tls_header(&pl.data[..TLS_HEADER_LEN])?;
    let end = TLS_HEADER_LEN + length;
    if end > pl.data.len() {
        return Err(VpnError::Protocol(format!(
            "TLS frame of {length} bytes exceeds the receive buffer"
        )));
    }
    reader.read_exact(&mut pl.data[TLS_HEADER_LEN..end]).await?;
    pl.data.truncate(end);
    Ok(type_byte)
}

/// Gateway to inbound queue. Returns when the channel ends for any reason.
pub async fn read_pump<R>(mut reader: R, cs: Arc<ConnSession>)
where
    R: AsyncRead + Unpin,
{
    let dead = read_deadline(cs.tls_dpd_time);
    let mut deadline = Instant::now() + dead;

    loop {
        if cs.take_tls_deadline_reset() {
            deadline = Instant::now() + dead;
        }

        let mut pl = cs.pool().acquire();
        let read = tokio::select! {
            _ = cs.close_token().cancelled() => None,
            r = timeout_at(deadline, read_frame(&mut reader, &mut pl)) => Some(r),
        };
        let type_byte = match read {
            None => break,
            Some(Err(_)) => {
                log::error!("TLS read deadline exceeded, gateway is not responding");
                break;
            }
            Some(Ok(Err(e))) => {
                log::error!("TLS server to payload in error: {e}");
                break;
            }
            Some(Ok(Ok(type_byte))) => type_byte,
        };
        cs.stat.add_received(pl.len());

        match PayloadType::try_from(type_byte) {
            Ok(PayloadType::Data) => {
                if let Err(e) = decode_tls(&mut pl) {
                    log::error!("TLS frame decode failed: {e}");
                    break;
                }
                let sent = tokio::select! {
                    r = cs.payload_in.sender().send(pl) => r.is_ok(),
                    _ = cs.close_token().cancelled() => false,
                };
                if !sent {
                    break;
                }
            }
            Ok(PayloadType::DpdRequest) => {
                pl.ptype = PayloadType::DpdResponse;
                let sent = tokio::select! {
                    r = cs.payload_out_tls.sender().send(pl) => r.is_ok(),
                    _ = cs.close_token().cancelled() => false,
                };
                if !sent {
                    break;
                }
            }
            Ok(PayloadType::Disconnect) | Ok(PayloadType::Terminate) => {
                log::info!("Gateway closed the TLS channel ({type_byte:#04x})");
                cs.pool().release(pl);
                break;
            }
            Ok(PayloadType::Compressed) => {
                log::debug!("Dropping compressed TLS frame, compression was not negotiated");
                cs.pool().release(pl);
            }
            Ok(PayloadType::Keepalive) | Ok(PayloadType::DpdResponse) => {
                cs.pool().release(pl);
            }
            Err(unknown) => {
                log::debug!("Ignoring TLS frame of unknown type {unknown:#04x}");
                cs.pool().release(pl);
            }
        }
    }

    log::info!("TLS channel read exit");
    cs.close();
}

/// Outbound TLS queue to gateway
pub async fn write_pump<W>(mut writer: W, mut rx: mpsc::Receiver<Payload>, cs: Arc<ConnSession>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let mut pl = tokio::select! {
            _ = cs.close_token().cancelled() => break,
            p = rx.recv() => match p {
                Some(p) => p,
                None => break,
            },
        };

        if let Err(e) = encode_tls(&mut pl) {
            log::error!("TLS frame encode failed: {e}");
            break;
        }
        let written = async {
            writer.write_all(&pl.data).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            log::error!("TLS payload out to server error: {e}");
            break;
        }
        cs.stat.add_sent(pl.len());
        cs.pool().release(pl);
    }

    let _ = writer.shutdown().await;
    log::info!("TLS channel write exit");
    cs.close();
}

/// Start both pumps on a negotiated stream
pub fn start<S>(stream: S, cs: Arc<ConnSession>) -> Result<(JoinHandle<()>, JoinHandle<()>)>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let rx = cs
        .payload_out_tls
        .take_receiver()
        .ok_or_else(|| VpnError::InvalidState("TLS channel already started".to_string()))?;
    let (reader, writer) = tokio::io::split(stream);

    let write = tokio::spawn(write_pump(writer, rx, cs.clone()));
    let read = tokio::spawn(read_pump(reader, cs));
    Ok((read, write))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{endpoint, params};
    use crate::session::Session;
    use std::time::Duration;
    use crate::protocol::constants::MAX_MTU;
    use crate::protocol::{PayloadPool, BUFFER_SIZE};
    use tokio::io::duplex;

    const FRAME: [u8; 13] = [
        0x53, 0x54, 0x46, 0x01, 0x00, 0x05, 0x00, 0x00, 0x45, 0x00, 0x00, 0x14, 0xff,
    ];
    const DPD_REQ: [u8; 8] = [0x53, 0x54, 0x46, 0x01, 0x00, 0x00, 0x03, 0x00];

    #[tokio::test]
    async fn test_dpd_request_answered_on_tls_queue() {
        let session = Session::new();
        let cs = session.new_conn_session(endpoint(), params());
        let mut out = cs.payload_out_tls.take_receiver().unwrap();
        let mut inbound = cs.payload_in.take_receiver().unwrap();

        let (mut server, client) = duplex(4096);
        let pump = tokio::spawn(read_pump(client, cs.clone()));

        server.write_all(&DPD_REQ).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(1), out.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.ptype, PayloadType::DpdResponse);
        assert!(inbound.try_recv().is_err());

        cs.close();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_data_frame_reaches_inbound_queue() {
        let session = Session::new();
        let cs = session.new_conn_session(endpoint(), params());
        let mut inbound = cs.payload_in.take_receiver().unwrap();

        let (mut server, client) = duplex(4096);
        let pump = tokio::spawn(read_pump(client, cs.clone()));

        // keepalive and an unknown type are skipped without losing alignment
        server
            .write_all(&[0x53, 0x54, 0x46, 0x01, 0x00, 0x00, 0x07, 0x00])
            .await
            .unwrap();
        server
            .write_all(&[0x53, 0x54, 0x46, 0x01, 0x00, 0x01, 0x06, 0x00, 0xaa])
            .await
            .unwrap();
        server.write_all(&FRAME).await.unwrap();

        let pl = inbound.recv().await.unwrap();
        assert_eq!(pl.ptype, PayloadType::Data);
        assert_eq!(pl.data, vec![0x45, 0x00, 0x00, 0x14, 0xff]);
        assert_eq!(cs.stat.snapshot().bytes_received, 8 + 9 + 13);

        server
            .write_all(&[0x53, 0x54, 0x46, 0x01, 0x00, 0x00, 0x05, 0x00])
            .await
            .unwrap();
        pump.await.unwrap();
        assert!(cs.is_closed());
    }

    #[tokio::test]
    async fn test_largest_frame_fits_buffer() {
        let pool = PayloadPool::new(2);
        for (len, fits) in [(MAX_MTU, true), (MAX_MTU + 1, false)] {
            let mut frame = vec![0x53, 0x54, 0x46, 0x01];
            frame.extend_from_slice(&(len as u16).to_be_bytes());
            frame.extend_from_slice(&[0x00, 0x00]);
            frame.resize(TLS_HEADER_LEN + len, 0x45);

            let (mut server, mut client) = duplex(8192);
            server.write_all(&frame).await.unwrap();
            let mut pl = pool.acquire();
            let result = read_frame(&mut client, &mut pl).await;
            assert_eq!(result.is_ok(), fits, "{len} byte frame");
            if fits {
                assert_eq!(pl.data.len(), BUFFER_SIZE);
            }
        }
    }

    #[tokio::test]
    async fn test_bad_magic_closes_session() {
        let session = Session::new();
        let cs = session.new_conn_session(endpoint(), params());
        let (mut server, client) = duplex(4096);
        let pump = tokio::spawn(read_pump(client, cs.clone()));

        server.write_all(b"HTTP/1.1").await.unwrap();
        pump.await.unwrap();
        assert!(cs.is_closed());
        assert!(session.current().is_none());
    }

    #[tokio::test]
    async fn test_write_pump_frames_payloads() {
        let session = Session::new();
        let cs = session.new_conn_session(endpoint(), params());
        let rx = cs.payload_out_tls.take_receiver().unwrap();

        let (mut server, client) = duplex(4096);
        let pump = tokio::spawn(write_pump(client, rx, cs.clone()));

        let sender = cs.payload_out_tls.sender();
        sender
            .send(Payload::data(&[0x45, 0x00, 0x00, 0x14, 0xff]))
            .await
            .unwrap();
        sender
            .send(Payload::control(PayloadType::DpdRequest))
            .await
            .unwrap();

        let mut wire = [0u8; 21];
        server.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire[..13], &FRAME);
        assert_eq!(&wire[13..], &DPD_REQ);
        assert_eq!(cs.stat.snapshot().bytes_sent, 21);

        cs.close();
        pump.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_gateway_hits_read_deadline() {
        let session = Session::new();
        let cs = session.new_conn_session(endpoint(), params());
        let (_server, client) = duplex(4096);
        let pump = tokio::spawn(read_pump(client, cs.clone()));

        // tls_dpd is 30, so the deadline is 35 seconds out
        tokio::time::sleep(Duration::from_secs(36)).await;
        pump.await.unwrap();
        assert!(cs.is_closed());
    }
}
