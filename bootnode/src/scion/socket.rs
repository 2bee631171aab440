use std::fmt;
use std::io;

use log::{debug, trace};
use tos_bootnode_common::{
    serializer::{Reader, Serializer},
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        net::{
            unix::{OwnedReadHalf, OwnedWriteHalf},
            UnixStream,
        },
        sync::Mutex,
    },
};

use super::address::ScionAddr;
use super::error::{ScionError, ScionResult};

/// Every dispatcher frame starts with this cookie.
pub(crate) const DISPATCHER_COOKIE: u64 = 0xde00_ad01_be02_ef03;

pub(crate) const FRAME_REGISTER: u8 = 0x01;
pub(crate) const FRAME_DATA: u8 = 0x02;
pub(crate) const FRAME_ERROR: u8 = 0x03;

/// Largest payload accepted from the dispatcher.
const MAX_FRAME_PAYLOAD: usize = 65_536 + 64;

/// L4 protocol number sent on registration.
const PROTOCOL_UDP: u8 = 17;

pub(crate) async fn write_frame<W>(writer: &mut W, kind: u8, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    let mut frame = Vec::with_capacity(13 + payload.len());
    frame.extend_from_slice(&DISPATCHER_COOKIE.to_be_bytes());
    frame.push(kind);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

pub(crate) async fn read_frame<R>(reader: &mut R) -> io::Result<(u8, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let cookie = reader.read_u64().await?;
    if cookie != DISPATCHER_COOKIE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad frame cookie {:#018x}", cookie),
        ));
    }
    let kind = reader.read_u8().await?;
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame payload of {} bytes exceeds {}", len, MAX_FRAME_PAYLOAD),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok((kind, payload))
}

/// Datagram socket relayed through the dispatcher.
///
/// Outgoing frames carry the destination address ahead of the datagram;
/// incoming frames carry the source address the same way.
pub struct PathAwareSocket {
    local: ScionAddr,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl fmt::Debug for PathAwareSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathAwareSocket").field("local", &self.local).finish()
    }
}

impl PathAwareSocket {
    /// Register `requested` with the dispatcher over `stream`. Port 0 lets
    /// the dispatcher choose.
    pub(crate) async fn register(stream: UnixStream, requested: &ScionAddr) -> ScionResult<Self> {
        let (mut reader, mut writer) = stream.into_split();

        let mut payload = vec![PROTOCOL_UDP];
        payload.extend_from_slice(&requested.to_bytes());
        write_frame(&mut writer, FRAME_REGISTER, &payload).await?;

        let (kind, reply) = read_frame(&mut reader).await?;
        let port = match kind {
            FRAME_REGISTER => {
                let bytes: [u8; 2] = reply.as_slice().try_into().map_err(|_| {
                    ScionError::Protocol(format!("expected a 2-byte port, got {} bytes", reply.len()))
                })?;
                u16::from_be_bytes(bytes)
            }
            FRAME_ERROR => {
                return Err(ScionError::RegistrationRefused(
                    String::from_utf8_lossy(&reply).into_owned(),
                ))
            }
            other => {
                return Err(ScionError::Protocol(format!(
                    "unexpected frame type {} in registration reply",
                    other
                )))
            }
        };

        let local = requested.with_port(port);
        if log::log_enabled!(log::Level::Debug) {
            debug!("registered path-aware socket {} with the dispatcher", local);
        }

        Ok(Self {
            local,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }

    pub fn local_addr(&self) -> &ScionAddr {
        &self.local
    }

    pub async fn send_to(&self, buf: &[u8], to: &ScionAddr) -> io::Result<usize> {
        let mut payload = to.to_bytes();
        payload.extend_from_slice(buf);

        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, FRAME_DATA, &payload).await?;
        Ok(buf.len())
    }

    /// Wait for the next datagram. Datagrams larger than `buf` are
    /// truncated.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, ScionAddr)> {
        let mut reader = self.reader.lock().await;
        loop {
            let (kind, payload) = read_frame(&mut *reader).await?;
            if kind != FRAME_DATA {
                if log::log_enabled!(log::Level::Trace) {
                    trace!("ignoring dispatcher frame of type {}", kind);
                }
                continue;
            }

            let mut r = Reader::new(&payload);
            let from = ScionAddr::read(&mut r)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            let data = &payload[r.total_read()..];
            let len = data.len().min(buf.len());
            buf[..len].copy_from_slice(&data[..len]);
            return Ok((len, from));
        }
    }
}
