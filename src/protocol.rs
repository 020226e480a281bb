use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::{LENGTH_PREFIX_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::ProtocolError;

/// Length prefix of a sized message, a little-endian `u32` on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PacketSize(u32);

impl PacketSize {
    #[inline]
    pub fn from_bytes(bytes: [u8; LENGTH_PREFIX_SIZE]) -> Self {
        PacketSize(u32::from_le_bytes(bytes))
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; LENGTH_PREFIX_SIZE] {
        self.0.to_le_bytes()
    }
}

impl From<PacketSize> for usize {
    fn from(ps: PacketSize) -> Self {
        ps.0 as usize
    }
}

impl From<u32> for PacketSize {
    fn from(val: u32) -> Self {
        PacketSize(val)
    }
}

impl TryFrom<usize> for PacketSize {
    type Error = ProtocolError;

    fn try_from(len: usize) -> Result<Self, Self::Error> {
        if len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(len));
        }
        u32::try_from(len)
            .map(PacketSize)
            .map_err(|_| ProtocolError::PayloadTooLarge(len))
    }
}

/// Writes `payload` as a sized message: the 4-byte length, then the bytes.
///
/// An empty payload is sent as a bare zero length.
pub async fn send_sized<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let size = PacketSize::try_from(payload.len())?;
    write_sized(writer, size, payload).await
}

async fn write_sized<W>(writer: &mut W, size: PacketSize, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&size.to_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Reads one sized message and returns its payload (empty for a zero length).
pub async fn recv_sized<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    read_at_boundary(reader, &mut len_buf).await?;
    read_payload(reader, PacketSize::from_bytes(len_buf)).await
}

/// Writes a 1-byte type tag followed by a sized message.
///
/// An oversized payload is rejected before anything reaches the stream.
pub async fn send_typed<W>(writer: &mut W, tag: u8, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let size = PacketSize::try_from(payload.len())?;
    writer.write_all(&[tag]).await?;
    write_sized(writer, size, payload).await
}

/// Reads a typed message: the type tag, then a sized payload.
pub async fn recv_typed<R>(reader: &mut R) -> Result<(u8, Vec<u8>), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut tag_buf = [0u8; 1];
    read_at_boundary(reader, &mut tag_buf).await?;

    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let payload = read_payload(reader, PacketSize::from_bytes(len_buf)).await?;

    Ok((tag_buf[0], payload))
}

/// Fills `buf` from the start of a message.
///
/// EOF before the first byte is a clean close, EOF after it is a broken
/// connection.
async fn read_at_boundary<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let first = reader.read(buf).await?;
    if first == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    reader.read_exact(&mut buf[first..]).await?;
    Ok(())
}

async fn read_payload<R>(reader: &mut R, size: PacketSize) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = usize::from(size);
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}
