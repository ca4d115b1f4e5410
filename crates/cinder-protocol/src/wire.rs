//! Length-prefixed framing for client and peer traffic.
//!
//! Each message is a 4-byte big-endian u32 length followed by a bincode
//! payload. Requests are command lines, responses are [`Frame`]s. The same
//! framing carries client commands, relayed commands and the
//! prepare/commit/rollback calls exchanged between nodes.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::types::{CmdLine, Frame};

/// Maximum frame size (64 MB). Anything larger is treated as corrupt input
/// rather than allocated.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Writes a length-prefixed bincode frame to `w`.
pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let data =
        bincode::serialize(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame size {} exceeds limit {MAX_FRAME_SIZE}", data.len()),
        ));
    }
    let len = data.len() as u32;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&data).await?;
    w.flush().await?;
    Ok(())
}

/// Reads a length-prefixed bincode frame from `r`, rejecting oversized frames.
pub async fn read_frame<R, T>(r: &mut R) -> io::Result<T>
where
    R: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame size {len} exceeds limit {MAX_FRAME_SIZE}"),
        ));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data).await?;
    bincode::deserialize(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Sends one command line and waits for its reply on the same stream.
pub async fn round_trip<S>(stream: &mut S, args: &CmdLine) -> io::Result<Frame>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    write_frame(stream, args).await?;
    read_frame(stream).await
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::types::cmd_line;

    #[tokio::test]
    async fn command_line_survives_framing() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let sent = cmd_line(["SET", "foo", "bar"]);
        write_frame(&mut client, &sent).await.unwrap();
        let got: CmdLine = read_frame(&mut server).await.unwrap();
        assert_eq!(got, sent);
    }

    #[tokio::test]
    async fn nested_reply_survives_framing() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let reply = Frame::Array(vec![
            Frame::Bulk(Bytes::from_static(b"v1")),
            Frame::Null,
            Frame::Error("TRYAGAIN slot 7 is migrating".into()),
        ]);
        write_frame(&mut server, &reply).await.unwrap();
        let got: Frame = read_frame(&mut client).await.unwrap();
        assert_eq!(got, reply);
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32) + 1;
        client.write_all(&len.to_be_bytes()).await.unwrap();
        let err = read_frame::<_, Frame>(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(client);
        assert!(read_frame::<_, Frame>(&mut server).await.is_err());
    }
}
