//! Zero-byte delimited JSON framing.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::ControlError;
use super::command::Command;

/// Terminates every frame.
pub const FRAME_DELIMITER: u8 = 0;

/// Upper bound on one frame, delimiter excluded.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Serialize `cmd` followed by the delimiter.
pub fn encode(cmd: &Command) -> Result<Vec<u8>, ControlError> {
    let mut frame = serde_json::to_vec(cmd)?;
    frame.push(FRAME_DELIMITER);
    Ok(frame)
}

/// Parse one frame body, without its delimiter.
pub fn decode(frame: &[u8]) -> Result<Command, ControlError> {
    Ok(serde_json::from_slice(frame)?)
}

/// Read the next command. `None` on a clean end of stream.
///
/// Empty frames are skipped; a stream that ends mid-frame is an error.
pub async fn read_command<R>(reader: &mut R) -> Result<Option<Command>, ControlError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader.read_until(FRAME_DELIMITER, &mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&FRAME_DELIMITER) {
            return Err(ControlError::TruncatedFrame(buf.len()));
        }
        buf.pop();
        if buf.len() > MAX_FRAME_LEN {
            return Err(ControlError::FrameTooLarge(buf.len()));
        }
        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return decode(&buf).map(Some);
    }
}

/// Write `cmd` as one frame and flush.
pub async fn write_command<W>(writer: &mut W, cmd: &Command) -> Result<(), ControlError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode(cmd)?).await?;
    writer.flush().await?;
    Ok(())
}
