//! Bounds-checked big-endian buffer helpers.

use super::packet::PacketError;

/// Safe slice read helper - returns an error instead of panicking.
#[inline]
pub fn read_slice(buffer: &[u8], start: usize, len: usize) -> Result<&[u8], PacketError> {
    let end = start.saturating_add(len);
    buffer.get(start..end).ok_or(PacketError::Truncated {
        needed: end,
        available: buffer.len(),
    })
}

#[inline]
pub fn read_u8(buffer: &[u8], offset: usize) -> Result<u8, PacketError> {
    buffer.get(offset).copied().ok_or(PacketError::Truncated {
        needed: offset + 1,
        available: buffer.len(),
    })
}

#[inline]
pub fn read_u16(buffer: &[u8], offset: usize) -> Result<u16, PacketError> {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(read_slice(buffer, offset, 2)?);
    Ok(u16::from_be_bytes(bytes))
}

#[inline]
pub fn read_u32(buffer: &[u8], offset: usize) -> Result<u32, PacketError> {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(read_slice(buffer, offset, 4)?);
    Ok(u32::from_be_bytes(bytes))
}

#[inline]
pub fn read_u64(buffer: &[u8], offset: usize) -> Result<u64, PacketError> {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(read_slice(buffer, offset, 8)?);
    Ok(u64::from_be_bytes(bytes))
}

/// Decode an unsigned LEB128 value. Returns the value and the bytes consumed.
pub fn read_uleb128_u32(buffer: &[u8]) -> Result<(u32, usize), PacketError> {
    let mut value: u32 = 0;
    for (idx, byte) in buffer.iter().enumerate().take(5) {
        let bits = u32::from(byte & 0x7f);
        let shift = 7 * u32::try_from(idx).map_err(|_| PacketError::InvalidLeb128)?;
        value |= bits.checked_shl(shift).ok_or(PacketError::InvalidLeb128)?;
        if byte & 0x80 == 0 {
            return Ok((value, idx + 1));
        }
    }
    Err(PacketError::InvalidLeb128)
}

/// Append the unsigned LEB128 encoding of `value`.
pub fn write_uleb128_u32(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = u8::try_from(value & 0x7f).unwrap_or_default();
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}
