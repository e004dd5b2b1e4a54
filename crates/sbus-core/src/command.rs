//! Command opcodes and payload layouts
//!
//! A request payload starts with the command opcode. Read commands carry
//! `[count-1 u8][index u16]`; write commands carry a byte count (covering
//! index and data), the index, and the data. Boolean data packs eight
//! cells per byte with the lowest addressed cell in bit 0; analog data is
//! four bytes per cell, MSB first.

use crate::error::CodecError;
use bytes::{BufMut, Bytes, BytesMut};

/// The S-Bus command opcodes understood by this client.
///
/// The numeric values are fixed by the protocol and match deployed PCDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    ReadFlags = 0x02,
    ReadInputs = 0x03,
    ReadOutputs = 0x05,
    ReadRegisters = 0x06,
    ReadTimers = 0x07,
    ReadCounters = 0x08,
    WriteFlags = 0x0B,
    WriteOutputs = 0x0D,
    WriteRegisters = 0x0E,
    WriteTimers = 0x0F,
    WriteCounters = 0x10,
    RunCpuAll = 0x14,
    StopCpuAll = 0x15,
    RestartCpuAll = 0x16,
    ReadStationNumber = 0x18,
    ReadPcdStatusOwn = 0x19,
    ReadSystemInformation = 0x27,
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> Self {
        cmd as Self
    }
}

impl TryFrom<u8> for Command {
    type Error = CodecError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        let cmd = match byte {
            0x02 => Self::ReadFlags,
            0x03 => Self::ReadInputs,
            0x05 => Self::ReadOutputs,
            0x06 => Self::ReadRegisters,
            0x07 => Self::ReadTimers,
            0x08 => Self::ReadCounters,
            0x0B => Self::WriteFlags,
            0x0D => Self::WriteOutputs,
            0x0E => Self::WriteRegisters,
            0x0F => Self::WriteTimers,
            0x10 => Self::WriteCounters,
            0x14 => Self::RunCpuAll,
            0x15 => Self::StopCpuAll,
            0x16 => Self::RestartCpuAll,
            0x18 => Self::ReadStationNumber,
            0x19 => Self::ReadPcdStatusOwn,
            0x27 => Self::ReadSystemInformation,
            _ => return Err(CodecError::UnknownCommand(byte)),
        };
        Ok(cmd)
    }
}

/// One of the controller's addressable memory spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    Input,
    Output,
    Flag,
    Register,
    Timer,
    Counter,
}

// === impl AddressSpace ===

impl AddressSpace {
    /// One-bit cells, packed on the wire.
    pub fn is_boolean(self) -> bool {
        matches!(self, Self::Input | Self::Output | Self::Flag)
    }

    /// The read command for this space.
    pub fn read_command(self) -> Command {
        match self {
            Self::Input => Command::ReadInputs,
            Self::Output => Command::ReadOutputs,
            Self::Flag => Command::ReadFlags,
            Self::Register => Command::ReadRegisters,
            Self::Timer => Command::ReadTimers,
            Self::Counter => Command::ReadCounters,
        }
    }

    /// The write command for this space. Inputs cannot be written.
    pub fn write_command(self) -> Option<Command> {
        match self {
            Self::Input => None,
            Self::Output => Some(Command::WriteOutputs),
            Self::Flag => Some(Command::WriteFlags),
            Self::Register => Some(Command::WriteRegisters),
            Self::Timer => Some(Command::WriteTimers),
            Self::Counter => Some(Command::WriteCounters),
        }
    }

    /// The address-space letter used by symbol files and tag names.
    pub fn letter(self) -> char {
        match self {
            Self::Input => 'i',
            Self::Output => 'o',
            Self::Flag => 'f',
            Self::Register => 'r',
            Self::Timer => 't',
            Self::Counter => 'c',
        }
    }

    /// Parses the address-space letter, case-insensitively.
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_lowercase() {
            'i' => Some(Self::Input),
            'o' => Some(Self::Output),
            'f' => Some(Self::Flag),
            'r' => Some(Self::Register),
            't' => Some(Self::Timer),
            'c' => Some(Self::Counter),
            _ => None,
        }
    }
}

impl std::fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Input => "inputs",
            Self::Output => "outputs",
            Self::Flag => "flags",
            Self::Register => "registers",
            Self::Timer => "timers",
            Self::Counter => "counters",
        };
        f.write_str(name)
    }
}

/// Builds a read-range payload: `[opcode][count-1][index]`.
///
/// `count` must be in `1..=256` and is the caller's duty to keep within
/// what the target PCD accepts per frame.
pub fn read_request(cmd: Command, index: u16, count: usize) -> Bytes {
    debug_assert!((1..=256).contains(&count));
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(cmd.into());
    buf.put_u8((count - 1) as u8);
    buf.put_u16(index);
    buf.freeze()
}

/// Builds an analog write payload: `[opcode][byte count][index][values]`.
pub fn write_analog_request(cmd: Command, index: u16, values: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + values.len() * 4);
    buf.put_u8(cmd.into());
    buf.put_u8((2 + values.len() * 4) as u8);
    buf.put_u16(index);
    for &value in values {
        buf.put_u32(value);
    }
    buf.freeze()
}

/// Builds a boolean write payload:
/// `[opcode][byte count][index][count-1][packed bits]`.
pub fn write_bits_request(cmd: Command, index: u16, values: &[bool]) -> Bytes {
    let data = pack_bits(values);
    let mut buf = BytesMut::with_capacity(5 + data.len());
    buf.put_u8(cmd.into());
    buf.put_u8((3 + data.len()) as u8);
    buf.put_u16(index);
    buf.put_u8((values.len() - 1) as u8);
    buf.put_slice(&data);
    buf.freeze()
}

/// Builds an argument-less payload (station number, status, CPU control).
pub fn plain_request(cmd: Command) -> Bytes {
    Bytes::copy_from_slice(&[cmd.into()])
}

/// Builds a system-information block read: `[0x27][0x00][block]`.
pub fn system_info_request(block: u8) -> Bytes {
    Bytes::copy_from_slice(&[Command::ReadSystemInformation.into(), 0x00, block])
}

/// Decodes an analog read-response body into `count` values.
pub fn decode_analog_response(data: &[u8], count: usize) -> Result<Vec<u32>, CodecError> {
    if data.len() < count * 4 {
        return Err(CodecError::TruncatedPayload { needed: count * 4, got: data.len() });
    }
    Ok((0..count)
        .map(|i| u32::from_be_bytes([data[i * 4], data[i * 4 + 1], data[i * 4 + 2], data[i * 4 + 3]]))
        .collect())
}

/// Decodes a boolean read-response body into `count` cells.
pub fn decode_bits_response(data: &[u8], count: usize) -> Result<Vec<bool>, CodecError> {
    let needed = count.div_ceil(8);
    if data.len() < needed {
        return Err(CodecError::TruncatedPayload { needed, got: data.len() });
    }
    Ok((0..count).map(|i| data[i / 8] & (1 << (i % 8)) != 0).collect())
}

/// Packs boolean cells eight per byte, lowest index in bit 0.
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut data = vec![0u8; values.len().div_ceil(8)];
    for (i, &value) in values.iter().enumerate() {
        if value {
            data[i / 8] |= 1 << (i % 8);
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_registers_payload() {
        // one register at index 100
        let payload = read_request(Command::ReadRegisters, 100, 1);
        assert_eq!(&payload[..], &[0x06, 0x00, 0x00, 0x64]);

        // sixteen registers starting at 10
        let payload = read_request(Command::ReadRegisters, 10, 16);
        assert_eq!(&payload[..], &[0x06, 0x0F, 0x00, 0x0A]);
    }

    #[test]
    fn write_register_payload() {
        let payload = write_analog_request(Command::WriteRegisters, 200, &[42]);
        assert_eq!(&payload[..], &[0x0E, 0x06, 0x00, 0xC8, 0x00, 0x00, 0x00, 0x2A]);
    }

    #[test]
    fn write_flags_payload() {
        let payload = write_bits_request(Command::WriteFlags, 8, &[true, false, true]);
        assert_eq!(&payload[..], &[0x0B, 0x04, 0x00, 0x08, 0x02, 0b0000_0101]);
    }

    #[test]
    fn bit_packing_roundtrip() {
        let values = [true, true, false, true, false, false, false, true, true, false];
        let data = pack_bits(&values);
        assert_eq!(data.len(), 2);
        assert_eq!(decode_bits_response(&data, values.len()).unwrap(), values);
    }

    #[test]
    fn analog_response_decoding() {
        let data = [0x12, 0x34, 0x56, 0x78, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(
            decode_analog_response(&data, 2).unwrap(),
            vec![0x1234_5678, 0xFFFF_FFFF]
        );
        assert!(decode_analog_response(&data, 3).is_err());
    }

    #[test]
    fn opcode_roundtrip() {
        for byte in 0u8..=255 {
            if let Ok(cmd) = Command::try_from(byte) {
                assert_eq!(u8::from(cmd), byte);
            }
        }
        assert!(Command::try_from(0x55).is_err());
    }
}
