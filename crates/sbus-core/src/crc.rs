//! The S-Bus CRC-16
//!
//! Saia PCDs checksum every telegram with the unreflected CCITT polynomial
//! `0x1021`, initial value zero and no final xor, i.e. the CRC-16/XMODEM
//! parameterization. The checksum covers all frame bytes preceding it and
//! is transmitted big-endian.

/// Computes the S-Bus CRC-16 over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crc::{Crc, CRC_16_XMODEM};

    #[test]
    fn check_value() {
        // the standard check input for this parameterization
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn matches_reference_implementation() {
        let reference = Crc::<u16>::new(&CRC_16_XMODEM);
        let samples: &[&[u8]] = &[
            b"",
            b"\x00",
            b"\xff\xff\xff\xff",
            b"123456789",
            // a read-registers telegram body: envelope + payload
            &[0, 0, 0, 15, 0, 0, 0, 1, 0, 0x06, 0x00, 0x00, 0x64],
        ];
        for sample in samples {
            assert_eq!(crc16(sample), reference.checksum(sample), "{sample:?}");
        }
    }
}
