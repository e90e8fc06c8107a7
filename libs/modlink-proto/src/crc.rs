//! CRC16 (Modbus variant)

/// CRC16 with init 0xFFFF and reflected polynomial 0xA001.
///
/// Over a complete RTU frame (CRC included, little-endian) the result is 0.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Append the CRC to `frame` in wire order (low byte first)
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// True when the frame's trailing two bytes are its valid CRC
#[inline]
pub fn is_valid_frame(frame: &[u8]) -> bool {
    frame.len() >= 4 && crc16(frame) == 0
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_vector() {
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(crc16(&data), 0x0A84);
    }

    #[test]
    fn test_full_frame_checks_to_zero() {
        let mut frame = vec![0x11, 0x03, 0x00, 0x6B, 0x00, 0x03];
        append_crc(&mut frame);
        assert_eq!(&frame[6..], &[0x76, 0x87]);
        assert!(is_valid_frame(&frame));
    }

    #[test]
    fn test_corrupted_crc_rejected() {
        let mut frame = vec![0x01, 0x06, 0x00, 0x01, 0x00, 0x03];
        append_crc(&mut frame);
        let n = frame.len();
        frame[n - 2] ^= 0xFF;
        frame[n - 1] ^= 0xFF;
        assert!(!is_valid_frame(&frame));
    }
}
