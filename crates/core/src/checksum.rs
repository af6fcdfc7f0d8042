/// CRC-32 (IEEE) over `data`
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Checks a buffer whose first 4 bytes hold the little-endian CRC of the rest
pub fn check_leading_crc(buffer: &[u8]) -> bool {
    if buffer.len() < 4 {
        return false;
    }
    let stored = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
    stored == crc32(&buffer[4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_vector() {
        // standard check value for CRC-32/IEEE
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_leading_crc() {
        let body = b"radio";
        let mut buffer = crc32(body).to_le_bytes().to_vec();
        buffer.extend_from_slice(body);
        assert!(check_leading_crc(&buffer));

        buffer[5] ^= 0x01;
        assert!(!check_leading_crc(&buffer));
        assert!(!check_leading_crc(&[1, 2]));
    }
}
