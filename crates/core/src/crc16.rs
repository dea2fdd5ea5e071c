//! CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, no reflection, no final XOR).

use crc::{Crc, CRC_16_IBM_3740};

const CCITT_FALSE: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Checksum over a single contiguous buffer.
pub fn crc16(data: &[u8]) -> u16 {
    CCITT_FALSE.checksum(data)
}

/// Continue a checksum from a previous value.
///
/// `crc16_continue(b, crc16(a)) == crc16(a ++ b)`, which lets a frame header
/// and payload living in separate buffers be checksummed without copying.
pub fn crc16_continue(data: &[u8], crc: u16) -> u16 {
    let mut digest = CCITT_FALSE.digest_with_initial(crc);
    digest.update(data);
    digest.finalize()
}
