//! Decoder for the humidity sensor's framed SysEx reply.
//!
//! The sensor firmware answers a read request with a sequence of 7-bit
//! values (the transport strips the high bit of every byte on the wire).
//! Consecutive pairs are recombined into 8-bit bytes, low septet first:
//!
//! ```text
//! byte = low | (high << 7)
//! ```
//!
//! The first reconstructed byte echoes the sensor address. The next four
//! carry the raw SHT conversion: a 14-bit humidity field and a 14-bit
//! temperature field packed as
//!
//! ```text
//! humidity    = ((b1 & 0x3F) << 8 | b2) / 16384 * 100      [%RH]
//! temperature = (b3 << 6 | b4 >> 2) / 16384 * 165 - 40     [degC]
//! ```
//!
//! A payload of all 0xFF after the address echo is the firmware's "no
//! sensor at this address" sentinel and decodes to [`RigError::DeviceAbsent`].
//!
//! Decoding is pure; it runs only once a full reply has been received.

use crate::error::{RigError, RigResult};

/// Reconstructed reply bytes: address echo, then payload.
const REPLY_BYTES: usize = 5;

/// One decoded humidity/temperature sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorSample {
    /// Relative humidity in percent.
    pub humidity: f64,
    /// Temperature in degrees Celsius.
    pub temperature: f64,
}

/// Recombine pairs of 7-bit values into 8-bit bytes, low septet first.
fn pack_septets(septets: &[u8]) -> RigResult<Vec<u8>> {
    if septets.len() % 2 != 0 {
        return Err(RigError::MalformedReply(format!(
            "odd septet count {}",
            septets.len()
        )));
    }

    Ok(septets
        .chunks_exact(2)
        .map(|pair| pair[0] | (pair[1] << 7))
        .collect())
}

/// Decodes a raw SysEx reply into a humidity/temperature sample.
///
/// `septets` is the full framed payload: an even number of 7-bit values
/// that reassemble to the address echo plus four data bytes.
pub fn decode_reply(septets: &[u8]) -> RigResult<SensorSample> {
    let bytes = pack_septets(septets)?;

    if bytes.len() < REPLY_BYTES {
        return Err(RigError::MalformedReply(format!(
            "reply has {} bytes, expected {}",
            bytes.len(),
            REPLY_BYTES
        )));
    }

    // Everything after the address echo at 0xFF means the firmware found
    // no sensor on that address.
    if bytes[1..].iter().all(|&b| b == 0xFF) {
        return Err(RigError::DeviceAbsent);
    }

    let humidity_raw = ((bytes[1] as u16 & 0x3F) as u32) << 8 | bytes[2] as u32;
    let temperature_raw = (bytes[3] as u32) << 6 | (bytes[4] as u32) >> 2;

    Ok(SensorSample {
        humidity: humidity_raw as f64 / 16384.0 * 100.0,
        temperature: temperature_raw as f64 / 16384.0 * 165.0 - 40.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Splits bytes back into (low, high) septet pairs for test input.
    fn to_septets(bytes: &[u8]) -> Vec<u8> {
        bytes
            .iter()
            .flat_map(|&b| [b & 0x7F, b >> 7])
            .collect()
    }

    #[test]
    fn test_decode_known_frame() {
        // addr echo 0x54, then 0x20 0x00 0x19 0x40:
        //   humidity = 0x2000 / 16384 * 100 = 50 %RH
        //   temperature = (0x19 << 6 | 0x40 >> 2) / 16384 * 165 - 40
        let septets = to_septets(&[0x54, 0x20, 0x00, 0x19, 0x40]);
        let sample = decode_reply(&septets).unwrap();

        assert!((sample.humidity - 50.0).abs() < 1e-9);
        let expected_t = 1616.0 / 16384.0 * 165.0 - 40.0;
        assert!((sample.temperature - expected_t).abs() < 1e-9);
    }

    #[test]
    fn test_septet_packing_uses_low_then_high() {
        // 0xC5 = 0x45 | (0x01 << 7)
        let bytes = pack_septets(&[0x45, 0x01]).unwrap();
        assert_eq!(bytes, vec![0xC5]);
    }

    #[test]
    fn test_all_ff_payload_is_device_absent() {
        let septets = to_septets(&[0x54, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(
            decode_reply(&septets),
            Err(RigError::DeviceAbsent)
        ));
    }

    #[test]
    fn test_odd_length_rejected() {
        let septets = [0x54, 0x00, 0x20];
        assert!(matches!(
            decode_reply(&septets),
            Err(RigError::MalformedReply(_))
        ));
    }

    #[test]
    fn test_short_reply_rejected() {
        let septets = to_septets(&[0x54, 0x20]);
        assert!(matches!(
            decode_reply(&septets),
            Err(RigError::MalformedReply(_))
        ));
    }

    #[test]
    fn test_address_echo_not_part_of_sentinel() {
        // An address echo of 0xFF with live payload still decodes.
        let septets = to_septets(&[0xFF, 0x20, 0x00, 0x19, 0x40]);
        assert!(decode_reply(&septets).is_ok());
    }
}
