//! Decoding of the encrypted notification pushed by BM2 monitors.
//!
//! The monitor pushes a single 16 byte block on characteristic `0000fff4`. The block is
//! AES-128 encrypted in CBC mode with a key shared by every device and an all-zero IV.
//! Once decrypted and rendered as lowercase hex the fields sit at fixed offsets:
//!
//! Start Char | End Char (excl) | Meaning
//! 0          | 2               | Unknown, ignored
//! 2          | 5               | Voltage in V/100
//! 5          | 6               | Status code
//! 6          | 8               | State of charge in %
//! 8          | 32              | Unknown, ignored
//!
//! There is no framing, checksum or version byte, so any block of the right size decodes
//! to *something*.

use aes::cipher::{BlockDecryptMut, KeyIvInit};
use aes::Aes128;

use crate::error::DecodeError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// The size of the encrypted block in bytes
pub const PAYLOAD_LEN: usize = 16;

/// The key shared by all BM2 monitors ("leagend" 0xff 0xfe "1882466")
pub const BM2_KEY: [u8; 16] = [
    0x6c, 0x65, 0x61, 0x67, 0x65, 0x6e, 0x64, 0xff, 0xfe, 0x31, 0x38, 0x38, 0x32, 0x34, 0x36, 0x36,
];

/// The values reported by the device, before any chemistry adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawReading {
    /// The battery voltage in V/100
    pub voltage_cv: u16,
    /// The device's own status code
    pub status_code: u8,
    /// The device's own (optimistic) state of charge in %
    pub percentage: u8,
}

impl RawReading {
    /// The battery voltage in V
    pub fn voltage(&self) -> f64 {
        f64::from(self.voltage_cv) / 100.0
    }
}

/// Turns the bytes of one notification into a [`RawReading`].
///
/// Isolates the wire format so other firmware revisions or models can be
/// plugged in without touching the poll session.
pub trait PayloadCodec: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<RawReading, DecodeError>;
}

/// The BM2 codec: fixed key AES-128-CBC followed by fixed offset hex fields.
#[derive(Debug, Clone)]
pub struct Bm2Codec {
    key: [u8; 16],
}

impl Default for Bm2Codec {
    fn default() -> Self {
        Self::with_key(BM2_KEY)
    }
}

impl Bm2Codec {
    pub fn with_key(key: [u8; 16]) -> Self {
        Self { key }
    }

    /// Decrypt exactly one block and render it as 32 lowercase hex characters.
    fn decrypt_to_hex(&self, payload: &[u8]) -> Result<String, DecodeError> {
        let mut block: [u8; PAYLOAD_LEN] =
            payload.try_into().map_err(|_| DecodeError::WrongLength {
                expected: PAYLOAD_LEN,
                actual: payload.len(),
            })?;

        Aes128CbcDec::new(&self.key.into(), &[0u8; 16].into())
            .decrypt_block_mut((&mut block).into());

        Ok(hex::encode(block))
    }
}

impl PayloadCodec for Bm2Codec {
    fn decode(&self, payload: &[u8]) -> Result<RawReading, DecodeError> {
        let plain = self.decrypt_to_hex(payload)?;
        log::debug!("Decrypted payload: 0x{plain}");

        let voltage_cv = hex_field(&plain, 2..5, "voltage")?;
        let status_code = hex_field(&plain, 5..6, "status")?;
        let percentage = hex_field(&plain, 6..8, "percentage")?;

        Ok(RawReading {
            voltage_cv,
            status_code: status_code as u8,
            percentage: percentage as u8,
        })
    }
}

fn hex_field(
    plain: &str,
    range: std::ops::Range<usize>,
    field: &'static str,
) -> Result<u16, DecodeError> {
    let text = plain.get(range).ok_or_else(|| DecodeError::InvalidHex {
        field,
        text: plain.to_string(),
    })?;
    u16::from_str_radix(text, 16).map_err(|_| DecodeError::InvalidHex {
        field,
        text: text.to_string(),
    })
}

#[test]
fn test_decode_happy() {
    // plaintext ab4ec1464a0000000000000000000000
    let payload = hex::decode("4b8c5e5bcaa9ff20e368f9c70119c8aa").unwrap();
    let reading = Bm2Codec::default().decode(&payload).unwrap();
    assert_eq!(
        reading,
        RawReading { voltage_cv: 0x4ec, status_code: 1, percentage: 70 }
    );
    assert!((reading.voltage() - 12.60).abs() < 1e-9);
}

#[test]
fn test_decode_full_and_floating() {
    // plaintext f55142640000000000000000000000ff
    let payload = hex::decode("56def5af919cde28e499b95ac1ad7f1f").unwrap();
    let reading = Bm2Codec::default().decode(&payload).unwrap();
    assert_eq!(reading.voltage_cv, 1300);
    assert_eq!(reading.status_code, 2);
    assert_eq!(reading.percentage, 100);

    // plaintext d1534804a0000000000000000000000f
    let payload = hex::decode("7e47a5efda1d627d8ae2ac37fa51b7ad").unwrap();
    let reading = Bm2Codec::default().decode(&payload).unwrap();
    assert_eq!(reading.voltage_cv, 1332);
    assert_eq!(reading.status_code, 8);
    assert_eq!(reading.percentage, 4);
}

#[test]
fn test_decode_garbage_is_not_an_error() {
    // an all-zero block decrypts to 1cc0db786c24f41344e65cfd3c7b66f7
    let reading = Bm2Codec::default().decode(&[0u8; 16]).unwrap();
    assert_eq!(
        reading,
        RawReading { voltage_cv: 0xc0d, status_code: 0xb, percentage: 0x78 }
    );
}

#[test]
fn test_decode_is_deterministic() {
    let codec = Bm2Codec::default();
    let payload = hex::decode("4b8c5e5bcaa9ff20e368f9c70119c8aa").unwrap();
    assert_eq!(codec.decode(&payload), codec.decode(&payload));
}

#[test]
fn test_decode_wrong_length() {
    let codec = Bm2Codec::default();
    assert_eq!(
        codec.decode(&[0u8; 15]),
        Err(DecodeError::WrongLength { expected: 16, actual: 15 })
    );
    assert_eq!(
        codec.decode(&[0u8; 32]),
        Err(DecodeError::WrongLength { expected: 16, actual: 32 })
    );
    assert_eq!(
        codec.decode(&[]),
        Err(DecodeError::WrongLength { expected: 16, actual: 0 })
    );
}

#[test]
fn test_hex_field_rejects_non_hex() {
    let err = hex_field("ab4xc1", 2..5, "voltage").unwrap_err();
    assert_eq!(
        err,
        DecodeError::InvalidHex { field: "voltage", text: "4xc".into() }
    );
}
