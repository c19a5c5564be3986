//! FDX-B (ISO 11784/11785) tag codes as sent by the reader.
//!
//! The reader reports a tag as `Z` followed by 16 hex digits: the 64
//! identification bits of the transponder, first bit first. Within those
//! bits each numeric field is transmitted least significant bit first:
//!
//! ```text
//! bits  0..38   national ID
//! bits 38..48   country code (999 = test transponder)
//! bit  48       additional data block follows
//! bits 49..63   reserved
//! bit  63       animal application
//! ```
//!
//! The printed animal ID is the 3-digit country followed by the 12-digit
//! national ID.

use std::fmt;

use weigh_core::constants::{TAG_HEX_DIGITS, TAG_PREFIX};
use weigh_core::{Error, Result};

const NATIONAL_ID_BITS: u32 = 38;
const COUNTRY_BITS: u32 = 10;
const ADDITIONAL_DATA_BIT: u32 = 48;
const ANIMAL_BIT: u32 = 63;

/// A decoded animal identification tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnimalTag {
    pub country: u16,
    pub national_id: u64,
    pub additional_data: bool,
    pub animal: bool,
}

impl AnimalTag {
    /// Parse a `Z`-prefixed tag line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the line is not `Z` followed by exactly
    /// 16 hex digits.
    ///
    /// # Examples
    ///
    /// ```
    /// use weigh_protocol::AnimalTag;
    ///
    /// let tag = AnimalTag::parse("Z5A2080A70C2C0001").unwrap();
    /// assert_eq!(tag.country, 208);
    /// assert_eq!(tag.code(), 208_210_000_479_322);
    /// ```
    pub fn parse(line: &str) -> Result<Self> {
        let hex = line
            .strip_prefix(TAG_PREFIX)
            .ok_or_else(|| Error::protocol(format!("not a tag code: {:?}", line)))?;
        if hex.len() != TAG_HEX_DIGITS || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::protocol(format!("malformed tag code: {:?}", line)));
        }
        let bits = u64::from_str_radix(hex, 16)
            .map_err(|e| Error::protocol(format!("malformed tag code {:?}: {}", line, e)))?;
        Ok(Self::from_bits(bits))
    }

    /// Decode the 64 identification bits, first transmitted bit as MSB.
    pub fn from_bits(bits: u64) -> Self {
        // After reversal, transmitted bit i sits at position i and every
        // LSB-first field reads as a plain integer.
        let lsb_first = bits.reverse_bits();
        let national_id = lsb_first & ((1 << NATIONAL_ID_BITS) - 1);
        let country = (lsb_first >> NATIONAL_ID_BITS) & ((1 << COUNTRY_BITS) - 1);
        Self {
            country: country as u16,
            national_id,
            additional_data: (lsb_first >> ADDITIONAL_DATA_BIT) & 1 == 1,
            animal: (lsb_first >> ANIMAL_BIT) & 1 == 1,
        }
    }

    /// The 15-digit animal ID as a number.
    pub fn code(&self) -> u64 {
        u64::from(self.country) * 1_000_000_000_000 + self.national_id
    }

    pub fn is_test_transponder(&self) -> bool {
        self.country == 999
    }
}

impl fmt::Display for AnimalTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}{:012}", self.country, self.national_id)
    }
}
