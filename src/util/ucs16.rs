//! UCS-16 ↔ UTF-8 conversion.
//!
//! Filesystem adapters carrying UTF-16 names (long filename tables and
//! the like) convert through these. The mapping is a bijection on the
//! Basic Multilingual Plane excluding surrogates; no code point outside
//! the BMP is representable in UCS-16.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

/// Encode UCS-16 units as UTF-8. Surrogate units are rejected.
pub fn utf8_from_ucs16(units: &[u16]) -> KernelResult<String> {
    let mut out = String::with_capacity(units.len());
    for &unit in units {
        if (0xd800..0xe000).contains(&unit) {
            return Err(KernelError::IntBounds);
        }
        let c = char::from_u32(unit as u32).ok_or(KernelError::IntBounds)?;
        out.push(c);
    }
    Ok(out)
}

/// Decode UTF-8 into UCS-16 units. Code points beyond the BMP do not
/// fit a single unit and are rejected.
pub fn utf8_to_ucs16(text: &str) -> KernelResult<Vec<u16>> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        let value = c as u32;
        if value > 0xffff {
            return Err(KernelError::IntBounds);
        }
        out.push(value as u16);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_width_sample_roundtrips() {
        // $, ¢, ह, €, 한
        let units = [0x24u16, 0xa2, 0x939, 0x20ac, 0xd55c];
        let text = utf8_from_ucs16(&units).unwrap();
        assert_eq!(text, "$\u{a2}\u{939}\u{20ac}\u{d55c}");
        assert_eq!(utf8_to_ucs16(&text).unwrap(), units);
    }

    #[test]
    fn bijection_over_the_bmp_sans_surrogates() {
        let mut unit = 0x0001u32;
        while unit <= 0xffff {
            if !(0xd800..0xe000).contains(&unit) {
                let units = [unit as u16];
                let text = utf8_from_ucs16(&units).unwrap();
                assert_eq!(utf8_to_ucs16(&text).unwrap(), units, "unit {:#x}", unit);
            }
            unit += 1;
        }
    }

    #[test]
    fn surrogates_and_astral_rejected() {
        assert!(utf8_from_ucs16(&[0xd800]).is_err());
        assert!(utf8_from_ucs16(&[0xdfff]).is_err());
        assert!(utf8_to_ucs16("𝄞").is_err());
    }
}
