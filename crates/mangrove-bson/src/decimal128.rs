//! BSON Decimal128 (IEEE 754-2008 decimal128, BID encoding).
//!
//! The 16 bytes are stored little-endian on the wire. Only the canonical
//! case-1 BID form is produced by the encoder; non-canonical coefficients
//! decode as zero, matching the reference behavior.

use std::fmt;

use crate::error::BsonError;

const EXPONENT_BIAS: i32 = 6176;
const EXPONENT_MAX: i32 = 6111;
const EXPONENT_MIN: i32 = -6176;
const MAX_DIGITS: usize = 34;

/// A 16-byte BSON Decimal128 value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal128(pub [u8; 16]);

/// Decoded classification of a Decimal128.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecimalClass {
    Finite { sign: bool, coefficient: u128, exponent: i32 },
    Infinity { sign: bool },
    NaN,
}

impl Decimal128 {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Decimal128(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Decodes the BID layout into sign/coefficient/exponent.
    pub fn classify(&self) -> DecimalClass {
        let bits = u128::from_le_bytes(self.0);
        let sign = (bits >> 127) & 1 == 1;
        let combination = ((bits >> 122) & 0b11111) as u8;

        if combination == 0b11110 {
            return DecimalClass::Infinity { sign };
        }
        if combination == 0b11111 {
            return DecimalClass::NaN;
        }

        let (exponent, coefficient) = if (combination >> 3) == 0b11 {
            // Case 2: implicit (100) prefix on the 111-bit trailing field.
            let exp = ((bits >> 111) & 0x3fff) as i32;
            let coeff = (bits & ((1u128 << 111) - 1)) | (0b100u128 << 111);
            (exp, coeff)
        } else {
            // Case 1: 14-bit exponent, 113-bit coefficient.
            let exp = ((bits >> 113) & 0x3fff) as i32;
            let coeff = bits & ((1u128 << 113) - 1);
            (exp, coeff)
        };

        // Coefficients beyond 34 digits are non-canonical and read as zero.
        let coefficient = if coefficient > max_coefficient() {
            0
        } else {
            coefficient
        };

        DecimalClass::Finite {
            sign,
            coefficient,
            exponent: exponent - EXPONENT_BIAS,
        }
    }

    /// Approximate numeric value, used for cross-type ordering.
    pub fn to_f64(&self) -> f64 {
        match self.classify() {
            DecimalClass::NaN => f64::NAN,
            DecimalClass::Infinity { sign: false } => f64::INFINITY,
            DecimalClass::Infinity { sign: true } => f64::NEG_INFINITY,
            DecimalClass::Finite {
                sign,
                coefficient,
                exponent,
            } => {
                let magnitude = coefficient as f64 * 10f64.powi(exponent);
                if sign {
                    -magnitude
                } else {
                    magnitude
                }
            }
        }
    }

    /// Parses the `$numberDecimal` string form.
    pub fn parse(s: &str) -> Result<Self, BsonError> {
        let bad = || BsonError::InvalidExtendedJson(format!("invalid $numberDecimal {s:?}"));

        let (sign, rest) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };

        match rest {
            "Infinity" | "Inf" => return Ok(Self::encode_special(sign, false)),
            "NaN" => return Ok(Self::encode_special(false, true)),
            _ => {}
        }

        let (mantissa, exp_part) = match rest.find(['e', 'E']) {
            Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
            None => (rest, None),
        };
        let mut exponent: i32 = match exp_part {
            Some(e) => e.parse().map_err(|_| bad())?,
            None => 0,
        };

        let (int_part, frac_part) = match mantissa.find('.') {
            Some(pos) => (&mantissa[..pos], &mantissa[pos + 1..]),
            None => (mantissa, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(bad());
        }
        exponent -= frac_part.len() as i32;

        let mut coefficient: u128 = 0;
        let mut digits = 0usize;
        for b in int_part.bytes().chain(frac_part.bytes()) {
            if !b.is_ascii_digit() {
                return Err(bad());
            }
            // Skip redundant leading zeros so precision counting is exact.
            if coefficient == 0 && b == b'0' && digits == 0 {
                continue;
            }
            digits += 1;
            if digits > MAX_DIGITS {
                return Err(bad());
            }
            coefficient = coefficient * 10 + (b - b'0') as u128;
        }

        if !(EXPONENT_MIN..=EXPONENT_MAX).contains(&exponent) {
            return Err(bad());
        }

        let biased = (exponent + EXPONENT_BIAS) as u128;
        let mut bits = (biased << 113) | coefficient;
        if sign {
            bits |= 1u128 << 127;
        }
        Ok(Decimal128(bits.to_le_bytes()))
    }

    fn encode_special(sign: bool, nan: bool) -> Self {
        let mut bits: u128 = if nan {
            0b11111u128 << 122
        } else {
            0b11110u128 << 122
        };
        if sign {
            bits |= 1u128 << 127;
        }
        Decimal128(bits.to_le_bytes())
    }
}

fn max_coefficient() -> u128 {
    10u128.pow(MAX_DIGITS as u32) - 1
}

impl fmt::Display for Decimal128 {
    /// IEEE "to scientific string" conversion, as drivers render
    /// `$numberDecimal`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (sign, coefficient, exponent) = match self.classify() {
            DecimalClass::NaN => return write!(f, "NaN"),
            DecimalClass::Infinity { sign } => {
                return write!(f, "{}Infinity", if sign { "-" } else { "" })
            }
            DecimalClass::Finite {
                sign,
                coefficient,
                exponent,
            } => (sign, coefficient, exponent),
        };

        if sign {
            write!(f, "-")?;
        }
        let digits = coefficient.to_string();
        let adjusted = exponent + digits.len() as i32 - 1;

        if exponent > 0 || adjusted < -6 {
            // Scientific notation.
            write!(f, "{}", &digits[..1])?;
            if digits.len() > 1 {
                write!(f, ".{}", &digits[1..])?;
            }
            write!(f, "E{}{}", if adjusted >= 0 { "+" } else { "" }, adjusted)
        } else if exponent == 0 {
            write!(f, "{digits}")
        } else {
            let point = digits.len() as i32 + exponent;
            if point > 0 {
                let point = point as usize;
                write!(f, "{}.{}", &digits[..point], &digits[point..])
            } else {
                write!(f, "0.")?;
                for _ in 0..-point {
                    write!(f, "0")?;
                }
                write!(f, "{digits}")
            }
        }
    }
}

impl fmt::Debug for Decimal128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Decimal128({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display_round_trip() {
        for s in ["0", "1", "-1", "42", "0.5", "-10.75", "123456789.123456789"] {
            let d = Decimal128::parse(s).unwrap();
            assert_eq!(d.to_string(), *s, "round trip of {s}");
        }
    }

    #[test]
    fn test_scientific_form() {
        let d = Decimal128::parse("1E+6").unwrap();
        assert_eq!(d.to_string(), "1E+6");
        let d = Decimal128::parse("1.5E-8").unwrap();
        assert_eq!(d.to_string(), "1.5E-8");
    }

    #[test]
    fn test_specials() {
        assert_eq!(Decimal128::parse("Infinity").unwrap().to_string(), "Infinity");
        assert_eq!(
            Decimal128::parse("-Infinity").unwrap().to_string(),
            "-Infinity"
        );
        assert_eq!(Decimal128::parse("NaN").unwrap().to_string(), "NaN");
    }

    #[test]
    fn test_numeric_value() {
        let d = Decimal128::parse("2.5").unwrap();
        assert_eq!(d.to_f64(), 2.5);
        let d = Decimal128::parse("-0.125").unwrap();
        assert_eq!(d.to_f64(), -0.125);
    }

    #[test]
    fn test_rejects_oversized_coefficient() {
        let too_long = "9".repeat(35);
        assert!(Decimal128::parse(&too_long).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Decimal128::parse("abc").is_err());
        assert!(Decimal128::parse("1..2").is_err());
        assert!(Decimal128::parse("").is_err());
    }
}
