//! MAC addresses for epair devices
//!
//! Each VNET interface carries a pair of hardware addresses, one per epair
//! half. When not configured explicitly, the pair is derived
//! deterministically from the jail name and the nic name so restarts keep
//! their addresses.

use crate::error::{Error, Result};
use sha2::{Digest, Sha224};
use std::fmt;

/// A single hardware address, stored as 12 lowercase hex digits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacAddress {
    address: String,
}

impl MacAddress {
    /// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-...` or bare hex digits
    pub fn new(mac: &str) -> Result<Self> {
        let address = mac.replace([':', '-'], "").to_ascii_lowercase();
        if address.len() != 12 || !address.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidMacAddress(mac.to_string()));
        }
        Ok(Self { address })
    }

    /// The raw 12 hex digits
    pub fn digits(&self) -> &str {
        &self.address
    }

    /// The numerically next address
    fn successor(&self) -> Self {
        let value = u64::from_str_radix(&self.address, 16).unwrap_or(0) + 1;
        Self {
            address: format!("{:012x}", value),
        }
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes: Vec<&str> = (0..6).map(|i| &self.address[i * 2..i * 2 + 2]).collect();
        write!(f, "{}", bytes.join(":"))
    }
}

/// The hardware address pair of an epair device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacAddressPair {
    pub a: MacAddress,
    pub b: MacAddress,
}

impl MacAddressPair {
    /// Parse a comma separated pair `a,b`
    pub fn parse(pair: &str) -> Result<Self> {
        let (a, b) = pair
            .split_once(',')
            .ok_or_else(|| Error::InvalidMacAddress(pair.to_string()))?;
        Ok(Self {
            a: MacAddress::new(a)?,
            b: MacAddress::new(b)?,
        })
    }

    /// Derive a stable pair from the jail name and nic name
    ///
    /// The first address is SHA-224 of name and nic truncated behind the
    /// configured prefix; the second is the first plus one.
    pub fn generate(jail_name: &str, nic: &str, prefix: &str) -> Result<Self> {
        let mut hasher = Sha224::new();
        hasher.update(jail_name.as_bytes());
        hasher.update(nic.as_bytes());
        let digest = hex::encode(hasher.finalize());

        let prefix = prefix.to_ascii_lowercase();
        if prefix.len() >= 12 || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidMacAddress(prefix));
        }

        let a = MacAddress::new(&format!("{}{}", prefix, &digest[..12 - prefix.len()]))?;
        let b = a.successor();
        Ok(Self { a, b })
    }
}

impl fmt::Display for MacAddressPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.a, self.b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_separators() {
        let mac = MacAddress::new("02:FF:60:ab:cd:ef").unwrap();
        assert_eq!(mac.digits(), "02ff60abcdef");
        assert_eq!(mac.to_string(), "02:ff:60:ab:cd:ef");
    }

    #[test]
    fn test_rejects_wrong_length_or_digits() {
        assert!(MacAddress::new("02ff60").is_err());
        assert!(MacAddress::new("02ff60abcdeg").is_err());
    }

    #[test]
    fn test_pair_parse_and_render() {
        let pair = MacAddressPair::parse("02ff600000aa,02ff600000ab").unwrap();
        assert_eq!(pair.to_string(), "02:ff:60:00:00:aa,02:ff:60:00:00:ab");
    }

    #[test]
    fn test_generated_pair_is_stable_and_consecutive() {
        let p1 = MacAddressPair::generate("web01", "vnet0", "02ff60").unwrap();
        let p2 = MacAddressPair::generate("web01", "vnet0", "02ff60").unwrap();
        assert_eq!(p1, p2);
        assert!(p1.digits_b_is_a_plus_one());

        let other = MacAddressPair::generate("web02", "vnet0", "02ff60").unwrap();
        assert_ne!(p1, other);
    }

    impl MacAddressPair {
        fn digits_b_is_a_plus_one(&self) -> bool {
            let a = u64::from_str_radix(self.a.digits(), 16).unwrap();
            let b = u64::from_str_radix(self.b.digits(), 16).unwrap();
            b == a + 1
        }
    }

    #[test]
    fn test_generated_pair_keeps_prefix() {
        let pair = MacAddressPair::generate("web01", "vnet0", "02ff60").unwrap();
        assert!(pair.a.digits().starts_with("02ff60"));
    }
}
