//! Radio hardware address normalisation.

use std::fmt;
use std::str::FromStr;

/// A device identifier in canonical form: six uppercase hex octets joined
/// by colons, e.g. `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{0}' is not a hardware address (expected six hex octets)")]
pub struct InvalidIdentity(pub String);

impl Identity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Identity {
    type Err = InvalidIdentity;

    /// Accepts `aa:bb:cc:dd:ee:ff`, `AA-BB-CC-DD-EE-FF` and bare
    /// `aabbccddeeff`, with surrounding whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let hex: String = if trimmed.contains(':') || trimmed.contains('-') {
            let octets: Vec<&str> = trimmed.split([':', '-']).collect();
            if octets.len() != 6 || octets.iter().any(|o| o.len() != 2) {
                return Err(InvalidIdentity(s.to_string()));
            }
            octets.concat()
        } else {
            trimmed.to_string()
        };

        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidIdentity(s.to_string()));
        }

        let upper = hex.to_ascii_uppercase();
        let canonical = upper
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(":");
        Ok(Self(canonical))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
