//! Auralization-mode bitmask
//!
//! The same mask exists on sources, receivers, and globally; the effective
//! mode for a sound path is the bitwise AND of all three.

use serde::{Deserialize, Serialize};

/// Bitmask gating which acoustic effects participate in rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuralizationMode(pub u32);

impl AuralizationMode {
    pub const DIRECT_SOUND: Self = Self(1);
    pub const EARLY_REFLECTIONS: Self = Self(2);
    pub const DIFFUSE_DECAY: Self = Self(4);
    pub const DOPPLER: Self = Self(8);
    pub const SPREADING_LOSS: Self = Self(16);
    pub const SOURCE_DIRECTIVITY: Self = Self(32);
    pub const MEDIUM_ABSORPTION: Self = Self(64);
    pub const TEMP_VAR: Self = Self(128);
    pub const ALL: Self = Self(255);
    pub const NONE: Self = Self(0);

    #[inline]
    pub fn contains(&self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    /// Effective mode of a path: source AND receiver AND global
    #[inline]
    pub fn combine(source: Self, receiver: Self, global: Self) -> Self {
        Self(source.0 & receiver.0 & global.0)
    }

    /// Short letter codes, e.g. "DS, SL, SD"
    pub fn to_short_string(&self) -> String {
        let mut parts = Vec::new();
        for (flag, code) in Self::FLAG_CODES {
            if self.contains(flag) {
                parts.push(code);
            }
        }
        parts.join(", ")
    }

    /// Parse short letter codes; unknown codes are ignored
    pub fn from_short_string(s: &str) -> Self {
        let mut mode = Self::NONE;
        for token in s.split(',').map(str::trim) {
            for (flag, code) in Self::FLAG_CODES {
                if token.eq_ignore_ascii_case(code) {
                    mode.0 |= flag.0;
                }
            }
        }
        mode
    }

    const FLAG_CODES: [(Self, &'static str); 8] = [
        (Self::DIRECT_SOUND, "DS"),
        (Self::EARLY_REFLECTIONS, "ER"),
        (Self::DIFFUSE_DECAY, "DD"),
        (Self::DOPPLER, "DP"),
        (Self::SPREADING_LOSS, "SL"),
        (Self::SOURCE_DIRECTIVITY, "SD"),
        (Self::MEDIUM_ABSORPTION, "MA"),
        (Self::TEMP_VAR, "TV"),
    ];
}

impl Default for AuralizationMode {
    fn default() -> Self {
        Self::ALL
    }
}

impl std::ops::BitAnd for AuralizationMode {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl std::ops::BitOr for AuralizationMode {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_is_and() {
        let source = AuralizationMode::ALL;
        let receiver = AuralizationMode::DIRECT_SOUND | AuralizationMode::DOPPLER;
        let global = AuralizationMode::DIRECT_SOUND | AuralizationMode::SPREADING_LOSS;
        let eff = AuralizationMode::combine(source, receiver, global);
        assert!(eff.contains(AuralizationMode::DIRECT_SOUND));
        assert!(!eff.contains(AuralizationMode::DOPPLER));
        assert!(!eff.contains(AuralizationMode::SPREADING_LOSS));
    }

    #[test]
    fn test_short_string_round_trip() {
        let mode = AuralizationMode::DIRECT_SOUND
            | AuralizationMode::SPREADING_LOSS
            | AuralizationMode::SOURCE_DIRECTIVITY;
        let s = mode.to_short_string();
        assert_eq!(s, "DS, SL, SD");
        assert_eq!(AuralizationMode::from_short_string(&s), mode);
    }

    #[test]
    fn test_default_is_all() {
        assert_eq!(AuralizationMode::default(), AuralizationMode::ALL);
    }
}
