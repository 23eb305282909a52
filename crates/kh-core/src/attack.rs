use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// AttackMode
// ---------------------------------------------------------------------------

/// Hashcat attack modes understood by the engine.
///
/// The numeric values follow hashcat's `-a` flag so they round-trip through
/// the store and the wire protocol unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackMode {
    Dictionary,
    Combination,
    Mask,
    HybridWordlistMask,
    HybridMaskWordlist,
    Association,
}

impl AttackMode {
    /// The hashcat `-a` value for this mode.
    pub fn as_hashcat_mode(&self) -> u8 {
        match self {
            AttackMode::Dictionary => 0,
            AttackMode::Combination => 1,
            AttackMode::Mask => 3,
            AttackMode::HybridWordlistMask => 6,
            AttackMode::HybridMaskWordlist => 7,
            AttackMode::Association => 9,
        }
    }

    /// Parse a hashcat `-a` value. Modes 2, 4, 5, and 8 do not exist.
    pub fn from_hashcat_mode(mode: u8) -> Option<Self> {
        match mode {
            0 => Some(AttackMode::Dictionary),
            1 => Some(AttackMode::Combination),
            3 => Some(AttackMode::Mask),
            6 => Some(AttackMode::HybridWordlistMask),
            7 => Some(AttackMode::HybridMaskWordlist),
            9 => Some(AttackMode::Association),
            _ => None,
        }
    }
}

impl fmt::Display for AttackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AttackMode::Dictionary => "dictionary",
            AttackMode::Combination => "combination",
            AttackMode::Mask => "mask",
            AttackMode::HybridWordlistMask => "hybrid-wordlist-mask",
            AttackMode::HybridMaskWordlist => "hybrid-mask-wordlist",
            AttackMode::Association => "association",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// IncrementMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IncrementMode {
    #[default]
    Off,
    /// Shortest mask length first.
    Increment,
    /// Longest mask length first.
    IncrementInverse,
}

// ---------------------------------------------------------------------------
// MaskSpec
// ---------------------------------------------------------------------------

/// A hashcat mask plus optional custom charsets `?1`..`?4`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskSpec {
    pub mask: String,
    #[serde(default)]
    pub custom_charset_1: Option<String>,
    #[serde(default)]
    pub custom_charset_2: Option<String>,
    #[serde(default)]
    pub custom_charset_3: Option<String>,
    #[serde(default)]
    pub custom_charset_4: Option<String>,
}

impl MaskSpec {
    pub fn new(mask: impl Into<String>) -> Self {
        Self {
            mask: mask.into(),
            custom_charset_1: None,
            custom_charset_2: None,
            custom_charset_3: None,
            custom_charset_4: None,
        }
    }

    /// Resolve a custom charset index (1..=4) to its definition, if set.
    pub fn custom_charset(&self, index: u8) -> Option<&str> {
        match index {
            1 => self.custom_charset_1.as_deref(),
            2 => self.custom_charset_2.as_deref(),
            3 => self.custom_charset_3.as_deref(),
            4 => self.custom_charset_4.as_deref(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// AttackConfig
// ---------------------------------------------------------------------------

/// Complete attack configuration, one variant per attack mode.
///
/// Each variant carries exactly the fields that mode consumes; there is no
/// open parameter bag. The keyspace calculator and the task generator switch
/// over the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AttackConfig {
    /// `-a 0`: straight wordlist, optionally amplified by rule files.
    Dictionary {
        wordlist_id: Uuid,
        #[serde(default)]
        rule_ids: Vec<Uuid>,
    },
    /// `-a 1`: every word of `left` combined with every word of `right`.
    Combination { left_wordlist_id: Uuid, right_wordlist_id: Uuid },
    /// `-a 3`: brute-force over a mask, optionally in increment mode.
    Mask {
        mask: MaskSpec,
        #[serde(default)]
        increment_mode: IncrementMode,
        #[serde(default)]
        increment_min: Option<u32>,
        #[serde(default)]
        increment_max: Option<u32>,
    },
    /// `-a 6`: wordlist on the left, mask appended on the right.
    HybridWordlistMask { wordlist_id: Uuid, mask: MaskSpec },
    /// `-a 7`: mask on the left, wordlist appended on the right.
    HybridMaskWordlist { mask: MaskSpec, wordlist_id: Uuid },
    /// `-a 9`: one candidate per hash, 1:1 with the hashlist.
    Association { wordlist_id: Uuid },
}

impl AttackConfig {
    pub fn mode(&self) -> AttackMode {
        match self {
            AttackConfig::Dictionary { .. } => AttackMode::Dictionary,
            AttackConfig::Combination { .. } => AttackMode::Combination,
            AttackConfig::Mask { .. } => AttackMode::Mask,
            AttackConfig::HybridWordlistMask { .. } => AttackMode::HybridWordlistMask,
            AttackConfig::HybridMaskWordlist { .. } => AttackMode::HybridMaskWordlist,
            AttackConfig::Association { .. } => AttackMode::Association,
        }
    }

    /// All wordlist artifact ids this config references.
    pub fn wordlist_ids(&self) -> Vec<Uuid> {
        match self {
            AttackConfig::Dictionary { wordlist_id, .. } => vec![*wordlist_id],
            AttackConfig::Combination {
                left_wordlist_id,
                right_wordlist_id,
            } => vec![*left_wordlist_id, *right_wordlist_id],
            AttackConfig::Mask { .. } => Vec::new(),
            AttackConfig::HybridWordlistMask { wordlist_id, .. }
            | AttackConfig::HybridMaskWordlist { wordlist_id, .. }
            | AttackConfig::Association { wordlist_id } => vec![*wordlist_id],
        }
    }

    /// Rule artifact ids (non-empty only for dictionary attacks).
    pub fn rule_ids(&self) -> &[Uuid] {
        match self {
            AttackConfig::Dictionary { rule_ids, .. } => rule_ids,
            _ => &[],
        }
    }

    /// Whether increment mode subdivides this attack into layers.
    pub fn is_incremental(&self) -> bool {
        matches!(
            self,
            AttackConfig::Mask {
                increment_mode: IncrementMode::Increment | IncrementMode::IncrementInverse,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attack_mode_hashcat_round_trip() {
        for mode in [0u8, 1, 3, 6, 7, 9] {
            let parsed = AttackMode::from_hashcat_mode(mode).expect("valid mode");
            assert_eq!(parsed.as_hashcat_mode(), mode);
        }
        assert!(AttackMode::from_hashcat_mode(2).is_none());
        assert!(AttackMode::from_hashcat_mode(5).is_none());
    }

    #[test]
    fn attack_config_serializes_with_mode_tag() {
        let cfg = AttackConfig::Dictionary {
            wordlist_id: Uuid::new_v4(),
            rule_ids: vec![],
        };
        let json = serde_json::to_value(&cfg).expect("serialize");
        assert_eq!(json["mode"], "dictionary");
    }

    #[test]
    fn increment_detection() {
        let plain = AttackConfig::Mask {
            mask: MaskSpec::new("?l?l?l"),
            increment_mode: IncrementMode::Off,
            increment_min: None,
            increment_max: None,
        };
        assert!(!plain.is_incremental());

        let inc = AttackConfig::Mask {
            mask: MaskSpec::new("?l?l?l?l"),
            increment_mode: IncrementMode::Increment,
            increment_min: Some(2),
            increment_max: Some(4),
        };
        assert!(inc.is_incremental());
    }
}
