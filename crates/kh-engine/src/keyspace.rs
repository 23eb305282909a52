//! Keyspace calculator: estimates base and effective keyspace for an attack
//! configuration, decides rule splitting, and fans increment-mode masks out
//! into layers.
//!
//! Outputs are estimates. They become authoritative only when a forced
//! benchmark for the exact config reports hashcat's own keyspace; the
//! calculator never flips `is_accurate_keyspace` itself.

use kh_core::artifacts::ArtifactStore;
use kh_core::attack::{AttackConfig, IncrementMode, MaskSpec};
use kh_core::error::{CoreError, Result};
use kh_core::settings::SystemSettings;
use kh_core::types::Hashlist;

// ---------------------------------------------------------------------------
// Policy & plan types
// ---------------------------------------------------------------------------

/// When a dictionary job flips into rule splitting: the rule dimension must
/// be at least `threshold` wide AND the wordlist at least
/// `min_wordlist_lines` long, otherwise word-dimension chunking distributes
/// better.
#[derive(Debug, Clone, Copy)]
pub struct RuleSplitPolicy {
    pub threshold: u64,
    pub min_wordlist_lines: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct KeyspacePolicy {
    /// Products beyond this are rejected with `KeyspaceOverflow`.
    pub max_keyspace: u64,
    pub rule_split: RuleSplitPolicy,
}

impl KeyspacePolicy {
    pub fn from_settings(settings: &SystemSettings) -> Self {
        Self {
            max_keyspace: settings.max_keyspace,
            rule_split: RuleSplitPolicy {
                threshold: settings.rule_split_threshold,
                min_wordlist_lines: settings.rule_split_min_wordlist_lines,
            },
        }
    }
}

/// One increment-mode sublayer in dispatch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPlan {
    /// 1-based dispatch position.
    pub layer_index: u32,
    pub mask: String,
    pub base_keyspace: u64,
}

/// Calculator output; all values are estimates until a forced benchmark
/// pins them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspacePlan {
    pub base_keyspace: u64,
    pub effective_keyspace: u64,
    pub multiplication_factor: u64,
    pub uses_rule_splitting: bool,
    pub layers: Vec<LayerPlan>,
}

// ---------------------------------------------------------------------------
// KeyspaceCalculator
// ---------------------------------------------------------------------------

pub struct KeyspaceCalculator<'a> {
    artifacts: &'a dyn ArtifactStore,
    policy: KeyspacePolicy,
}

impl<'a> KeyspaceCalculator<'a> {
    pub fn new(artifacts: &'a dyn ArtifactStore, policy: KeyspacePolicy) -> Self {
        Self { artifacts, policy }
    }

    /// Compute the keyspace plan for one attack config against a hashlist.
    pub async fn compute(
        &self,
        attack: &AttackConfig,
        hashlist: &Hashlist,
    ) -> Result<KeyspacePlan> {
        match attack {
            AttackConfig::Dictionary {
                wordlist_id,
                rule_ids,
            } => {
                let wordlist = self.artifacts.wordlist(*wordlist_id).await?;
                let mut factor = 0u64;
                for rule_id in rule_ids {
                    let rules = self.artifacts.rule_file(*rule_id).await?;
                    factor = factor
                        .checked_add(rules.rule_count)
                        .ok_or_else(|| overflow("rule multiplication factor"))?;
                }
                let factor = factor.max(1);
                let base = wordlist.line_count;
                let effective = self.checked_mul(base, factor, "dictionary keyspace")?;
                let uses_rule_splitting = factor >= self.policy.rule_split.threshold
                    && base >= self.policy.rule_split.min_wordlist_lines;
                Ok(KeyspacePlan {
                    base_keyspace: base,
                    effective_keyspace: effective,
                    multiplication_factor: factor,
                    uses_rule_splitting,
                    layers: Vec::new(),
                })
            }

            AttackConfig::Combination {
                left_wordlist_id,
                right_wordlist_id,
            } => {
                let left = self.artifacts.wordlist(*left_wordlist_id).await?;
                let right = self.artifacts.wordlist(*right_wordlist_id).await?;
                let effective =
                    self.checked_mul(left.line_count, right.line_count, "combination keyspace")?;
                Ok(KeyspacePlan {
                    base_keyspace: effective,
                    effective_keyspace: effective,
                    multiplication_factor: 1,
                    uses_rule_splitting: false,
                    layers: Vec::new(),
                })
            }

            AttackConfig::Mask {
                mask,
                increment_mode,
                increment_min,
                increment_max,
            } => self.compute_mask(mask, *increment_mode, *increment_min, *increment_max),

            AttackConfig::HybridWordlistMask { wordlist_id, mask } => {
                let wordlist = self.artifacts.wordlist(*wordlist_id).await?;
                let mask_size = self.full_mask_keyspace(mask)?;
                let effective =
                    self.checked_mul(wordlist.line_count, mask_size, "hybrid keyspace")?;
                Ok(KeyspacePlan {
                    base_keyspace: effective,
                    effective_keyspace: effective,
                    multiplication_factor: 1,
                    uses_rule_splitting: false,
                    layers: Vec::new(),
                })
            }

            AttackConfig::HybridMaskWordlist { mask, wordlist_id } => {
                let mask_size = self.full_mask_keyspace(mask)?;
                let wordlist = self.artifacts.wordlist(*wordlist_id).await?;
                let effective =
                    self.checked_mul(mask_size, wordlist.line_count, "hybrid keyspace")?;
                Ok(KeyspacePlan {
                    base_keyspace: effective,
                    effective_keyspace: effective,
                    multiplication_factor: 1,
                    uses_rule_splitting: false,
                    layers: Vec::new(),
                })
            }

            AttackConfig::Association { wordlist_id } => {
                if hashlist.has_mixed_work_factors {
                    return Err(CoreError::validation(
                        "association attacks require uniform work factors across the hashlist",
                    ));
                }
                let wordlist = self.artifacts.wordlist(*wordlist_id).await?;
                if wordlist.line_count != hashlist.total_hashes {
                    return Err(CoreError::validation(format!(
                        "association wordlist has {} lines but the hashlist holds {} hashes; \
                         a 1:1 mapping is required",
                        wordlist.line_count, hashlist.total_hashes
                    )));
                }
                Ok(KeyspacePlan {
                    base_keyspace: wordlist.line_count,
                    effective_keyspace: wordlist.line_count,
                    multiplication_factor: 1,
                    uses_rule_splitting: false,
                    layers: Vec::new(),
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Mask arithmetic
    // -----------------------------------------------------------------------

    fn compute_mask(
        &self,
        mask: &MaskSpec,
        increment_mode: IncrementMode,
        increment_min: Option<u32>,
        increment_max: Option<u32>,
    ) -> Result<KeyspacePlan> {
        let tokens = parse_mask(mask)?;
        if tokens.is_empty() {
            return Err(CoreError::validation("mask is empty"));
        }

        if increment_mode == IncrementMode::Off {
            let base = self.mask_product(&tokens)?;
            return Ok(KeyspacePlan {
                base_keyspace: base,
                effective_keyspace: base,
                multiplication_factor: 1,
                uses_rule_splitting: false,
                layers: Vec::new(),
            });
        }

        let min = increment_min.unwrap_or(1);
        let max = increment_max.unwrap_or(tokens.len() as u32);
        if min == 0 || min > max || max as usize > tokens.len() {
            return Err(CoreError::validation(format!(
                "increment range {min}..{max} does not fit mask of {} positions",
                tokens.len()
            )));
        }

        let mut lengths: Vec<u32> = (min..=max).collect();
        if increment_mode == IncrementMode::IncrementInverse {
            lengths.reverse();
        }

        let mut layers = Vec::with_capacity(lengths.len());
        let mut total = 0u64;
        for (position, length) in lengths.iter().enumerate() {
            let prefix = &tokens[..*length as usize];
            let base = self.mask_product(prefix)?;
            total = total
                .checked_add(base)
                .ok_or_else(|| overflow("summed layer keyspace"))?;
            layers.push(LayerPlan {
                layer_index: position as u32 + 1,
                mask: prefix.iter().map(|t| t.text.as_str()).collect(),
                base_keyspace: base,
            });
        }

        Ok(KeyspacePlan {
            base_keyspace: total,
            effective_keyspace: total,
            multiplication_factor: 1,
            uses_rule_splitting: false,
            layers,
        })
    }

    fn full_mask_keyspace(&self, mask: &MaskSpec) -> Result<u64> {
        let tokens = parse_mask(mask)?;
        if tokens.is_empty() {
            return Err(CoreError::validation("mask is empty"));
        }
        self.mask_product(&tokens)
    }

    fn mask_product(&self, tokens: &[MaskToken]) -> Result<u64> {
        let mut product = 1u64;
        for token in tokens {
            product = self.checked_mul(product, token.charset_size, "mask keyspace")?;
        }
        Ok(product)
    }

    fn checked_mul(&self, a: u64, b: u64, what: &str) -> Result<u64> {
        let product = a.checked_mul(b).ok_or_else(|| overflow(what))?;
        if product > self.policy.max_keyspace {
            return Err(overflow(what));
        }
        Ok(product)
    }
}

fn overflow(what: &str) -> CoreError {
    CoreError::KeyspaceOverflow(format!("{what} exceeds the representable maximum"))
}

// ---------------------------------------------------------------------------
// Mask parsing
// ---------------------------------------------------------------------------

struct MaskToken {
    /// Original spelling, for reassembling truncated masks.
    text: String,
    charset_size: u64,
}

/// Split a hashcat mask into per-position tokens. `?l ?u ?d ?s ?a ?b ?h ?H`
/// are built in, `?1`..`?4` resolve against the mask's custom charsets,
/// `??` is a literal question mark, and any other character is a literal.
fn parse_mask(spec: &MaskSpec) -> Result<Vec<MaskToken>> {
    let mut tokens = Vec::new();
    let mut chars = spec.mask.chars();
    while let Some(c) = chars.next() {
        if c != '?' {
            tokens.push(MaskToken {
                text: c.to_string(),
                charset_size: 1,
            });
            continue;
        }
        let Some(class) = chars.next() else {
            return Err(CoreError::validation("mask ends with a dangling '?'"));
        };
        let charset_size = match class {
            'l' | 'u' => 26,
            'd' => 10,
            's' => 33,
            'a' => 95,
            'b' => 256,
            'h' | 'H' => 16,
            '?' => 1,
            '1'..='4' => {
                let index = class as u8 - b'0';
                let charset = spec.custom_charset(index).ok_or_else(|| {
                    CoreError::validation(format!("mask references undefined charset ?{class}"))
                })?;
                charset.chars().count() as u64
            }
            other => {
                return Err(CoreError::validation(format!(
                    "unknown mask charset ?{other}"
                )))
            }
        };
        tokens.push(MaskToken {
            text: format!("?{class}"),
            charset_size,
        });
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kh_core::artifacts::MemoryArtifactStore;
    use kh_core::attack::AttackConfig;
    use uuid::Uuid;

    fn policy() -> KeyspacePolicy {
        KeyspacePolicy {
            max_keyspace: u64::MAX / 2,
            rule_split: RuleSplitPolicy {
                threshold: 10_000,
                min_wordlist_lines: 1_000_000,
            },
        }
    }

    fn hashlist(total: u64) -> Hashlist {
        let mut h = Hashlist::new("test", 0);
        h.total_hashes = total;
        h
    }

    #[tokio::test]
    async fn dictionary_without_rules() {
        let artifacts = MemoryArtifactStore::new();
        let wordlist_id = artifacts.add_wordlist(1_000_000);
        let calc = KeyspaceCalculator::new(&artifacts, policy());

        let plan = calc
            .compute(
                &AttackConfig::Dictionary {
                    wordlist_id,
                    rule_ids: vec![],
                },
                &hashlist(10),
            )
            .await
            .expect("plan");
        assert_eq!(plan.base_keyspace, 1_000_000);
        assert_eq!(plan.effective_keyspace, 1_000_000);
        assert_eq!(plan.multiplication_factor, 1);
        assert!(!plan.uses_rule_splitting);
    }

    #[tokio::test]
    async fn dictionary_rules_multiply_and_sum() {
        let artifacts = MemoryArtifactStore::new();
        let wordlist_id = artifacts.add_wordlist(1_000_000);
        let rules_a = artifacts.add_rule_file(30);
        let rules_b = artifacts.add_rule_file(20);
        let calc = KeyspaceCalculator::new(&artifacts, policy());

        let plan = calc
            .compute(
                &AttackConfig::Dictionary {
                    wordlist_id,
                    rule_ids: vec![rules_a, rules_b],
                },
                &hashlist(10),
            )
            .await
            .expect("plan");
        assert_eq!(plan.multiplication_factor, 50);
        assert_eq!(plan.effective_keyspace, 50_000_000);
        // 50 rules is far below the splitting threshold.
        assert!(!plan.uses_rule_splitting);
    }

    #[tokio::test]
    async fn rule_split_needs_both_dimensions_large() {
        let artifacts = MemoryArtifactStore::new();
        let big_wordlist = artifacts.add_wordlist(5_000_000);
        let small_wordlist = artifacts.add_wordlist(1_000);
        let big_rules = artifacts.add_rule_file(50_000);
        let calc = KeyspaceCalculator::new(&artifacts, policy());

        let split = calc
            .compute(
                &AttackConfig::Dictionary {
                    wordlist_id: big_wordlist,
                    rule_ids: vec![big_rules],
                },
                &hashlist(10),
            )
            .await
            .expect("plan");
        assert!(split.uses_rule_splitting);

        let no_split = calc
            .compute(
                &AttackConfig::Dictionary {
                    wordlist_id: small_wordlist,
                    rule_ids: vec![big_rules],
                },
                &hashlist(10),
            )
            .await
            .expect("plan");
        assert!(!no_split.uses_rule_splitting);
    }

    #[tokio::test]
    async fn combination_multiplies_wordlists() {
        let artifacts = MemoryArtifactStore::new();
        let left = artifacts.add_wordlist(1_000);
        let right = artifacts.add_wordlist(2_000);
        let calc = KeyspaceCalculator::new(&artifacts, policy());

        let plan = calc
            .compute(
                &AttackConfig::Combination {
                    left_wordlist_id: left,
                    right_wordlist_id: right,
                },
                &hashlist(10),
            )
            .await
            .expect("plan");
        assert_eq!(plan.effective_keyspace, 2_000_000);
    }

    #[tokio::test]
    async fn plain_mask_product() {
        let artifacts = MemoryArtifactStore::new();
        let calc = KeyspaceCalculator::new(&artifacts, policy());

        let plan = calc
            .compute(
                &AttackConfig::Mask {
                    mask: MaskSpec::new("?l?d?d"),
                    increment_mode: IncrementMode::Off,
                    increment_min: None,
                    increment_max: None,
                },
                &hashlist(10),
            )
            .await
            .expect("plan");
        assert_eq!(plan.base_keyspace, 26 * 10 * 10);
        assert!(plan.layers.is_empty());
    }

    #[tokio::test]
    async fn increment_mask_builds_layers() {
        let artifacts = MemoryArtifactStore::new();
        let calc = KeyspaceCalculator::new(&artifacts, policy());

        let plan = calc
            .compute(
                &AttackConfig::Mask {
                    mask: MaskSpec::new("?l?l?l?l"),
                    increment_mode: IncrementMode::Increment,
                    increment_min: Some(2),
                    increment_max: Some(4),
                },
                &hashlist(10),
            )
            .await
            .expect("plan");

        assert_eq!(plan.layers.len(), 3);
        assert_eq!(plan.layers[0].mask, "?l?l");
        assert_eq!(plan.layers[0].base_keyspace, 676);
        assert_eq!(plan.layers[1].mask, "?l?l?l");
        assert_eq!(plan.layers[1].base_keyspace, 17_576);
        assert_eq!(plan.layers[2].mask, "?l?l?l?l");
        assert_eq!(plan.layers[2].base_keyspace, 456_976);
        assert_eq!(plan.base_keyspace, 475_228);
    }

    #[tokio::test]
    async fn increment_inverse_reverses_dispatch_order() {
        let artifacts = MemoryArtifactStore::new();
        let calc = KeyspaceCalculator::new(&artifacts, policy());

        let plan = calc
            .compute(
                &AttackConfig::Mask {
                    mask: MaskSpec::new("?l?l?l?l"),
                    increment_mode: IncrementMode::IncrementInverse,
                    increment_min: Some(2),
                    increment_max: Some(4),
                },
                &hashlist(10),
            )
            .await
            .expect("plan");
        assert_eq!(plan.layers[0].mask, "?l?l?l?l");
        assert_eq!(plan.layers[0].layer_index, 1);
        assert_eq!(plan.layers[2].mask, "?l?l");
    }

    #[tokio::test]
    async fn custom_charsets_resolve() {
        let artifacts = MemoryArtifactStore::new();
        let calc = KeyspaceCalculator::new(&artifacts, policy());

        let mut mask = MaskSpec::new("?1?d");
        mask.custom_charset_1 = Some("abc".into());
        let plan = calc
            .compute(
                &AttackConfig::Mask {
                    mask,
                    increment_mode: IncrementMode::Off,
                    increment_min: None,
                    increment_max: None,
                },
                &hashlist(10),
            )
            .await
            .expect("plan");
        assert_eq!(plan.base_keyspace, 30);

        let undefined = calc
            .compute(
                &AttackConfig::Mask {
                    mask: MaskSpec::new("?2"),
                    increment_mode: IncrementMode::Off,
                    increment_min: None,
                    increment_max: None,
                },
                &hashlist(10),
            )
            .await;
        assert!(matches!(undefined, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn keyspace_overflow_rejected() {
        let artifacts = MemoryArtifactStore::new();
        let calc = KeyspaceCalculator::new(
            &artifacts,
            KeyspacePolicy {
                max_keyspace: 1_000_000,
                rule_split: policy().rule_split,
            },
        );

        let result = calc
            .compute(
                &AttackConfig::Mask {
                    mask: MaskSpec::new("?a?a?a?a?a"),
                    increment_mode: IncrementMode::Off,
                    increment_min: None,
                    increment_max: None,
                },
                &hashlist(10),
            )
            .await;
        assert!(matches!(result, Err(CoreError::KeyspaceOverflow(_))));
    }

    #[tokio::test]
    async fn association_requires_one_to_one() {
        let artifacts = MemoryArtifactStore::new();
        let wordlist_id = artifacts.add_wordlist(100);
        let calc = KeyspaceCalculator::new(&artifacts, policy());

        let ok = calc
            .compute(&AttackConfig::Association { wordlist_id }, &hashlist(100))
            .await
            .expect("plan");
        assert_eq!(ok.effective_keyspace, 100);

        let mismatch = calc
            .compute(&AttackConfig::Association { wordlist_id }, &hashlist(99))
            .await;
        assert!(matches!(mismatch, Err(CoreError::Validation(_))));

        let mut mixed = hashlist(100);
        mixed.has_mixed_work_factors = true;
        let rejected = calc
            .compute(&AttackConfig::Association { wordlist_id }, &mixed)
            .await;
        assert!(matches!(rejected, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn missing_wordlist_surfaces_not_found() {
        let artifacts = MemoryArtifactStore::new();
        let calc = KeyspaceCalculator::new(&artifacts, policy());
        let result = calc
            .compute(
                &AttackConfig::Dictionary {
                    wordlist_id: Uuid::new_v4(),
                    rule_ids: vec![],
                },
                &hashlist(10),
            )
            .await;
        assert!(matches!(result, Err(CoreError::NotFound { .. })));
    }
}
