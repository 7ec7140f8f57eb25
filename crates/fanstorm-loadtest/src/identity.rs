//! Virtual user identities

use fanstorm_core::{IdentityConfig, VirtualUserIdentity};
use rand::distributions::{Alphanumeric, DistString};
use rand::Rng;

/// Random characters appended to the prefix of a brand new account
const NEW_NAME_SUFFIX_LEN: usize = 12;

/// Decides per admission whether a virtual user reuses an existing account
/// or signs up a new one
#[derive(Clone, Debug)]
pub struct IdentityGenerator {
    existing_offset: u64,
    percent_new: u8,
    prefix: String,
}

impl IdentityGenerator {
    /// `percent_new` above 100 is treated as 100
    pub fn new(existing_offset: u64, percent_new: u8, prefix: impl Into<String>) -> Self {
        Self {
            existing_offset,
            percent_new: percent_new.min(100),
            prefix: prefix.into(),
        }
    }

    pub fn from_config(config: &IdentityConfig) -> Self {
        Self::new(config.existing_offset, config.percent_new, config.name_prefix.clone())
    }

    pub fn next(&self, sequence_index: u64) -> VirtualUserIdentity {
        self.next_with(sequence_index, &mut rand::thread_rng())
    }

    /// Weighted draw against `percent_new`, independent for every call
    pub fn next_with<R: Rng + ?Sized>(&self, sequence_index: u64, rng: &mut R) -> VirtualUserIdentity {
        let is_new_user = rng.gen_range(0..100u8) < self.percent_new;
        let display_name = if is_new_user {
            format!("{}{}", self.prefix, Alphanumeric.sample_string(rng, NEW_NAME_SUFFIX_LEN))
        } else {
            self.existing_name(sequence_index)
        };

        VirtualUserIdentity {
            sequence_index,
            is_new_user,
            display_name,
        }
    }

    /// Stable account name for an existing user
    pub fn existing_name(&self, sequence_index: u64) -> String {
        format!("{}{}", self.prefix, self.existing_offset + sequence_index)
    }

    /// The first `count` existing identities, in index order
    pub fn existing_pool(&self, count: u64) -> impl Iterator<Item = VirtualUserIdentity> + '_ {
        (0..count).map(|sequence_index| VirtualUserIdentity {
            sequence_index,
            is_new_user: false,
            display_name: self.existing_name(sequence_index),
        })
    }
}
