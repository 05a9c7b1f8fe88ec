//! Destination policy for multi-partition operations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a convergence partition is chosen when an operation's objects live
/// on more than one partition.
///
/// Under both policies ties are broken by the lowest partition id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementPolicy {
    /// Least-loaded partition among those the operation's objects already
    /// occupy. Only objects elsewhere migrate.
    #[default]
    Occupants,

    /// Globally least-loaded partition other than the one holding the
    /// operation's first object. Every object not already there migrates.
    GlobalExcludingSource,
}

impl PlacementPolicy {
    /// Configuration name of the policy.
    pub fn name(&self) -> &'static str {
        match self {
            PlacementPolicy::Occupants => "occupants",
            PlacementPolicy::GlobalExcludingSource => "global_excluding_source",
        }
    }
}

impl fmt::Display for PlacementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PlacementPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "occupants" => Ok(PlacementPolicy::Occupants),
            "global_excluding_source" | "global" => Ok(PlacementPolicy::GlobalExcludingSource),
            other => Err(format!(
                "unknown placement policy '{}': expected 'occupants' or 'global-excluding-source'",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_policy_names() {
        assert_eq!(
            "occupants".parse::<PlacementPolicy>(),
            Ok(PlacementPolicy::Occupants)
        );
        assert_eq!(
            "global-excluding-source".parse::<PlacementPolicy>(),
            Ok(PlacementPolicy::GlobalExcludingSource)
        );
        assert_eq!(
            "Global".parse::<PlacementPolicy>(),
            Ok(PlacementPolicy::GlobalExcludingSource)
        );
        assert!("nearest".parse::<PlacementPolicy>().is_err());
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for policy in [
            PlacementPolicy::Occupants,
            PlacementPolicy::GlobalExcludingSource,
        ] {
            assert_eq!(policy.to_string().parse::<PlacementPolicy>(), Ok(policy));
        }
    }
}
