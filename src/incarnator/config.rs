//! Incarnator configuration: the immutable view definition.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::evaluator::Evaluator;

/// Truncation depth applied to array-shaped emitted keys before grouping.
///
/// `All` (the config value `0` / `"0"`) collapses every emission into one
/// singleton group; `Depth(n)` keeps the first `n` elements of an
/// array-shaped key and passes other key shapes through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupLevel {
    All,
    Depth(u32),
}

impl GroupLevel {
    pub fn parse(text: &str) -> Option<GroupLevel> {
        match text.parse::<u32>() {
            Ok(0) => Some(GroupLevel::All),
            Ok(n) => Some(GroupLevel::Depth(n)),
            Err(_) => None,
        }
    }

    pub fn depth(&self) -> Option<u32> {
        match self {
            GroupLevel::All => None,
            GroupLevel::Depth(n) => Some(*n),
        }
    }
}

impl fmt::Display for GroupLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupLevel::All => write!(f, "0"),
            GroupLevel::Depth(n) => write!(f, "{}", n),
        }
    }
}

impl Serialize for GroupLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            GroupLevel::All => serializer.serialize_u32(0),
            GroupLevel::Depth(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for GroupLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Accept both `0` and `"0"`: the wire format carried either.
        let raw = Value::deserialize(deserializer)?;
        match &raw {
            Value::Number(n) => match n.as_u64() {
                Some(0) => Ok(GroupLevel::All),
                Some(n) if n <= u32::MAX as u64 => Ok(GroupLevel::Depth(n as u32)),
                _ => Err(D::Error::custom("group level out of range")),
            },
            Value::String(s) => {
                GroupLevel::parse(s).ok_or_else(|| D::Error::custom("bad group level"))
            }
            _ => Err(D::Error::custom("group level must be an integer or \"0\"")),
        }
    }
}

/// One reduction: a reduce source plus the group levels to materialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceConfig {
    #[serde(rename = "function")]
    pub function: String,
    pub group_levels: Vec<GroupLevel>,
}

/// Immutable view definition of one incarnator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncarnatorConfig {
    /// Source collection the map function reads from.
    pub source: String,
    /// Map source text.
    pub map: String,
    /// Reductions by name.
    #[serde(default)]
    pub reduces: BTreeMap<String, ReduceConfig>,
}

impl IncarnatorConfig {
    /// Compile-check every piece of user-supplied source. Malformed
    /// config is rejected here, before any state change, and can never
    /// fail at sync time.
    pub fn validate(&self, evaluator: &dyn Evaluator) -> Result<(), String> {
        evaluator
            .compile_map(&self.map)
            .map_err(|err| format!("map: {}", err))?;
        for (name, reduce) in &self.reduces {
            evaluator
                .compile_reduce(&reduce.function)
                .map_err(|err| format!("reduce {}: {}", name, err))?;
            if reduce.group_levels.is_empty() {
                return Err(format!("reduce {}: no group levels", name));
            }
        }
        Ok(())
    }

    /// Every (reduction, group level) pair this config materializes.
    pub fn incarnations(&self) -> impl Iterator<Item = (&str, GroupLevel)> {
        self.reduces.iter().flat_map(|(name, reduce)| {
            reduce
                .group_levels
                .iter()
                .map(move |gl| (name.as_str(), *gl))
        })
    }

    pub fn has_incarnation(&self, reduce_name: &str, group_level: GroupLevel) -> bool {
        self.reduces
            .get(reduce_name)
            .map(|r| r.group_levels.contains(&group_level))
            .unwrap_or(false)
    }
}
