//! Key/value run configuration.
//!
//! Options come as opaque `key = value` pairs, from a properties file or
//! from the command line, and are applied on top of the defaults in order:
//!
//! ```text
//! # search
//! search.order = random
//! search.seed = 42
//! search.depth_limit = 30
//! vm.scheduling = reduced
//! perturb.methods = Calc.scale, Calc.offset(I)I
//! vm.inject = IllegalStateException("closed")@Store.put:3; IOError@Disk.read
//! idle.max_backjumps = 500
//! ```

use crate::error::{ConfigError, ConfigResult};
use crate::search::{SearchConfig, SearchOrder};
use crate::state::SerializerKind;
use rove_vm::{IdleAction, PolicyKind, VmConfig};
use tracing::debug;

/// Every key [`RunConfig`] understands.
pub const KEYS: &[&str] = &[
    "search.order",
    "search.seed",
    "search.match_state",
    "search.match_depth",
    "search.multiple_errors",
    "search.check_deadlock",
    "search.check_races",
    "search.check_cycles",
    "search.max_states",
    "search.depth_limit",
    "search.time_limit",
    "search.memory_limit",
    "search.serializer",
    "search.full_images",
    "search.parallel",
    "search.threads",
    "vm.scheduling",
    "vm.max_transition_length",
    "vm.gc",
    "vm.max_array_length",
    "vm.inject",
    "idle.max_backjumps",
    "idle.action",
    "cg.break_single_choice",
    "cg.break_lock_release",
    "cg.break_notify",
    "cg.break_yield",
    "perturb.methods",
    "perturb.seed",
];

#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub vm: VmConfig,
    pub search: SearchConfig,
    /// Seed for a random search order, kept until the order is random.
    seed: Option<u64>,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_pairs(pairs)?;
        Ok(config)
    }

    /// Parse a properties file: one `key = value` per line, `#` comments.
    pub fn from_properties_str(text: &str) -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_properties_str(text)?;
        Ok(config)
    }

    pub fn apply_properties_str(&mut self, text: &str) -> ConfigResult<()> {
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = split_pair(line).ok_or_else(|| ConfigError::Syntax {
                line: n + 1,
                text: line.to_string(),
            })?;
            self.apply(key, value)?;
        }
        Ok(())
    }

    pub fn apply_pairs<'a>(
        &mut self,
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> ConfigResult<()> {
        for (key, value) in pairs {
            self.apply(key.trim(), value.trim())?;
        }
        Ok(())
    }

    /// Apply a `key=value` option as given on the command line.
    pub fn apply_option(&mut self, option: &str) -> ConfigResult<()> {
        let (key, value) = split_pair(option).ok_or_else(|| ConfigError::Syntax {
            line: 0,
            text: option.to_string(),
        })?;
        self.apply(key, value)
    }

    pub fn apply(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        debug!(key, value, "option");
        let search = &mut self.search;
        let vm = &mut self.vm;
        match key {
            "search.order" => {
                search.order = SearchOrder::from_name(value, self.seed.unwrap_or(0))
                    .ok_or_else(|| invalid(key, value, "dfs, bfs or random"))?;
            }
            "search.seed" => {
                self.seed = Some(parse_num(key, value)?);
            }
            "search.match_state" => search.state_matching = parse_bool(key, value)?,
            "search.match_depth" => search.match_depth = parse_bool(key, value)?,
            "search.multiple_errors" => search.multiple_errors = parse_bool(key, value)?,
            "search.check_deadlock" => search.check_deadlock = parse_bool(key, value)?,
            "search.check_races" => search.check_races = parse_bool(key, value)?,
            "search.check_cycles" => search.check_cycles = parse_bool(key, value)?,
            "search.max_states" => search.max_states = parse_num(key, value)?,
            "search.depth_limit" => search.max_depth = parse_num(key, value)?,
            "search.time_limit" => search.max_time_secs = parse_num(key, value)?,
            "search.memory_limit" => search.memory_limit_mb = parse_num(key, value)?,
            "search.serializer" => {
                search.serializer = SerializerKind::from_name(value)
                    .ok_or_else(|| invalid(key, value, "heap or canonical"))?;
            }
            "search.full_images" => search.full_images = parse_bool(key, value)?,
            "search.parallel" => search.parallel = parse_bool(key, value)?,
            "search.threads" => search.num_threads = parse_num(key, value)?,
            "vm.scheduling" => {
                vm.policy = PolicyKind::from_name(value)
                    .ok_or_else(|| invalid(key, value, "all or reduced"))?;
            }
            "vm.max_transition_length" => {
                let n: usize = parse_num(key, value)?;
                if n == 0 {
                    return Err(invalid(key, value, "a positive integer"));
                }
                vm.max_transition_length = n;
            }
            "vm.gc" => vm.gc = parse_bool(key, value)?,
            "vm.max_array_length" => vm.max_array_length = parse_num(key, value)?,
            "vm.inject" => {
                vm.inject = value
                    .split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
            "idle.max_backjumps" => vm.idle_max_backjumps = parse_num(key, value)?,
            "idle.action" => {
                vm.idle_action = IdleAction::from_name(value)
                    .ok_or_else(|| invalid(key, value, "warn, break, yield, prune or jump"))?;
            }
            "cg.break_single_choice" => vm.break_single_choice = parse_bool(key, value)?,
            "cg.break_lock_release" => vm.break_lock_release = parse_bool(key, value)?,
            "cg.break_notify" => vm.break_notify = parse_bool(key, value)?,
            "cg.break_yield" => vm.break_yield = parse_bool(key, value)?,
            "perturb.methods" => {
                vm.perturb = value
                    .split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(String::from)
                    .collect();
            }
            "perturb.seed" => vm.perturb_seed = parse_num(key, value)?,
            _ => {
                return Err(ConfigError::UnknownKey {
                    key: key.to_string(),
                })
            }
        }
        if let (Some(s), SearchOrder::RandomDepthFirst { seed }) = (self.seed, &mut self.search.order) {
            *seed = s;
        }
        Ok(())
    }
}

fn split_pair(text: &str) -> Option<(&str, &str)> {
    let (key, value) = text.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}

fn invalid(key: &str, value: &str, expected: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        expected,
    }
}

fn parse_bool(key: &str, value: &str) -> ConfigResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(key, value, "a boolean")),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value
        .parse()
        .map_err(|_| invalid(key, value, "a non-negative integer"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunConfig::from_pairs([]).unwrap();
        assert_eq!(config.vm, VmConfig::default());
        assert_eq!(config.search.order, SearchOrder::DepthFirst);
        assert!(config.search.state_matching);
    }

    #[test]
    fn test_every_key_is_accepted() {
        let value = |key: &str| match key {
            "search.order" => "bfs",
            "search.serializer" => "heap",
            "vm.scheduling" => "reduced",
            "perturb.methods" => "A.b",
            "vm.inject" => "Error@A.b",
            "idle.action" => "prune",
            k if k.starts_with("search.match")
                || k.starts_with("cg.")
                || k == "vm.gc"
                || k == "search.multiple_errors"
                || k.starts_with("search.check_")
                || k == "search.full_images"
                || k == "search.parallel" =>
            {
                "true"
            }
            _ => "3",
        };
        let mut config = RunConfig::new();
        for key in KEYS {
            config.apply(key, value(key)).unwrap_or_else(|e| panic!("{key}: {e}"));
        }
        assert_eq!(config.search.order, SearchOrder::BreadthFirst);
        assert_eq!(config.search.max_depth, 3);
        assert_eq!(config.vm.policy, PolicyKind::Reduced);
        assert_eq!(config.vm.perturb, ["A.b"]);
        assert!(config.vm.break_single_choice);
        assert!(config.search.check_races);
        assert!(config.search.check_cycles);
        assert_eq!(config.vm.inject, ["Error@A.b"]);
        assert_eq!(config.vm.idle_max_backjumps, 3);
        assert_eq!(config.vm.idle_action, IdleAction::Prune);
        assert_eq!(config.vm.max_array_length, 3);
    }

    #[test]
    fn test_properties_file() {
        let text = "
# limits
search.max_states = 1000
search.time_limit=60

search.order = random
search.seed = 42
perturb.methods = Calc.scale, Calc.offset(I)I ,
cg.break_yield = off
";
        let config = RunConfig::from_properties_str(text).unwrap();
        assert_eq!(config.search.max_states, 1000);
        assert_eq!(config.search.max_time_secs, 60);
        assert_eq!(config.search.order, SearchOrder::RandomDepthFirst { seed: 42 });
        assert_eq!(config.vm.perturb, ["Calc.scale", "Calc.offset(I)I"]);
        assert!(!config.vm.break_yield);
    }

    #[test]
    fn test_injections_split_on_semicolons() {
        let config = RunConfig::from_pairs([(
            "vm.inject",
            r#"IllegalStateException("a, b")@Store.put(II)V:3 ; Error@Disk.read;"#,
        )])
        .unwrap();
        assert_eq!(
            config.vm.inject,
            [r#"IllegalStateException("a, b")@Store.put(II)V:3"#, "Error@Disk.read"]
        );
        assert!(matches!(
            RunConfig::from_pairs([("idle.action", "sleep")]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_seed_before_order() {
        let config =
            RunConfig::from_pairs([("search.seed", "7"), ("search.order", "random")]).unwrap();
        assert_eq!(config.search.order, SearchOrder::RandomDepthFirst { seed: 7 });
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            RunConfig::from_pairs([("search.colour", "red")]).unwrap_err(),
            ConfigError::UnknownKey {
                key: "search.colour".into()
            }
        );
        assert!(matches!(
            RunConfig::from_pairs([("search.max_states", "-1")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            RunConfig::from_pairs([("search.parallel", "maybe")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            RunConfig::from_pairs([("vm.max_transition_length", "0")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(
            RunConfig::from_properties_str("search.order dfs").unwrap_err(),
            ConfigError::Syntax {
                line: 1,
                text: "search.order dfs".into()
            }
        );
        let mut config = RunConfig::new();
        assert!(config.apply_option("search.depth_limit=12").is_ok());
        assert_eq!(config.search.max_depth, 12);
        assert!(config.apply_option("=3").is_err());
    }
}
