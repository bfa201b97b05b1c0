//! Soundness properties of the search over generated programs.
//!
//! - a reported violation replays to the same state
//! - every search order reaches the same set of states
//! - without state matching every path is enumerated
//! - locking removes the lost update
//! - the state limit is exact

use proptest::prelude::*;
use rove_mc::{Limit, SearchConfig, SearchOrder, SearchStatus};
use rove_soundness::{check_source, choice_program, counter_program, replay_violation};
use rove_vm::{PolicyKind, VmConfig};

fn order_strategy() -> impl Strategy<Value = SearchOrder> {
    prop_oneof![
        Just(SearchOrder::DepthFirst),
        Just(SearchOrder::BreadthFirst),
        any::<u64>().prop_map(|seed| SearchOrder::RandomDepthFirst { seed }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        .. ProptestConfig::default()
    })]

    #[test]
    fn violations_replay_to_same_state(
        workers in 2usize..=3,
        increments in 1usize..=2,
        order in order_strategy(),
    ) {
        let src = counter_program(workers, increments, false);
        let config = SearchConfig { order, ..SearchConfig::default() };
        let report = check_source(&src, VmConfig::default(), config).unwrap();
        prop_assert_eq!(report.status, SearchStatus::Halted);

        let violation = &report.violations[0];
        let replayed = replay_violation(&src, VmConfig::default(), violation).unwrap();
        prop_assert_eq!(replayed.fingerprint, violation.fingerprint);
        prop_assert_eq!(replayed.steps, violation.depth);
        let found = replayed.violation.unwrap();
        prop_assert_eq!(&found.message, &violation.message);
    }

    #[test]
    fn search_orders_reach_same_states(
        workers in 1usize..=3,
        order in order_strategy(),
        reduced in any::<bool>(),
    ) {
        let src = counter_program(workers, 1, true);
        let vm_config = VmConfig {
            policy: if reduced { PolicyKind::Reduced } else { PolicyKind::AllRunnables },
            ..VmConfig::default()
        };
        let dfs = check_source(&src, vm_config.clone(), SearchConfig::default()).unwrap();
        let other = check_source(
            &src,
            vm_config,
            SearchConfig { order, ..SearchConfig::default() },
        )
        .unwrap();
        prop_assert!(dfs.is_complete());
        prop_assert!(other.is_complete());
        prop_assert_eq!(other.stats.states, dfs.stats.states);
        prop_assert_eq!(other.stats.transitions, dfs.stats.transitions);
    }

    #[test]
    fn every_path_is_enumerated_without_matching(
        lo in -2i32..=2,
        width in 0i32..=3,
        booleans in 0usize..=3,
    ) {
        let src = choice_program(lo, lo + width, booleans);
        let config = SearchConfig { state_matching: false, ..SearchConfig::default() };
        let report = check_source(&src, VmConfig::default(), config).unwrap();
        prop_assert!(report.is_complete());
        let paths = (width as usize + 1) << booleans;
        prop_assert_eq!(report.stats.end_states, paths);
        prop_assert_eq!(report.stats.revisited, 0);
    }

    #[test]
    fn locking_prevents_lost_update(workers in 1usize..=3, increments in 1usize..=2) {
        let src = counter_program(workers, increments, true);
        let report = check_source(&src, VmConfig::default(), SearchConfig::default()).unwrap();
        prop_assert!(report.is_complete(), "{}", report.status);
        prop_assert!(!report.has_violations());
    }

    #[test]
    fn state_limit_is_exact(limit in 1usize..=40) {
        let src = counter_program(2, 1, true);
        let full = check_source(&src, VmConfig::default(), SearchConfig::default()).unwrap();
        let config = SearchConfig { max_states: limit, ..SearchConfig::default() };
        let report = check_source(&src, VmConfig::default(), config).unwrap();
        if limit <= full.stats.states {
            prop_assert_eq!(report.status, SearchStatus::Incomplete(Limit::States));
            prop_assert_eq!(report.stats.states, limit);
        } else {
            prop_assert!(report.is_complete());
            prop_assert_eq!(report.stats.states, full.stats.states);
        }
    }

    #[test]
    fn depth_limit_bounds_paths(limit in 1usize..=6) {
        let src = counter_program(2, 1, false);
        let config = SearchConfig {
            max_depth: limit,
            multiple_errors: true,
            ..SearchConfig::default()
        };
        let report = check_source(&src, VmConfig::default(), config).unwrap();
        prop_assert!(report.stats.max_depth <= limit);
        prop_assert!(report.violations.iter().all(|v| v.depth <= limit));
    }
}
