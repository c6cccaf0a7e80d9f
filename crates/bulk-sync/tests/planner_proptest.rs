use bulk_sync::config::RangePolicy;
use bulk_sync::planner::{plan, Boundary, KeyDomain, Range};
use proptest::prelude::*;

fn assert_exact_cover(ranges: &[Range], min_key: i64, max_key: i64) -> Result<(), TestCaseError> {
    prop_assert!(!ranges.is_empty());
    prop_assert_eq!(ranges[0].lower, min_key);
    prop_assert_eq!(ranges[ranges.len() - 1].upper, max_key + 1);
    for pair in ranges.windows(2) {
        prop_assert_eq!(pair[0].upper, pair[1].lower);
    }
    for (i, r) in ranges.iter().enumerate() {
        prop_assert!(r.lower < r.upper);
        prop_assert_eq!(r.id as usize, i + 1);
    }
    Ok(())
}

proptest! {
    #[test]
    fn fixed_width_covers_domain(
        min_key in -1_000_000_i64..1_000_000,
        span in 0_i64..5_000_000,
        total_rows in 0_u64..10_000_000,
        rows_per_range in 1_u64..2_000_000,
        max_range_rows in 1_u64..5_000_000,
    ) {
        let domain = KeyDomain { min_key, max_key: min_key + span, total_rows };
        let policy = RangePolicy::FixedWidth { rows_per_range, range_width: None };
        let ranges = plan(&policy, &domain, max_range_rows).expect("valid input must plan");

        assert_exact_cover(&ranges, domain.min_key, domain.max_key)?;
        for r in &ranges {
            prop_assert!(r.estimated_rows <= max_range_rows || r.upper - r.lower == 1);
        }
    }

    #[test]
    fn data_driven_covers_domain(
        min_key in 0_i64..1_000,
        cuts in prop::collection::vec((1_i64..500, 0_i64..200, 0_u64..50_000), 1..20),
        max_range_rows in 100_u64..100_000,
    ) {
        // Build ascending, non-overlapping boundaries with random gaps between them.
        let mut lower = min_key;
        let mut boundaries = Vec::new();
        for (width, gap, estimated_rows) in &cuts {
            lower += gap;
            boundaries.push(Boundary { lower, upper: lower + width, estimated_rows: *estimated_rows });
            lower += width;
        }
        let domain = KeyDomain { min_key, max_key: lower + 10, total_rows: 0 };
        let policy = RangePolicy::DataDriven { boundaries };
        let ranges = plan(&policy, &domain, max_range_rows).expect("valid input must plan");

        assert_exact_cover(&ranges, domain.min_key, domain.max_key)?;

        let again = plan(&policy, &domain, max_range_rows).expect("valid input must plan");
        prop_assert_eq!(ranges, again);
    }
}
