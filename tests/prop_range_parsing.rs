// Property: Range headers the relay can serve from the preload window parse
// to exactly the bytes they name, and everything else is rejected rather
// than misread. The status decision only reports 206 when a range was asked for.

use audio_relay::normalizer::decide_status;
use audio_relay::RangeSpec;
use http::{HeaderMap, StatusCode};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_closed_range_parses(a in 0u64..=u64::MAX / 2, b in 0u64..=u64::MAX / 2) {
        let (start, end) = if a <= b { (a, b) } else { (b, a) };

        let parsed = RangeSpec::from_header(&RangeSpec::closed_header(start, end)).unwrap();
        prop_assert_eq!(parsed, RangeSpec { start, end: Some(end) });
    }

    #[test]
    fn prop_open_range_parses(start in 0u64..=u64::MAX / 2) {
        let parsed = RangeSpec::from_header(&format!("bytes={}-", start)).unwrap();
        prop_assert_eq!(parsed.start, start);
        prop_assert_eq!(parsed.end, None);
    }

    #[test]
    fn prop_inverted_range_rejected(start in 1u64..1_000_000, gap in 1u64..1000) {
        let end = start.saturating_sub(gap);
        prop_assume!(end < start);
        let header = format!("bytes={}-{}", start, end);
        prop_assert!(RangeSpec::from_header(&header).is_err());
    }

    #[test]
    fn prop_suffix_and_multipart_rejected(n in 1u64..1_000_000, m in 1u64..1_000_000) {
        let suffix = format!("bytes=-{}", n);
        prop_assert!(RangeSpec::from_header(&suffix).is_err());
        let multipart = format!("bytes=0-{},{}-{}", n, n + 1, n + m);
        prop_assert!(RangeSpec::from_header(&multipart).is_err());
        let wrong_unit = format!("items=0-{}", n);
        prop_assert!(RangeSpec::from_header(&wrong_unit).is_err());
    }

    #[test]
    fn prop_206_only_when_range_requested(
        status in prop::sample::select(vec![200u16, 206, 404, 500]),
        with_content_range in any::<bool>(),
    ) {
        let upstream = StatusCode::from_u16(status).unwrap();
        let mut headers = HeaderMap::new();
        if with_content_range {
            headers.insert("content-range", "bytes 0-9/100".parse().unwrap());
        }

        // Without a Range request the upstream status passes through
        prop_assert_eq!(decide_status(false, upstream, &headers), upstream);

        let ranged = decide_status(true, upstream, &headers);
        if status == 206 || with_content_range {
            prop_assert_eq!(ranged, StatusCode::PARTIAL_CONTENT);
        } else {
            prop_assert_eq!(ranged, upstream);
        }
    }
}
