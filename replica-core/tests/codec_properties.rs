//! Property tests for the fixed-point and dictionary codecs.

use proptest::prelude::*;
use replica_core::fixed_point::{self, FixedFormat};
use std::collections::{BTreeMap, BTreeSet};

fn roundtrip(x: f64, format: FixedFormat) -> f64 {
    let mut out = Vec::new();
    fixed_point::encode_into(x, format, &mut out);
    assert_eq!(out.len(), format.width());
    fixed_point::decode(&out, format).unwrap()
}

proptest! {
    #[test]
    fn prop_fp168_within_bound(x in -32000.0f64..32000.0) {
        prop_assert!((roundtrip(x, FixedFormat::Fp168) - x).abs() <= 1.0 / 256.0);
    }

    #[test]
    fn prop_fp412_within_bound(x in -7.9f64..7.9) {
        prop_assert!((roundtrip(x, FixedFormat::Fp412) - x).abs() <= 1.0 / 4096.0);
    }

    #[test]
    fn prop_fp1616_within_bound(x in -32000.0f64..32000.0) {
        prop_assert!((roundtrip(x, FixedFormat::Fp1616) - x).abs() <= 1.0 / 65536.0);
    }

    #[test]
    fn prop_out_of_range_saturates(x in 40000.0f64..1.0e12) {
        let v = roundtrip(-x, FixedFormat::Fp168);
        prop_assert!((v + FixedFormat::Fp168.max_value()).abs() < 1e-9);
    }

    #[test]
    fn prop_dictionary_restores_mapping(
        labels in proptest::collection::btree_map(any::<u32>(), "[a-z]{1,6}", 0..64),
        little_endian in any::<bool>(),
    ) {
        let records: Vec<(u32, &str)> = labels.iter().map(|(id, s)| (*id, s.as_str())).collect();
        let (dict, pdata) = fixed_point::encode_labels(&records, little_endian);

        let distinct: BTreeSet<&str> = labels.values().map(String::as_str).collect();
        prop_assert_eq!(dict.len(), distinct.len());
        prop_assert!(dict.keys().all(|k| distinct.contains(k.as_str())));

        let ids: BTreeSet<u32> = dict.values().copied().collect();
        prop_assert_eq!(ids, (1..=dict.len() as u32).collect::<BTreeSet<_>>());

        let decoded: BTreeMap<u32, String> =
            fixed_point::decode_labels(&pdata, &dict, little_endian).unwrap().into_iter().collect();
        prop_assert_eq!(decoded, labels);
    }

    #[test]
    fn prop_position_records_roundtrip(
        records in proptest::collection::vec((any::<u32>(), prop::array::uniform3(-1000.0f64..1000.0)), 0..32),
        origin in prop::array::uniform3(-500.0f64..500.0),
    ) {
        let pdata = fixed_point::encode_records(&records, FixedFormat::Fp168, origin, false);
        prop_assert_eq!(pdata.len(), records.len() * 13);
        let back = fixed_point::decode_records::<3>(&pdata, FixedFormat::Fp168, origin, false).unwrap();
        prop_assert_eq!(back.len(), records.len());
        for ((id, v), (bid, bv)) in records.iter().zip(back.iter()) {
            prop_assert_eq!(id, bid);
            for i in 0..3 {
                prop_assert!((v[i] - bv[i]).abs() <= 1.0 / 256.0 + 1e-9);
            }
        }
    }
}

#[test]
fn test_fp168_scenario() {
    let v = fixed_point::decode_fp168(fixed_point::encode_fp168(-12.5));
    assert!((v - (-12.5)).abs() < 0.004);
}
