use mpu_ingest::normalize::{EXCLUDED_PROFILE_KEYS, RESTRICTED_EVENTS};
use mpu_ingest::record::{Properties, MAX_PROPERTIES};
use mpu_ingest::{EventRecord, ProfileRecord, PropertyValue, RecordNormalizer};
use proptest::prelude::*;
use serde_json::{json, Value};

fn normalizer() -> RecordNormalizer {
    RecordNormalizer::default().with_clock(|| 1_700_000_000)
}

fn arb_value() -> impl Strategy<Value = Option<PropertyValue>> {
    let leaf = prop_oneof![
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
    ];
    prop_oneof![
        4 => leaf.clone().prop_map(|v| Some(PropertyValue::from(v))),
        1 => proptest::collection::vec(leaf, 0..4).prop_map(|v| Some(PropertyValue::from(Value::Array(v)))),
        1 => Just(None),
    ]
}

fn arb_profile_key() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => "\\$?[a-z_]{1,10}",
        1 => prop::sample::select(vec![
            "$email", "email", "Email", "$phone", "phone", "Phone", "Date Of Birth", "$name",
            "$date_of_birth", "$timezone",
        ])
        .prop_map(String::from),
    ]
}

fn arb_properties(
    key: impl Strategy<Value = String>,
    max: usize,
) -> impl Strategy<Value = Properties> {
    proptest::collection::btree_map(key, arb_value(), 0..max)
}

fn arb_event_name() -> impl Strategy<Value = String> {
    prop_oneof![
        prop::sample::select(RESTRICTED_EVENTS.to_vec()).prop_map(String::from),
        "[A-Za-z][A-Za-z ]{0,15}",
    ]
}

fn event(name: &str, mut properties: Properties, identity: bool, time: bool) -> EventRecord {
    if identity {
        properties.insert("distinct_id".into(), Some(PropertyValue::from(json!("u1"))));
    }
    if time {
        properties.insert("time".into(), Some(PropertyValue::from(json!(1000))));
    }
    EventRecord {
        event_name: name.to_string(),
        properties,
    }
}

proptest! {
    #[test]
    fn profile_output_excludes_pii_and_respects_cap(
        identity in "[a-z0-9]{1,8}",
        properties in arb_properties(arb_profile_key(), 400),
    ) {
        let record = ProfileRecord { identity, properties };
        let canonical = normalizer().normalize_profile(record).unwrap();

        prop_assert!(canonical.data().len() <= MAX_PROPERTIES);
        for key in EXCLUDED_PROFILE_KEYS {
            prop_assert!(!canonical.data().contains_key(*key));
        }
        prop_assert!(canonical.data().values().all(|v| !v.is_null()));
    }

    #[test]
    fn event_missing_required_field_yields_nothing(
        name in arb_event_name(),
        properties in arb_properties("[a-z]{1,8}", 20),
        missing in 0usize..3,
    ) {
        let record = match missing {
            0 => event("", properties, true, true),
            1 => event(&name, properties, false, true),
            _ => event(&name, properties, true, false),
        };
        prop_assert!(normalizer().normalize_event(record).is_none());
    }

    #[test]
    fn restricted_event_names_are_prefixed(
        name in arb_event_name(),
        properties in arb_properties("[a-z]{1,8}", 20),
    ) {
        let canonical = normalizer()
            .normalize_event(event(&name, properties, true, true))
            .unwrap();

        let expected = if RESTRICTED_EVENTS.contains(&name.as_str()) {
            format!("_{}", name)
        } else {
            name.clone()
        };
        prop_assert_eq!(canonical.name(), Some(expected.as_str()));
        prop_assert!(canonical.data().len() <= MAX_PROPERTIES);
        prop_assert!(!canonical.data().contains_key("distinct_id"));
        prop_assert!(!canonical.data().contains_key("time"));
    }

    #[test]
    fn normalized_profile_is_a_fixed_point(
        identity in "[a-z0-9]{1,8}",
        properties in arb_properties("[a-z_][a-z_ ]{0,10}", 300),
    ) {
        let normalizer = normalizer();
        let once = normalizer
            .normalize_profile(ProfileRecord { identity: identity.clone(), properties })
            .unwrap();

        let reshaped: Properties = once
            .data()
            .iter()
            .map(|(k, v)| (k.clone(), Some(PropertyValue::from(v.clone()))))
            .collect();
        let twice = normalizer
            .normalize_profile(ProfileRecord { identity, properties: reshaped })
            .unwrap();

        prop_assert_eq!(once, twice);
    }
}
