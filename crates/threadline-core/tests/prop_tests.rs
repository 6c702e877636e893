//! Property-based tests for channel values and store configuration.

use proptest::prelude::*;
use serde_json::Value;

use threadline_core::config::{check_port, sanitize_table_name, POSTGRES_DEFAULT_PORT};
use threadline_core::value::ChannelValue;

fn arb_json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1_000_000i64..1_000_000).prop_map(|n| Value::Number(n.into())),
        "[a-zA-Z0-9_ ]{0,20}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::hash_map("[a-z_]{1,6}", inner, 0..3)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Structural conversion from JSON and back is lossless.
    #[test]
    fn json_conversion_is_lossless(raw in arb_json_value()) {
        let value = ChannelValue::from(raw.clone());
        prop_assert_eq!(value.to_json(), raw);
    }

    /// Serde text encoding agrees with the structural conversion.
    #[test]
    fn serde_roundtrip(raw in arb_json_value()) {
        let value = ChannelValue::from(raw);
        let text = serde_json::to_string(&value).unwrap();
        let back: ChannelValue = serde_json::from_str(&text).unwrap();
        prop_assert_eq!(back, value);
    }

    /// Sanitizing a valid name is idempotent and yields lowercase words
    /// joined by underscores.
    #[test]
    fn sanitize_is_idempotent(raw in "[A-Za-z0-9_]{1,8}( +[A-Za-z0-9_]{1,8}){0,3}") {
        let once = sanitize_table_name(&raw).unwrap();
        prop_assert_eq!(sanitize_table_name(&once).unwrap(), once.clone());
        prop_assert!(!once.contains(' '));
        prop_assert_eq!(once.clone(), once.to_lowercase());
    }

    /// Names carrying SQL punctuation are always rejected.
    #[test]
    fn sanitize_rejects_punctuation(
        prefix in "[a-z]{0,5}",
        bad in "[-;'\"().*]",
        suffix in "[a-z]{0,5}",
    ) {
        let raw = format!("{prefix}{bad}{suffix}");
        prop_assert!(sanitize_table_name(&raw).is_err());
    }

    /// Only the PostgreSQL port is refused.
    #[test]
    fn only_postgres_port_is_refused(port in any::<u16>()) {
        prop_assert_eq!(check_port(port).is_err(), port == POSTGRES_DEFAULT_PORT);
    }
}
