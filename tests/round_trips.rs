//! Round-trip and matcher laws, property-based.

use composite_controls::message::DeviceMessage;
use composite_controls::meta::{
    Address, BoolConverter, DoubleConverter, LongConverter, Meta, MetaConverter, Name, NameToken,
    StringConverter, Value,
};
use composite_controls::state::Quality;
use proptest::prelude::*;

fn token_body() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,7}"
}

fn name_token() -> impl Strategy<Value = NameToken> {
    (token_body(), proptest::option::of("[a-z0-9]{1,3}")).prop_map(|(body, index)| match index {
        Some(index) => NameToken::indexed(body, index),
        None => NameToken::new(body),
    })
}

fn arb_name() -> impl Strategy<Value = Name> {
    proptest::collection::vec(name_token(), 1..5).prop_map(Name::from_tokens)
}

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(Value::Int),
        any::<i64>().prop_map(Value::Long),
        // NaN breaks equality; stick to finite doubles
        (-1.0e12f64..1.0e12).prop_map(Value::Double),
        "[ -~]{0,16}".prop_map(Value::String),
    ]
}

proptest! {
    #[test]
    fn name_parse_print_round_trip(name in arb_name()) {
        let printed = name.to_string();
        let parsed = Name::parse(&printed).unwrap();
        prop_assert_eq!(parsed, name);
    }

    #[test]
    fn address_parse_print_round_trip(route in arb_name(), device in arb_name()) {
        let address = Address::new(route, device);
        let parsed: Address = address.to_string().parse().unwrap();
        prop_assert_eq!(parsed, address);
    }

    #[test]
    fn meta_print_parse_round_trip(entries in proptest::collection::vec((token_body(), scalar()), 0..6)) {
        let mut meta = Meta::new();
        for (key, value) in entries {
            meta.set_value(&Name::of(NameToken::new(key)), value).unwrap();
        }
        meta.seal();
        let parsed = Meta::parse(&meta.print()).unwrap();
        prop_assert_eq!(parsed, meta);
    }

    #[test]
    fn double_converter_round_trip(value in -1.0e12f64..1.0e12) {
        let meta = DoubleConverter.to_meta(&value);
        prop_assert_eq!(DoubleConverter.from_meta(&meta).unwrap(), value);
    }

    #[test]
    fn long_converter_round_trip(value in any::<i64>()) {
        let meta = LongConverter.to_meta(&value);
        prop_assert_eq!(LongConverter.from_meta(&meta).unwrap(), value);
    }

    #[test]
    fn bool_converter_round_trip(value in any::<bool>()) {
        let meta = BoolConverter.to_meta(&value);
        prop_assert_eq!(BoolConverter.from_meta(&meta).unwrap(), value);
    }

    #[test]
    fn string_converter_round_trip(value in "[ -~]{0,24}") {
        let meta = StringConverter.to_meta(&value);
        prop_assert_eq!(StringConverter.from_meta(&meta).unwrap(), value);
    }

    #[test]
    fn message_serde_round_trip(device in arb_name(), property in arb_name(), value in scalar()) {
        let message = DeviceMessage::PropertyChanged {
            source: Address::new(Name::of(NameToken::new("hub")), device),
            property,
            value: Meta::of(value),
            quality: Quality::Ok,
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_string(&message).unwrap();
        let back: DeviceMessage = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, message);
    }

    #[test]
    fn match_rest_matches_everything(topic in arb_name()) {
        prop_assert!(topic.matches(&Name::parse("**").unwrap()));
    }

    #[test]
    fn exact_pattern_matches_only_itself(topic in arb_name(), other in arb_name()) {
        prop_assert!(topic.matches(&topic));
        if topic != other {
            prop_assert!(!topic.matches(&other) || !other.matches(&topic));
        }
    }

    #[test]
    fn prefix_match_rest(topic in arb_name(), suffix in proptest::collection::vec(name_token(), 0..3)) {
        let longer = topic.plus(&Name::from_tokens(suffix));
        let pattern = topic.child(NameToken::new("**"));
        // `a.**` matches `a` itself and everything under it
        prop_assert!(topic.matches(&pattern));
        prop_assert!(longer.matches(&pattern));
    }

    #[test]
    fn single_wildcard_consumes_one_token(topic in arb_name()) {
        if topic.len() >= 2 {
            let mut tokens: Vec<NameToken> = topic.tokens().to_vec();
            tokens[0] = NameToken::new("*");
            let pattern = Name::from_tokens(tokens);
            prop_assert!(topic.matches(&pattern));
        }
    }
}

#[test]
fn wildcard_pattern_examples() {
    let matches = |pattern: &str, topic: &str| {
        Name::parse(topic).unwrap().matches(&Name::parse(pattern).unwrap())
    };
    assert!(matches("**", "a.b.c"));
    assert!(matches("a.*.c", "a.b.c"));
    assert!(!matches("a.*.c", "a.b.d"));
    assert!(matches("a.**", "a"));
    assert!(matches("a.**", "a.b.c"));
    assert!(!matches("a.b", "a.b.c"));
}
