use super::*;
use serde_json::json;

#[test]
fn dispatch_arguments_parse_as_json() {
    let args = Args::try_parse_from(["desktop", "dispatch", "counter", "inc", "2"]).expect("args");
    let Command::Dispatch { widget, name, args } = args.command else {
        panic!("expected dispatch");
    };
    assert_eq!((widget.as_str(), name.as_str()), ("counter", "inc"));
    let values: Vec<Value> = args.iter().map(|arg| parse_value(arg)).collect();
    assert_eq!(values, vec![json!(2)]);
    assert_eq!(values[0].as_i64(), Some(2));
}

#[test]
fn unparsable_arguments_stay_strings() {
    assert_eq!(parse_value("hello"), json!("hello"));
    assert_eq!(parse_value(r#"{"by":2}"#), json!({ "by": 2 }));
}

#[test]
fn dotted_paths_split_into_keys_and_indices() {
    assert_eq!(
        parse_path("state.items.0"),
        vec![
            PathSegment::from("state"),
            PathSegment::from("items"),
            PathSegment::Index(0),
        ]
    );
    assert!(parse_path("").is_empty());
}
