use super::*;

#[test]
fn parses_state_update() {
    let cmd = parse_command(r#"{"type":"stateUpdate","lat":12.5,"lng":-3.25,"zoom":4}"#).unwrap();
    assert_eq!(cmd, Command::StateUpdate { lat: 12.5, lng: -3.25, zoom: 4 });
    assert_eq!(cmd.kind(), "stateUpdate");
}

#[test]
fn parses_map_change_with_camel_case_map_name() {
    let cmd = parse_command(r#"{"type":"mapChange","mapName":"Huanglong","lat":1,"lng":2,"zoom":0}"#).unwrap();
    assert_eq!(
        cmd,
        Command::MapChange { map_name: "Huanglong".into(), lat: 1.0, lng: 2.0, zoom: 0 }
    );
}

#[test]
fn pan_by_fields_are_optional() {
    let cmd = parse_command(r#"{"type":"panBy","dy":-50}"#).unwrap();
    assert_eq!(cmd, Command::PanBy { dx: None, dy: Some(-50.0) });

    let cmd = parse_command(r#"{"type":"panBy"}"#).unwrap();
    assert_eq!(cmd, Command::PanBy { dx: None, dy: None });
}

#[test]
fn pan_by_accepts_legacy_x_y_keys() {
    let cmd = parse_command(r#"{"type":"panBy","x":50}"#).unwrap();
    assert_eq!(cmd, Command::PanBy { dx: Some(50.0), dy: None });
}

#[test]
fn unit_commands_ignore_extra_fields() {
    assert_eq!(parse_command(r#"{"type":"zoomIn"}"#).unwrap(), Command::ZoomIn);
    assert_eq!(parse_command(r#"{"type":"zoomOut","source":"panel"}"#).unwrap(), Command::ZoomOut);
}

#[test]
fn rejects_invalid_json() {
    let err = parse_command("{not json").unwrap_err();
    assert!(matches!(err, MalformedCommand::InvalidJson(_)));
    assert_eq!(err.error_code(), "E_MALFORMED_COMMAND");
}

#[test]
fn rejects_missing_or_non_string_type() {
    assert!(matches!(parse_command(r#"{"lat":1}"#), Err(MalformedCommand::MissingType)));
    assert!(matches!(parse_command(r#"{"type":7}"#), Err(MalformedCommand::MissingType)));
    assert!(matches!(parse_command("[1,2,3]"), Err(MalformedCommand::MissingType)));
}

#[test]
fn rejects_unknown_type_explicitly() {
    let err = parse_command(r#"{"type":"teleport","lat":1,"lng":2}"#).unwrap_err();
    match err {
        MalformedCommand::UnknownType(kind) => assert_eq!(kind, "teleport"),
        other => panic!("expected UnknownType, got {other:?}"),
    }
}

#[test]
fn rejects_missing_required_field() {
    let err = parse_command(r#"{"type":"jumpTo","lat":1}"#).unwrap_err();
    match err {
        MalformedCommand::InvalidFields { kind, .. } => assert_eq!(kind, "jumpTo"),
        other => panic!("expected InvalidFields, got {other:?}"),
    }
}

#[test]
fn rejects_non_numeric_value() {
    let err = parse_command(r#"{"type":"stateUpdate","lat":"north","lng":2,"zoom":1}"#).unwrap_err();
    assert!(matches!(err, MalformedCommand::InvalidFields { .. }));
}

#[test]
fn rejects_fractional_zoom() {
    let err = parse_command(r#"{"type":"stateUpdate","lat":1,"lng":2,"zoom":2.5}"#).unwrap_err();
    assert!(matches!(err, MalformedCommand::InvalidFields { .. }));
}

#[test]
fn check_finite_flags_offending_field() {
    let cmd = Command::JumpTo { lat: 1.0, lng: f64::INFINITY };
    match cmd.check_finite() {
        Err(MalformedCommand::NonFinite { kind, field }) => {
            assert_eq!(kind, "jumpTo");
            assert_eq!(field, "lng");
        }
        other => panic!("expected NonFinite, got {other:?}"),
    }
    assert!(Command::PanBy { dx: Some(f64::NAN), dy: None }.check_finite().is_err());
    assert!(Command::ZoomIn.check_finite().is_ok());
}

#[test]
fn server_message_uses_flat_type_tag() {
    let msg = ServerMessage::StateUpdate { lat: 1.5, lng: 2.5, zoom: 3, version: 9 };
    let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
    assert_eq!(value["type"], "stateUpdate");
    assert_eq!(value["lat"], 1.5);
    assert_eq!(value["zoom"], 3);
    assert_eq!(value["version"], 9);
}

#[test]
fn map_change_message_carries_full_state() {
    let view = MapViewState {
        map_name: "official_map".into(),
        lat: -12.0,
        lng: 44.0,
        zoom: 2,
        version: 5,
    };
    let msg = ServerMessage::map_change(&view);
    let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
    assert_eq!(value["type"], "mapChange");
    assert_eq!(value["mapName"], "official_map");
    assert_eq!(value["lat"], -12.0);
    assert_eq!(value["lng"], 44.0);
    assert_eq!(value["zoom"], 2);
    assert_eq!(msg.version(), Some(5));
}

#[test]
fn client_count_update_has_no_version() {
    let msg = ServerMessage::ClientCountUpdate { count: 3 };
    assert_eq!(msg.version(), None);
    assert_eq!(msg.to_json().unwrap(), r#"{"type":"clientCountUpdate","count":3}"#);
}
