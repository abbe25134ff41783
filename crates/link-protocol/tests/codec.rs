//! Codec behaviour over a representative envelope: nested maps, mixed
//! numeric representations, binary payloads and subscription updates.

use dslink_protocol::{
    Envelope, Format, Frame, JsonSerializer, MsgPackSerializer, Request, Response, Serializer,
    SubscriptionUpdate, Value,
};

fn representative() -> Envelope {
    let mut params = Value::map();
    params.insert("blob", Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef]));
    params.insert("ratio", Value::Double(0.25));
    params.insert("count", Value::Int(-3));
    params.insert("tags", Value::Array(vec!["a".into(), "b".into()]));

    let update = SubscriptionUpdate::new(
        7,
        Value::Int(123),
        Some("2024-01-01T00:00:00.000+00:00".into()),
    );

    Envelope {
        msg: Some(10),
        ack: Some(9),
        requests: vec![Request::invoke(2, "/actions/run", params, None).to_value()],
        responses: vec![
            Response::subscription_updates(vec![update.to_value()]).to_value(),
            Response::closed(5).to_value(),
        ],
    }
}

#[test]
fn json_round_trip_preserves_structure() {
    let env = representative();
    let frame = JsonSerializer.serialize(&env).unwrap();
    let Frame::Text(text) = &frame else {
        panic!("json must produce text frames");
    };
    assert!(text.contains("\\u001bbytes:3q2-7w=="));
    assert_eq!(JsonSerializer.deserialize(&frame).unwrap(), env);
}

#[test]
fn msgpack_round_trip_preserves_structure() {
    let env = representative();
    let frame = MsgPackSerializer.serialize(&env).unwrap();
    assert!(matches!(frame, Frame::Binary(_)));
    assert_eq!(MsgPackSerializer.deserialize(&frame).unwrap(), env);
}

#[test]
fn json_escaped_string_comes_back_as_bytes() {
    // The documented asymmetry: a *string* that happens to carry the
    // escape prefix decodes as binary under JSON, but stays a string
    // under MessagePack.
    let mut value = Value::map();
    value.insert("v", Value::String("\u{1b}bytes:AQI=".into()));
    let env = Envelope::with_responses(vec![value]);

    let via_json = JsonSerializer
        .deserialize(&JsonSerializer.serialize(&env).unwrap())
        .unwrap();
    assert_eq!(
        via_json.responses[0].get("v"),
        Some(&Value::Bytes(vec![1, 2]))
    );

    let via_msgpack = MsgPackSerializer
        .deserialize(&MsgPackSerializer.serialize(&env).unwrap())
        .unwrap();
    assert_eq!(via_msgpack, env);
}

#[test]
fn msgpack_keeps_float_and_double_apart() {
    let env = Envelope::with_responses(vec![Value::Array(vec![
        Value::Float(1.5),
        Value::Double(1.5),
    ])]);
    let back = MsgPackSerializer
        .deserialize(&MsgPackSerializer.serialize(&env).unwrap())
        .unwrap();
    assert_eq!(back, env);
}

#[test]
fn unknown_envelope_fields_are_ignored() {
    let frame = Frame::Text(r#"{"msg":1,"salt":"abc","responses":[]}"#.into());
    let env = JsonSerializer.deserialize(&frame).unwrap();
    assert_eq!(env.msg, Some(1));
    assert!(env.responses.is_empty());
}

#[test]
fn serializer_for_format() {
    for format in Format::supported() {
        let codec = format.serializer();
        let env = representative();
        let back = codec.deserialize(&codec.serialize(&env).unwrap()).unwrap();
        assert_eq!(back, env, "{format} round trip");
    }
}
