//! Transcoding between RPC wire payloads and GraphQL JSON.
//!
//! Decode turns an inbound payload (JSON, binary proto, or a gRPC-framed
//! body) into a map keyed by canonical proto field names, ready to ship as
//! GraphQL variables. Encode walks the method's output descriptor, pulls
//! values by field name out of the GraphQL `data` object, and serializes the
//! resulting dynamic message back into the protocol's framing.

use crate::error::{Error, ErrorKind, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use prost::Message;
use prost_reflect::{
    DynamicMessage, FieldDescriptor, Kind, MapKey, MessageDescriptor, ReflectMessage,
    SerializeOptions, Value,
};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;

/// gRPC-Web trailers frame marker.
const TRAILER_FRAME: u8 = 0x80;

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Parse a JSON payload against the input descriptor.
///
/// Keys may arrive as canonical proto names or proto-JSON camelCase; the
/// output map always carries the canonical name. Unknown fields are rejected
/// unless `permissive` is set, in which case they pass through untouched.
pub fn decode_json(
    payload: &[u8],
    desc: &MessageDescriptor,
    permissive: bool,
) -> Result<JsonMap<String, JsonValue>> {
    if payload.is_empty() {
        return Ok(JsonMap::new());
    }
    let value: JsonValue = serde_json::from_slice(payload)
        .map_err(|e| Error::status(ErrorKind::InvalidArgument, format!("invalid JSON: {e}")))?;
    let JsonValue::Object(object) = value else {
        return Err(Error::status(
            ErrorKind::InvalidArgument,
            "request payload must be a JSON object",
        ));
    };
    decode_json_object(object, desc, permissive)
}

fn decode_json_object(
    object: JsonMap<String, JsonValue>,
    desc: &MessageDescriptor,
    permissive: bool,
) -> Result<JsonMap<String, JsonValue>> {
    let mut out = JsonMap::new();
    for (key, value) in object {
        let Some(field) = field_by_any_name(desc, &key) else {
            if permissive {
                out.insert(key, value);
                continue;
            }
            return Err(Error::status(
                ErrorKind::InvalidArgument,
                format!("unknown field {key} for {}", desc.full_name()),
            ));
        };
        let value = decode_json_field(value, &field, permissive)?;
        out.insert(field.name().to_string(), value);
    }
    Ok(out)
}

fn decode_json_field(
    value: JsonValue,
    field: &FieldDescriptor,
    permissive: bool,
) -> Result<JsonValue> {
    if field.is_map() {
        let Kind::Message(entry) = field.kind() else {
            return Ok(value);
        };
        let value_field = entry.map_entry_value_field();
        if let JsonValue::Object(object) = value {
            let mut out = JsonMap::new();
            for (key, item) in object {
                out.insert(key, decode_json_field(item, &value_field, permissive)?);
            }
            return Ok(JsonValue::Object(out));
        }
        return Ok(value);
    }

    if field.is_list() {
        if let JsonValue::Array(items) = value {
            let items = items
                .into_iter()
                .map(|item| decode_json_item(item, field, permissive))
                .collect::<Result<Vec<_>>>()?;
            return Ok(JsonValue::Array(items));
        }
        return Ok(value);
    }

    decode_json_item(value, field, permissive)
}

fn decode_json_item(
    value: JsonValue,
    field: &FieldDescriptor,
    permissive: bool,
) -> Result<JsonValue> {
    match (field.kind(), value) {
        (Kind::Message(inner), JsonValue::Object(object)) => Ok(JsonValue::Object(
            decode_json_object(object, &inner, permissive)?,
        )),
        (_, value) => Ok(value),
    }
}

fn field_by_any_name(desc: &MessageDescriptor, name: &str) -> Option<FieldDescriptor> {
    desc.get_field_by_name(name)
        .or_else(|| desc.fields().find(|f| f.json_name() == name))
}

/// Decode a binary proto payload and flatten it to a field-name-keyed map.
pub fn decode_binary(
    payload: &[u8],
    desc: &MessageDescriptor,
) -> Result<JsonMap<String, JsonValue>> {
    let message = DynamicMessage::decode(desc.clone(), payload).map_err(|e| {
        Error::status(
            ErrorKind::InvalidArgument,
            format!("failed to decode {}: {e}", desc.full_name()),
        )
    })?;
    Ok(message_to_map(&message))
}

/// Walk a dynamic message's populated fields into a JSON map: scalars keep
/// their proto width, enums ride as numbers, bytes as base64 text, maps get
/// string-coerced keys.
fn message_to_map(message: &DynamicMessage) -> JsonMap<String, JsonValue> {
    let mut map = JsonMap::new();
    for field in message.descriptor().fields() {
        if !message.has_field(&field) {
            continue;
        }
        let value = message.get_field(&field);
        map.insert(field.name().to_string(), prost_value_to_json(&value));
    }
    map
}

fn prost_value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::I32(v) => json!(v),
        Value::I64(v) => json!(v),
        Value::U32(v) => json!(v),
        Value::U64(v) => json!(v),
        Value::F32(v) => json!(v),
        Value::F64(v) => json!(v),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Bytes(b) => JsonValue::String(BASE64.encode(b)),
        Value::EnumNumber(n) => json!(n),
        Value::Message(m) => JsonValue::Object(message_to_map(m)),
        Value::List(items) => {
            JsonValue::Array(items.iter().map(prost_value_to_json).collect())
        }
        Value::Map(entries) => {
            let mut map = JsonMap::new();
            for (key, item) in entries {
                map.insert(map_key_to_string(key), prost_value_to_json(item));
            }
            JsonValue::Object(map)
        }
    }
}

fn map_key_to_string(key: &MapKey) -> String {
    match key {
        MapKey::Bool(b) => b.to_string(),
        MapKey::I32(v) => v.to_string(),
        MapKey::I64(v) => v.to_string(),
        MapKey::U32(v) => v.to_string(),
        MapKey::U64(v) => v.to_string(),
        MapKey::String(s) => s.clone(),
    }
}

/// Turn a decoded payload into GraphQL variables: drop `_`-prefixed fields
/// and apply the per-operation renames.
pub fn variables_from(
    decoded: JsonMap<String, JsonValue>,
    mapping: &HashMap<String, String>,
) -> JsonMap<String, JsonValue> {
    let mut variables = JsonMap::new();
    for (key, value) in decoded {
        if key.starts_with('_') {
            continue;
        }
        let key = mapping.get(&key).cloned().unwrap_or(key);
        variables.insert(key, value);
    }
    variables
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Materialize the method's output message from the GraphQL `data` object.
///
/// Fields are pulled by canonical proto name (or proto-JSON name). When the
/// output descriptor has no field named after the operation's root field and
/// `data` is single-rooted under that name, the root is unwrapped first, so
/// both `{"employees": [...]}` and `{"employeeById": {...}}` shapes land.
pub fn build_output_message(
    data: Option<&JsonValue>,
    desc: &MessageDescriptor,
    root_field: Option<&str>,
) -> Result<DynamicMessage> {
    let mut scope = data.unwrap_or(&JsonValue::Null);

    if let (Some(root), Some(object)) = (root_field, scope.as_object()) {
        if desc.get_field_by_name(root).is_none() {
            if let Some(inner) = object.get(root) {
                scope = inner;
            }
        }
    }

    match scope {
        JsonValue::Null => Ok(DynamicMessage::new(desc.clone())),
        JsonValue::Object(object) => message_from_object(object, desc),
        other => Err(Error::status(
            ErrorKind::Internal,
            format!(
                "expected object for {}, got {}",
                desc.full_name(),
                json_type_name(other)
            ),
        )),
    }
}

fn message_from_object(
    object: &JsonMap<String, JsonValue>,
    desc: &MessageDescriptor,
) -> Result<DynamicMessage> {
    let mut message = DynamicMessage::new(desc.clone());
    for field in desc.fields() {
        let value = object
            .get(field.name())
            .or_else(|| object.get(field.json_name()));
        let Some(value) = value else { continue };
        if value.is_null() {
            continue;
        }
        message.set_field(&field, json_to_prost_value(value, &field)?);
    }
    Ok(message)
}

fn json_to_prost_value(value: &JsonValue, field: &FieldDescriptor) -> Result<Value> {
    if field.is_map() {
        let JsonValue::Object(object) = value else {
            return Err(mismatch(field, "map object", value));
        };
        let Kind::Message(entry) = field.kind() else {
            return Err(mismatch(field, "map object", value));
        };
        let key_field = entry.map_entry_key_field();
        let value_field = entry.map_entry_value_field();
        let mut map = HashMap::new();
        for (key, item) in object {
            map.insert(
                parse_map_key(key, &key_field)?,
                json_to_single_value(item, &value_field)?,
            );
        }
        return Ok(Value::Map(map));
    }

    if field.is_list() {
        let JsonValue::Array(items) = value else {
            return Err(mismatch(field, "list", value));
        };
        let items = items
            .iter()
            .map(|item| json_to_single_value(item, field))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Value::List(items));
    }

    json_to_single_value(value, field)
}

fn json_to_single_value(value: &JsonValue, field: &FieldDescriptor) -> Result<Value> {
    match field.kind() {
        Kind::Bool => value
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| mismatch(field, "boolean", value)),
        Kind::String => value
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(|| mismatch(field, "string", value)),
        Kind::Bytes => {
            let text = value
                .as_str()
                .ok_or_else(|| mismatch(field, "base64 string", value))?;
            BASE64
                .decode(text)
                .map(|b| Value::Bytes(b.into()))
                .map_err(|_| mismatch(field, "base64 string", value))
        }
        Kind::Float => value
            .as_f64()
            .map(|v| Value::F32(v as f32))
            .ok_or_else(|| mismatch(field, "float", value)),
        Kind::Double => value
            .as_f64()
            .map(Value::F64)
            .ok_or_else(|| mismatch(field, "float", value)),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => value
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(Value::I32)
            .ok_or_else(|| mismatch(field, "32-bit int", value)),
        Kind::Uint32 | Kind::Fixed32 => value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(Value::U32)
            .ok_or_else(|| mismatch(field, "32-bit uint", value)),
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => match value {
            JsonValue::Number(n) => n
                .as_i64()
                .map(Value::I64)
                .ok_or_else(|| mismatch(field, "64-bit int", value)),
            JsonValue::String(s) => s
                .parse::<i64>()
                .map(Value::I64)
                .map_err(|_| mismatch(field, "64-bit int", value)),
            _ => Err(mismatch(field, "64-bit int", value)),
        },
        Kind::Uint64 | Kind::Fixed64 => match value {
            JsonValue::Number(n) => n
                .as_u64()
                .map(Value::U64)
                .ok_or_else(|| mismatch(field, "64-bit uint", value)),
            JsonValue::String(s) => s
                .parse::<u64>()
                .map(Value::U64)
                .map_err(|_| mismatch(field, "64-bit uint", value)),
            _ => Err(mismatch(field, "64-bit uint", value)),
        },
        Kind::Enum(en) => match value {
            JsonValue::Number(n) => n
                .as_i64()
                .map(|v| Value::EnumNumber(v as i32))
                .ok_or_else(|| mismatch(field, "enum", value)),
            JsonValue::String(name) => en
                .get_value_by_name(name)
                .map(|v| Value::EnumNumber(v.number()))
                .ok_or_else(|| mismatch(field, "enum", value)),
            _ => Err(mismatch(field, "enum", value)),
        },
        Kind::Message(inner) => match value {
            JsonValue::Object(object) => {
                message_from_object(object, &inner).map(Value::Message)
            }
            _ => Err(mismatch(field, "object", value)),
        },
    }
}

fn parse_map_key(key: &str, field: &FieldDescriptor) -> Result<MapKey> {
    let parsed = match field.kind() {
        Kind::String => Some(MapKey::String(key.to_string())),
        Kind::Bool => key.parse().ok().map(MapKey::Bool),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => key.parse().ok().map(MapKey::I32),
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => key.parse().ok().map(MapKey::I64),
        Kind::Uint32 | Kind::Fixed32 => key.parse().ok().map(MapKey::U32),
        Kind::Uint64 | Kind::Fixed64 => key.parse().ok().map(MapKey::U64),
        _ => None,
    };
    parsed.ok_or_else(|| {
        Error::status(
            ErrorKind::Internal,
            format!("invalid map key {key} for {}", field.full_name()),
        )
    })
}

fn mismatch(field: &FieldDescriptor, expected: &str, value: &JsonValue) -> Error {
    Error::status(
        ErrorKind::Internal,
        format!(
            "field {}: expected {expected}, got {}",
            field.full_name(),
            json_type_name(value)
        ),
    )
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Canonical proto-JSON serialization, defaults included so empty lists and
/// zero scalars stay visible to the client.
pub fn encode_json(message: &DynamicMessage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::new(&mut buf);
    message
        .serialize_with_options(
            &mut serializer,
            &SerializeOptions::new().skip_default_fields(false),
        )
        .map_err(|e| Error::status(ErrorKind::Internal, format!("JSON encode failed: {e}")))?;
    Ok(buf)
}

pub fn encode_binary(message: &DynamicMessage) -> Vec<u8> {
    message.encode_to_vec()
}

// ---------------------------------------------------------------------------
// gRPC framing
// ---------------------------------------------------------------------------

/// Strip the 5-byte `{compressed, length}` prefix from a gRPC message frame.
/// Compression was never negotiated, so a set compressed flag is refused.
pub fn split_grpc_frame(body: &[u8]) -> Result<&[u8]> {
    if body.is_empty() {
        return Ok(body);
    }
    if body.len() < 5 {
        return Err(Error::status(
            ErrorKind::InvalidArgument,
            "truncated gRPC frame",
        ));
    }
    if body[0] & 0x01 != 0 {
        return Err(Error::status(
            ErrorKind::Unimplemented,
            "compressed gRPC messages are not supported",
        ));
    }
    let length = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
    if body.len() < 5 + length {
        return Err(Error::status(
            ErrorKind::InvalidArgument,
            "gRPC frame length exceeds body",
        ));
    }
    Ok(&body[5..5 + length])
}

/// Wrap a serialized message in the 5-byte gRPC frame.
pub fn encode_grpc_frame(message: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(5 + message.len());
    framed.push(0);
    framed.extend_from_slice(&(message.len() as u32).to_be_bytes());
    framed.extend_from_slice(message);
    framed
}

/// Build the gRPC-Web trailers frame (`0x80` marker) carrying the status.
pub fn encode_grpc_web_trailers(status: i32, message: &str) -> Vec<u8> {
    let mut text = format!("grpc-status: {status}\r\n");
    if !message.is_empty() {
        text.push_str(&format!("grpc-message: {message}\r\n"));
    }
    let mut frame = Vec::with_capacity(5 + text.len());
    frame.push(TRAILER_FRAME);
    frame.extend_from_slice(&(text.len() as u32).to_be_bytes());
    frame.extend_from_slice(text.as_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::load_employee_services;
    use prost_reflect::DescriptorPool;

    fn employee_pool() -> DescriptorPool {
        let tmp = tempfile::tempdir().unwrap();
        load_employee_services(tmp.path()).pool
    }

    fn rich_pool() -> DescriptorPool {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("profile");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("service.proto"),
            r#"
syntax = "proto3";
package profile.v1;

enum Role {
  ROLE_UNSPECIFIED = 0;
  ROLE_ADMIN = 1;
}

message Address {
  string city = 1;
}

message Profile {
  string name = 1;
  int64 score = 2;
  bytes avatar = 3;
  Role role = 4;
  Address address = 5;
  repeated string tags = 6;
  map<string, int32> limits = 7;
  string _internal = 8;
}

service ProfileService {
  rpc QueryProfile(Profile) returns (Profile);
}
"#,
        )
        .unwrap();
        crate::loader::load(tmp.path()).unwrap().pool
    }

    #[test]
    fn json_decode_normalizes_names_and_rejects_unknown_fields() {
        let pool = employee_pool();
        let desc = pool
            .get_message_by_name("employee.v1.MutationUpdateEmployeeRequest")
            .unwrap();

        let decoded = decode_json(br#"{"id": 7, "name": "Ada"}"#, &desc, false).unwrap();
        assert_eq!(decoded["id"], 7);
        assert_eq!(decoded["name"], "Ada");

        let err = decode_json(br#"{"id": 7, "wat": true}"#, &desc, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let decoded = decode_json(br#"{"id": 7, "wat": true}"#, &desc, true).unwrap();
        assert_eq!(decoded["wat"], true);
    }

    #[test]
    fn json_decode_recurses_into_nested_messages() {
        let pool = rich_pool();
        let desc = pool.get_message_by_name("profile.v1.Profile").unwrap();

        let err = decode_json(
            br#"{"address": {"city": "Berlin", "zip": "x"}}"#,
            &desc,
            false,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let decoded =
            decode_json(br#"{"address": {"city": "Berlin"}}"#, &desc, false).unwrap();
        assert_eq!(decoded["address"]["city"], "Berlin");
    }

    #[test]
    fn binary_decode_flattens_populated_fields() {
        let pool = rich_pool();
        let desc = pool.get_message_by_name("profile.v1.Profile").unwrap();

        let mut message = DynamicMessage::new(desc.clone());
        message.set_field_by_name("name", Value::String("Ada".into()));
        message.set_field_by_name("score", Value::I64(42));
        message.set_field_by_name("avatar", Value::Bytes(vec![1u8, 2, 3].into()));
        message.set_field_by_name("role", Value::EnumNumber(1));
        message.set_field_by_name(
            "tags",
            Value::List(vec![Value::String("a".into()), Value::String("b".into())]),
        );
        let mut limits = HashMap::new();
        limits.insert(MapKey::String("rate".into()), Value::I32(10));
        message.set_field_by_name("limits", Value::Map(limits));

        let decoded = decode_binary(&message.encode_to_vec(), &desc).unwrap();
        assert_eq!(decoded["name"], "Ada");
        assert_eq!(decoded["score"], 42);
        assert_eq!(decoded["avatar"], BASE64.encode([1u8, 2, 3]));
        assert_eq!(decoded["role"], 1);
        assert_eq!(decoded["tags"], json!(["a", "b"]));
        assert_eq!(decoded["limits"], json!({"rate": 10}));
        // Unset fields never appear.
        assert!(!decoded.contains_key("address"));
    }

    #[test]
    fn variables_drop_underscored_fields_and_apply_renames() {
        let mut decoded = JsonMap::new();
        decoded.insert("id".into(), json!(1));
        decoded.insert("_internal".into(), json!("x"));
        let mut mapping = HashMap::new();
        mapping.insert("id".to_string(), "employeeId".to_string());

        let variables = variables_from(decoded, &mapping);
        assert_eq!(variables.len(), 1);
        assert_eq!(variables["employeeId"], 1);
    }

    #[test]
    fn output_unwraps_single_rooted_data() {
        let pool = employee_pool();
        let desc = pool
            .get_message_by_name("employee.v1.EmployeeResult")
            .unwrap();

        let data = json!({"employeeById": {"id": 1, "name": "Ada"}});
        let message =
            build_output_message(Some(&data), &desc, Some("employeeById")).unwrap();
        let encoded = encode_json(&message).unwrap();
        let round: JsonValue = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(round, json!({"id": 1, "name": "Ada"}));
    }

    #[test]
    fn output_keeps_root_when_descriptor_has_that_field() {
        let pool = employee_pool();
        let desc = pool
            .get_message_by_name("employee.v1.QueryEmployeesResponse")
            .unwrap();

        let data = json!({"employees": []});
        let message = build_output_message(Some(&data), &desc, Some("employees")).unwrap();
        let encoded = encode_json(&message).unwrap();
        let round: JsonValue = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(round, json!({"employees": []}));
    }

    #[test]
    fn output_type_mismatch_is_internal() {
        let pool = employee_pool();
        let desc = pool
            .get_message_by_name("employee.v1.EmployeeResult")
            .unwrap();

        let data = json!({"id": "not a number"});
        let err = build_output_message(Some(&data), &desc, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn json_roundtrip_preserves_valid_instances() {
        let pool = rich_pool();
        let desc = pool.get_message_by_name("profile.v1.Profile").unwrap();

        let payload = json!({
            "name": "Ada",
            "score": 42,
            "avatar": BASE64.encode([9u8, 9]),
            "role": 1,
            "address": {"city": "Berlin"},
            "tags": ["x"],
            "limits": {"rate": 10},
        });
        let decoded =
            decode_json(&serde_json::to_vec(&payload).unwrap(), &desc, false).unwrap();
        let message =
            build_output_message(Some(&JsonValue::Object(decoded.clone())), &desc, None)
                .unwrap();
        let reencoded = encode_json(&message).unwrap();
        let redecoded = decode_json(&reencoded, &desc, false).unwrap();

        for key in ["name", "avatar", "address", "tags", "limits"] {
            assert_eq!(redecoded[key], decoded[key], "field {key} drifted");
        }
        // 64-bit integers ride as strings and enums by name in proto-JSON.
        assert_eq!(redecoded["score"], json!("42"));
        assert_eq!(redecoded["role"], json!("ROLE_ADMIN"));
    }

    #[test]
    fn grpc_frames_roundtrip() {
        let framed = encode_grpc_frame(b"abc");
        assert_eq!(framed[0], 0);
        assert_eq!(&framed[1..5], &3u32.to_be_bytes());
        assert_eq!(split_grpc_frame(&framed).unwrap(), b"abc");
    }

    #[test]
    fn compressed_frames_are_refused() {
        let mut framed = encode_grpc_frame(b"abc");
        framed[0] = 1;
        let err = split_grpc_frame(&framed).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unimplemented);
    }

    #[test]
    fn truncated_frames_are_invalid() {
        assert_eq!(
            split_grpc_frame(&[0, 0, 0]).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        let mut framed = encode_grpc_frame(b"abc");
        framed.truncate(6);
        assert_eq!(
            split_grpc_frame(&framed).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn web_trailers_carry_status_and_message() {
        let frame = encode_grpc_web_trailers(5, "not found");
        assert_eq!(frame[0], 0x80);
        let text = std::str::from_utf8(&frame[5..]).unwrap();
        assert!(text.contains("grpc-status: 5"));
        assert!(text.contains("grpc-message: not found"));
    }
}
