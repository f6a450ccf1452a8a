//! Response-callback registry: maps a command name to the strategy that
//! turns its raw [`Value`] into the shape a caller actually wants, the
//! way the source keeps a table from command name to a small callback
//! rather than special-casing each command at every call site.
//!
//! New commands add a row to [`shape_for`]; everything else falls back to
//! [`ResponseShape::Identity`].
use crate::types::{ErrorKind, RedisError, RedisResult, Value};

/// A shaping strategy for a command's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// Pass the raw value through unchanged.
    Identity,
    /// `+OK` (or any status reply) becomes `true`; `Nil` becomes `false`
    /// (a conditional write, e.g. `SET ... NX`, that didn't apply).
    BoolFromOk,
    /// `:0`/`:1` become `false`/`true`.
    BoolFromInt,
    /// The `INFO` bulk string, parsed into `field: value` pairs.
    ParseInfo,
    /// An integer reply where a negative sentinel means "no such
    /// key"/"no TTL set", surfaced as `Nil` instead of the raw negative.
    IntOrNone,
    /// A flat `key value key value ...` array (`HGETALL`, `CONFIG GET`)
    /// regrouped into two-element pairs.
    PairsToMap,
    /// A flat `member score member score ...` array (`ZRANGE
    /// ... WITHSCORES`) regrouped into two-element pairs, order and
    /// duplicates preserved.
    ListOfPairs,
    /// A bulk string that is itself a formatted float (`ZSCORE`,
    /// `INCRBYFLOAT`), validated as parseable.
    ScoreFromBulk,
}

/// Looks up the shaping strategy for `name` (case-insensitive).
///
/// Grouped the way the source groups callback registration: one
/// assignment per shape, listing every command name that shares it.
pub fn shape_for(name: &str) -> ResponseShape {
    let upper = name.to_ascii_uppercase();
    match upper.as_str() {
        "SETNX" | "HSETNX" | "EXPIRE" | "EXPIREAT" | "PEXPIRE" | "PEXPIREAT" | "PERSIST" | "MOVE" | "RENAMENX"
        | "SISMEMBER" | "SMOVE" | "COPY" | "HEXISTS" => ResponseShape::BoolFromInt,

        "SET" | "MSET" | "SETEX" | "PSETEX" | "RENAME" | "SELECT" | "AUTH" | "FLUSHDB" | "FLUSHALL" | "RESTORE"
        | "SHUTDOWN" | "LSET" | "LTRIM" | "HMSET" => ResponseShape::BoolFromOk,

        "INFO" => ResponseShape::ParseInfo,

        "TTL" | "PTTL" => ResponseShape::IntOrNone,

        "HGETALL" | "CONFIG" => ResponseShape::PairsToMap,

        // `ZPOPMIN`/`ZPOPMAX` always reply member/score pairs. `ZRANGE`
        // and kin only do when called with `WITHSCORES`, which this table
        // can't see from the command name alone, so they default to
        // `Identity` rather than risking an odd-length error on the more
        // common plain-member-list call.
        "ZPOPMIN" | "ZPOPMAX" => ResponseShape::ListOfPairs,

        "ZSCORE" | "ZINCRBY" | "INCRBYFLOAT" | "HINCRBYFLOAT" | "GEODIST" => ResponseShape::ScoreFromBulk,

        _ => ResponseShape::Identity,
    }
}

/// Applies the shaping strategy registered for `name` to `value`.
pub fn apply(name: &str, value: Value) -> RedisResult<Value> {
    shape(shape_for(name), value)
}

/// Applies a specific [`ResponseShape`] directly, for callers (pipelines
/// replaying queued commands) that already resolved the shape once.
pub fn shape(shape: ResponseShape, value: Value) -> RedisResult<Value> {
    match shape {
        ResponseShape::Identity => Ok(value),
        ResponseShape::BoolFromOk => Ok(bool_from_ok(value)),
        ResponseShape::BoolFromInt => bool_from_int(value),
        ResponseShape::ParseInfo => parse_info(value),
        ResponseShape::IntOrNone => Ok(int_or_none(value)),
        ResponseShape::PairsToMap => pairs(value),
        ResponseShape::ListOfPairs => pairs(value),
        ResponseShape::ScoreFromBulk => score_from_bulk(value),
    }
}

fn bool_from_ok(value: Value) -> Value {
    match value {
        Value::Nil => Value::Int(0),
        _ => Value::Int(1),
    }
}

fn bool_from_int(value: Value) -> RedisResult<Value> {
    match value {
        Value::Int(n) => Ok(Value::Int(if n != 0 { 1 } else { 0 })),
        _ => Err(RedisError::from((ErrorKind::TypeError, "expected an integer reply"))),
    }
}

fn int_or_none(value: Value) -> Value {
    match value {
        Value::Int(n) if n < 0 => Value::Nil,
        other => other,
    }
}

/// Regroups a flat `Bulk` array into two-element `Bulk` pairs. `HGETALL`,
/// `CONFIG GET` and `ZRANGE ... WITHSCORES` all reply this way; an odd
/// number of elements means the server sent something else entirely.
fn pairs(value: Value) -> RedisResult<Value> {
    let items = match value {
        Value::Bulk(items) => items,
        Value::Nil => return Ok(Value::Bulk(Vec::new())),
        _ => return Err(RedisError::from((ErrorKind::TypeError, "expected an array reply"))),
    };
    if items.len() % 2 != 0 {
        return Err(RedisError::from((ErrorKind::TypeError, "expected an even number of elements for a pairs reply")));
    }
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut it = items.into_iter();
    while let (Some(k), Some(v)) = (it.next(), it.next()) {
        out.push(Value::Bulk(vec![k, v]));
    }
    Ok(Value::Bulk(out))
}

/// The `INFO` reply is `\r\n`-separated lines of `field:value`, with
/// blank lines as section separators and `#`-prefixed lines as section
/// headers. Both are skipped; everything else becomes a pair.
fn parse_info(value: Value) -> RedisResult<Value> {
    let data = match &value {
        Value::Data(d) => d.as_slice(),
        Value::Status(s) => s.as_bytes(),
        _ => return Err(RedisError::from((ErrorKind::TypeError, "expected a bulk string reply for INFO"))),
    };
    let text = std::str::from_utf8(data).map_err(|_| RedisError::from((ErrorKind::TypeError, "INFO reply was not valid UTF-8")))?;

    let mut out = Vec::new();
    for line in text.split("\r\n") {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((field, val)) = line.split_once(':') {
            out.push(Value::Bulk(vec![Value::Data(field.as_bytes().to_vec()), Value::Data(val.as_bytes().to_vec())]));
        }
    }
    Ok(Value::Bulk(out))
}

/// Validates that a bulk-string reply parses as a float, the way
/// `ZSCORE`/`INCRBYFLOAT` style commands reply with a formatted number
/// rather than a RESP integer or double.
fn score_from_bulk(value: Value) -> RedisResult<Value> {
    match &value {
        Value::Nil => Ok(Value::Nil),
        Value::Data(d) => {
            let text = std::str::from_utf8(d).map_err(|_| RedisError::from((ErrorKind::TypeError, "score reply was not valid UTF-8")))?;
            text.parse::<f64>().map_err(|_| RedisError::from((ErrorKind::TypeError, "score reply did not parse as a float")))?;
            Ok(value)
        }
        _ => Err(RedisError::from((ErrorKind::TypeError, "expected a bulk string score reply"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_from_ok_treats_status_and_okay_as_true_and_nil_as_false() {
        assert_eq!(shape(ResponseShape::BoolFromOk, Value::Okay).unwrap(), Value::Int(1));
        assert_eq!(shape(ResponseShape::BoolFromOk, Value::Status("OK".into())).unwrap(), Value::Int(1));
        assert_eq!(shape(ResponseShape::BoolFromOk, Value::Nil).unwrap(), Value::Int(0));
    }

    #[test]
    fn bool_from_int_maps_zero_and_nonzero() {
        assert_eq!(shape(ResponseShape::BoolFromInt, Value::Int(0)).unwrap(), Value::Int(0));
        assert_eq!(shape(ResponseShape::BoolFromInt, Value::Int(1)).unwrap(), Value::Int(1));
        assert_eq!(shape(ResponseShape::BoolFromInt, Value::Int(7)).unwrap(), Value::Int(1));
        assert!(shape(ResponseShape::BoolFromInt, Value::Nil).is_err());
    }

    #[test]
    fn int_or_none_hides_negative_sentinels() {
        assert_eq!(shape(ResponseShape::IntOrNone, Value::Int(-1)).unwrap(), Value::Nil);
        assert_eq!(shape(ResponseShape::IntOrNone, Value::Int(-2)).unwrap(), Value::Nil);
        assert_eq!(shape(ResponseShape::IntOrNone, Value::Int(42)).unwrap(), Value::Int(42));
    }

    #[test]
    fn pairs_to_map_regroups_a_flat_array() {
        let flat = Value::Bulk(vec![
            Value::Data(b"field1".to_vec()),
            Value::Data(b"value1".to_vec()),
            Value::Data(b"field2".to_vec()),
            Value::Data(b"value2".to_vec()),
        ]);
        let shaped = shape(ResponseShape::PairsToMap, flat).unwrap();
        assert_eq!(
            shaped,
            Value::Bulk(vec![
                Value::Bulk(vec![Value::Data(b"field1".to_vec()), Value::Data(b"value1".to_vec())]),
                Value::Bulk(vec![Value::Data(b"field2".to_vec()), Value::Data(b"value2".to_vec())]),
            ])
        );
    }

    #[test]
    fn pairs_rejects_an_odd_length_array() {
        let flat = Value::Bulk(vec![Value::Data(b"field1".to_vec())]);
        assert!(shape(ResponseShape::PairsToMap, flat).is_err());
    }

    #[test]
    fn pairs_on_nil_is_an_empty_list() {
        assert_eq!(shape(ResponseShape::PairsToMap, Value::Nil).unwrap(), Value::Bulk(Vec::new()));
    }

    #[test]
    fn list_of_pairs_preserves_order_and_duplicates() {
        let flat = Value::Bulk(vec![
            Value::Data(b"alice".to_vec()),
            Value::Data(b"1".to_vec()),
            Value::Data(b"bob".to_vec()),
            Value::Data(b"1".to_vec()),
        ]);
        let shaped = shape(ResponseShape::ListOfPairs, flat).unwrap();
        assert_eq!(
            shaped,
            Value::Bulk(vec![
                Value::Bulk(vec![Value::Data(b"alice".to_vec()), Value::Data(b"1".to_vec())]),
                Value::Bulk(vec![Value::Data(b"bob".to_vec()), Value::Data(b"1".to_vec())]),
            ])
        );
    }

    #[test]
    fn parse_info_skips_comments_and_blank_lines() {
        let raw = Value::Data(b"# Server\r\nredis_version:7.2.0\r\n\r\n# Clients\r\nconnected_clients:3\r\n".to_vec());
        let shaped = shape(ResponseShape::ParseInfo, raw).unwrap();
        assert_eq!(
            shaped,
            Value::Bulk(vec![
                Value::Bulk(vec![Value::Data(b"redis_version".to_vec()), Value::Data(b"7.2.0".to_vec())]),
                Value::Bulk(vec![Value::Data(b"connected_clients".to_vec()), Value::Data(b"3".to_vec())]),
            ])
        );
    }

    #[test]
    fn score_from_bulk_validates_a_parseable_float() {
        let good = Value::Data(b"3.14159".to_vec());
        assert_eq!(shape(ResponseShape::ScoreFromBulk, good.clone()).unwrap(), good);
        let bad = Value::Data(b"not-a-number".to_vec());
        assert!(shape(ResponseShape::ScoreFromBulk, bad).is_err());
        assert_eq!(shape(ResponseShape::ScoreFromBulk, Value::Nil).unwrap(), Value::Nil);
    }

    #[test]
    fn shape_for_knows_the_common_commands() {
        assert_eq!(shape_for("expire"), ResponseShape::BoolFromInt);
        assert_eq!(shape_for("SET"), ResponseShape::BoolFromOk);
        assert_eq!(shape_for("info"), ResponseShape::ParseInfo);
        assert_eq!(shape_for("ttl"), ResponseShape::IntOrNone);
        assert_eq!(shape_for("HGETALL"), ResponseShape::PairsToMap);
        assert_eq!(shape_for("zrange"), ResponseShape::Identity);
        assert_eq!(shape_for("zpopmin"), ResponseShape::ListOfPairs);
        assert_eq!(shape_for("zscore"), ResponseShape::ScoreFromBulk);
        assert_eq!(shape_for("GET"), ResponseShape::Identity);
    }
}
