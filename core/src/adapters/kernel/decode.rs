//! Schema-tolerant decoding of kernel tracer records.
//!
//! Tracer versions disagree on field names (`pid` vs `tgid`, `port` vs
//! `lport`, ...). Each logical field has an ordered alias list; the first
//! alias present in the record is canonical, and a bad value under it is an
//! error rather than a reason to try the next alias.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::{AddressFamily, KernelEvent};

/// Why a record could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("unknown event type `{0}`")]
    UnknownType(String),

    #[error("invalid value for `{field}`: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// A logical field and the names it appears under, in priority order.
struct Field {
    name: &'static str,
    aliases: &'static [&'static str],
}

const TYPE: Field = Field {
    name: "type",
    aliases: &["type", "event", "kind", "evt", "op"],
};
const PID: Field = Field {
    name: "pid",
    aliases: &["pid", "tgid", "process_id", "proc_pid"],
};
const FD: Field = Field {
    name: "fd",
    aliases: &["fd", "sockfd", "sock_fd", "socket_fd", "file_descriptor"],
};
const PORT: Field = Field {
    name: "port",
    aliases: &["port", "lport", "local_port", "sport", "bind_port"],
};
const FAMILY: Field = Field {
    name: "family",
    aliases: &["family", "af", "sa_family", "addr_family", "domain"],
};

/// Keys under which output wrappers (e.g. `bpftrace -f json`) nest the record.
const ENVELOPES: &[&str] = &["data", "payload", "event_data"];

const BIND_TYPES: &[&str] = &[
    "bind",
    "listen",
    "inet_bind",
    "sys_enter_bind",
    "sys_enter_listen",
    "security_socket_bind",
];
const CLOSE_TYPES: &[&str] = &["close", "sys_enter_close", "close_fd"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordType {
    Bind,
    Close,
}

/// Decode one line of tracer output.
pub fn decode_record(line: &str) -> Result<KernelEvent, DecodeError> {
    let value: Value =
        serde_json::from_str(line.trim()).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    let Value::Object(record) = value else {
        return Err(DecodeError::NotAnObject);
    };

    match record_type(&record) {
        Ok(kind) => decode_fields(&record, kind),
        Err(outer_err) => match envelope(&record)? {
            Some(inner) => {
                let kind = record_type(&inner)?;
                decode_fields(&inner, kind)
            }
            None => Err(outer_err),
        },
    }
}

fn record_type(record: &Map<String, Value>) -> Result<RecordType, DecodeError> {
    let value = lookup(record, &TYPE).ok_or(DecodeError::MissingField(TYPE.name))?;
    let Some(name) = value.as_str() else {
        return Err(invalid(&TYPE, value));
    };

    let normalized = name.trim().to_ascii_lowercase();
    if BIND_TYPES.contains(&normalized.as_str()) {
        Ok(RecordType::Bind)
    } else if CLOSE_TYPES.contains(&normalized.as_str()) {
        Ok(RecordType::Close)
    } else {
        Err(DecodeError::UnknownType(name.to_string()))
    }
}

/// Unwrap one level of output envelope, if present.
fn envelope(record: &Map<String, Value>) -> Result<Option<Map<String, Value>>, DecodeError> {
    let Some(inner) = ENVELOPES.iter().find_map(|key| record.get(*key)) else {
        return Ok(None);
    };

    match inner {
        Value::Object(map) => Ok(Some(map.clone())),
        Value::String(text) => match serde_json::from_str::<Value>(text.trim()) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            Ok(_) => Err(DecodeError::NotAnObject),
            Err(e) => Err(DecodeError::InvalidJson(e.to_string())),
        },
        _ => Ok(None),
    }
}

fn decode_fields(record: &Map<String, Value>, kind: RecordType) -> Result<KernelEvent, DecodeError> {
    let pid = require_int(record, &PID)?;
    let pid = u32::try_from(pid).map_err(|_| DecodeError::InvalidValue {
        field: PID.name,
        value: pid.to_string(),
    })?;
    let fd = require_int(record, &FD)?;

    match kind {
        RecordType::Close => Ok(KernelEvent::Close { pid, fd }),
        RecordType::Bind => {
            let family = require_family(record)?;
            // Binds without a port (unix sockets, some probes) decode as port 0
            let port = match lookup(record, &PORT) {
                Some(_) => require_int(record, &PORT)?,
                None => 0,
            };
            Ok(KernelEvent::Bind {
                pid,
                fd,
                port,
                family,
            })
        }
    }
}

/// First alias present with a non-null value.
fn lookup<'a>(record: &'a Map<String, Value>, field: &Field) -> Option<&'a Value> {
    field
        .aliases
        .iter()
        .filter_map(|alias| record.get(*alias))
        .find(|v| !v.is_null())
}

fn require_int(record: &Map<String, Value>, field: &Field) -> Result<i64, DecodeError> {
    let value = lookup(record, field).ok_or(DecodeError::MissingField(field.name))?;
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| invalid(field, value)),
        Value::String(s) => s.trim().parse().map_err(|_| invalid(field, value)),
        _ => Err(invalid(field, value)),
    }
}

fn require_family(record: &Map<String, Value>) -> Result<AddressFamily, DecodeError> {
    let value = lookup(record, &FAMILY).ok_or(DecodeError::MissingField(FAMILY.name))?;
    match value {
        Value::String(s) => Ok(AddressFamily::from_name(s)),
        Value::Number(n) => n
            .as_i64()
            .map(AddressFamily::from_code)
            .ok_or_else(|| invalid(&FAMILY, value)),
        _ => Err(invalid(&FAMILY, value)),
    }
}

fn invalid(field: &Field, value: &Value) -> DecodeError {
    DecodeError::InvalidValue {
        field: field.name,
        value: value.to_string(),
    }
}
