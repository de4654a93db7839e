//! Query-shape canonicalization
//!
//! Turns a raw profiler entry into a deterministic, shell-like rendering of
//! the operation it recorded:
//!
//! ```text
//! query payload             → db.<namespace>.find(<filter>)
//! { find: "orders", ... }   → db.orders.find(<filter or {}>)
//! { aggregate: "orders" }   → db.orders.aggregate(<pipeline or []>)
//! { count: "orders" }       → db.orders.count(<query or {}>)
//! { distinct: "orders" }    → db.orders.distinct("<key>", <query or {}>)
//! any other command         → Unsupported command type
//! no query, no command      → Unsupported query type
//! ```
//!
//! Everything here is pure; the same entry always yields the same shape.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use mongodb::bson::{Bson, Document};

use crate::types::{collection_of, DatabaseId, LogPayload, ProfiledQueryEvent, RawLogEntry};

/// Shape text for entries carrying neither a query nor a command.
pub const UNSUPPORTED_QUERY: &str = "Unsupported query type";

/// Shape text for commands that are not find/aggregate/count/distinct.
pub const UNSUPPORTED_COMMAND: &str = "Unsupported command type";

/// Result of canonicalizing one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryShape {
    /// Rendered shape, e.g. `db.orders.find({status: "open"})`
    Shape(String),
    /// Entry had neither a query nor a command
    UnsupportedQuery,
    /// Entry had a command of an unrecognised kind
    UnsupportedCommand,
}

impl QueryShape {
    /// Whether the shape is worth publishing
    pub fn is_supported(&self) -> bool {
        matches!(self, QueryShape::Shape(_))
    }

    /// Shape text, or the sentinel string for unsupported entries
    pub fn as_str(&self) -> &str {
        match self {
            QueryShape::Shape(shape) => shape,
            QueryShape::UnsupportedQuery => UNSUPPORTED_QUERY,
            QueryShape::UnsupportedCommand => UNSUPPORTED_COMMAND,
        }
    }

    /// Build the canonical event for `entry` using this shape
    pub fn into_event(self, database_id: &DatabaseId, entry: &RawLogEntry) -> ProfiledQueryEvent {
        let query_shape = match self {
            QueryShape::Shape(shape) => shape,
            other => other.as_str().to_string(),
        };
        ProfiledQueryEvent {
            database_id: database_id.clone(),
            timestamp: entry.timestamp,
            collection: collection_of(&entry.namespace).to_string(),
            query_shape,
            execution_time_ms: entry.duration_ms,
        }
    }
}

impl fmt::Display for QueryShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recognised command kinds, borrowed from the command document
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind<'a> {
    Find {
        target: &'a str,
        filter: Option<&'a Document>,
    },
    Aggregate {
        target: &'a str,
        pipeline: Option<&'a Vec<Bson>>,
    },
    Count {
        target: &'a str,
        query: Option<&'a Document>,
    },
    Distinct {
        target: &'a str,
        key: &'a str,
        query: Option<&'a Document>,
    },
    /// Anything else, including recognised commands with a non-string target
    Other,
}

impl<'a> CommandKind<'a> {
    /// Classify a command document by its first key, which names the command.
    pub fn classify(command: &'a Document) -> Self {
        let Some((name, target)) = command.iter().next() else {
            return CommandKind::Other;
        };
        let Bson::String(target) = target else {
            return CommandKind::Other;
        };
        let target = target.as_str();

        match name.as_str() {
            "find" => CommandKind::Find {
                target,
                filter: command.get_document("filter").ok(),
            },
            "aggregate" => CommandKind::Aggregate {
                target,
                pipeline: command.get_array("pipeline").ok(),
            },
            "count" => CommandKind::Count {
                target,
                query: command.get_document("query").ok(),
            },
            "distinct" => match command.get_str("key") {
                Ok(key) => CommandKind::Distinct {
                    target,
                    key,
                    query: command.get_document("query").ok(),
                },
                Err(_) => CommandKind::Other,
            },
            _ => CommandKind::Other,
        }
    }
}

/// Canonicalize a profiler entry
pub fn canonicalize(entry: &RawLogEntry) -> QueryShape {
    canonicalize_payload(&entry.namespace, &entry.payload)
}

/// Canonicalize a payload recorded against `namespace`
pub fn canonicalize_payload(namespace: &str, payload: &LogPayload) -> QueryShape {
    match payload {
        LogPayload::Query(filter) => {
            QueryShape::Shape(format!("db.{}.find({})", namespace, render_document(filter)))
        }
        LogPayload::Command(command) => canonicalize_command(command),
        LogPayload::Absent => QueryShape::UnsupportedQuery,
    }
}

fn canonicalize_command(command: &Document) -> QueryShape {
    let shape = match CommandKind::classify(command) {
        CommandKind::Find { target, filter } => {
            format!("db.{}.find({})", target, render_optional_document(filter))
        }
        CommandKind::Aggregate { target, pipeline } => {
            let pipeline = pipeline
                .map(|stages| render_array(stages))
                .unwrap_or_else(|| "[]".to_string());
            format!("db.{}.aggregate({})", target, pipeline)
        }
        CommandKind::Count { target, query } => {
            format!("db.{}.count({})", target, render_optional_document(query))
        }
        CommandKind::Distinct { target, key, query } => format!(
            "db.{}.distinct({}, {})",
            target,
            render_string(key),
            render_optional_document(query)
        ),
        CommandKind::Other => return QueryShape::UnsupportedCommand,
    };
    QueryShape::Shape(shape)
}

fn render_optional_document(doc: Option<&Document>) -> String {
    doc.map(render_document).unwrap_or_else(|| "{}".to_string())
}

/// Render a document as shell-like text: `{status: "open", qty: {$gt: 5}}`
pub fn render_document(doc: &Document) -> String {
    if doc.is_empty() {
        return "{}".to_string();
    }
    let fields: Vec<String> = doc
        .iter()
        .map(|(key, value)| format!("{}: {}", render_key(key), render_value(value)))
        .collect();
    format!("{{{}}}", fields.join(", "))
}

fn render_array(items: &[Bson]) -> String {
    let items: Vec<String> = items.iter().map(render_value).collect();
    format!("[{}]", items.join(", "))
}

fn render_key(key: &str) -> String {
    let mut chars = key.chars();
    let identifier_like = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == '$' => chars
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$'),
        _ => false,
    };
    if identifier_like {
        key.to_string()
    } else {
        render_string(key)
    }
}

fn render_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

fn render_double(d: f64) -> String {
    if d.is_nan() {
        "NaN".to_string()
    } else if d.is_infinite() {
        let sign = if d > 0.0 { "" } else { "-" };
        format!("{}Infinity", sign)
    } else {
        d.to_string()
    }
}

/// Render a single BSON value as shell-like text
pub fn render_value(value: &Bson) -> String {
    match value {
        Bson::Null => "null".to_string(),
        Bson::Undefined => "undefined".to_string(),
        Bson::Boolean(b) => b.to_string(),
        Bson::Int32(i) => i.to_string(),
        Bson::Int64(i) => i.to_string(),
        Bson::Double(d) => render_double(*d),
        Bson::Decimal128(d) => format!("NumberDecimal(\"{}\")", d),
        Bson::String(s) => render_string(s),
        Bson::Symbol(s) => render_string(s),
        Bson::Array(items) => render_array(items),
        Bson::Document(doc) => render_document(doc),
        Bson::ObjectId(id) => format!("ObjectId(\"{}\")", id.to_hex()),
        Bson::DateTime(dt) => match dt.try_to_rfc3339_string() {
            Ok(iso) => format!("ISODate(\"{}\")", iso),
            Err(_) => format!("new Date({})", dt.timestamp_millis()),
        },
        Bson::Timestamp(ts) => format!("Timestamp({}, {})", ts.time, ts.increment),
        Bson::Binary(bin) => format!(
            "BinData({}, \"{}\")",
            u8::from(bin.subtype),
            STANDARD.encode(&bin.bytes)
        ),
        Bson::RegularExpression(regex) => format!("/{}/{}", regex.pattern, regex.options),
        Bson::JavaScriptCode(code) => format!("Code({})", render_string(code)),
        Bson::JavaScriptCodeWithScope(code) => format!(
            "Code({}, {})",
            render_string(&code.code),
            render_document(&code.scope)
        ),
        Bson::MinKey => "MinKey()".to_string(),
        Bson::MaxKey => "MaxKey()".to_string(),
        other => format!("{:?}", other),
    }
}
