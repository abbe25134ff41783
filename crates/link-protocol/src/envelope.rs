//! Envelope and message types.
//!
//! The [`Envelope`] is what goes over the socket.  Its `requests` and
//! `responses` arrays stay as raw [`Value`]s so one malformed entry never
//! poisons a whole frame; [`Request::parse`] and [`Response::parse`] turn
//! individual entries into typed messages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::permission::Permission;
use crate::value::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One transport-level message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender-assigned, monotonically increasing message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<i64>,
    /// Echo of the last `msg` received from the peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub responses: Vec<Value>,
}

impl Envelope {
    pub fn with_requests(requests: Vec<Value>) -> Self {
        Self {
            requests,
            ..Default::default()
        }
    }

    pub fn with_responses(responses: Vec<Value>) -> Self {
        Self {
            responses,
            ..Default::default()
        }
    }

    /// True when there is nothing to deliver besides sequencing ids.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.responses.is_empty() && self.ack.is_none()
    }

    /// Fold `other` into `self`: arrays are concatenated, `ack` is
    /// overwritten by the later one.
    pub fn merge(&mut self, other: Envelope) {
        self.requests.extend(other.requests);
        self.responses.extend(other.responses);
        if other.ack.is_some() {
            self.ack = other.ack;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Requests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    List,
    Set,
    Remove,
    Invoke,
    Subscribe,
    Unsubscribe,
    Close,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::List => "list",
            Method::Set => "set",
            Method::Remove => "remove",
            Method::Invoke => "invoke",
            Method::Subscribe => "subscribe",
            Method::Unsubscribe => "unsubscribe",
            Method::Close => "close",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "list" => Some(Method::List),
            "set" => Some(Method::Set),
            "remove" => Some(Method::Remove),
            "invoke" => Some(Method::Invoke),
            "subscribe" => Some(Method::Subscribe),
            "unsubscribe" => Some(Method::Unsubscribe),
            "close" => Some(Method::Close),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `{path, sid}` entry of a subscribe request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribePath {
    pub path: String,
    pub sid: i64,
    pub qos: Option<i64>,
}

impl SubscribePath {
    fn parse(value: &Value) -> Option<Self> {
        Some(Self {
            path: value.get("path")?.as_str()?.to_string(),
            sid: value.get("sid")?.as_i64()?,
            qos: value.get("qos").and_then(Value::as_i64),
        })
    }

    fn to_value(&self) -> Value {
        let mut v = Value::map();
        v.insert("path", self.path.as_str());
        v.insert("sid", self.sid);
        if let Some(qos) = self.qos {
            v.insert("qos", qos);
        }
        v
    }
}

/// A typed request.  Which optional fields are meaningful depends on
/// `method`.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub rid: i64,
    pub method: Method,
    pub path: Option<String>,
    pub permit: Option<Permission>,
    pub value: Option<Value>,
    pub params: Option<Value>,
    pub paths: Vec<SubscribePath>,
    pub sids: Vec<i64>,
}

impl Request {
    fn new(rid: i64, method: Method) -> Self {
        Self {
            rid,
            method,
            path: None,
            permit: None,
            value: None,
            params: None,
            paths: Vec::new(),
            sids: Vec::new(),
        }
    }

    pub fn list(rid: i64, path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new(rid, Method::List)
        }
    }

    pub fn set(
        rid: i64,
        path: impl Into<String>,
        value: Value,
        permit: Option<Permission>,
    ) -> Self {
        Self {
            path: Some(path.into()),
            value: Some(value),
            permit,
            ..Self::new(rid, Method::Set)
        }
    }

    pub fn remove(rid: i64, path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new(rid, Method::Remove)
        }
    }

    pub fn invoke(
        rid: i64,
        path: impl Into<String>,
        params: Value,
        permit: Option<Permission>,
    ) -> Self {
        Self {
            path: Some(path.into()),
            params: Some(params),
            permit,
            ..Self::new(rid, Method::Invoke)
        }
    }

    pub fn subscribe(rid: i64, paths: Vec<SubscribePath>) -> Self {
        Self {
            paths,
            ..Self::new(rid, Method::Subscribe)
        }
    }

    pub fn unsubscribe(rid: i64, sids: Vec<i64>) -> Self {
        Self {
            sids,
            ..Self::new(rid, Method::Unsubscribe)
        }
    }

    pub fn close(rid: i64) -> Self {
        Self::new(rid, Method::Close)
    }

    /// Parse one entry of an envelope's `requests` array.
    ///
    /// A missing `rid` or `method` is [`ProtocolError::Malformed`]; a method
    /// outside the protocol is [`ProtocolError::UnknownMethod`].  Malformed
    /// entries inside `paths` and `sids` are dropped.
    pub fn parse(value: &Value) -> Result<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| ProtocolError::Malformed("request is not a map".into()))?;
        let rid = map
            .get("rid")
            .and_then(Value::as_i64)
            .ok_or_else(|| ProtocolError::Malformed("request without rid".into()))?;
        let method_name = map
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed(format!("request {rid} without method")))?;
        let method = Method::parse(method_name)
            .ok_or_else(|| ProtocolError::UnknownMethod(method_name.to_string()))?;

        let paths = map
            .get("paths")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().filter_map(SubscribePath::parse).collect())
            .unwrap_or_default();
        let sids = map
            .get("sids")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();

        Ok(Self {
            rid,
            method,
            path: map.get("path").and_then(Value::as_str).map(str::to_string),
            permit: map.get("permit").and_then(Permission::from_value),
            value: map.get("value").cloned(),
            params: map.get("params").cloned(),
            paths,
            sids,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut v = Value::map();
        v.insert("rid", self.rid);
        v.insert("method", self.method.as_str());
        if let Some(path) = &self.path {
            v.insert("path", path.as_str());
        }
        if let Some(permit) = self.permit {
            v.insert("permit", permit);
        }
        if let Some(value) = &self.value {
            v.insert("value", value.clone());
        }
        if let Some(params) = &self.params {
            v.insert("params", params.clone());
        }
        if !self.paths.is_empty() {
            v.insert(
                "paths",
                self.paths.iter().map(SubscribePath::to_value).collect::<Value>(),
            );
        }
        if !self.sids.is_empty() {
            v.insert(
                "sids",
                self.sids.iter().map(|s| Value::Int(*s)).collect::<Value>(),
            );
        }
        v
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Responses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Initialize,
    Open,
    Closed,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Initialize => "initialize",
            StreamState::Open => "open",
            StreamState::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initialize" => Some(StreamState::Initialize),
            "open" => Some(StreamState::Open),
            "closed" => Some(StreamState::Closed),
            _ => None,
        }
    }
}

/// An action result column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub type_name: String,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }

    pub fn parse(value: &Value) -> Option<Self> {
        Some(Self {
            name: value.get("name")?.as_str()?.to_string(),
            type_name: value
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("dynamic")
                .to_string(),
        })
    }

    pub fn to_value(&self) -> Value {
        let mut v = Value::map();
        v.insert("name", self.name.as_str());
        v.insert("type", self.type_name.as_str());
        v
    }
}

/// A typed response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub rid: i64,
    pub stream: Option<StreamState>,
    pub updates: Option<Vec<Value>>,
    pub columns: Option<Vec<Column>>,
    pub meta: Option<Value>,
    pub error: Option<Value>,
}

impl Response {
    pub fn new(rid: i64) -> Self {
        Self {
            rid,
            stream: None,
            updates: None,
            columns: None,
            meta: None,
            error: None,
        }
    }

    /// `{rid, stream: "closed"}`.
    pub fn closed(rid: i64) -> Self {
        Self {
            stream: Some(StreamState::Closed),
            ..Self::new(rid)
        }
    }

    /// `{rid, stream: "open", updates}`.
    pub fn open(rid: i64, updates: Vec<Value>) -> Self {
        Self {
            stream: Some(StreamState::Open),
            updates: Some(updates),
            ..Self::new(rid)
        }
    }

    /// `{rid: 0, updates}`: a batch of subscription value updates.
    pub fn subscription_updates(updates: Vec<Value>) -> Self {
        Self {
            updates: Some(updates),
            ..Self::new(0)
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream == Some(StreamState::Closed)
    }

    pub fn parse(value: &Value) -> Result<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| ProtocolError::Malformed("response is not a map".into()))?;
        let rid = map
            .get("rid")
            .and_then(Value::as_i64)
            .ok_or_else(|| ProtocolError::Malformed("response without rid".into()))?;
        Ok(Self {
            rid,
            stream: map
                .get("stream")
                .and_then(Value::as_str)
                .and_then(StreamState::parse),
            updates: map.get("updates").and_then(Value::as_array).cloned(),
            columns: map
                .get("columns")
                .and_then(Value::as_array)
                .map(|cols| cols.iter().filter_map(Column::parse).collect()),
            meta: map.get("meta").cloned(),
            error: map.get("error").cloned(),
        })
    }

    pub fn to_value(&self) -> Value {
        let mut v = Value::map();
        v.insert("rid", self.rid);
        if let Some(stream) = self.stream {
            v.insert("stream", stream.as_str());
        }
        if let Some(columns) = &self.columns {
            v.insert(
                "columns",
                columns.iter().map(Column::to_value).collect::<Value>(),
            );
        }
        if let Some(updates) = &self.updates {
            v.insert("updates", Value::Array(updates.clone()));
        }
        if let Some(meta) = &self.meta {
            v.insert("meta", meta.clone());
        }
        if let Some(error) = &self.error {
            v.insert("error", error.clone());
        }
        v
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscription updates (rid 0)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One value update for a subscription id.
///
/// Arrives either as `[sid, value, ts]` or, for rolled-up numeric
/// subscriptions, as `{sid, value, ts, count, sum, min, max}`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionUpdate {
    pub sid: i64,
    pub value: Value,
    pub timestamp: Option<String>,
    pub count: Option<i64>,
    pub sum: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl SubscriptionUpdate {
    pub fn new(sid: i64, value: Value, timestamp: Option<String>) -> Self {
        Self {
            sid,
            value,
            timestamp,
            count: None,
            sum: None,
            min: None,
            max: None,
        }
    }

    pub fn parse(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) => {
                let mut items = items.iter();
                let sid = items.next()?.as_i64()?;
                let value = items.next().cloned().unwrap_or_default();
                let timestamp = items.next().and_then(Value::as_str).map(str::to_string);
                Some(Self::new(sid, value, timestamp))
            }
            Value::Map(map) => Some(Self {
                sid: map.get("sid")?.as_i64()?,
                value: map.get("value").cloned().unwrap_or_default(),
                timestamp: map.get("ts").and_then(Value::as_str).map(str::to_string),
                count: map.get("count").and_then(Value::as_i64),
                sum: map.get("sum").and_then(Value::as_f64),
                min: map.get("min").and_then(Value::as_f64),
                max: map.get("max").and_then(Value::as_f64),
            }),
            _ => None,
        }
    }

    /// Array form, which is what this SDK produces.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Int(self.sid),
            self.value.clone(),
            self.timestamp.clone().into(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: &str) -> Value {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parses_set_request() {
        let req = Request::parse(&raw(
            r#"{"rid":3,"method":"set","path":"/a","value":5,"permit":"write"}"#,
        ))
        .unwrap();
        assert_eq!(req.rid, 3);
        assert_eq!(req.method, Method::Set);
        assert_eq!(req.path.as_deref(), Some("/a"));
        assert_eq!(req.value, Some(Value::Int(5)));
        assert_eq!(req.permit, Some(Permission::Write));
    }

    #[test]
    fn unknown_method_is_distinct_from_malformed() {
        let err = Request::parse(&raw(r#"{"rid":1,"method":"explode"}"#)).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMethod(m) if m == "explode"));

        let err = Request::parse(&raw(r#"{"method":"list"}"#)).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn bad_subscribe_paths_are_skipped() {
        let req = Request::parse(&raw(
            r#"{"rid":2,"method":"subscribe","paths":[{"path":"/a","sid":1},{"sid":2},"junk"]}"#,
        ))
        .unwrap();
        assert_eq!(req.paths.len(), 1);
        assert_eq!(req.paths[0].path, "/a");
    }

    #[test]
    fn request_to_value_round_trips() {
        let req = Request::subscribe(
            4,
            vec![SubscribePath {
                path: "/x".into(),
                sid: 9,
                qos: None,
            }],
        );
        assert_eq!(Request::parse(&req.to_value()).unwrap(), req);
    }

    #[test]
    fn merge_concatenates_and_overwrites_ack() {
        let mut a = Envelope {
            ack: Some(1),
            responses: vec![Value::from(1)],
            ..Default::default()
        };
        a.merge(Envelope {
            ack: Some(2),
            responses: vec![Value::from(2)],
            requests: vec![Value::from(3)],
            ..Default::default()
        });
        assert_eq!(a.ack, Some(2));
        assert_eq!(a.responses.len(), 2);
        assert_eq!(a.requests.len(), 1);
    }

    #[test]
    fn empty_arrays_are_not_serialized() {
        let json = serde_json::to_string(&Envelope {
            msg: Some(1),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json, r#"{"msg":1}"#);
    }

    #[test]
    fn subscription_update_forms() {
        let arr = SubscriptionUpdate::parse(&raw(r#"[5, 12, "2024-01-01T00:00:00.000+00:00"]"#))
            .unwrap();
        assert_eq!(arr.sid, 5);
        assert_eq!(arr.value, Value::Int(12));
        assert!(arr.count.is_none());

        let agg = SubscriptionUpdate::parse(&raw(
            r#"{"sid":6,"value":3.5,"ts":"x","count":4,"sum":14,"min":1,"max":6}"#,
        ))
        .unwrap();
        assert_eq!(agg.sid, 6);
        assert_eq!(agg.count, Some(4));
        assert_eq!(agg.sum, Some(14.0));
        assert_eq!(agg.max, Some(6.0));
    }

    #[test]
    fn response_parse_reads_columns() {
        let resp = Response::parse(&raw(
            r#"{"rid":7,"stream":"open","columns":[{"name":"a","type":"number"}],"updates":[[1]]}"#,
        ))
        .unwrap();
        assert_eq!(resp.stream, Some(StreamState::Open));
        assert_eq!(resp.columns.unwrap()[0], Column::new("a", "number"));
        assert_eq!(resp.updates.unwrap().len(), 1);
    }
}
