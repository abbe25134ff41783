//! Actions: invokable behaviour attached to a node.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dslink_protocol::{Column, Envelope, Permission, Response, StreamState, Value};
use tokio_util::sync::CancellationToken;

use crate::connection::Outbound;
use crate::types::{ActionError, LinkError, Result};

/// How an action reports results (`$result`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultType {
    /// A single row; the stream closes with it.
    #[default]
    Values,
    /// Rows replace (first update) and then append to a table.
    Table,
    /// Open-ended row stream.
    Stream,
}

impl ResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultType::Values => "values",
            ResultType::Table => "table",
            ResultType::Stream => "stream",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "values" => Some(ResultType::Values),
            "table" => Some(ResultType::Table),
            "stream" => Some(ResultType::Stream),
            _ => None,
        }
    }
}

/// Behaviour run for each `invoke` on a node.
///
/// Closures `Fn(InvokeRequest) -> impl Future<Output = Result<(), ActionError>>`
/// implement this directly.
#[async_trait]
pub trait Action: Send + Sync + 'static {
    async fn invoke(&self, request: InvokeRequest) -> std::result::Result<(), ActionError>;
}

#[async_trait]
impl<F, Fut> Action for F
where
    F: Fn(InvokeRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), ActionError>> + Send + 'static,
{
    async fn invoke(&self, request: InvokeRequest) -> std::result::Result<(), ActionError> {
        (self)(request).await
    }
}

/// An action plus the metadata advertised for it.
#[derive(Clone)]
pub struct ActionHandler {
    pub(crate) permission: Permission,
    pub(crate) result_type: ResultType,
    pub(crate) params: Vec<Value>,
    pub(crate) columns: Vec<Column>,
    pub(crate) action: Arc<dyn Action>,
}

impl ActionHandler {
    pub fn new(permission: Permission, action: impl Action) -> Self {
        Self {
            permission,
            result_type: ResultType::Values,
            params: Vec::new(),
            columns: Vec::new(),
            action: Arc::new(action),
        }
    }

    pub fn param(mut self, name: &str, type_name: &str) -> Self {
        let mut def = Value::map();
        def.insert("name", name);
        def.insert("type", type_name);
        self.params.push(def);
        self
    }

    pub fn column(mut self, name: &str, type_name: &str) -> Self {
        self.columns.push(Column::new(name, type_name));
        self
    }

    pub fn result_type(mut self, result_type: ResultType) -> Self {
        self.result_type = result_type;
        self
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    /// Configs advertising this action on its node.
    pub(crate) fn configs(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("invokable", self.permission.into()),
            ("params", Value::Array(self.params.clone())),
            (
                "columns",
                self.columns.iter().map(Column::to_value).collect::<Value>(),
            ),
            ("result", self.result_type.as_str().into()),
        ]
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invocation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared between an [`InvokeRequest`] and the responder's stream table.
#[derive(Default)]
pub(crate) struct InvokeState {
    pub(crate) closed: AtomicBool,
    columns_sent: AtomicBool,
    pub(crate) cancel: CancellationToken,
}

impl InvokeState {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// One in-flight invocation, handed to the [`Action`].
///
/// Cheap to clone; all clones write to the same stream.
#[derive(Clone)]
pub struct InvokeRequest {
    rid: i64,
    path: String,
    params: Value,
    result_type: ResultType,
    columns: Vec<Column>,
    pub(crate) state: Arc<InvokeState>,
    outbound: Arc<dyn Outbound>,
}

impl InvokeRequest {
    pub(crate) fn new(
        rid: i64,
        path: String,
        params: Value,
        handler: &ActionHandler,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        Self {
            rid,
            path,
            params,
            result_type: handler.result_type,
            columns: handler.columns.clone(),
            state: Arc::new(InvokeState::default()),
            outbound,
        }
    }

    pub fn rid(&self) -> i64 {
        self.rid
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn result_type(&self) -> ResultType {
        self.result_type
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Fires when the requester closes the stream or the link disconnects.
    pub fn cancel_token(&self) -> CancellationToken {
        self.state.cancel.clone()
    }

    /// Emit rows.  Columns ride along with the first emission only.
    ///
    /// For [`ResultType::Values`] this is the single result and closes the
    /// stream.
    pub fn update_table(&self, rows: Vec<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(LinkError::RequestClosed(self.rid));
        }

        let first = !self.state.columns_sent.swap(true, Ordering::SeqCst);
        let mut response = Response::open(self.rid, rows);
        if first && !self.columns.is_empty() {
            response.columns = Some(self.columns.clone());
        }
        match self.result_type {
            ResultType::Values => {
                response.stream = Some(StreamState::Closed);
                self.state.closed.store(true, Ordering::SeqCst);
            }
            ResultType::Table => {
                response.meta = Some(mode(if first { "refresh" } else { "append" }));
            }
            ResultType::Stream => {
                response.meta = Some(mode("stream"));
            }
        }
        self.outbound
            .enqueue(Envelope::with_responses(vec![response.to_value()]));
        Ok(())
    }

    /// Single-row convenience for [`ResultType::Values`] actions.
    pub fn send_values(&self, row: Vec<Value>) -> Result<()> {
        self.update_table(vec![Value::Array(row)])
    }

    /// Close the stream.  Idempotent.
    pub fn close(&self) {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            self.outbound
                .enqueue(Envelope::with_responses(vec![Response::closed(self.rid).to_value()]));
        }
    }

    /// Close the stream carrying `error`.  No-op if already closed.
    pub fn close_with_error(&self, error: &ActionError) {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            let mut response = Response::closed(self.rid);
            response.error = Some(error.to_value());
            self.outbound
                .enqueue(Envelope::with_responses(vec![response.to_value()]));
        }
    }
}

fn mode(name: &str) -> Value {
    let mut meta = Value::map();
    meta.insert("mode", name);
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::RecordingOutbound;

    fn request(result_type: ResultType, outbound: &Arc<RecordingOutbound>) -> InvokeRequest {
        let handler = ActionHandler::new(Permission::Read, |_req: InvokeRequest| async { Ok::<_, ActionError>(()) })
            .column("n", "number")
            .result_type(result_type);
        InvokeRequest::new(9, "/act".into(), Value::map(), &handler, outbound.clone())
    }

    #[test]
    fn columns_only_on_first_table_update() {
        let outbound = Arc::new(RecordingOutbound::default());
        let req = request(ResultType::Table, &outbound);
        req.update_table(vec![Value::Array(vec![1.into()])]).unwrap();
        req.update_table(vec![Value::Array(vec![2.into()])]).unwrap();

        let responses = outbound.responses();
        assert_eq!(responses.len(), 2);
        assert!(responses[0].columns.is_some());
        assert!(responses[1].columns.is_none());
        assert_eq!(responses[0].meta.as_ref().and_then(|m| m.get("mode")), Some(&Value::from("refresh")));
        assert_eq!(responses[1].meta.as_ref().and_then(|m| m.get("mode")), Some(&Value::from("append")));
        assert_eq!(responses[1].stream, Some(StreamState::Open));
    }

    #[test]
    fn values_result_closes_with_first_update() {
        let outbound = Arc::new(RecordingOutbound::default());
        let req = request(ResultType::Values, &outbound);
        req.send_values(vec![5.into()]).unwrap();
        assert!(req.is_closed());
        assert!(matches!(
            req.send_values(vec![6.into()]),
            Err(LinkError::RequestClosed(9))
        ));

        req.close();
        let responses = outbound.responses();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].is_closed());
    }

    #[test]
    fn close_is_idempotent() {
        let outbound = Arc::new(RecordingOutbound::default());
        let req = request(ResultType::Stream, &outbound);
        req.close();
        req.close();
        req.close_with_error(&ActionError::Failed("late".into()));
        assert_eq!(outbound.responses().len(), 1);
    }

    #[test]
    fn handler_configs_advertise_action() {
        let handler = ActionHandler::new(Permission::Write, |_req: InvokeRequest| async { Ok::<_, ActionError>(()) })
            .param("target", "string")
            .result_type(ResultType::Stream);
        let configs: std::collections::HashMap<_, _> = handler.configs().into_iter().collect();
        assert_eq!(configs["invokable"], Value::from("write"));
        assert_eq!(configs["result"], Value::from("stream"));
        assert_eq!(
            configs["params"].as_array().map(Vec::len),
            Some(1)
        );
    }
}
