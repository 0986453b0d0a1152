// Live feeds - a compiled query kept running against the change log

use crate::backend::{Backend, ChangeEvent, ChangeKind, Subscription};
use crate::config::KernelConfig;
use crate::error::{ContractDbError, Result};
use crate::kernel::compile_query;
use crate::matcher::{evaluate, BackendLinks, ImageLinks};
use crate::permission::redact;
use crate::schema::Schema;
use crate::sql::{QueryOptions, SqlQuery, ID_COLUMN};
use crate::view::query_schema;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// What a live feed reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    /// A new contract matches.
    Insert { id: String, contract: Value },
    /// A matching contract changed and still matches.
    Update { id: String, contract: Value },
    /// A matching contract was deleted.
    Delete { id: String },
    /// A contract that matched does not anymore.
    Unmatch { id: String },
    /// Answer to [`Stream::query`].
    Dataset { id: String, contracts: Vec<Value> },
    Error { message: String },
    /// Last event of a closed stream.
    Closed,
}

enum Request {
    Change(ChangeEvent),
    Query {
        id: String,
        schema: Schema,
        options: QueryOptions,
    },
    SetSchema {
        schema: Schema,
        options: QueryOptions,
    },
    Close,
}

/// A live feed over one query.
///
/// Changes are classified on a background thread against the compiled
/// predicate. Events for one contract arrive in the order the backend
/// committed them.
pub struct Stream {
    events: mpsc::Receiver<StreamEvent>,
    requests: mpsc::Sender<Request>,
    subscription: Option<Subscription>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    pub(crate) fn open<B: Backend>(
        backend: Arc<B>,
        config: KernelConfig,
        mask: Schema,
        schema: &Schema,
        options: &QueryOptions,
    ) -> Result<Stream> {
        let query = compile_query(&config, &mask, schema, None, options)?;
        let (request_tx, request_rx) = mpsc::channel::<Request>();
        let (event_tx, event_rx) = mpsc::channel::<StreamEvent>();

        let sink_tx = request_tx.clone();
        let subscription = backend.subscribe_changes(Box::new(move |change| {
            let _ = sink_tx.send(Request::Change(change));
        }));

        let worker = Worker {
            backend,
            config,
            mask,
            query,
            matched: HashSet::new(),
            events: event_tx,
        };
        let handle = std::thread::Builder::new()
            .name("contractdb-stream".to_string())
            .spawn(move || worker.run(request_rx))
            .map_err(|e| ContractDbError::Database(format!("Cannot start stream: {e}")))?;

        log::debug!("Stream opened");
        Ok(Stream {
            events: event_rx,
            requests: request_tx,
            subscription: Some(subscription),
            worker: Some(handle),
        })
    }

    /// Run a one-off query under the stream's permissions. The result comes
    /// back as a `Dataset` event tagged with `id`, and its contracts can
    /// later be reported as unmatched.
    pub fn query(&self, id: impl Into<String>, schema: &Value, options: QueryOptions) -> Result<()> {
        let schema = query_schema(schema)?;
        self.send(Request::Query {
            id: id.into(),
            schema,
            options,
        })
    }

    /// Swap the live predicate without dropping the subscription.
    pub fn set_schema(&self, schema: &Value, options: QueryOptions) -> Result<()> {
        let schema = query_schema(schema)?;
        self.send(Request::SetSchema { schema, options })
    }

    pub fn recv(&self) -> Option<StreamEvent> {
        self.events.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<StreamEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    /// Stop the feed. No change is reported after this returns; events
    /// already queued, and the final `Closed`, can still be received.
    pub fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        let _ = self.requests.send(Request::Close);
        if worker.join().is_err() {
            log::error!("Stream worker panicked");
        }
    }

    fn send(&self, request: Request) -> Result<()> {
        if self.worker.is_none() {
            return Err(ContractDbError::Database("Stream is closed".into()));
        }
        self.requests
            .send(request)
            .map_err(|_| ContractDbError::Database("Stream is closed".into()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("open", &self.worker.is_some())
            .finish()
    }
}

struct Worker<B: Backend> {
    backend: Arc<B>,
    config: KernelConfig,
    mask: Schema,
    query: SqlQuery,
    /// Contracts reported as matching, so that they can be unmatched.
    matched: HashSet<String>,
    events: mpsc::Sender<StreamEvent>,
}

impl<B: Backend> Worker<B> {
    fn run(mut self, requests: mpsc::Receiver<Request>) {
        for request in requests.iter() {
            let event = match request {
                Request::Change(change) => match self.classify(&change) {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("Failed to match change of {}: {e}", change.id);
                        Some(StreamEvent::Error { message: e.to_string() })
                    }
                },
                Request::Query { id, schema, options } => Some(self.dataset(id, &schema, &options)),
                Request::SetSchema { schema, options } => self.set_schema(&schema, &options),
                Request::Close => break,
            };
            if let Some(event) = event {
                if self.events.send(event).is_err() {
                    log::debug!("Stream receiver dropped");
                    return;
                }
            }
        }
        let _ = self.events.send(StreamEvent::Closed);
        log::debug!("Stream closed");
    }

    /// Matches reported under the previous predicate are forgotten, so they
    /// are not unmatched by it later.
    fn set_schema(&mut self, schema: &Schema, options: &QueryOptions) -> Option<StreamEvent> {
        match compile_query(&self.config, &self.mask, schema, None, options) {
            Ok(query) => {
                self.query = query;
                self.matched.clear();
                None
            }
            Err(e) => Some(StreamEvent::Error { message: e.to_string() }),
        }
    }

    fn classify(&mut self, change: &ChangeEvent) -> Result<Option<StreamEvent>> {
        let fallback = BackendLinks::new(&*self.backend);
        let id = change.id.clone();

        let was_matched = self.matched.contains(&id)
            || match &change.before {
                Some(before) => evaluate(&self.query, before, &ImageLinks::new(before, &fallback))?.is_some(),
                None => false,
            };

        if change.kind == ChangeKind::Delete {
            self.matched.remove(&id);
            return Ok(was_matched.then_some(StreamEvent::Delete { id }));
        }

        let Some(after) = &change.after else {
            return Ok(None);
        };
        match evaluate(&self.query, after, &ImageLinks::new(after, &fallback))? {
            Some(contract) => {
                self.matched.insert(id.clone());
                let contract = redact(&self.mask, contract);
                Ok(Some(match change.kind {
                    ChangeKind::Insert => StreamEvent::Insert { id, contract },
                    _ => StreamEvent::Update { id, contract },
                }))
            }
            None if was_matched => {
                self.matched.remove(&id);
                Ok(Some(StreamEvent::Unmatch { id }))
            }
            None => Ok(None),
        }
    }

    fn dataset(&mut self, id: String, schema: &Schema, options: &QueryOptions) -> StreamEvent {
        let result = compile_query(&self.config, &self.mask, schema, None, options)
            .and_then(|query| Ok((self.backend.execute(&query)?, query)));
        match result {
            Ok((rows, query)) => {
                for row in &rows {
                    if let Some(matched) = row.get(ID_COLUMN).and_then(Value::as_str) {
                        self.matched.insert(matched.to_string());
                    }
                }
                let contracts = query
                    .reshape(rows)
                    .into_iter()
                    .map(|c| redact(&self.mask, c))
                    .collect();
                StreamEvent::Dataset { id, contracts }
            }
            Err(e) => {
                log::warn!("Stream query {id} failed: {e}");
                StreamEvent::Error { message: e.to_string() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use crate::patch::parse_patch;
    use crate::test_utils;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(5);

    fn open_cards() -> Value {
        json!({
            "type": "object",
            "required": ["type", "data"],
            "properties": {
                "type": { "const": "card@1.0.0" },
                "data": {
                    "required": ["status"],
                    "properties": { "status": { "const": "open" } }
                }
            }
        })
    }

    #[test]
    fn test_insert_then_unmatch() {
        let kernel = test_utils::kernel();
        let session = kernel.admin_session().unwrap();
        let mut stream = kernel.stream(&session, &open_cards(), QueryOptions::default()).unwrap();

        let slug = test_utils::random_slug("card");
        let card = kernel
            .insert_contract(&session, json!({
                "slug": slug,
                "type": "card@1.0.0",
                "data": { "status": "open" }
            }))
            .unwrap();

        assert_eq!(
            stream.recv_timeout(WAIT),
            Some(StreamEvent::Insert {
                id: card.id.clone(),
                contract: json!({ "type": "card@1.0.0", "data": { "status": "open" } }),
            })
        );

        let ops = parse_patch(json!([{ "op": "replace", "path": "/data/status", "value": "closed" }])).unwrap();
        kernel.patch_by_slug(&session, &format!("{slug}@1.0.0"), &ops).unwrap();
        assert_eq!(stream.recv_timeout(WAIT), Some(StreamEvent::Unmatch { id: card.id.clone() }));

        // No longer matched: a further change is not reported
        let ops = parse_patch(json!([{ "op": "add", "path": "/data/note", "value": "x" }])).unwrap();
        kernel.patch_by_slug(&session, &format!("{slug}@1.0.0"), &ops).unwrap();
        stream.query("after", &open_cards(), QueryOptions::default()).unwrap();
        assert_eq!(
            stream.recv_timeout(WAIT),
            Some(StreamEvent::Dataset { id: "after".into(), contracts: vec![] })
        );

        stream.close();
        assert_eq!(stream.recv_timeout(WAIT), Some(StreamEvent::Closed));
    }

    #[test]
    fn test_update_of_matching_contract() {
        let kernel = test_utils::kernel();
        let session = kernel.admin_session().unwrap();
        let slug = test_utils::random_slug("card");
        let card = kernel
            .insert_contract(&session, json!({
                "slug": slug,
                "type": "card@1.0.0",
                "data": { "status": "open" }
            }))
            .unwrap();

        let stream = kernel.stream(&session, &open_cards(), QueryOptions::default()).unwrap();
        let ops = parse_patch(json!([{ "op": "add", "path": "/data/note", "value": "x" }])).unwrap();
        kernel.patch_by_slug(&session, &format!("{slug}@1.0.0"), &ops).unwrap();

        assert_eq!(
            stream.recv_timeout(WAIT),
            Some(StreamEvent::Update {
                id: card.id,
                contract: json!({ "type": "card@1.0.0", "data": { "status": "open" } }),
            })
        );
    }

    #[test]
    fn test_dataset_and_set_schema() {
        let kernel = test_utils::kernel();
        let session = kernel.admin_session().unwrap();
        let stream = kernel.stream(&session, &open_cards(), QueryOptions::default()).unwrap();

        let org = kernel
            .insert_contract(&session, json!({ "type": "org@1.0.0", "name": "Acme Org" }))
            .unwrap();
        // Not matched by the open cards query
        stream
            .query("orgs", &json!({ "required": ["slug"], "properties": { "type": { "const": "org@1.0.0" } } }), QueryOptions::default())
            .unwrap();
        assert_eq!(
            stream.recv_timeout(WAIT),
            Some(StreamEvent::Dataset {
                id: "orgs".into(),
                contracts: vec![json!({ "slug": "acme-org", "type": "org@1.0.0" })],
            })
        );

        stream
            .set_schema(&json!({ "required": ["name"], "properties": { "type": { "const": "org@1.0.0" } } }), QueryOptions::default())
            .unwrap();
        let ops = parse_patch(json!([{ "op": "replace", "path": "/name", "value": "Acme" }])).unwrap();
        kernel.patch_by_slug(&session, "acme-org@1.0.0", &ops).unwrap();
        assert_eq!(
            stream.recv_timeout(WAIT),
            Some(StreamEvent::Update {
                id: org.id,
                contract: json!({ "name": "Acme", "type": "org@1.0.0" }),
            })
        );
    }

    fn worker(schema: Value) -> (Worker<SqliteBackend>, mpsc::Receiver<StreamEvent>) {
        let config = KernelConfig::default();
        let mask = Schema::Bool(true);
        let schema = Schema::from_value(schema).unwrap();
        let query = compile_query(&config, &mask, &schema, None, &QueryOptions::default()).unwrap();
        let (events, received) = mpsc::channel();
        let worker = Worker {
            backend: Arc::new(SqliteBackend::open_in_memory().unwrap()),
            config,
            mask,
            query,
            matched: HashSet::new(),
            events,
        };
        (worker, received)
    }

    fn change(kind: ChangeKind, before: Option<Value>, after: Option<Value>) -> ChangeEvent {
        ChangeEvent {
            id: "c1".into(),
            kind,
            before,
            after,
        }
    }

    #[test]
    fn test_classify_against_images() {
        let (mut worker, _events) = worker(open_cards());
        let open = json!({ "id": "c1", "type": "card@1.0.0", "data": { "status": "open" } });
        let closed = json!({ "id": "c1", "type": "card@1.0.0", "data": { "status": "closed" } });

        // Matched before the stream saw it: the before image decides
        let event = worker
            .classify(&change(ChangeKind::Update, Some(open.clone()), Some(closed.clone())))
            .unwrap();
        assert_eq!(event, Some(StreamEvent::Unmatch { id: "c1".into() }));

        let event = worker
            .classify(&change(ChangeKind::Update, Some(closed.clone()), Some(closed.clone())))
            .unwrap();
        assert_eq!(event, None);

        let event = worker.classify(&change(ChangeKind::Insert, None, Some(open.clone()))).unwrap();
        assert!(matches!(event, Some(StreamEvent::Insert { .. })));
        assert!(worker.matched.contains("c1"));

        let event = worker.classify(&change(ChangeKind::Delete, Some(open), None)).unwrap();
        assert_eq!(event, Some(StreamEvent::Delete { id: "c1".into() }));
        assert!(worker.matched.is_empty());

        let event = worker.classify(&change(ChangeKind::Delete, Some(closed), None)).unwrap();
        assert_eq!(event, None);
    }

    #[test]
    fn test_schema_change_forgets_matches() {
        let (mut worker, _events) = worker(open_cards());
        let open = json!({ "id": "c1", "type": "card@1.0.0", "data": { "status": "open" } });
        let closed = json!({ "id": "c1", "type": "card@1.0.0", "data": { "status": "closed" } });

        let event = worker.classify(&change(ChangeKind::Insert, None, Some(open))).unwrap();
        assert!(matches!(event, Some(StreamEvent::Insert { .. })));
        assert!(worker.matched.contains("c1"));

        let orgs = Schema::from_value(json!({ "properties": { "type": { "const": "org@1.0.0" } } })).unwrap();
        assert_eq!(worker.set_schema(&orgs, &QueryOptions::default()), None);
        assert!(worker.matched.is_empty());

        // Never matched the new predicate, so nothing to unmatch
        let event = worker
            .classify(&change(ChangeKind::Update, Some(closed.clone()), Some(closed.clone())))
            .unwrap();
        assert_eq!(event, None);
        let event = worker.classify(&change(ChangeKind::Delete, Some(closed), None)).unwrap();
        assert_eq!(event, None);
    }

    #[test]
    fn test_invalid_schema_is_rejected_up_front() {
        let kernel = test_utils::kernel();
        let session = kernel.admin_session().unwrap();
        let stream = kernel.stream(&session, &open_cards(), QueryOptions::default()).unwrap();
        let result = stream.set_schema(&json!({ "required": "slug" }), QueryOptions::default());
        assert!(matches!(result, Err(ContractDbError::Compile(_))));
    }

    #[test]
    fn test_events_serialize_with_tag() {
        assert_eq!(
            serde_json::to_value(StreamEvent::Unmatch { id: "c1".into() }).unwrap(),
            json!({ "event": "unmatch", "id": "c1" })
        );
        assert_eq!(serde_json::to_value(StreamEvent::Closed).unwrap(), json!({ "event": "closed" }));
    }

    #[test]
    fn test_send_after_close() {
        let kernel = test_utils::kernel();
        let session = kernel.admin_session().unwrap();
        let mut stream = kernel.stream(&session, &open_cards(), QueryOptions::default()).unwrap();
        stream.close();
        let result = stream.query("late", &json!({}), QueryOptions::default());
        assert!(matches!(result, Err(ContractDbError::Database(_))));
    }
}
