use super::{Backend, ChangeEvent, ChangeKind, ChangeSink, Row, Subscription};
use crate::contract::{stamp_linked_at, Contract, LinkContract, Version, VersionRef};
use crate::error::{ContractDbError, Result};
use crate::matcher::{evaluate_row, sort_contracts, BackendLinks};
use crate::sql::{quote_ident, SqlQuery, Tables};
use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use rusqlite::{params, Connection, ErrorCode};
use serde_json::{json, Map, Value};
use std::cell::RefCell;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Reference backend over a single SQLite connection.
///
/// Compiled statements target PostgreSQL, so `execute` runs their predicate
/// in-process against the stored rows and builds the rows the statement
/// would return.
pub struct SqliteBackend {
    inner: ReentrantMutex<RefCell<Inner>>,
    tables: Tables,
    subscribers: Arc<Mutex<Vec<(u64, Arc<ChangeSink>)>>>,
    next_subscriber: AtomicU64,
}

/// Holds the connection for the current thread. Other threads block until
/// it is dropped.
pub struct RowGuard<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<Inner>>,
}

struct Inner {
    conn: Connection,
    contracts: String,
    links: String,
    depth: usize,
    pending: Vec<ChangeEvent>,
}

#[derive(Clone, Copy, PartialEq)]
enum WriteMode {
    Insert,
    Upsert,
}

impl SqliteBackend {
    /// Open or create the database at the given path.
    pub fn open(path: &Path, tables: Tables, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::with_connection(conn, tables)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with(Tables::default())
    }

    pub fn open_in_memory_with(tables: Tables) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, tables)
    }

    fn with_connection(conn: Connection, tables: Tables) -> Result<Self> {
        let inner = Inner {
            conn,
            contracts: quote_ident(&tables.contracts),
            links: quote_ident(&tables.links),
            depth: 0,
            pending: Vec::new(),
        };
        inner.initialize_tables()?;
        Ok(SqliteBackend {
            inner: ReentrantMutex::new(RefCell::new(inner)),
            tables,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber: AtomicU64::new(0),
        })
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> Result<T>) -> Result<T> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        f(&inner)
    }

    fn write(&self, contract: &Contract, mode: WriteMode) -> Result<Contract> {
        self.with_transaction(|| {
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();
            inner.write(contract, mode)
        })
    }

    fn deliver(&self, events: Vec<ChangeEvent>) {
        if events.is_empty() {
            return;
        }
        let sinks: Vec<Arc<ChangeSink>> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, sink)| sink.clone())
            .collect();
        for event in events {
            for sink in &sinks {
                (**sink)(event.clone());
            }
        }
    }
}

impl Backend for SqliteBackend {
    type RowLock<'a> = RowGuard<'a>;

    fn execute(&self, query: &SqlQuery) -> Result<Vec<Row>> {
        let mut contracts = Vec::new();
        for contract in self.read(|inner| inner.all())? {
            contracts.push(contract.to_row()?);
        }
        sort_contracts(query, &mut contracts);

        let resolver = BackendLinks::new(self);
        let skip = query.options.skip.unwrap_or(0);
        let limit = query.options.limit.unwrap_or(usize::MAX);
        let mut skipped = 0;
        let mut rows = Vec::new();
        for contract in &contracts {
            if rows.len() >= limit {
                break;
            }
            let Some(row) = evaluate_row(query, contract, &resolver)? else {
                continue;
            };
            if skipped < skip {
                skipped += 1;
                continue;
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn get_element_by_id(&self, id: &str) -> Result<Option<Contract>> {
        self.read(|inner| inner.get_by_id(id))
    }

    fn get_element_by_slug(&self, slug: &str, version: &VersionRef) -> Result<Option<Contract>> {
        self.read(|inner| match version {
            VersionRef::Exact(version) => inner.get_by_slug(slug, &version.to_string()),
            VersionRef::Latest => Ok(inner
                .all_versions(slug)?
                .into_iter()
                .filter_map(|c| c.parsed_version().ok().map(|v| (v, c)))
                .max_by(|(a, _), (b, _)| a.cmp(b))
                .map(|(_, c)| c)),
        })
    }

    fn insert_element(&self, contract: &Contract) -> Result<Contract> {
        self.write(contract, WriteMode::Insert)
    }

    fn upsert_element(&self, contract: &Contract) -> Result<Contract> {
        self.write(contract, WriteMode::Upsert)
    }

    fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let guard = self.inner.lock();
        let outermost = {
            let mut inner = guard.borrow_mut();
            if inner.depth == 0 {
                inner.conn.execute_batch("BEGIN IMMEDIATE").db()?;
            }
            inner.depth += 1;
            inner.depth == 1
        };

        let result = f();

        let mut inner = guard.borrow_mut();
        inner.depth -= 1;
        if !outermost {
            return result;
        }

        let events = std::mem::take(&mut inner.pending);
        let result = match result {
            Ok(value) => match inner.conn.execute_batch("COMMIT").db() {
                Ok(()) => Ok(value),
                Err(e) => {
                    inner.rollback();
                    Err(e)
                }
            },
            Err(e) => {
                inner.rollback();
                Err(e)
            }
        };
        drop(inner);
        drop(guard);

        if result.is_ok() {
            self.deliver(events);
        } else if !events.is_empty() {
            log::debug!("Dropping {} change events of a rolled back transaction", events.len());
        }
        result
    }

    fn lock_row(&self, _table: &str, _id: &str) -> Result<RowGuard<'_>> {
        // One connection: holding it excludes every other writer
        Ok(RowGuard {
            _guard: self.inner.lock(),
        })
    }

    fn get_links(&self, id: &str, link_type: &str) -> Result<Vec<Contract>> {
        self.read(|inner| inner.linked(id, link_type))
    }

    fn subscribe_changes(&self, sink: ChangeSink) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().push((id, Arc::new(sink)));
        let subscribers = self.subscribers.clone();
        Subscription::new(move || {
            subscribers.lock().retain(|(other, _)| *other != id);
        })
    }

    fn status(&self) -> Result<Value> {
        self.read(|inner| {
            let count = |table: &str| -> Result<i64> {
                inner
                    .conn
                    .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                    .db()
            };
            Ok(json!({
                "contracts": count(&inner.contracts)?,
                "links": count(&inner.links)?,
            }))
        })
    }
}

impl Inner {
    fn initialize_tables(&self) -> Result<()> {
        let contracts = &self.contracts;
        let links = &self.links;
        self.conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {contracts} (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL,
                version TEXT NOT NULL,
                type TEXT NOT NULL,
                active INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                data_json TEXT NOT NULL,
                UNIQUE (slug, version)
            );

            CREATE INDEX IF NOT EXISTS idx_contracts_type ON {contracts}(type);

            CREATE TABLE IF NOT EXISTS {links} (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                inverse_name TEXT NOT NULL,
                from_id TEXT NOT NULL,
                to_id TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_links_from ON {links}(from_id, name);
            CREATE INDEX IF NOT EXISTS idx_links_to ON {links}(to_id, inverse_name);
            "
        ))?;
        Ok(())
    }

    fn rollback(&self) {
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            log::warn!("Rollback failed: {e}");
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    fn select(&self, condition: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Contract>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, data_json FROM {} {condition}",
            self.contracts
        ))?;
        let rows = stmt.query_map(args, |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut contracts = Vec::new();
        for row in rows {
            let (id, data_json) = row.db()?;
            if let Some(contract) = decode(&id, &data_json) {
                contracts.push(contract);
            }
        }
        Ok(contracts)
    }

    fn all(&self) -> Result<Vec<Contract>> {
        self.select("ORDER BY created_at, id", &[])
    }

    fn get_by_id(&self, id: &str) -> Result<Option<Contract>> {
        Ok(self.select("WHERE id = ?1", &[&id])?.pop())
    }

    fn get_by_slug(&self, slug: &str, version: &str) -> Result<Option<Contract>> {
        Ok(self
            .select("WHERE slug = ?1 AND version = ?2", &[&slug, &version])?
            .pop())
    }

    fn all_versions(&self, slug: &str) -> Result<Vec<Contract>> {
        self.select("WHERE slug = ?1", &[&slug])
    }

    fn linked(&self, id: &str, link_type: &str) -> Result<Vec<Contract>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT c.id, c.data_json FROM {links} AS l
             JOIN {contracts} AS c
               ON c.id = CASE WHEN l.from_id = ?1 THEN l.to_id ELSE l.from_id END
             WHERE ((l.from_id = ?1 AND l.name = ?2) OR (l.to_id = ?1 AND l.inverse_name = ?2))
               AND c.active = 1
             ORDER BY c.created_at, c.id",
            links = self.links,
            contracts = self.contracts,
        ))?;
        let rows = stmt.query_map(params![id, link_type], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut contracts = Vec::new();
        for row in rows {
            let (id, data_json) = row.db()?;
            if let Some(contract) = decode(&id, &data_json) {
                contracts.push(contract);
            }
        }
        Ok(contracts)
    }

    /// The contract with its active links materialized under `links`.
    fn image(&self, contract: &Contract) -> Result<Value> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT name, inverse_name, from_id, to_id FROM {} WHERE from_id = ?1 OR to_id = ?1 ORDER BY id",
            self.links
        ))?;
        let edges = stmt
            .query_map(params![contract.id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut links = Map::new();
        for (name, inverse_name, from_id, to_id) in edges {
            let (link_name, other_id) = if from_id == contract.id {
                (name, to_id)
            } else {
                (inverse_name, from_id)
            };
            let Some(other) = self.get_by_id(&other_id)?.filter(|c| c.active) else {
                continue;
            };
            if let Value::Array(entries) = links
                .entry(link_name)
                .or_insert_with(|| Value::Array(Vec::new()))
            {
                entries.push(other.to_row()?);
            }
        }

        let mut value = contract.to_row()?;
        if let Value::Object(object) = &mut value {
            object.insert("links".to_string(), Value::Object(links));
        }
        Ok(value)
    }

    // ── Writes ───────────────────────────────────────────────────────

    fn store(&self, contract: &Contract) -> Result<()> {
        let data_json = serde_json::to_string(&contract.to_row()?)?;
        self.conn
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO {} (id, slug, version, type, active, created_at, data_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    self.contracts
                ),
                params![
                    contract.id,
                    contract.slug,
                    contract.version,
                    contract.contract_type,
                    contract.active,
                    contract.created_at.to_rfc3339(),
                    data_json,
                ],
            )
            .db()?;
        Ok(())
    }

    fn write(&mut self, contract: &Contract, mode: WriteMode) -> Result<Contract> {
        contract.validate_identity()?;
        let mut stored = contract.clone();
        stored.version = Version::parse(&contract.version)?.to_string();
        stored.links.clear();

        let existing = match self.get_by_slug(&stored.slug, &stored.version)? {
            Some(found) => Some(found),
            None => self.get_by_id(&stored.id)?,
        };

        let before = match &existing {
            Some(found) if mode == WriteMode::Insert => {
                return Err(ContractDbError::ElementAlreadyExists(format!(
                    "{} ({})",
                    stored.versioned_slug(),
                    found.id
                )));
            }
            Some(found) => {
                stored.id = found.id.clone();
                stored.created_at = found.created_at;
                stored.updated_at = Some(Utc::now());
                if found.id != contract.id {
                    log::debug!("Replacing {} keeps its id {}", stored.versioned_slug(), found.id);
                }
                Some(self.image(found)?)
            }
            None => None,
        };

        let link = LinkContract::from_contract(&stored);
        let mut endpoints = Vec::new();
        if let Some(link) = &link {
            let mut ids = vec![link.from_id.clone()];
            if link.to_id != link.from_id {
                ids.push(link.to_id.clone());
            }
            for id in ids {
                if let Some(endpoint) = self.get_by_id(&id)? {
                    let before = self.image(&endpoint)?;
                    endpoints.push((endpoint, before));
                }
            }
        }

        self.store(&stored)?;
        let queued = self.pending.len();

        if let Some(link) = &link {
            if link.active {
                self.conn
                    .execute(
                        &format!(
                            "INSERT OR REPLACE INTO {} (id, name, inverse_name, from_id, to_id)
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                            self.links
                        ),
                        params![link.id, link.name, link.inverse_name, link.from_id, link.to_id],
                    )
                    .db()?;
            } else {
                self.conn
                    .execute(&format!("DELETE FROM {} WHERE id = ?1", self.links), params![link.id])
                    .db()?;
            }

            for (mut endpoint, before) in endpoints {
                if link.active && stamp_linked_at(link, &mut endpoint) {
                    self.store(&endpoint)?;
                }
                let after = self.image(&endpoint)?;
                self.pending.push(ChangeEvent {
                    id: endpoint.id.clone(),
                    kind: ChangeKind::Update,
                    before: Some(before),
                    after: Some(after),
                });
            }
        }

        let after = self.image(&stored)?;
        let kind = if before.is_some() {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        // Ahead of the endpoint updates it caused
        self.pending.insert(
            queued,
            ChangeEvent {
                id: stored.id.clone(),
                kind,
                before,
                after: Some(after),
            },
        );
        Ok(stored)
    }
}

fn decode(id: &str, data_json: &str) -> Option<Contract> {
    match serde_json::from_str::<Value>(data_json).map_err(ContractDbError::from).and_then(Contract::from_value) {
        Ok(contract) => Some(contract),
        Err(e) => {
            log::warn!("Skipping undecodable contract {id}: {e}");
            None
        }
    }
}

/// Busy and locked databases surface as timeouts.
trait SqliteResultExt<T> {
    fn db(self) -> Result<T>;
}

impl<T> SqliteResultExt<T> for rusqlite::Result<T> {
    fn db(self) -> Result<T> {
        self.map_err(|e| match &e {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                ContractDbError::DatabaseTimeout(e.to_string())
            }
            _ => ContractDbError::Sqlite(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use crate::select::SelectMap;
    use crate::sql::{compile, QueryOptions};
    use pretty_assertions::assert_eq;
    use std::sync::mpsc;

    fn card(slug: &str) -> Contract {
        Contract::from_partial(json!({ "slug": slug, "type": "card@1.0.0" })).unwrap()
    }

    fn link(slug: &str, name: &str, inverse: &str, from: &Contract, to: &Contract) -> Contract {
        Contract::from_partial(json!({
            "slug": slug,
            "type": "link@1.0.0",
            "name": name,
            "data": {
                "inverseName": inverse,
                "from": { "id": from.id, "type": from.contract_type },
                "to": { "id": to.id, "type": to.contract_type },
            }
        }))
        .unwrap()
    }

    fn collect(backend: &SqliteBackend) -> (Subscription, mpsc::Receiver<ChangeEvent>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let subscription = backend.subscribe_changes(Box::new(move |event| {
            let _ = tx.lock().send(event);
        }));
        (subscription, rx)
    }

    #[test]
    fn test_insert_and_get() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let stored = backend.insert_element(&card("foo")).unwrap();

        let by_id = backend.get_element_by_id(&stored.id).unwrap().unwrap();
        assert_eq!(by_id, stored);

        let version = VersionRef::Exact(Version::parse("1.0.0").unwrap());
        let by_slug = backend.get_element_by_slug("foo", &version).unwrap().unwrap();
        assert_eq!(by_slug.id, stored.id);

        assert!(backend.get_element_by_id("missing").unwrap().is_none());
    }

    #[test]
    fn test_insert_duplicate_fails() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.insert_element(&card("foo")).unwrap();
        let result = backend.insert_element(&card("foo"));
        assert!(matches!(result, Err(ContractDbError::ElementAlreadyExists(_))));
    }

    #[test]
    fn test_upsert_replaces_by_slug_and_version() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let first = backend.upsert_element(&card("foo")).unwrap();

        let mut replacement = card("foo");
        replacement.data = json!({ "x": 1 });
        let second = backend.upsert_element(&replacement).unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at.is_some());
        let stored = backend.get_element_by_id(&first.id).unwrap().unwrap();
        assert_eq!(stored.data, json!({ "x": 1 }));
    }

    #[test]
    fn test_latest_version() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        for version in ["1.0.0", "1.10.0", "1.2.0"] {
            let contract = Contract::from_partial(json!({
                "slug": "foo", "type": "card@1.0.0", "version": version
            }))
            .unwrap();
            backend.insert_element(&contract).unwrap();
        }
        let latest = backend
            .get_element_by_slug("foo", &VersionRef::Latest)
            .unwrap()
            .unwrap();
        assert_eq!(latest.version, "1.10.0");
        assert!(backend
            .get_element_by_slug("bar", &VersionRef::Latest)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_links_are_maintained() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let message = backend.insert_element(&card("message")).unwrap();
        let thread = backend.insert_element(&card("thread")).unwrap();
        let edge = backend
            .insert_element(&link("link-1", "is attached to", "has attached element", &message, &thread))
            .unwrap();

        let forward = backend.get_links(&message.id, "is attached to").unwrap();
        assert_eq!(forward.len(), 1);
        assert_eq!(forward[0].id, thread.id);
        let inverse = backend.get_links(&thread.id, "has attached element").unwrap();
        assert_eq!(inverse[0].id, message.id);
        assert!(backend.get_links(&thread.id, "is attached to").unwrap().is_empty());

        let stamped = backend.get_element_by_id(&message.id).unwrap().unwrap();
        assert!(stamped.linked_at.contains_key("is attached to"));
        let stamped = backend.get_element_by_id(&thread.id).unwrap().unwrap();
        assert!(stamped.linked_at.contains_key("has attached element"));

        let mut inactive = edge.clone();
        inactive.active = false;
        backend.upsert_element(&inactive).unwrap();
        assert!(backend.get_links(&message.id, "is attached to").unwrap().is_empty());
        assert_eq!(backend.status().unwrap(), json!({ "contracts": 3, "links": 0 }));
    }

    #[test]
    fn test_inactive_contracts_are_not_linked() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let message = backend.insert_element(&card("message")).unwrap();
        let mut thread = card("thread");
        thread.active = false;
        let thread = backend.insert_element(&thread).unwrap();
        backend
            .insert_element(&link("link-1", "is attached to", "has attached element", &message, &thread))
            .unwrap();
        assert!(backend.get_links(&message.id, "is attached to").unwrap().is_empty());
    }

    #[test]
    fn test_change_events_carry_link_images() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let (_subscription, rx) = collect(&backend);

        let message = backend.insert_element(&card("message")).unwrap();
        let thread = backend.insert_element(&card("thread")).unwrap();
        let edge = backend
            .insert_element(&link("link-1", "is attached to", "has attached element", &message, &thread))
            .unwrap();

        let events: Vec<ChangeEvent> = rx.try_iter().collect();
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![message.id.as_str(), thread.id.as_str(), edge.id.as_str(), message.id.as_str(), thread.id.as_str()]);
        assert_eq!(events[0].kind, ChangeKind::Insert);
        assert!(events[0].before.is_none());

        let update = &events[3];
        assert_eq!(update.kind, ChangeKind::Update);
        assert_eq!(update.before.as_ref().unwrap()["links"], json!({}));
        let linked = &update.after.as_ref().unwrap()["links"]["is attached to"];
        assert_eq!(linked[0]["id"], json!(thread.id));
    }

    #[test]
    fn test_transaction_delivers_after_commit() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let (_subscription, rx) = collect(&backend);

        backend
            .with_transaction(|| {
                backend.insert_element(&card("a"))?;
                backend.insert_element(&card("b"))?;
                assert!(rx.try_recv().is_err());
                Ok(())
            })
            .unwrap();
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_transaction_rollback_drops_writes_and_events() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let (_subscription, rx) = collect(&backend);

        let result: Result<()> = backend.with_transaction(|| {
            backend.insert_element(&card("a"))?;
            backend.insert_element(&card("a"))?;
            Ok(())
        });
        assert!(matches!(result, Err(ContractDbError::ElementAlreadyExists(_))));
        assert!(rx.try_recv().is_err());
        assert!(backend
            .get_element_by_slug("a", &VersionRef::Latest)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_cancelled_subscription_stops_delivery() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let (subscription, rx) = collect(&backend);
        subscription.cancel();
        backend.insert_element(&card("a")).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_execute_builds_rows() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let message = backend.insert_element(&card("message")).unwrap();
        let thread = backend.insert_element(&card("thread")).unwrap();
        backend.insert_element(&card("other")).unwrap();
        backend
            .insert_element(&link("link-1", "is attached to", "has attached element", &message, &thread))
            .unwrap();

        let schema = Schema::from_value(json!({
            "required": ["slug"],
            "properties": { "type": { "const": "card@1.0.0" } },
            "$$links": { "is attached to": { "required": ["slug"] } }
        }))
        .unwrap();
        let select = SelectMap::from_schema(&schema);
        let query = compile(&Tables::default(), &select, &schema, &QueryOptions::default()).unwrap();

        let rows = backend.execute(&query).unwrap();
        assert_eq!(
            rows,
            vec![json!({
                "id": message.id,
                "contract": { "slug": "message", "type": "card@1.0.0" },
                "join@/is attached to.0": [
                    { "parent": message.id, "id": thread.id, "contract": { "slug": "thread" } }
                ]
            })]
        );
        assert_eq!(
            query.reshape(rows),
            vec![json!({
                "slug": "message",
                "type": "card@1.0.0",
                "links": { "is attached to": [{ "slug": "thread" }] }
            })]
        );
    }

    #[test]
    fn test_execute_pages() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        for slug in ["a", "b", "c", "d"] {
            let mut contract = card(slug);
            contract.data = json!({ "n": slug });
            backend.insert_element(&contract).unwrap();
        }
        let schema = Schema::from_value(json!({ "required": ["slug"] })).unwrap();
        let select = SelectMap::from_schema(&schema);
        let options = QueryOptions {
            limit: Some(2),
            skip: Some(1),
            sort_by: Some(vec!["data".into(), "n".into()]),
            sort_dir: crate::sql::SortDir::Desc,
        };
        let query = compile(&Tables::default(), &select, &schema, &options).unwrap();
        let slugs: Vec<Value> = query
            .reshape(backend.execute(&query).unwrap())
            .into_iter()
            .map(|c| c["slug"].clone())
            .collect();
        assert_eq!(slugs, vec![json!("c"), json!("b")]);
    }

    #[test]
    fn test_reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contracts.db");
        let id = {
            let backend = SqliteBackend::open(&path, Tables::default(), Duration::from_millis(100)).unwrap();
            backend.insert_element(&card("persisted")).unwrap().id
        };
        let backend = SqliteBackend::open(&path, Tables::default(), Duration::from_millis(100)).unwrap();
        assert_eq!(backend.get_element_by_id(&id).unwrap().unwrap().slug, "persisted");
    }
}
