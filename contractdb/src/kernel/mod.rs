// Kernel - permission-aware queries, patches and live feeds over a backend

use crate::backend::{Backend, SqliteBackend};
use crate::cards;
use crate::config::KernelConfig;
use crate::contract::{normalize_endpoint_types, parse_reference, type_reference, Contract, VersionRef};
use crate::error::{ContractDbError, Result};
use crate::matcher::BackendLinks;
use crate::patch::{apply_patch, PatchOperation};
use crate::permission::{forbids, get_mask, prune, redact};
use crate::schema::Schema;
use crate::select::SelectMap;
use crate::sql::{self, json_equal, QueryOptions, SortDir, SqlQuery};
use crate::stream::Stream;
use crate::validation::{check_contract, Validator};
use crate::view::query_schema;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;

/// Message of schema mismatches raised against a full contract, which may
/// hold properties the caller cannot see.
const INVALID_UPDATE: &str = "The updated contract is invalid";

/// Compile `schema` for a caller whose permissions are `mask`.
///
/// The query is merged with the mask after pruning what the mask forbids.
/// Without an explicit `select` the output is what the query names, minus
/// forbidden properties.
pub fn compile_query(
    config: &KernelConfig,
    mask: &Schema,
    schema: &Schema,
    select: Option<SelectMap>,
    options: &QueryOptions,
) -> Result<SqlQuery> {
    let limit = config.effective_limit(options.limit)?;
    let pruned = prune(schema, mask);
    let select = select.unwrap_or_else(|| {
        let mut select = SelectMap::from_schema(schema);
        select.rectify(&SelectMap::from_schema(&pruned));
        select
    });
    let merged = Schema::all_of(vec![mask.clone(), pruned]);
    let options = QueryOptions {
        limit: Some(limit),
        ..options.clone()
    };
    sql::compile(&config.tables(), &select, &merged, &options)
}

/// Log a failed operation the way its kind calls for, and hand it back.
fn report(error: ContractDbError, context: &str) -> ContractDbError {
    match &error {
        ContractDbError::DatabaseTimeout(_) => log::warn!("Database timeout in {context}: {error}"),
        e if e.is_expected() => log::debug!("{context}: {error}"),
        _ => log::error!("{context} failed: {error}"),
    }
    error
}

/// The entry point applications use: every read and write goes through the
/// permissions of a session.
pub struct Kernel<B: Backend> {
    backend: Arc<B>,
    config: KernelConfig,
    admin_session: RwLock<Option<String>>,
}

impl Kernel<SqliteBackend> {
    /// Open the SQLite store the configuration points at.
    pub fn open(config: KernelConfig) -> Result<Self> {
        config.validate()?;
        let backend = match &config.database_path {
            Some(path) => SqliteBackend::open(path, config.tables(), config.busy_timeout())?,
            None => SqliteBackend::open_in_memory_with(config.tables())?,
        };
        Ok(Kernel::new(backend, config))
    }
}

impl<B: Backend> Kernel<B> {
    pub fn new(backend: B, config: KernelConfig) -> Self {
        Kernel {
            backend: Arc::new(backend),
            config,
            admin_session: RwLock::new(None),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    // ── Bootstrap ───────────────────────────────────────────────────

    /// Store the built-in contracts and open the admin session. Safe to run
    /// on every start; returns the admin session id.
    pub fn initialize(&self) -> Result<String> {
        log::info!("Initializing kernel");
        let session = self
            .backend
            .with_transaction(|| {
                for definition in cards::core_types() {
                    self.bootstrap(definition)?;
                }
                self.bootstrap(cards::role_user_admin())?;
                let admin = self.bootstrap(cards::user_admin())?;
                let session = self.bootstrap(cards::admin_session(&admin.id))?;
                for definition in cards::extra_types() {
                    self.bootstrap(definition)?;
                }
                Ok(session.id)
            })
            .map_err(|e| report(e, "initialize"))?;

        *self.admin_session.write() = Some(session.clone());
        log::info!("Kernel initialized");
        Ok(session)
    }

    /// The session of the admin user, once initialized.
    pub fn admin_session(&self) -> Result<String> {
        self.admin_session
            .read()
            .clone()
            .ok_or_else(|| ContractDbError::InvalidSession("Kernel is not initialized".into()))
    }

    /// Upsert a built-in contract, checked against its type only. A type may
    /// describe itself.
    fn bootstrap(&self, definition: Value) -> Result<Contract> {
        let contract = self.normalize(definition)?;
        let schema = match self.type_schema(&contract.contract_type) {
            Err(ContractDbError::UnknownType(_)) if contract.versioned_slug() == contract.contract_type => {
                Schema::from_value(contract.type_schema().cloned().unwrap_or(Value::Bool(true)))?
            }
            other => other?,
        };
        check_contract(&schema, &contract.to_value()?, &BackendLinks::new(&*self.backend))?;
        log::debug!("Bootstrapping {}", contract.versioned_slug());
        self.backend.upsert_element(&contract)
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Contracts matching `query` (a schema or a view contract) that the
    /// session may see.
    pub fn query(&self, session: &str, query: &Value, options: &QueryOptions) -> Result<Vec<Value>> {
        log::debug!("Query {query} with {options:?}");
        let result = (|| -> Result<Vec<Value>> {
            let mask = get_mask(&*self.backend, session)?;
            let schema = query_schema(query)?;
            self.run(&mask, &schema, None, options)
        })();
        result.map_err(|e| report(e, &format!("query {query}")))
    }

    pub fn get_by_id(&self, session: &str, id: &str) -> Result<Option<Value>> {
        log::debug!("Get by id {id}");
        if id.is_empty() {
            return Err(ContractDbError::InvalidId("Id is undefined".into()));
        }
        let result = get_mask(&*self.backend, session).and_then(|mask| self.visible_by_id(&mask, id));
        result.map_err(|e| report(e, &format!("get {id}")))
    }

    /// Get a contract by `slug@version`, where the version may be `latest`.
    pub fn get_by_slug(&self, session: &str, reference: &str) -> Result<Option<Value>> {
        log::debug!("Get by slug {reference}");
        let (slug, version) = parse_reference(reference)?;
        let result = (|| -> Result<Option<Value>> {
            let mask = get_mask(&*self.backend, session)?;
            let mut properties = serde_json::Map::new();
            properties.insert("slug".into(), json!({ "const": slug }));
            let mut options = QueryOptions {
                limit: Some(1),
                ..Default::default()
            };
            match &version {
                VersionRef::Exact(version) => {
                    properties.insert("version".into(), json!({ "const": version.to_string() }));
                }
                VersionRef::Latest => {
                    options.sort_by = Some(vec!["version".into()]);
                    options.sort_dir = SortDir::Desc;
                }
            }
            let schema = Schema::from_value(json!({ "required": ["slug"], "properties": properties }))?;
            Ok(self.run(&mask, &schema, Some(SelectMap::default()), &options)?.pop())
        })();
        result.map_err(|e| report(e, &format!("get {reference}")))
    }

    fn visible_by_id(&self, mask: &Schema, id: &str) -> Result<Option<Value>> {
        let schema = Schema::from_value(json!({
            "required": ["id"],
            "properties": { "id": { "const": id } }
        }))?;
        let options = QueryOptions {
            limit: Some(1),
            ..Default::default()
        };
        Ok(self.run(mask, &schema, Some(SelectMap::default()), &options)?.pop())
    }

    fn run(
        &self,
        mask: &Schema,
        schema: &Schema,
        select: Option<SelectMap>,
        options: &QueryOptions,
    ) -> Result<Vec<Value>> {
        let compiled = compile_query(&self.config, mask, schema, select, options)?;
        let rows = self.backend.execute(&compiled)?;
        Ok(compiled
            .reshape(rows)
            .into_iter()
            .map(|contract| redact(mask, contract))
            .collect())
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// A contract built from a partial definition, every default applied.
    pub fn defaults(&self, partial: Value) -> Result<Contract> {
        Contract::from_partial(partial)
    }

    /// Store a new contract. Fails if its `slug@version` is taken.
    pub fn insert_contract(&self, session: &str, partial: Value) -> Result<Contract> {
        let result = (|| -> Result<Contract> {
            let mask = get_mask(&*self.backend, session)?;
            let contract = self.pre_upsert(&mask, partial)?;
            log::debug!("Inserting {}", contract.versioned_slug());
            self.backend.insert_element(&contract)
        })();
        result.map_err(|e| report(e, "insert"))
    }

    /// Store a contract, replacing the one with the same `slug@version`.
    pub fn replace_contract(&self, session: &str, partial: Value) -> Result<Contract> {
        let result = (|| -> Result<Contract> {
            let mask = get_mask(&*self.backend, session)?;
            let contract = self.pre_upsert(&mask, partial)?;
            log::debug!("Replacing {}", contract.versioned_slug());
            self.backend.with_transaction(|| {
                let version = VersionRef::Exact(contract.parsed_version()?);
                if let Some(existing) = self.backend.get_element_by_slug(&contract.slug, &version)? {
                    let _lock = self.backend.lock_row(&self.config.table, &existing.id)?;
                    if self.visible_by_id(&mask, &existing.id)?.is_none() {
                        return Err(ContractDbError::Permissions(format!(
                            "You may not replace {}",
                            contract.versioned_slug()
                        )));
                    }
                }
                self.backend.upsert_element(&contract)
            })
        })();
        result.map_err(|e| report(e, "replace"))
    }

    /// Apply JSON Patch `operations` to the contract `slug@version`.
    ///
    /// The patch is applied to both the full contract and the view the
    /// session has of it. The patched view must still be visible to the
    /// session and the patched contract must satisfy its type. Returns the
    /// patched view.
    pub fn patch_by_slug(&self, session: &str, reference: &str, operations: &[PatchOperation]) -> Result<Value> {
        log::debug!("Patching {reference} with {} operations", operations.len());
        let result = (|| -> Result<Value> {
            let (slug, version) = parse_reference(reference)?;
            let mask = get_mask(&*self.backend, session)?;
            self.backend.with_transaction(|| {
                let no_element = || ContractDbError::NoElement(reference.to_string());
                let found = self.backend.get_element_by_slug(&slug, &version)?.ok_or_else(no_element)?;
                let _lock = self.backend.lock_row(&self.config.table, &found.id)?;
                let full = self.backend.get_element_by_id(&found.id)?.ok_or_else(no_element)?;
                let view = self.visible_by_id(&mask, &full.id)?.ok_or_else(no_element)?;

                if operations.is_empty() {
                    return Ok(view);
                }

                let type_schema = self.type_schema(&type_reference(&full.contract_type))?;
                let resolver = BackendLinks::new(&*self.backend);

                let patched_view = apply_patch(&view, operations)?;
                if let Some(key) = forbidden_change(&mask, &view, &patched_view) {
                    return Err(ContractDbError::Permissions(format!(
                        "You may not change '{key}' of {reference}"
                    )));
                }
                if !Validator::new(&mask)?.accepts(&patched_view, &resolver)? {
                    return Err(ContractDbError::Permissions(format!(
                        "The patched {reference} would not be visible to you"
                    )));
                }

                let original = full.to_value()?;
                let patched = apply_patch(&original, operations)?;
                match check_contract(&type_schema, &patched, &resolver) {
                    Ok(()) => {}
                    Err(ContractDbError::SchemaMismatch(detail)) => {
                        log::debug!("Patch of {reference} rejected: {detail}");
                        return Err(ContractDbError::SchemaMismatch(INVALID_UPDATE.into()));
                    }
                    Err(e) => return Err(e),
                }

                if json_equal(&patched, &original) {
                    log::debug!("Patch leaves {reference} unchanged");
                    return Ok(patched_view);
                }

                let contract = Contract::from_value(patched)
                    .map_err(|_| ContractDbError::SchemaMismatch(INVALID_UPDATE.into()))?;
                contract.validate_identity()?;
                self.backend.upsert_element(&contract)?;
                Ok(patched_view)
            })
        })();
        result.map_err(|e| report(e, &format!("patch {reference}")))
    }

    /// Defaults, type check and permission check shared by inserts and
    /// replacements.
    fn pre_upsert(&self, mask: &Schema, partial: Value) -> Result<Contract> {
        let contract = self.normalize(partial)?;
        let schema = self.type_schema(&contract.contract_type)?;
        let value = contract.to_value()?;
        let resolver = BackendLinks::new(&*self.backend);
        check_contract(&schema, &value, &resolver)?;
        if !Validator::new(mask)?.accepts(&value, &resolver)? {
            return Err(ContractDbError::Permissions(format!(
                "You may not write {}",
                contract.versioned_slug()
            )));
        }
        Ok(contract)
    }

    fn normalize(&self, partial: Value) -> Result<Contract> {
        let mut contract = Contract::from_partial(partial)?;
        contract.contract_type = type_reference(&contract.contract_type);
        normalize_endpoint_types(&mut contract);
        Ok(contract)
    }

    /// The schema of the type `slug@version`.
    fn type_schema(&self, reference: &str) -> Result<Schema> {
        let unknown = || ContractDbError::UnknownType(reference.to_string());
        let (slug, version) = parse_reference(reference).map_err(|_| unknown())?;
        let contract = self
            .backend
            .get_element_by_slug(&slug, &version)?
            .filter(|c| c.active)
            .ok_or_else(unknown)?;
        Schema::from_value(contract.type_schema().cloned().unwrap_or(Value::Bool(true)))
    }

    // ── Live feeds ──────────────────────────────────────────────────

    /// Follow the contracts matching `query` as they change.
    pub fn stream(&self, session: &str, query: &Value, options: QueryOptions) -> Result<Stream> {
        log::debug!("Opening stream for {query}");
        let result = (|| -> Result<Stream> {
            let mask = get_mask(&*self.backend, session)?;
            let schema = query_schema(query)?;
            Stream::open(self.backend.clone(), self.config.clone(), mask, &schema, &options)
        })();
        result.map_err(|e| report(e, &format!("stream {query}")))
    }

    pub fn status(&self) -> Result<Value> {
        self.backend.status()
    }
}

/// A top-level property the patch changed although the mask hides it.
fn forbidden_change(mask: &Schema, before: &Value, after: &Value) -> Option<String> {
    let (Value::Object(before), Value::Object(after)) = (before, after) else {
        return None;
    };
    before
        .keys()
        .chain(after.keys())
        .find(|key| {
            let changed = match (before.get(*key), after.get(*key)) {
                (Some(a), Some(b)) => !json_equal(a, b),
                (None, None) => false,
                _ => true,
            };
            changed && forbids(mask, key)
        })
        .cloned()
}
