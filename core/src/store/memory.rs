//! In-process store keeping tables as vectors of records.
//!
//! Enforces the identity field and declared unique constraints the way a real
//! store would, logs every call, and can be told to fail specific operations.
//! Used by the crate's tests and for prototyping against the batch API
//! without a database.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::{
    compare::{group_signature, values_equal},
    database::capabilities::ConnectionDescriptor,
    model::ModelSchema,
    record::{identity_of, Record},
    store::{Filter, RecordUpdate, Store, StoreError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    FindMany,
    CreateMany,
    Update,
    DeleteMany,
    Transaction,
    ExecuteRaw,
}

/// A call received by the store, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    FindMany { table: String, filter: Filter },
    CreateMany { table: String, records: Vec<Record>, skip_duplicates: bool },
    Update { table: String, id: Value, data: Record },
    DeleteMany { table: String, ids: Vec<Value> },
    Transaction { table: String, updates: Vec<RecordUpdate> },
    ExecuteRaw { sql: String },
}

impl StoreCall {
    pub fn operation(&self) -> StoreOperation {
        match self {
            StoreCall::FindMany { .. } => StoreOperation::FindMany,
            StoreCall::CreateMany { .. } => StoreOperation::CreateMany,
            StoreCall::Update { .. } => StoreOperation::Update,
            StoreCall::DeleteMany { .. } => StoreOperation::DeleteMany,
            StoreCall::Transaction { .. } => StoreOperation::Transaction,
            StoreCall::ExecuteRaw { .. } => StoreOperation::ExecuteRaw,
        }
    }
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    operation: StoreOperation,
    error: StoreError,
    /// Only fail calls touching this identity.
    id: Option<Value>,
    /// `None` fails every matching call.
    remaining: Option<usize>,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    id_field: String,
    unique_constraints: Vec<Vec<String>>,
    rows: Vec<Record>,
    next_id: u64,
}

impl MemoryTable {
    fn new(id_field: &str) -> Self {
        Self {
            id_field: id_field.to_string(),
            unique_constraints: Vec::new(),
            rows: Vec::new(),
            next_id: 1,
        }
    }

    /// Identity first, then the declared groups.
    fn constraint_groups(&self) -> Vec<Vec<String>> {
        let mut groups = vec![vec![self.id_field.clone()]];
        groups.extend(self.unique_constraints.iter().cloned());
        groups
    }

    fn position_of(&self, id: &Value) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| identity_of(row, &self.id_field).is_some_and(|v| values_equal(v, id)))
    }

    /// The first group on which `record` collides with a row other than `skip`.
    fn conflict(&self, record: &Record, skip: Option<usize>) -> Option<Vec<String>> {
        for (index, group) in self.constraint_groups().into_iter().enumerate() {
            let Some(signature) = group_signature(record, index, &group) else {
                continue;
            };
            let collides = self.rows.iter().enumerate().any(|(position, row)| {
                Some(position) != skip &&
                    group_signature(row, index, &group).as_ref() == Some(&signature)
            });
            if collides {
                return Some(group);
            }
        }
        None
    }

    fn assign_identity(&mut self, record: &mut Record) {
        match identity_of(record, &self.id_field).and_then(Value::as_u64) {
            Some(id) => self.next_id = self.next_id.max(id + 1),
            None if identity_of(record, &self.id_field).is_none() => {
                record.insert(self.id_field.clone(), Value::from(self.next_id));
                self.next_id += 1;
            }
            None => {}
        }
    }

    fn insert(&mut self, mut record: Record) -> Result<(), StoreError> {
        self.assign_identity(&mut record);
        if let Some(group) = self.conflict(&record, None) {
            return Err(unique_violation(&group));
        }
        self.rows.push(record);
        Ok(())
    }

    fn update(&mut self, id: &Value, data: &Record) -> Result<(), StoreError> {
        let position = self
            .position_of(id)
            .ok_or_else(|| StoreError::other(format!("Record to update not found: {}", id)))?;

        let mut updated = self.rows[position].clone();
        for (field, value) in data {
            updated.insert(field.clone(), value.clone());
        }

        if let Some(group) = self.conflict(&updated, Some(position)) {
            return Err(unique_violation(&group));
        }

        self.rows[position] = updated;
        Ok(())
    }
}

fn unique_violation(group: &[String]) -> StoreError {
    let fields = group.iter().map(|field| format!("`{}`", field)).collect::<Vec<_>>().join(",");
    StoreError::unique_violation(format!("Unique constraint failed on the fields: ({})", fields))
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    calls: Vec<StoreCall>,
    failures: Vec<InjectedFailure>,
}

impl MemoryState {
    fn table(&mut self, table: &str, id_field: &str) -> &mut MemoryTable {
        self.tables.entry(table.to_string()).or_insert_with(|| MemoryTable::new(id_field))
    }

    fn take_failure(&mut self, operation: StoreOperation, ids: &[&Value]) -> Option<StoreError> {
        let position = self.failures.iter().position(|failure| {
            failure.operation == operation &&
                match &failure.id {
                    Some(target) => ids.iter().any(|id| values_equal(id, target)),
                    None => true,
                }
        })?;

        let failure = &mut self.failures[position];
        let error = failure.error.clone();
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.failures.remove(position);
            }
        }
        Some(error)
    }

    /// Stored rows a set-based `UPDATE <table> ... WHERE <id> IN (...)` targets.
    fn matched_rows(&self, sql: &str) -> u64 {
        let Some(rest) = sql.strip_prefix("UPDATE ") else {
            return 0;
        };
        let (Some((table, _)), Some((_, list))) = (rest.split_once(' '), rest.rsplit_once(" IN ("))
        else {
            return 0;
        };
        let Some(table) = self.tables.get(unquote(table)) else {
            return 0;
        };

        let list = list.strip_suffix(')').unwrap_or(list);
        split_literals(list).iter().filter(|id| table.position_of(id).is_some()).count() as u64
    }
}

fn unquote(identifier: &str) -> &str {
    identifier.trim_matches(|c| matches!(c, '"' | '`' | '[' | ']'))
}

/// Splits a comma separated list of SQL literals, honouring quoted strings.
fn split_literals(list: &str) -> Vec<Value> {
    let mut literals = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in list.chars() {
        match c {
            '\'' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => literals.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    literals.push(current);

    literals.iter().map(|literal| parse_literal(literal.trim())).collect()
}

fn parse_literal(literal: &str) -> Value {
    if let Some(text) = literal.strip_prefix('\'').and_then(|rest| rest.strip_suffix('\'')) {
        return Value::String(text.replace("''", "'"));
    }
    if let Ok(number) = literal.parse::<i64>() {
        return Value::from(number);
    }
    if let Ok(number) = literal.parse::<f64>() {
        return Value::from(number);
    }
    Value::String(literal.to_string())
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    descriptor: ConnectionDescriptor,
    pool_size: usize,
    latency: Option<Duration>,
    raw_affected: Option<u64>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store that reports itself as postgres with a pool of 10 connections.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            descriptor: ConnectionDescriptor::from_engine("postgres"),
            pool_size: 10,
            latency: None,
            raw_affected: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_descriptor(mut self, descriptor: ConnectionDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn with_engine(self, engine: &str) -> Self {
        self.with_descriptor(ConnectionDescriptor::from_engine(engine))
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Every call sleeps this long before touching the tables.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Rows reported as affected by `execute_raw_unsafe`, instead of the
    /// stored rows an `UPDATE ... WHERE id IN (...)` statement targets.
    pub fn with_raw_affected(mut self, affected: u64) -> Self {
        self.raw_affected = Some(affected);
        self
    }

    /// Declares the identity field and unique constraints of a schema's table.
    pub fn with_schema(self, schema: &ModelSchema) -> Self {
        {
            let mut state = self.lock();
            let table = state.table(&schema.table, &schema.id_field);
            table.id_field = schema.id_field.clone();
            table.unique_constraints = schema.unique_constraints.clone();
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // every mutation is applied to a copy or in one step, so a poisoned lock is consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inserts rows directly, bypassing constraints and the call log.
    pub fn seed(&self, table: &str, records: Vec<Record>) {
        let mut state = self.lock();
        let table = state.table(table, "id");
        for mut record in records {
            table.assign_identity(&mut record);
            table.rows.push(record);
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.lock().tables.get(table).map(|table| table.rows.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    pub fn calls_of(&self, operation: StoreOperation) -> Vec<StoreCall> {
        self.lock().calls.iter().filter(|call| call.operation() == operation).cloned().collect()
    }

    /// Most calls that were in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Fails the next call of `operation` with `error`.
    pub fn fail_next(&self, operation: StoreOperation, error: StoreError) {
        self.fail_times(operation, error, 1);
    }

    pub fn fail_times(&self, operation: StoreOperation, error: StoreError, times: usize) {
        if times == 0 {
            return;
        }
        self.lock().failures.push(InjectedFailure {
            operation,
            error,
            id: None,
            remaining: Some(times),
        });
    }

    /// Fails every call of `operation`.
    pub fn fail_always(&self, operation: StoreOperation, error: StoreError) {
        self.lock().failures.push(InjectedFailure { operation, error, id: None, remaining: None });
    }

    /// Fails every call of `operation` that touches the record identified by `id`.
    pub fn fail_for_id(&self, operation: StoreOperation, id: Value, error: StoreError) {
        self.lock().failures.push(InjectedFailure {
            operation,
            error,
            id: Some(id),
            remaining: None,
        });
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        InFlight(&self.in_flight)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_many(&self, table: &str, filter: &Filter) -> Result<Vec<Record>, StoreError> {
        let _in_flight = self.enter().await;
        let mut state = self.lock();
        state.calls.push(StoreCall::FindMany { table: table.to_string(), filter: filter.clone() });

        if let Some(error) = state.take_failure(StoreOperation::FindMany, &[]) {
            return Err(error);
        }

        Ok(state
            .tables
            .get(table)
            .map(|table| table.rows.iter().filter(|row| filter.matches(row)).cloned().collect())
            .unwrap_or_default())
    }

    async fn create_many(
        &self,
        table: &str,
        records: &[Record],
        skip_duplicates: bool,
    ) -> Result<u64, StoreError> {
        let _in_flight = self.enter().await;
        let mut state = self.lock();
        state.calls.push(StoreCall::CreateMany {
            table: table.to_string(),
            records: records.to_vec(),
            skip_duplicates,
        });

        if let Some(error) = state.take_failure(StoreOperation::CreateMany, &[]) {
            return Err(error);
        }

        let target = state.table(table, "id");
        let mut staged = target.clone();
        let mut inserted = 0;

        for record in records {
            match staged.insert(record.clone()) {
                Ok(()) => inserted += 1,
                Err(e) if skip_duplicates && e.is_unique_violation() => {
                    debug!("MemoryStore - skipping duplicate row in {}: {}", table, e);
                }
                Err(e) => return Err(e),
            }
        }

        *target = staged;
        Ok(inserted)
    }

    async fn update(
        &self,
        table: &str,
        id_field: &str,
        id: &Value,
        data: &Record,
    ) -> Result<(), StoreError> {
        let _in_flight = self.enter().await;
        let mut state = self.lock();
        state.calls.push(StoreCall::Update {
            table: table.to_string(),
            id: id.clone(),
            data: data.clone(),
        });

        if let Some(error) = state.take_failure(StoreOperation::Update, &[id]) {
            return Err(error);
        }

        state.table(table, id_field).update(id, data)
    }

    async fn delete_many(
        &self,
        table: &str,
        id_field: &str,
        ids: &[Value],
    ) -> Result<u64, StoreError> {
        let _in_flight = self.enter().await;
        let mut state = self.lock();
        state.calls.push(StoreCall::DeleteMany { table: table.to_string(), ids: ids.to_vec() });

        let touched: Vec<&Value> = ids.iter().collect();
        if let Some(error) = state.take_failure(StoreOperation::DeleteMany, &touched) {
            return Err(error);
        }

        let target = state.table(table, id_field);
        let before = target.rows.len();
        target.rows.retain(|row| {
            !identity_of(row, id_field).is_some_and(|id| ids.iter().any(|v| values_equal(id, v)))
        });
        Ok((before - target.rows.len()) as u64)
    }

    async fn transaction(
        &self,
        table: &str,
        id_field: &str,
        updates: &[RecordUpdate],
    ) -> Result<(), StoreError> {
        let _in_flight = self.enter().await;
        let mut state = self.lock();
        state.calls.push(StoreCall::Transaction {
            table: table.to_string(),
            updates: updates.to_vec(),
        });

        let touched: Vec<&Value> = updates.iter().map(|update| &update.id).collect();
        if let Some(error) = state.take_failure(StoreOperation::Transaction, &touched) {
            return Err(error);
        }

        let target = state.table(table, id_field);
        let mut staged = target.clone();
        for update in updates {
            staged.update(&update.id, &update.data)?;
        }

        *target = staged;
        Ok(())
    }

    async fn execute_raw_unsafe(&self, sql: &str) -> Result<u64, StoreError> {
        let _in_flight = self.enter().await;
        let mut state = self.lock();
        state.calls.push(StoreCall::ExecuteRaw { sql: sql.to_string() });

        if let Some(error) = state.take_failure(StoreOperation::ExecuteRaw, &[]) {
            return Err(error);
        }

        Ok(self.raw_affected.unwrap_or_else(|| state.matched_rows(sql)))
    }

    fn pool_size(&self) -> usize {
        self.pool_size
    }

    fn descriptor(&self) -> ConnectionDescriptor {
        self.descriptor.clone()
    }
}
