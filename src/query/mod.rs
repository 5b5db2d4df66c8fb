//! Criteria queries
//!
//! A [`Query`] names an entity, carries a criteria [`Junction`], ordering,
//! pagination and projections, and is executed against a [`Session`]. The
//! backend compiles the criteria into its native query form first, so a
//! query it cannot express fails before anything is flushed or executed.
//!
//! ```rust,ignore
//! use runtara_datastore::query::{Order, Projection, Query, restrictions};
//!
//! let adults = Query::new("Person")
//!     .add(restrictions::ge("age", 18))
//!     .add(restrictions::like("lastName", "Sm%"))
//!     .order(Order::asc("lastName"))
//!     .paginate(0, 20)
//!     .list_of::<Person, _>(&mut session)?;
//!
//! let oldest = Query::new("Person")
//!     .projection(Projection::Max("age".to_string()))
//!     .list(&mut session)?;
//! ```

pub mod criteria;
pub mod projections;

use std::borrow::Cow;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::trace;

use crate::engine::NativeBackend;
use crate::error::{DatastoreError, Result};
use crate::model::builder::downcast;
use crate::model::{MappingContext, ObjectRef, PersistentEntity, PersistentProperty, PropertyKind};
use crate::session::Session;

pub use criteria::{Criterion, Direction, Junction, JunctionKind, Operator, Order, Point, restrictions};
pub use projections::Projection;

/// Result of executing a query
#[derive(Clone)]
pub enum QueryResults {
    /// Reconstituted domain objects
    Objects(Vec<ObjectRef>),
    /// Projected values
    ///
    /// With a single projection this is its raw result list. With several,
    /// each element is the `Value::Array` of one projection, in declaration
    /// order.
    Values(Vec<Value>),
}

impl QueryResults {
    pub fn len(&self) -> usize {
        match self {
            QueryResults::Objects(objects) => objects.len(),
            QueryResults::Values(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_objects(self) -> Option<Vec<ObjectRef>> {
        match self {
            QueryResults::Objects(objects) => Some(objects),
            QueryResults::Values(_) => None,
        }
    }

    pub fn into_values(self) -> Option<Vec<Value>> {
        match self {
            QueryResults::Values(values) => Some(values),
            QueryResults::Objects(_) => None,
        }
    }
}

impl std::fmt::Debug for QueryResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryResults::Objects(objects) => write!(f, "Objects({} objects)", objects.len()),
            QueryResults::Values(values) => f.debug_tuple("Values").field(values).finish(),
        }
    }
}

/// Criteria query over one entity (and its subtypes)
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    entity: String,
    criteria: Junction,
    projections: Vec<Projection>,
    orders: Vec<Order>,
    offset: usize,
    max_results: Option<usize>,
}

impl Query {
    /// Create a query for the named entity
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            criteria: Junction::conjunction(),
            projections: Vec::new(),
            orders: Vec::new(),
            offset: 0,
            max_results: None,
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity
    }

    pub fn criteria(&self) -> &Junction {
        &self.criteria
    }

    pub fn projections(&self) -> &[Projection] {
        &self.projections
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    /// Add a criterion to the top-level conjunction
    pub fn add(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    /// Replace the top-level junction
    pub fn with_criteria(mut self, criteria: Junction) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn projection(mut self, projection: Projection) -> Self {
        self.projections.push(projection);
        self
    }

    /// Add an ordering; without any the entity's default sort applies
    pub fn order(mut self, order: Order) -> Self {
        self.orders.push(order);
        self
    }

    /// Set the number of results to skip
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Set the maximum number of results
    pub fn max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }

    /// Set pagination
    pub fn paginate(self, offset: usize, max: usize) -> Self {
        self.offset(offset).max_results(max)
    }

    fn resolve<B: NativeBackend>(&self, session: &Session<B>) -> Result<Arc<PersistentEntity>> {
        session
            .context()
            .persistent_entity(&self.entity)
            .ok_or_else(|| {
                DatastoreError::illegal_argument(format!("'{}' is not a persistent entity", self.entity))
            })
    }

    fn effective_orders(&self, entity: &PersistentEntity) -> Vec<Order> {
        if !self.orders.is_empty() {
            return self.orders.clone();
        }
        entity.mapping().sort.iter().cloned().collect()
    }

    /// Compile to the backend's native query without executing it
    pub fn compile<B: NativeBackend>(&self, session: &Session<B>) -> Result<B::Query> {
        let entity = self.resolve(session)?;
        self.compile_for(session, &entity)
    }

    fn compile_for<B: NativeBackend>(&self, session: &Session<B>, entity: &PersistentEntity) -> Result<B::Query> {
        let orders = self.effective_orders(entity);
        let native = session
            .backend()
            .compile_query(session.context(), entity, &self.criteria, &orders)?;
        trace!(entity = %entity.name(), query = ?native, "Compiled query");
        Ok(native)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Execute the query
    ///
    /// Returns objects, or projected values when projections were added.
    pub fn list<B: NativeBackend>(&self, session: &mut Session<B>) -> Result<QueryResults> {
        session.ensure_connected()?;
        let entity = self.resolve(session)?;
        let native = self.compile_for(session, &entity)?;
        session.auto_flush()?;

        if !self.projections.is_empty() {
            return self.project(session, &entity, &native).map(QueryResults::Values);
        }

        let rows = session
            .backend_mut()
            .execute_query(&entity, &native, self.offset, self.max_results)?;
        let mut objects = Vec::with_capacity(rows.len());
        for (key, entry) in rows {
            objects.push(session.load_entry(&entity, &key, entry)?);
        }
        Ok(QueryResults::Objects(objects))
    }

    /// Execute and downcast every result to `T`
    pub fn list_of<T: 'static, B: NativeBackend>(&self, session: &mut Session<B>) -> Result<Vec<Rc<RefCell<T>>>> {
        match self.list(session)? {
            QueryResults::Objects(objects) => objects.into_iter().map(downcast::<T>).collect(),
            QueryResults::Values(_) => Err(DatastoreError::illegal_argument(
                "projection queries return values, not objects",
            )),
        }
    }

    /// First matching object, if any
    pub fn single_result<B: NativeBackend>(&self, session: &mut Session<B>) -> Result<Option<ObjectRef>> {
        if !self.projections.is_empty() {
            return Err(DatastoreError::illegal_argument(
                "single_result does not apply to projection queries",
            ));
        }
        let query = self.clone().max_results(1);
        Ok(query
            .list(session)?
            .into_objects()
            .and_then(|objects| objects.into_iter().next()))
    }

    /// Number of matching records, ignoring pagination
    pub fn count<B: NativeBackend>(&self, session: &mut Session<B>) -> Result<u64> {
        session.ensure_connected()?;
        let entity = self.resolve(session)?;
        let native = self.compile_for(session, &entity)?;
        session.auto_flush()?;
        session.backend_mut().count(&entity, &native)
    }

    fn project<B: NativeBackend>(
        &self,
        session: &mut Session<B>,
        entity: &PersistentEntity,
        native: &B::Query,
    ) -> Result<Vec<Value>> {
        let needs_rows = self.projections.iter().any(|p| !matches!(p, Projection::Count));
        let rows = if needs_rows {
            session
                .backend_mut()
                .execute_query(entity, native, self.offset, self.max_results)?
        } else {
            Vec::new()
        };

        let mut results = Vec::with_capacity(self.projections.len());
        for projection in &self.projections {
            let values = match projection {
                Projection::Count => vec![json!(session.backend_mut().count(entity, native)?)],
                Projection::Id => rows
                    .iter()
                    .map(|(key, _)| session.backend().key_to_value(key))
                    .collect(),
                Projection::Property(name) => self.property_values(session, entity, name, &rows)?,
                Projection::Min(name) => {
                    vec![projections::min(&self.property_values(session, entity, name, &rows)?)]
                }
                Projection::Max(name) => {
                    vec![projections::max(&self.property_values(session, entity, name, &rows)?)]
                }
                Projection::CountDistinct(name) => {
                    let values = self.property_values(session, entity, name, &rows)?;
                    vec![json!(projections::count_distinct(&values))]
                }
            };
            results.push(values);
        }

        if results.len() == 1 {
            return Ok(results.into_iter().flatten().collect());
        }
        Ok(results.into_iter().map(Value::Array).collect())
    }

    /// Stored value of `name` for each row; references become key values
    fn property_values<B: NativeBackend>(
        &self,
        session: &Session<B>,
        entity: &PersistentEntity,
        name: &str,
        rows: &[(B::Key, B::Entry)],
    ) -> Result<Vec<Value>> {
        let property = projected_property(session.context(), entity, name)?;
        let backend = session.backend();
        let field = backend.property_key(&property);
        let is_identity = matches!(property.kind(), PropertyKind::Identity);

        Ok(rows
            .iter()
            .map(|(key, entry)| {
                if is_identity {
                    return backend.key_to_value(key);
                }
                let value = backend.entry_value(entry, &field).unwrap_or(Value::Null);
                if property.kind().is_to_one() && !property.kind().is_embedded() {
                    return backend
                        .dereference(&value)
                        .map(|k| backend.key_to_value(&k))
                        .unwrap_or(Value::Null);
                }
                value
            })
            .collect())
    }
}

fn projected_property<'a>(
    context: &MappingContext,
    entity: &'a PersistentEntity,
    name: &str,
) -> Result<Cow<'a, PersistentProperty>> {
    let property = context.hierarchy_property(entity, name)?;
    if property.kind().is_to_many() {
        return Err(DatastoreError::unsupported_query(format!(
            "cannot project collection property {}.{}",
            entity.name(),
            name
        )));
    }
    Ok(property)
}
