use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::{BulkItem, BulkOutcome, SearchAfterRequest, SearchHit, SearchIndex, SearchPage};
use crate::error::{ArcherError, Result};

#[derive(Debug, Default)]
struct Inner {
    documents: Mutex<BTreeMap<String, Map<String, Value>>>,
    pits: Mutex<HashMap<String, Vec<(String, Value)>>>,
    next_pit: AtomicU64,
    reject_bulk: AtomicBool,
}

/// Search index held in process memory, with the same merge and pagination
/// behaviour as the real engine.
#[derive(Debug, Clone, Default)]
pub struct InMemorySearchIndex {
    inner: Arc<Inner>,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self, id: &str) -> Option<Value> {
        self.inner
            .documents
            .lock()
            .get(id)
            .cloned()
            .map(Value::Object)
    }

    pub fn len(&self) -> usize {
        self.inner.documents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn open_pits(&self) -> usize {
        self.inner.pits.lock().len()
    }

    /// Make every subsequent bulk request report per-document failures.
    pub fn reject_bulk(&self, reject: bool) {
        self.inner.reject_bulk.store(reject, AtomicOrdering::SeqCst);
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn bulk(&self, items: &[BulkItem]) -> Result<Vec<BulkOutcome>> {
        if self.inner.reject_bulk.load(AtomicOrdering::SeqCst) {
            return Ok(items
                .iter()
                .map(|item| BulkOutcome {
                    id: item.id.clone(),
                    error: Some("es_rejected_execution_exception: queue full".into()),
                })
                .collect());
        }

        let mut documents = self.inner.documents.lock();
        Ok(items
            .iter()
            .map(|item| {
                let doc = documents.entry(item.id.clone()).or_default();
                item.script.apply(doc, &item.params);
                BulkOutcome::ok(item.id.clone())
            })
            .collect())
    }

    async fn open_point_in_time(&self, _keep_alive: &str) -> Result<String> {
        let snapshot: Vec<(String, Value)> = self
            .inner
            .documents
            .lock()
            .iter()
            .map(|(id, doc)| (id.clone(), Value::Object(doc.clone())))
            .collect();
        let id = format!(
            "pit-{}",
            self.inner.next_pit.fetch_add(1, AtomicOrdering::SeqCst)
        );
        self.inner.pits.lock().insert(id.clone(), snapshot);
        Ok(id)
    }

    async fn search_after(&self, request: &SearchAfterRequest) -> Result<SearchPage> {
        let pits = self.inner.pits.lock();
        let snapshot = pits.get(&request.pit_id).ok_or_else(|| {
            ArcherError::Search(format!("point in time {} not found", request.pit_id))
        })?;

        let (sort_field, descending) = parse_sort(&request.sort);
        let mut matched: Vec<SearchHit> = snapshot
            .iter()
            .filter(|(_, doc)| matches_query(doc, &request.query))
            .map(|(id, doc)| SearchHit {
                id: id.clone(),
                sort: vec![
                    lookup(doc, sort_field).into_iter().next().unwrap_or(Value::Null),
                    Value::String(id.clone()),
                ],
                source: project(doc, &request.source),
            })
            .collect();

        matched.sort_by(|a, b| {
            let primary = compare_values(&a.sort[0], &b.sort[0]);
            let primary = if descending { primary.reverse() } else { primary };
            primary.then_with(|| compare_values(&a.sort[1], &b.sort[1]))
        });

        let start = match &request.search_after {
            Some(after) => matched
                .iter()
                .position(|hit| {
                    let primary = compare_values(&hit.sort[0], &after[0]);
                    let primary = if descending { primary.reverse() } else { primary };
                    let ordering = primary.then_with(|| {
                        compare_values(
                            &hit.sort[1],
                            after.get(1).unwrap_or(&Value::Null),
                        )
                    });
                    ordering == Ordering::Greater
                })
                .unwrap_or(matched.len()),
            None => 0,
        };

        Ok(SearchPage {
            pit_id: Some(request.pit_id.clone()),
            hits: matched
                .into_iter()
                .skip(start)
                .take(request.size.max(1))
                .collect(),
        })
    }

    async fn close_point_in_time(&self, pit_id: &str) -> Result<()> {
        self.inner.pits.lock().remove(pit_id);
        Ok(())
    }
}

fn parse_sort(sort: &str) -> (&str, bool) {
    match sort.split_once(':') {
        Some((field, direction)) => (field, direction.eq_ignore_ascii_case("desc")),
        None => (sort, false),
    }
}

/// Every value reachable at a dotted path, flattening arrays.
fn lookup(doc: &Value, path: &str) -> Vec<Value> {
    let mut current = vec![doc.clone()];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Array(items) => {
                    for item in items {
                        if let Some(found) = item.get(segment) {
                            next.push(found.clone());
                        }
                    }
                }
                other => {
                    if let Some(found) = other.get(segment) {
                        next.push(found.clone());
                    }
                }
            }
        }
        current = next;
    }
    current
        .into_iter()
        .flat_map(|value| match value {
            Value::Array(items) => items,
            other => vec![other],
        })
        .collect()
}

/// Supports the `field:value AND field:value` subset of the query-string
/// syntax the modules issue.
fn matches_query(doc: &Value, query: &str) -> bool {
    let query = query.trim();
    if query.is_empty() || query == "*" {
        return true;
    }
    query.split(" AND ").all(|term| {
        let Some((field, expected)) = term.trim().split_once(':') else {
            return false;
        };
        let expected = expected.trim_matches('"');
        lookup(doc, field).iter().any(|value| match value {
            Value::String(s) => s == expected,
            Value::Number(n) => n.to_string() == expected,
            Value::Bool(b) => b.to_string() == expected,
            _ => false,
        })
    })
}

fn project(doc: &Value, fields: &[String]) -> Value {
    if fields.is_empty() {
        return doc.clone();
    }
    let Some(object) = doc.as_object() else {
        return doc.clone();
    };
    let mut projected = Map::new();
    for field in fields {
        let top = field.split('.').next().unwrap_or(field);
        if let Some(value) = object.get(top) {
            projected.insert(top.to_string(), value.clone());
        }
    }
    Value::Object(projected)
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => a.to_string().cmp(&b.to_string()),
    }
}
