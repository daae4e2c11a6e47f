//! Query executor: walks a `Statement` stage by stage over the dataset.
//!
//! Stage order is filter, group, project, order, limit. The predicate is
//! interpreted directly over the typed tree; records are accessed by schema
//! index, never by name injection.

pub mod funcs;

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::sql::{CmpOp, Direction, Operand, Predicate, Projection, Statement};
use crate::types::{Dataset, Record, Value};

/// Per-query execution context: the worker pool, the debug flag, and the
/// aggregate memo keyed by `(group, function, args)`.
pub struct ExecCtx<'a> {
    pub pool: &'a Pool,
    pub debug: bool,
    cache: RefCell<HashMap<String, Value>>,
}

impl<'a> ExecCtx<'a> {
    pub fn new(pool: &'a Pool, debug: bool) -> Self {
        Self {
            pool,
            debug,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn cached(&self, key: &str) -> Option<Value> {
        self.cache.borrow().get(key).cloned()
    }

    pub(crate) fn store(&self, key: String, value: Value) {
        self.cache.borrow_mut().insert(key, value);
    }
}

/// An ordered projection, suitable for tabular rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

fn unknown_field(name: &str) -> Error {
    Error::Query(format!("unknown field '{}'", name))
}

/// Execute a statement against the dataset.
pub fn execute(ctx: &ExecCtx, stmt: &Statement, data: &Dataset) -> Result<QueryOutput> {
    if ctx.debug {
        log::debug!("statement tree: {:#?}", stmt);
    }
    validate(stmt, data)?;

    // Filter: interpret the predicate tree over row indices in parallel.
    let all: Vec<usize> = (0..data.rows.len()).collect();
    let kept = match &stmt.predicate {
        Some(pred) => {
            let resolved = resolve_predicate(pred, data)?;
            let resolved = &resolved;
            let filtered = ctx.pool.map(all, move |chunk| {
                Ok(chunk
                    .into_iter()
                    .filter(|&i| eval_predicate(resolved, &data.rows[i]))
                    .collect())
            })?;
            log::debug!("filter kept {} of {} rows", filtered.len(), data.rows.len());
            filtered
        }
        None => all,
    };

    // Group: stable-sort by the key tuple, then split into maximal runs.
    let groups: Vec<Vec<usize>> = match &stmt.group_by {
        Some(keys) => {
            let key_idx: Vec<usize> = keys
                .iter()
                .map(|k| data.schema.index_of(k).ok_or_else(|| unknown_field(k)))
                .collect::<Result<_>>()?;
            let mut sorted = kept;
            sorted.sort_by(|&a, &b| {
                key_idx
                    .iter()
                    .map(|&k| data.rows[a][k].compare(&data.rows[b][k]))
                    .find(|ord| *ord != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
            let mut groups: Vec<Vec<usize>> = Vec::new();
            for i in sorted {
                if let Some(last) = groups.last_mut() {
                    let same = key_idx
                        .iter()
                        .all(|&k| data.rows[last[0]][k].equals(&data.rows[i][k]));
                    if same {
                        last.push(i);
                        continue;
                    }
                }
                groups.push(vec![i]);
            }
            groups
        }
        None => vec![kept],
    };

    // Project.
    let columns = output_columns(stmt, data);
    let has_aggregate = stmt.fields.iter().any(contains_aggregate);
    let mut rows: Vec<Vec<Value>> = Vec::new();
    if has_aggregate {
        for (ord, group) in groups.iter().enumerate() {
            let mut row = Vec::with_capacity(columns.len());
            for item in &stmt.fields {
                match item {
                    Projection::Star => {
                        let first = group
                            .first()
                            .map(|&i| &data.rows[i])
                            .ok_or_else(|| Error::Query("'*' over an empty group".into()))?;
                        row.extend(first.iter().cloned());
                    }
                    other => row.push(eval_in_group(ctx, other, group, data, ord)?),
                }
            }
            rows.push(row);
        }
    } else {
        for group in &groups {
            for &i in group {
                let record = &data.rows[i];
                let mut row = Vec::with_capacity(columns.len());
                for item in &stmt.fields {
                    match item {
                        Projection::Star => row.extend(record.iter().cloned()),
                        other => row.push(eval_on_record(other, record, data)?),
                    }
                }
                rows.push(row);
            }
        }
    }

    // Order: stable sort over the projected rows; desc flips the comparator
    // so equal keys keep their relative order.
    if let Some(order) = &stmt.order_by {
        let sort_idx: Vec<usize> = order
            .fields
            .iter()
            .map(|f| {
                columns.iter().position(|c| c == f).ok_or_else(|| {
                    Error::Query(format!("order by column '{}' is not in the projection", f))
                })
            })
            .collect::<Result<_>>()?;
        let cmp = |a: &Vec<Value>, b: &Vec<Value>| {
            sort_idx
                .iter()
                .map(|&k| a[k].compare(&b[k]))
                .find(|ord| *ord != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        };
        match order.direction {
            Direction::Asc => rows.sort_by(|a, b| cmp(a, b)),
            Direction::Desc => rows.sort_by(|a, b| cmp(b, a)),
        }
    }

    // Limit: slice [offset : offset + count] with clamp.
    if let Some(limit) = stmt.limit {
        rows = rows
            .into_iter()
            .skip(limit.offset)
            .take(limit.count)
            .collect();
    }

    Ok(QueryOutput { columns, rows })
}

/// Output column names follow the projection syntax verbatim; `*` expands to
/// the schema fields in order.
fn output_columns(stmt: &Statement, data: &Dataset) -> Vec<String> {
    let mut columns = Vec::with_capacity(stmt.fields.len());
    for item in &stmt.fields {
        match item {
            Projection::Star => columns.extend(data.schema.names().map(str::to_string)),
            other => columns.push(other.column_name()),
        }
    }
    columns
}

fn contains_aggregate(item: &Projection) -> bool {
    match item {
        Projection::Call { name, args } => {
            funcs::is_aggregate(name) || args.iter().any(contains_aggregate)
        }
        _ => false,
    }
}

fn collect_field_refs<'a>(item: &'a Projection, data: &'a Dataset, refs: &mut Vec<&'a str>) {
    match item {
        Projection::Field(name) => refs.push(name),
        Projection::Star => refs.extend(data.schema.names()),
        Projection::Call { args, .. } => {
            for arg in args {
                collect_field_refs(arg, data, refs);
            }
        }
        _ => {}
    }
}

/// Up-front semantic checks so no partial result can be emitted.
fn validate(stmt: &Statement, data: &Dataset) -> Result<()> {
    for item in &stmt.fields {
        validate_projection(item, data)?;
    }
    let has_aggregate = stmt.fields.iter().any(contains_aggregate);
    if has_aggregate {
        // A projection mixing aggregates with plain field references needs a
        // GROUP BY naming every such field; otherwise the per-group value
        // would be ambiguous.
        let group_fields: &[String] = stmt.group_by.as_deref().unwrap_or(&[]);
        for item in &stmt.fields {
            if contains_aggregate(item) {
                continue;
            }
            let mut refs = Vec::new();
            collect_field_refs(item, data, &mut refs);
            for field in refs {
                if !group_fields.iter().any(|g| g == field) {
                    return Err(Error::Query(format!(
                        "field '{}' must appear in group by when aggregates are selected",
                        field
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_projection(item: &Projection, data: &Dataset) -> Result<()> {
    match item {
        Projection::Field(name) => {
            data.schema
                .index_of(name)
                .ok_or_else(|| unknown_field(name))?;
            Ok(())
        }
        Projection::Call { name, args } => {
            if !funcs::is_known(name) {
                return Err(Error::Query(format!("unknown function '{}'", name)));
            }
            if funcs::is_aggregate(name) {
                // Aggregates take a column (or `*` for count) plus literal
                // options; nested calls are not aggregated over.
                match args.first() {
                    Some(Projection::Field(col)) => {
                        data.schema.index_of(col).ok_or_else(|| unknown_field(col))?;
                    }
                    Some(Projection::Star) | Some(Projection::Int(_)) => {}
                    Some(other) => {
                        return Err(Error::Query(format!(
                            "{}() takes a column name, got {}",
                            name, other
                        )));
                    }
                    None => {
                        return Err(Error::Query(format!("{}() requires an argument", name)));
                    }
                }
                Ok(())
            } else {
                for arg in args {
                    validate_projection(arg, data)?;
                }
                Ok(())
            }
        }
        _ => Ok(()),
    }
}

/// Evaluate a projection item over a whole group (aggregate mode).
/// Non-aggregate sub-expressions resolve against the group's first record.
fn eval_in_group(
    ctx: &ExecCtx,
    item: &Projection,
    group: &[usize],
    data: &Dataset,
    group_ord: usize,
) -> Result<Value> {
    match item {
        Projection::Int(i) => Ok(Value::Int(*i)),
        Projection::Str(s) => Ok(Value::Str(s.clone())),
        Projection::Field(name) => {
            let idx = data
                .schema
                .index_of(name)
                .ok_or_else(|| unknown_field(name))?;
            let first = group
                .first()
                .ok_or_else(|| Error::Query(format!("field '{}' over an empty group", name)))?;
            Ok(data.rows[*first][idx].clone())
        }
        Projection::Star => Err(Error::Query("'*' is not valid here".into())),
        Projection::Call { name, args } => {
            if funcs::is_aggregate(name) {
                funcs::aggregate(ctx, name, args, group, data, group_ord)
            } else {
                let values: Vec<Value> = args
                    .iter()
                    .map(|arg| eval_in_group(ctx, arg, group, data, group_ord))
                    .collect::<Result<_>>()?;
                funcs::scalar(name, &values)
            }
        }
    }
}

/// Evaluate a projection item against a single record (non-aggregate mode).
fn eval_on_record(item: &Projection, record: &Record, data: &Dataset) -> Result<Value> {
    match item {
        Projection::Int(i) => Ok(Value::Int(*i)),
        Projection::Str(s) => Ok(Value::Str(s.clone())),
        Projection::Field(name) => {
            let idx = data
                .schema
                .index_of(name)
                .ok_or_else(|| unknown_field(name))?;
            Ok(record[idx].clone())
        }
        Projection::Star => Err(Error::Query("'*' is not a valid function argument".into())),
        Projection::Call { name, args } => {
            let values: Vec<Value> = args
                .iter()
                .map(|arg| eval_on_record(arg, record, data))
                .collect::<Result<_>>()?;
            funcs::scalar(name, &values)
        }
    }
}

/// Predicate operand with the field lookup resolved to a schema index.
enum Bound {
    Col(usize),
    Lit(Value),
}

enum ResolvedPred {
    Compare {
        lhs: Bound,
        op: CmpOp,
        rhs: Bound,
    },
    Between {
        val: Bound,
        lo: Bound,
        hi: Bound,
    },
    In {
        val: Bound,
        items: Vec<Bound>,
    },
    And(Box<ResolvedPred>, Box<ResolvedPred>),
    Or(Box<ResolvedPred>, Box<ResolvedPred>),
}

fn bind(operand: &Operand, data: &Dataset) -> Result<Bound> {
    match operand {
        Operand::Field(name) => data
            .schema
            .index_of(name)
            .map(Bound::Col)
            .ok_or_else(|| unknown_field(name)),
        Operand::Int(i) => Ok(Bound::Lit(Value::Int(*i))),
        Operand::Str(s) => Ok(Bound::Lit(Value::Str(s.clone()))),
    }
}

fn resolve_predicate(pred: &Predicate, data: &Dataset) -> Result<ResolvedPred> {
    let resolved = match pred {
        Predicate::Compare { lhs, op, rhs } => ResolvedPred::Compare {
            lhs: bind(lhs, data)?,
            op: *op,
            rhs: bind(rhs, data)?,
        },
        Predicate::Between { val, lo, hi } => ResolvedPred::Between {
            val: bind(val, data)?,
            lo: bind(lo, data)?,
            hi: bind(hi, data)?,
        },
        Predicate::In { val, items } => ResolvedPred::In {
            val: bind(val, data)?,
            items: items
                .iter()
                .map(|item| bind(item, data))
                .collect::<Result<_>>()?,
        },
        Predicate::And(lhs, rhs) => ResolvedPred::And(
            Box::new(resolve_predicate(lhs, data)?),
            Box::new(resolve_predicate(rhs, data)?),
        ),
        Predicate::Or(lhs, rhs) => ResolvedPred::Or(
            Box::new(resolve_predicate(lhs, data)?),
            Box::new(resolve_predicate(rhs, data)?),
        ),
    };
    Ok(resolved)
}

fn bound<'a>(bound: &'a Bound, record: &'a Record) -> &'a Value {
    match bound {
        Bound::Col(idx) => &record[*idx],
        Bound::Lit(value) => value,
    }
}

fn eval_predicate(pred: &ResolvedPred, record: &Record) -> bool {
    match pred {
        ResolvedPred::Compare { lhs, op, rhs } => {
            let a = bound(lhs, record);
            let b = bound(rhs, record);
            match op {
                CmpOp::Eq => a.equals(b),
                CmpOp::Ne => !a.equals(b),
                CmpOp::Lt => a.compare(b) == Ordering::Less,
                CmpOp::Gt => a.compare(b) == Ordering::Greater,
                CmpOp::Le => a.compare(b) != Ordering::Greater,
                CmpOp::Ge => a.compare(b) != Ordering::Less,
            }
        }
        ResolvedPred::Between { val, lo, hi } => {
            let v = bound(val, record);
            bound(lo, record).compare(v) != Ordering::Greater
                && v.compare(bound(hi, record)) != Ordering::Greater
        }
        ResolvedPred::In { val, items } => {
            let v = bound(val, record);
            items.iter().any(|item| v.equals(bound(item, record)))
        }
        ResolvedPred::And(lhs, rhs) => eval_predicate(lhs, record) && eval_predicate(rhs, record),
        ResolvedPred::Or(lhs, rhs) => eval_predicate(lhs, record) || eval_predicate(rhs, record),
    }
}
