//! Aggregate and scalar functions callable from a query.
//!
//! Aggregates reduce a group to one value and memoise their result in the
//! execution context; scalars operate on already-evaluated argument values.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::exec::ExecCtx;
use crate::sql::Projection;
use crate::types::{Dataset, Value};

/// Every callable function name, for shell completion.
pub const NAMES: &[&str] = &[
    "avg", "count", "day", "div", "hour", "int", "max", "mean", "median", "min", "minute", "mode",
    "month", "ms_to_s", "second", "us_to_ms", "year",
];

pub fn is_aggregate(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "count" | "avg" | "mean" | "min" | "max" | "median" | "mode"
    )
}

pub fn is_scalar(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "int" | "div" | "year" | "month" | "day" | "hour" | "minute" | "second" | "us_to_ms"
            | "ms_to_s"
    )
}

pub fn is_known(name: &str) -> bool {
    is_aggregate(name) || is_scalar(name)
}

fn arity(name: &str, got: usize, want: usize) -> Result<()> {
    if got == want {
        Ok(())
    } else {
        Err(Error::Query(format!(
            "{}() takes {} argument(s), got {}",
            name, want, got
        )))
    }
}

/// Evaluate an aggregate over one group of row indices.
pub fn aggregate(
    ctx: &ExecCtx,
    name: &str,
    args: &[Projection],
    group: &[usize],
    data: &Dataset,
    group_ord: usize,
) -> Result<Value> {
    let name = name.to_lowercase();
    let rendered: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    let key = format!("{}#{}({})", group_ord, name, rendered.join(","));
    if let Some(value) = ctx.cached(&key) {
        return Ok(value);
    }

    let value = match name.as_str() {
        "count" => Value::Int(group.len() as i64),
        "avg" | "mean" => {
            arity(&name, args.len(), 1)?;
            avg(ctx, column_ints(&name, args, group, data)?)?
        }
        "min" => {
            arity(&name, args.len(), 1)?;
            extremum(ctx, column_ints(&name, args, group, data)?, false)?
        }
        "max" => {
            arity(&name, args.len(), 1)?;
            extremum(ctx, column_ints(&name, args, group, data)?, true)?
        }
        "median" => {
            arity(&name, args.len(), 1)?;
            median(&name, column_values(&name, args, group, data)?)?
        }
        "mode" => {
            if args.is_empty() || args.len() > 2 {
                return Err(Error::Query(format!(
                    "mode() takes a column and an optional rank, got {} argument(s)",
                    args.len()
                )));
            }
            let rank = match args.get(1) {
                Some(Projection::Int(k)) if *k >= 0 => *k as usize,
                Some(other) => {
                    return Err(Error::Query(format!(
                        "mode() rank must be a non-negative integer, got {}",
                        other
                    )));
                }
                None => 0,
            };
            mode(column_values(&name, &args[..1], group, data)?, rank)?
        }
        other => return Err(Error::Query(format!("unknown aggregate '{}'", other))),
    };
    ctx.store(key, value.clone());
    Ok(value)
}

/// Resolve an aggregate's column argument to a schema index.
fn column_arg(fname: &str, args: &[Projection], data: &Dataset) -> Result<(usize, String)> {
    match args.first() {
        Some(Projection::Field(col)) => {
            let idx = data
                .schema
                .index_of(col)
                .ok_or_else(|| Error::Query(format!("{}(): unknown field '{}'", fname, col)))?;
            Ok((idx, col.clone()))
        }
        Some(other) => Err(Error::Query(format!(
            "{}() takes a column name, got {}",
            fname, other
        ))),
        None => Err(Error::Query(format!("{}() requires a column", fname))),
    }
}

fn column_values(
    fname: &str,
    args: &[Projection],
    group: &[usize],
    data: &Dataset,
) -> Result<Vec<Value>> {
    let (idx, _) = column_arg(fname, args, data)?;
    Ok(group.iter().map(|&i| data.rows[i][idx].clone()).collect())
}

fn column_ints(
    fname: &str,
    args: &[Projection],
    group: &[usize],
    data: &Dataset,
) -> Result<Vec<i64>> {
    let (idx, col) = column_arg(fname, args, data)?;
    group
        .iter()
        .map(|&i| {
            let value = &data.rows[i][idx];
            value.as_int().ok_or_else(|| {
                Error::Query(format!(
                    "{}(): non-numeric value '{}' in field '{}'",
                    fname, value, col
                ))
            })
        })
        .collect()
}

/// Truncated integer mean, computed as per-chunk (sum, n) pairs combined
/// into one division.
fn avg(ctx: &ExecCtx, ints: Vec<i64>) -> Result<Value> {
    if ints.is_empty() {
        return Err(Error::Query("avg() over an empty group".into()));
    }
    let pairs = ctx
        .pool
        .reduce(ints, |chunk| Ok((chunk.iter().sum::<i64>(), chunk.len() as i64)))?;
    let (sum, n) = pairs
        .into_iter()
        .fold((0i64, 0i64), |acc, (s, n)| (acc.0 + s, acc.1 + n));
    Ok(Value::Int(sum / n))
}

fn extremum(ctx: &ExecCtx, ints: Vec<i64>, want_max: bool) -> Result<Value> {
    let fname = if want_max { "max" } else { "min" };
    if ints.is_empty() {
        return Err(Error::Query(format!("{}() over an empty group", fname)));
    }
    let partials = ctx.pool.reduce(ints, move |chunk| {
        let it = chunk.into_iter();
        let best = if want_max { it.max() } else { it.min() };
        best.ok_or_else(|| Error::other("empty chunk"))
    })?;
    let it = partials.into_iter();
    let best = if want_max { it.max() } else { it.min() };
    best.map(Value::Int)
        .ok_or_else(|| Error::Query(format!("{}() over an empty group", fname)))
}

/// Middle element of a sorted copy; the lower-middle one for even-length
/// groups, with no averaging.
fn median(fname: &str, mut values: Vec<Value>) -> Result<Value> {
    if values.is_empty() {
        return Err(Error::Query(format!("{}() over an empty group", fname)));
    }
    values.sort_by(|a, b| a.compare(b));
    Ok(values[(values.len() - 1) / 2].clone())
}

/// The (rank + 1)-th most common value; ties break toward the smaller value
/// so the ranking is deterministic.
fn mode(values: Vec<Value>, rank: usize) -> Result<Value> {
    let mut counts: HashMap<String, (Value, usize)> = HashMap::new();
    for value in values {
        let entry = counts
            .entry(value.to_string())
            .or_insert_with(|| (value, 0));
        entry.1 += 1;
    }
    let mut ranked: Vec<(Value, usize)> = counts.into_values().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.compare(&b.0)));
    ranked
        .into_iter()
        .nth(rank)
        .map(|(value, _)| value)
        .ok_or_else(|| Error::Query(format!("mode(): rank {} out of range", rank)))
}

fn numeric(fname: &str, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| Error::Query(format!("{}(): non-numeric value '{}'", fname, value)))
}

fn exact_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Str(s) => s.trim().parse().ok(),
        Value::Float(_) => None,
    }
}

/// Slice a digit range out of a 14-character `YYYYMMDDHHMMSS` timestamp.
fn date_part(fname: &str, args: &[Value], start: usize, len: usize) -> Result<Value> {
    arity(fname, args.len(), 1)?;
    let text = match &args[0] {
        Value::Str(s) => s.trim(),
        other => {
            return Err(Error::Query(format!(
                "{}(): expected a timestamp string, got '{}'",
                fname, other
            )));
        }
    };
    if text.len() < 14 {
        return Err(Error::Query(format!(
            "{}(): timestamp '{}' is shorter than 14 characters",
            fname, text
        )));
    }
    text[start..start + len]
        .parse()
        .map(Value::Int)
        .map_err(|_| {
            Error::Query(format!(
                "{}(): non-numeric timestamp part in '{}'",
                fname, text
            ))
        })
}

/// Evaluate a scalar function on evaluated argument values.
pub fn scalar(name: &str, args: &[Value]) -> Result<Value> {
    let name = name.to_lowercase();
    match name.as_str() {
        "int" => {
            arity(&name, args.len(), 1)?;
            args[0]
                .as_int()
                .map(Value::Int)
                .ok_or_else(|| Error::Query(format!("int(): non-numeric value '{}'", args[0])))
        }
        "div" => {
            arity(&name, args.len(), 2)?;
            match (exact_int(&args[0]), exact_int(&args[1])) {
                (Some(_), Some(0)) => Err(Error::Query("div(): division by zero".into())),
                (Some(a), Some(b)) => Ok(Value::Int(a / b)),
                _ => {
                    let a = numeric(&name, &args[0])?;
                    let b = numeric(&name, &args[1])?;
                    if b == 0.0 {
                        Err(Error::Query("div(): division by zero".into()))
                    } else {
                        Ok(Value::Float(a / b))
                    }
                }
            }
        }
        "year" => date_part(&name, args, 0, 4),
        "month" => date_part(&name, args, 4, 2),
        "day" => date_part(&name, args, 6, 2),
        "hour" => date_part(&name, args, 8, 2),
        "minute" => date_part(&name, args, 10, 2),
        "second" => date_part(&name, args, 12, 2),
        "us_to_ms" | "ms_to_s" => {
            arity(&name, args.len(), 1)?;
            Ok(Value::Float(numeric(&name, &args[0])? / 1000.0))
        }
        other => Err(Error::Query(format!("unknown function '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logformat::{FieldDef, FieldKind};
    use crate::pool::Pool;
    use crate::types::Schema;

    fn dataset(values: Vec<i64>) -> Dataset {
        let schema = Schema::new(vec![FieldDef {
            name: "n".into(),
            kind: FieldKind::Int,
        }]);
        let rows = values.into_iter().map(|v| vec![Value::Int(v)]).collect();
        Dataset::new(schema, rows)
    }

    fn agg(name: &str, args: &[Projection], data: &Dataset) -> Result<Value> {
        let pool = Pool::new();
        let ctx = ExecCtx::new(&pool, false);
        let group: Vec<usize> = (0..data.rows.len()).collect();
        aggregate(&ctx, name, args, &group, data, 0)
    }

    fn col() -> Vec<Projection> {
        vec![Projection::Field("n".into())]
    }

    #[test]
    fn test_count() {
        let data = dataset(vec![1, 2, 3, 4]);
        assert_eq!(
            agg("count", &[Projection::Star], &data).unwrap(),
            Value::Int(4)
        );
    }

    #[test]
    fn test_avg_truncates() {
        let data = dataset(vec![2326, 12, 40]);
        assert_eq!(agg("avg", &col(), &data).unwrap(), Value::Int(792));
        assert_eq!(agg("mean", &col(), &data).unwrap(), Value::Int(792));
    }

    #[test]
    fn test_min_max() {
        let data = dataset(vec![7, 3, 9, 5]);
        assert_eq!(agg("min", &col(), &data).unwrap(), Value::Int(3));
        assert_eq!(agg("max", &col(), &data).unwrap(), Value::Int(9));
    }

    #[test]
    fn test_min_max_parallel_path() {
        let data = dataset((0..5000).collect());
        assert_eq!(agg("min", &col(), &data).unwrap(), Value::Int(0));
        assert_eq!(agg("max", &col(), &data).unwrap(), Value::Int(4999));
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(
            agg("median", &col(), &dataset(vec![5, 1, 3])).unwrap(),
            Value::Int(3)
        );
        // even length: the lower-middle element, no averaging
        assert_eq!(
            agg("median", &col(), &dataset(vec![4, 1, 3, 2])).unwrap(),
            Value::Int(2)
        );
    }

    #[test]
    fn test_mode_ranking() {
        let data = dataset(vec![1, 2, 2, 3, 3, 3]);
        assert_eq!(agg("mode", &col(), &data).unwrap(), Value::Int(3));
        let args = vec![Projection::Field("n".into()), Projection::Int(1)];
        assert_eq!(agg("mode", &args, &data).unwrap(), Value::Int(2));
        let args = vec![Projection::Field("n".into()), Projection::Int(5)];
        assert!(agg("mode", &args, &data).is_err());
    }

    #[test]
    fn test_aggregate_arity_mismatch() {
        let data = dataset(vec![1]);
        let args = vec![Projection::Field("n".into()), Projection::Field("n".into())];
        assert!(matches!(agg("avg", &args, &data), Err(Error::Query(_))));
    }

    #[test]
    fn test_int_coercion() {
        assert_eq!(
            scalar("int", &[Value::Str("42".into())]).unwrap(),
            Value::Int(42)
        );
        assert!(scalar("int", &[Value::Str("nope".into())]).is_err());
    }

    #[test]
    fn test_div_integer_and_float() {
        assert_eq!(
            scalar("div", &[Value::Int(7), Value::Int(2)]).unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            scalar("div", &[Value::Float(7.0), Value::Int(2)]).unwrap(),
            Value::Float(3.5)
        );
        assert!(scalar("div", &[Value::Int(1), Value::Int(0)]).is_err());
    }

    #[test]
    fn test_date_parts() {
        let ts = [Value::Str("20001010135536".into())];
        assert_eq!(scalar("year", &ts).unwrap(), Value::Int(2000));
        assert_eq!(scalar("month", &ts).unwrap(), Value::Int(10));
        assert_eq!(scalar("day", &ts).unwrap(), Value::Int(10));
        assert_eq!(scalar("hour", &ts).unwrap(), Value::Int(13));
        assert_eq!(scalar("minute", &ts).unwrap(), Value::Int(55));
        assert_eq!(scalar("second", &ts).unwrap(), Value::Int(36));
    }

    #[test]
    fn test_date_part_too_short() {
        let err = scalar("year", &[Value::Str("2000".into())]).unwrap_err();
        assert!(err.to_string().contains("14"));
    }

    #[test]
    fn test_unit_conversions() {
        assert_eq!(
            scalar("us_to_ms", &[Value::Int(1500)]).unwrap(),
            Value::Float(1.5)
        );
        assert_eq!(
            scalar("ms_to_s", &[Value::Int(250)]).unwrap(),
            Value::Float(0.25)
        );
    }

    #[test]
    fn test_aggregate_memoisation() {
        let pool = Pool::new();
        let ctx = ExecCtx::new(&pool, false);
        let data = dataset(vec![1, 2, 3]);
        let group: Vec<usize> = vec![0, 1, 2];
        let first = aggregate(&ctx, "avg", &col(), &group, &data, 0).unwrap();
        let second = aggregate(&ctx, "avg", &col(), &group, &data, 0).unwrap();
        assert_eq!(first, second);
    }
}
