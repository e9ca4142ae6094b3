//! Filter pushdown: translating filter predicates into JSONB WHERE
//! clauses.
//!
//! Every generated clause is a *superset* of the MongoDB predicate: a row
//! the full evaluation would match is never excluded by the pushed SQL.
//! Where the canonical JSONB encoding cannot discriminate exactly (tagged
//! numbers, implicit array traversal), the clause widens into an OR over
//! the tag spellings of the same mathematical value, plus an escape for
//! array fields, and the result is flagged incomplete so the caller
//! re-runs the full filter in memory.
//!
//! Eligibility per operator and operand type is deliberately explicit
//! here and enumerated by the tests at the bottom; range operators are
//! never pushed because JSONB orders the tag wrappers, not the numbers
//! inside them.

use mangrove_bson::{pgjson, Document, Value};
use serde_json::json;

/// A pushdown plan: WHERE clauses with bind parameters, plus whether the
/// plan captures the filter exactly.
#[derive(Debug, Default)]
pub struct Pushdown {
    pub clauses: Vec<String>,
    pub params: Vec<serde_json::Value>,
    /// True when the clauses are equivalent to the filter, so in-memory
    /// re-evaluation (and therefore LIMIT suppression) is unnecessary.
    pub complete: bool,
}

impl Pushdown {
    /// ` WHERE ...` fragment, empty when nothing was pushed.
    pub fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// Builds the pushdown plan for a filter document.
pub fn build(filter: &Document) -> Pushdown {
    let mut builder = Builder::default();
    let mut all_exact = true;

    for (field, condition) in filter.iter() {
        // Logical operators and dotted paths stay in memory.
        if field.starts_with('$') || field.contains('.') {
            all_exact = false;
            continue;
        }
        match builder.field_clauses(field, condition) {
            FieldPlan::Exact => {}
            FieldPlan::Partial => all_exact = false,
            FieldPlan::Residual => all_exact = false,
        }
    }

    Pushdown {
        clauses: builder.clauses,
        params: builder.params,
        complete: all_exact,
    }
}

enum FieldPlan {
    /// Clauses capture this field's predicate exactly.
    Exact,
    /// Clauses were emitted but are wider than the predicate.
    Partial,
    /// Nothing pushed for this field.
    Residual,
}

#[derive(Default)]
struct Builder {
    clauses: Vec<String>,
    params: Vec<serde_json::Value>,
}

impl Builder {
    fn bind(&mut self, value: serde_json::Value) -> String {
        self.params.push(value);
        format!("${}::jsonb", self.params.len())
    }

    fn field_clauses(&mut self, field: &str, condition: &Value) -> FieldPlan {
        match condition {
            Value::Document(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                let mut plan = FieldPlan::Exact;
                for (op, operand) in ops.iter() {
                    let op_plan = match op {
                        "$eq" => self.eq_clause(field, operand),
                        "$in" => self.in_clause(field, operand),
                        "$exists" => self.exists_clause(field, operand),
                        // $gt/$gte/$lt/$lte, $ne, $nin, $not, $type,
                        // $regex: evaluated in memory.
                        _ => FieldPlan::Residual,
                    };
                    plan = combine(plan, op_plan);
                }
                plan
            }
            // Implicit equality against a scalar.
            other => self.eq_clause(field, other),
        }
    }

    fn eq_clause(&mut self, field: &str, operand: &Value) -> FieldPlan {
        let path = field_access(field);
        // `_id` holds a single scalar by contract; other fields may hold
        // an array the predicate implicitly traverses.
        let array_escape = field != "_id";

        let (spellings, widened) = match operand {
            Value::String(_)
            | Value::Bool(_)
            | Value::DateTime(_)
            | Value::ObjectId(_)
            | Value::Binary(_)
            | Value::Timestamp(_) => (vec![pgjson::value_to_json(operand)], false),
            Value::Double(_) | Value::Int32(_) | Value::Int64(_) | Value::Decimal128(_) => {
                match numeric_spellings(operand) {
                    Some(spellings) => (spellings, true),
                    None => return FieldPlan::Residual,
                }
            }
            // null (matches missing), documents (JSONB forgets field
            // order), arrays, regex, min/max keys: not pushable.
            _ => return FieldPlan::Residual,
        };

        let mut alternatives: Vec<String> = spellings
            .into_iter()
            .map(|spelling| {
                let placeholder = self.bind(spelling);
                format!("{path} = {placeholder}")
            })
            .collect();
        let mut exact = !widened;

        if widened {
            // An equal value may be stored under the decimal tag with a
            // different coefficient/exponent split.
            alternatives.push(format!(
                "(jsonb_typeof({path}) = 'object' AND {path} ? '$numberDecimal')"
            ));
        }
        if array_escape {
            alternatives.push(format!("jsonb_typeof({path}) = 'array'"));
            exact = false;
        }

        self.clauses.push(parenthesize(alternatives));
        if exact {
            FieldPlan::Exact
        } else {
            FieldPlan::Partial
        }
    }

    fn in_clause(&mut self, field: &str, operand: &Value) -> FieldPlan {
        let Some(values) = operand.as_array() else {
            return FieldPlan::Residual;
        };
        if values.is_empty() {
            return FieldPlan::Residual;
        }

        // Collect every spelling before binding anything, so a single
        // unpushable alternative leaves no orphan parameters behind.
        let mut spellings = Vec::with_capacity(values.len());
        let mut widened = false;
        for value in values {
            match value {
                Value::Double(_) | Value::Int32(_) | Value::Int64(_) | Value::Decimal128(_) => {
                    let Some(numeric) = numeric_spellings(value) else {
                        return FieldPlan::Residual;
                    };
                    widened = true;
                    spellings.extend(numeric);
                }
                Value::String(_)
                | Value::Bool(_)
                | Value::DateTime(_)
                | Value::ObjectId(_)
                | Value::Binary(_)
                | Value::Timestamp(_) => spellings.push(pgjson::value_to_json(value)),
                _ => return FieldPlan::Residual,
            }
        }

        let path = field_access(field);
        let mut alternatives: Vec<String> = spellings
            .into_iter()
            .map(|spelling| {
                let placeholder = self.bind(spelling);
                format!("{path} = {placeholder}")
            })
            .collect();
        if widened {
            alternatives.push(format!(
                "(jsonb_typeof({path}) = 'object' AND {path} ? '$numberDecimal')"
            ));
        }
        if field != "_id" {
            alternatives.push(format!("jsonb_typeof({path}) = 'array'"));
        }

        self.clauses.push(parenthesize(alternatives));
        FieldPlan::Partial
    }

    fn exists_clause(&mut self, field: &str, operand: &Value) -> FieldPlan {
        let Some(wanted) = operand.as_bool() else {
            return FieldPlan::Residual;
        };
        let key = quote_json_key(field);
        if wanted {
            self.clauses.push(format!("_jsonb ? {key}"));
        } else {
            self.clauses.push(format!("NOT (_jsonb ? {key})"));
        }
        // Top-level key presence is exactly $exists for a top-level path.
        FieldPlan::Exact
    }
}

fn combine(a: FieldPlan, b: FieldPlan) -> FieldPlan {
    match (a, b) {
        (FieldPlan::Exact, FieldPlan::Exact) => FieldPlan::Exact,
        (FieldPlan::Residual, FieldPlan::Residual) => FieldPlan::Residual,
        _ => FieldPlan::Partial,
    }
}

/// Tag spellings that can encode the operand's mathematical value.
/// None for non-integral decimals, whose spellings are not enumerable.
fn numeric_spellings(value: &Value) -> Option<Vec<serde_json::Value>> {
    let mut spellings = Vec::with_capacity(3);
    if let Some(i) = value.as_integer() {
        if i32::try_from(i).is_ok() {
            spellings.push(json!({ "$numberInt": i.to_string() }));
        }
        spellings.push(json!({ "$numberLong": i.to_string() }));
        // Doubles render integral values without a fraction.
        if i.unsigned_abs() < (1u64 << 53) {
            spellings.push(json!({ "$numberDouble": i.to_string() }));
        }
        return Some(spellings);
    }
    match value {
        Value::Double(d) if d.is_finite() => {
            spellings.push(json!({ "$numberDouble": format!("{d}") }));
            Some(spellings)
        }
        // Non-integral decimals and non-finite doubles stay in memory.
        _ => None,
    }
}

/// `_jsonb->'field'` with the key as a safely quoted SQL literal.
fn field_access(field: &str) -> String {
    format!("_jsonb->{}", quote_json_key(field))
}

fn quote_json_key(field: &str) -> String {
    format!("'{}'", field.replace('\'', "''"))
}

fn parenthesize(alternatives: Vec<String>) -> String {
    if alternatives.len() == 1 {
        alternatives.into_iter().next().unwrap()
    } else {
        format!("({})", alternatives.join(" OR "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mangrove_bson::{doc, ObjectId};

    #[test]
    fn test_empty_filter_is_complete() {
        let plan = build(&Document::new());
        assert!(plan.complete);
        assert!(plan.clauses.is_empty());
        assert_eq!(plan.where_sql(), "");
    }

    #[test]
    fn test_string_equality_pushes_with_array_escape() {
        let plan = build(&doc! { "name" => "ada" });
        assert_eq!(plan.clauses.len(), 1);
        assert!(plan.clauses[0].contains("_jsonb->'name' = $1::jsonb"));
        assert!(plan.clauses[0].contains("jsonb_typeof(_jsonb->'name') = 'array'"));
        assert_eq!(plan.params, vec![json!("ada")]);
        assert!(!plan.complete, "array escape requires residual filtering");
    }

    #[test]
    fn test_integer_equality_enumerates_spellings() {
        let plan = build(&doc! { "a" => 1 });
        let clause = &plan.clauses[0];
        assert!(clause.contains("$1::jsonb") && clause.contains("$3::jsonb"));
        assert_eq!(
            plan.params,
            vec![
                json!({ "$numberInt": "1" }),
                json!({ "$numberLong": "1" }),
                json!({ "$numberDouble": "1" }),
            ]
        );
        assert!(clause.contains("'$numberDecimal'"));
        assert!(!plan.complete);
    }

    #[test]
    fn test_id_equality_skips_array_escape() {
        let plan = build(&doc! { "_id" => Value::ObjectId(ObjectId::from_bytes([1; 12])) });
        assert_eq!(plan.clauses.len(), 1);
        assert!(!plan.clauses[0].contains("'array'"));
        assert!(plan.complete, "scalar _id equality is exact");
    }

    #[test]
    fn test_exists_is_exact() {
        let plan = build(&doc! { "a" => doc! { "$exists" => true } });
        assert_eq!(plan.clauses, vec!["_jsonb ? 'a'"]);
        assert!(plan.complete);

        let plan = build(&doc! { "a" => doc! { "$exists" => false } });
        assert_eq!(plan.clauses, vec!["NOT (_jsonb ? 'a')"]);
        assert!(plan.complete);
    }

    #[test]
    fn test_in_pushes_scalar_alternatives() {
        let plan = build(&doc! {
            "status" => doc! { "$in" => vec![Value::from("new"), Value::from("open")] }
        });
        assert_eq!(plan.params.len(), 2);
        assert!(plan.clauses[0].contains(" OR "));
        assert!(!plan.complete);
    }

    #[test]
    fn test_in_with_unpushable_element_is_residual() {
        let plan = build(&doc! {
            "a" => doc! { "$in" => vec![Value::from(1), Value::Null] }
        });
        assert!(plan.clauses.is_empty());
        assert!(!plan.complete);
    }

    #[test]
    fn test_range_operators_stay_residual() {
        for op in ["$gt", "$gte", "$lt", "$lte", "$ne", "$nin", "$type"] {
            let plan = build(&doc! { "a" => doc! { op => 5 } });
            assert!(plan.clauses.is_empty(), "{op} must not push");
            assert!(!plan.complete);
        }
    }

    #[test]
    fn test_null_and_regex_and_documents_stay_residual() {
        let plan = build(&doc! { "a" => Value::Null });
        assert!(plan.clauses.is_empty());

        let plan = build(&doc! {
            "a" => Value::Regex(mangrove_bson::Regex { pattern: "^x".into(), options: String::new() })
        });
        assert!(plan.clauses.is_empty());

        let plan = build(&doc! { "a" => doc! { "b" => 1 } });
        assert!(plan.clauses.is_empty());
    }

    #[test]
    fn test_logical_and_dotted_fields_stay_residual() {
        let plan = build(&doc! { "$or" => vec![Value::Document(doc! { "a" => 1 })] });
        assert!(plan.clauses.is_empty());
        assert!(!plan.complete);

        let plan = build(&doc! { "a.b" => 1 });
        assert!(plan.clauses.is_empty());
        assert!(!plan.complete);
    }

    #[test]
    fn test_mixed_filter_pushes_what_it_can() {
        // Scenario: {a: 1, b: {$regex: "^x"}} pushes a, leaves b.
        let plan = build(&doc! {
            "a" => 1,
            "b" => doc! { "$regex" => "^x" },
        });
        assert_eq!(plan.clauses.len(), 1);
        assert!(plan.clauses[0].contains("_jsonb->'a' = $1::jsonb"));
        assert!(!plan.complete);
    }

    #[test]
    fn test_key_quoting_escapes_single_quotes() {
        let plan = build(&doc! { "it's" => "x" });
        assert!(plan.clauses[0].contains("_jsonb->'it''s'"));
    }

    #[test]
    fn test_non_integral_double_keeps_double_spelling_only() {
        let plan = build(&doc! { "a" => 2.5 });
        assert_eq!(plan.params[0], json!({ "$numberDouble": "2.5" }));
        assert!(plan.clauses[0].contains("'$numberDecimal'"));
    }
}
