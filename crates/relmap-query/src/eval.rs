//! Stack-based in-memory evaluation of compiled expressions.

use crate::compile::{CompiledExpression, Op};
use crate::expr::CompareOp;
use relmap_core::schema::PathComponent;
use relmap_core::{DataRow, EntityDescriptor, Error, Result, Schema, Value};
use serde::Serialize;
use std::cmp::Ordering;

/// Reads property values from an arbitrary object by dot-separated path.
pub trait PropertyAccess {
    fn read_property(&self, path: &str) -> Result<Value>;
}

/// The object an expression is evaluated against.
///
/// Chosen once per evaluation so path reads dispatch on a closed set of
/// subject kinds.
#[derive(Clone, Copy)]
pub enum EvalSubject<'a> {
    /// Column-keyed snapshot: paths are looked up as keys.
    Row(&'a DataRow),
    /// Entity metadata: paths resolve to column or target entity names.
    Entity {
        schema: &'a Schema,
        entity: &'a EntityDescriptor,
    },
    /// Any other object exposing properties by path.
    Object(&'a dyn PropertyAccess),
}

impl<'a> EvalSubject<'a> {
    fn read(&self, path: &str, db: bool) -> Result<Value> {
        match self {
            // A missing key reads as NULL, like a map lookup.
            EvalSubject::Row(row) => Ok(row.get(path).cloned().unwrap_or(Value::Null)),
            EvalSubject::Entity { schema, entity } => {
                if db {
                    return entity
                        .attribute_for_column(path)
                        .map(|a| Value::Text(a.column.clone()))
                        .ok_or_else(|| Error::unknown_attribute(entity.name.clone(), path));
                }
                let components = schema.resolve_path(&entity.name, path)?;
                Ok(match components.last() {
                    Some(PathComponent::Attribute(a)) => Value::Text(a.column.clone()),
                    Some(PathComponent::Relationship(r)) => Value::Text(r.target_entity.clone()),
                    None => Value::Null,
                })
            }
            EvalSubject::Object(object) => {
                if db {
                    return Err(Error::Custom(format!(
                        "database path '{path}' cannot be read from an in-memory object"
                    )));
                }
                object.read_property(path)
            }
        }
    }
}

impl<'a> From<&'a DataRow> for EvalSubject<'a> {
    fn from(row: &'a DataRow) -> Self {
        EvalSubject::Row(row)
    }
}

impl<'a> From<&'a dyn PropertyAccess> for EvalSubject<'a> {
    fn from(object: &'a dyn PropertyAccess) -> Self {
        EvalSubject::Object(object)
    }
}

/// Path reads over serialized objects.
///
/// Each dot-separated segment selects an object member; a missing member is an
/// error.
impl PropertyAccess for serde_json::Value {
    fn read_property(&self, path: &str) -> Result<Value> {
        let mut current = self;
        for segment in path.split('.') {
            current = match current {
                serde_json::Value::Object(map) => map.get(segment),
                _ => None,
            }
            .ok_or_else(|| {
                Error::Custom(format!("Error reading property '{path}': no member '{segment}'"))
            })?;
        }
        Ok(Value::from(current.clone()))
    }
}

impl CompiledExpression {
    /// Evaluate against `subject`, returning the final stack value.
    ///
    /// Any failure is wrapped in an expression error naming the failing
    /// sub-expression.
    pub fn evaluate<'a>(&self, subject: impl Into<EvalSubject<'a>>) -> Result<Value> {
        let subject = subject.into();
        let mut stack: Vec<Value> = Vec::with_capacity(4);
        let mut pc = 0;

        while let Some(step) = self.steps.get(pc) {
            pc += 1;
            let outcome = match &step.op {
                Op::Push(value) => {
                    stack.push(value.clone());
                    Ok(())
                }
                Op::Property { path, db } => subject.read(path, *db).map(|v| stack.push(v)),
                Op::Compare(op) => pop2(&mut stack).and_then(|(left, right)| {
                    compare(*op, &left, &right).map(|b| stack.push(Value::Bool(b)))
                }),
                Op::Between { negated } => pop3(&mut stack).and_then(|(value, low, high)| {
                    between(&value, &low, &high)
                        .map(|b| stack.push(Value::Bool(b.is_some_and(|b| b != *negated))))
                }),
                Op::In { negated } => pop2(&mut stack).map(|(value, list)| {
                    let found = match &list {
                        Value::Array(items) => items.iter().any(|item| item.null_safe_eq(&value)),
                        scalar => scalar.null_safe_eq(&value),
                    };
                    stack.push(Value::Bool(found != *negated));
                }),
                Op::Like { pattern, negated } => pop1(&mut stack).map(|value| {
                    let matched = match &value {
                        Value::Null => false,
                        Value::Text(text) => pattern.is_match(text),
                        other => pattern.is_match(&other.to_string()),
                    };
                    stack.push(Value::Bool(!value.is_null() && matched != *negated));
                }),
                Op::Not => pop1(&mut stack).map(|v| stack.push(Value::Bool(!v.is_true()))),
                Op::ToBool => pop1(&mut stack).map(|v| stack.push(Value::Bool(v.is_true()))),
                Op::Pop => pop1(&mut stack).map(|_| ()),
                Op::JumpIfFalse(target) => pop1(&mut stack).map(|v| {
                    let truth = v.is_true();
                    stack.push(Value::Bool(truth));
                    if !truth {
                        pc = *target;
                    }
                }),
                Op::JumpIfTrue(target) => pop1(&mut stack).map(|v| {
                    let truth = v.is_true();
                    stack.push(Value::Bool(truth));
                    if truth {
                        pc = *target;
                    }
                }),
            };

            if let Err(cause) = outcome {
                let source = &self.sources[step.source];
                tracing::debug!(expression = %source, error = %cause, "Expression evaluation failed");
                return Err(wrap(source, cause));
            }
        }

        match (stack.pop(), stack.is_empty()) {
            (Some(result), true) => Ok(result),
            _ => Err(Error::expression(
                self.expression().to_string(),
                "Error evaluating expression: unbalanced stack",
                None,
            )),
        }
    }

    /// Evaluate as a boolean; NULL and non-boolean results are false.
    pub fn matches<'a>(&self, subject: impl Into<EvalSubject<'a>>) -> Result<bool> {
        self.evaluate(subject).map(|v| v.is_true())
    }

    /// Evaluate against any serializable value, reading paths from its JSON form.
    pub fn evaluate_serialized<T: Serialize + ?Sized>(&self, object: &T) -> Result<Value> {
        let json = serde_json::to_value(object).map_err(|e| {
            Error::expression(
                self.expression().to_string(),
                "Error evaluating expression",
                Some(Box::new(e)),
            )
        })?;
        self.evaluate(EvalSubject::Object(&json))
    }

    /// Keep the items for which the expression is true.
    ///
    /// Items whose evaluation fails are excluded and logged.
    pub fn filter<'i, T>(
        &self,
        items: &'i [T],
        subject: impl Fn(&'i T) -> EvalSubject<'i>,
    ) -> Vec<&'i T> {
        items
            .iter()
            .filter(|&item| match self.matches(subject(item)) {
                Ok(matched) => matched,
                Err(error) => {
                    tracing::warn!(error = %error, "Excluding object that failed qualifier evaluation");
                    false
                }
            })
            .collect()
    }
}

fn wrap(source: &str, cause: Error) -> Error {
    match cause {
        already @ Error::Expression(_) => already,
        other => Error::expression(source, "Error evaluating expression", Some(Box::new(other))),
    }
}

fn underflow() -> Error {
    Error::Custom("expression stack underflow".to_string())
}

fn pop1(stack: &mut Vec<Value>) -> Result<Value> {
    stack.pop().ok_or_else(underflow)
}

fn pop2(stack: &mut Vec<Value>) -> Result<(Value, Value)> {
    let second = pop1(stack)?;
    let first = pop1(stack)?;
    Ok((first, second))
}

fn pop3(stack: &mut Vec<Value>) -> Result<(Value, Value, Value)> {
    let third = pop1(stack)?;
    let (first, second) = pop2(stack)?;
    Ok((first, second, third))
}

fn ordering(left: &Value, right: &Value) -> Result<Option<Ordering>> {
    if left.is_null() || right.is_null() {
        return Ok(None);
    }
    left.compare(right).map(Some).ok_or_else(|| {
        Error::Custom(format!(
            "cannot compare {} with {}",
            left.type_name(),
            right.type_name()
        ))
    })
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool> {
    match op {
        CompareOp::Eq => Ok(left.null_safe_eq(right)),
        CompareOp::Ne => Ok(!left.null_safe_eq(right)),
        _ => Ok(match ordering(left, right)? {
            None => false,
            Some(order) => match op {
                CompareOp::Lt => order == Ordering::Less,
                CompareOp::Le => order != Ordering::Greater,
                CompareOp::Gt => order == Ordering::Greater,
                CompareOp::Ge => order != Ordering::Less,
                CompareOp::Eq | CompareOp::Ne => unreachable!("handled above"),
            },
        }),
    }
}

/// `None` when any operand is null; negation does not apply then.
fn between(value: &Value, low: &Value, high: &Value) -> Result<Option<bool>> {
    let (Some(lower), Some(upper)) = (ordering(value, low)?, ordering(value, high)?) else {
        return Ok(None);
    };
    Ok(Some(lower != Ordering::Less && upper != Ordering::Greater))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Expression;
    use relmap_core::AttributeInfo;
    use relmap_core::RelationshipInfo;
    use std::cell::Cell;

    /// Counts reads of "watched" and answers `true`.
    struct ReadCounter {
        reads: Cell<usize>,
    }

    impl PropertyAccess for ReadCounter {
        fn read_property(&self, path: &str) -> Result<Value> {
            match path {
                "watched" => {
                    self.reads.set(self.reads.get() + 1);
                    Ok(Value::Bool(true))
                }
                _ => Err(Error::Custom(format!("no property '{path}'"))),
            }
        }
    }

    fn counted_reads(expr: &Expression) -> (bool, usize) {
        let counter = ReadCounter {
            reads: Cell::new(0),
        };
        let compiled = CompiledExpression::compile(expr);
        let result = compiled.matches(EvalSubject::Object(&counter)).unwrap();
        (result, counter.reads.get())
    }

    #[test]
    fn and_false_skips_right() {
        let expr = Expression::literal(false).and(Expression::path("watched"));
        assert_eq!(counted_reads(&expr), (false, 0));
    }

    #[test]
    fn or_true_skips_right() {
        let expr = Expression::literal(true).or(Expression::path("watched"));
        assert_eq!(counted_reads(&expr), (true, 0));
    }

    #[test]
    fn and_true_evaluates_right_once() {
        let expr = Expression::literal(true).and(Expression::path("watched"));
        assert_eq!(counted_reads(&expr), (true, 1));
    }

    #[test]
    fn or_false_evaluates_right_once() {
        let expr = Expression::literal(false).or(Expression::path("watched"));
        assert_eq!(counted_reads(&expr), (true, 1));
    }

    #[test]
    fn null_comparisons_are_false() {
        let row = DataRow::new().with("A", Value::Null);
        let cases = [
            Expression::literal(Value::Null).lt(5),
            Expression::literal(5).gt(Value::Null),
            Expression::literal(Value::Null).between(1, 10),
            Expression::path("A").not_between(1, 10),
            Expression::literal(5).not_between(Value::Null, 10),
            Expression::path("A").ge(1),
        ];
        for expr in &cases {
            let compiled = CompiledExpression::compile(expr);
            assert!(!compiled.matches(&row).unwrap(), "{expr}");
        }
    }

    #[test]
    fn null_safe_equality() {
        let row = DataRow::new().with("A", Value::Null).with("B", 3);
        let eval = |e: Expression| CompiledExpression::compile(&e).matches(&row).unwrap();
        assert!(eval(Expression::path("A").eq(Value::Null)));
        assert!(!eval(Expression::path("A").eq(3)));
        assert!(eval(Expression::path("A").ne(3)));
        assert!(eval(Expression::path("B").eq(3i64)));
    }

    #[test]
    fn between_is_inclusive() {
        let eval = |v: i32| {
            let row = DataRow::new().with("P", v);
            CompiledExpression::compile(&Expression::path("P").between(1, 10))
                .matches(&row)
                .unwrap()
        };
        assert!(eval(1));
        assert!(eval(10));
        assert!(!eval(11));

        let outside = CompiledExpression::compile(&Expression::path("P").not_between(1, 10));
        assert!(outside.matches(&DataRow::new().with("P", 11)).unwrap());
        assert!(!outside.matches(&DataRow::new().with("P", 5)).unwrap());
    }

    #[test]
    fn in_uses_null_safe_equality() {
        let row = DataRow::new().with("A", Value::Null).with("B", 2);
        let within = CompiledExpression::compile(&Expression::path("A").in_list([Value::Null]));
        assert!(within.matches(&row).unwrap());

        let not_within = CompiledExpression::compile(&Expression::path("B").not_in_list([1, 3]));
        assert!(not_within.matches(&row).unwrap());
    }

    #[test]
    fn like_semantics() {
        let smith = DataRow::new().with("NAME", "Smith");
        let jones = DataRow::new().with("NAME", "Jones");
        let lower = DataRow::new().with("NAME", "smith");

        let like = CompiledExpression::compile(&Expression::path("NAME").like("S%").unwrap());
        assert!(like.matches(&smith).unwrap());
        assert!(!like.matches(&jones).unwrap());

        let not_like = CompiledExpression::compile(&Expression::path("NAME").not_like("S%").unwrap());
        assert!(!not_like.matches(&smith).unwrap());
        assert!(not_like.matches(&jones).unwrap());

        let ignore_case =
            CompiledExpression::compile(&Expression::path("NAME").like_ignore_case("S%").unwrap());
        assert!(ignore_case.matches(&lower).unwrap());
    }

    #[test]
    fn not_coerces_null_to_false() {
        let row = DataRow::new().with("FLAG", Value::Null);
        let compiled = CompiledExpression::compile(&Expression::path("FLAG").not());
        assert!(compiled.matches(&row).unwrap());
    }

    #[test]
    fn failures_are_wrapped_with_sub_expression() {
        let counter = ReadCounter {
            reads: Cell::new(0),
        };
        let compiled = CompiledExpression::compile(&Expression::path("missing").eq(1));
        let err = compiled.evaluate(EvalSubject::Object(&counter)).unwrap_err();
        let Error::Expression(e) = err else {
            panic!("expected expression error, got {err:?}");
        };
        assert_eq!(e.expression, "missing");
        assert!(e.source.is_some());
    }

    #[test]
    fn incomparable_types_error() {
        let row = DataRow::new().with("A", "text");
        let compiled = CompiledExpression::compile(&Expression::path("A").lt(3));
        let err = compiled.matches(&row).unwrap_err();
        assert!(matches!(&err, Error::Expression(e) if e.expression == "A < 3"));
    }

    #[test]
    fn serialized_objects_are_readable() {
        #[derive(Serialize)]
        struct Gallery {
            name: String,
            address: Address,
        }
        #[derive(Serialize)]
        struct Address {
            city: String,
        }

        let gallery = Gallery {
            name: "Louvre".into(),
            address: Address {
                city: "Paris".into(),
            },
        };
        let compiled = CompiledExpression::compile(
            &Expression::path("address.city")
                .eq("Paris")
                .and(Expression::path("name").like("L%").unwrap()),
        );
        assert_eq!(compiled.evaluate_serialized(&gallery).unwrap(), Value::Bool(true));
    }

    #[test]
    fn entity_subject_resolves_paths() {
        let schema = Schema::new()
            .with_entity(
                EntityDescriptor::new("Artist", "ARTIST")
                    .with_attribute(AttributeInfo::new("id", "ID").primary_key())
                    .with_attribute(AttributeInfo::new("name", "ARTIST_NAME")),
            )
            .with_entity(
                EntityDescriptor::new("Painting", "PAINTING")
                    .with_attribute(AttributeInfo::new("id", "ID").primary_key())
                    .with_relationship(
                        RelationshipInfo::many_to_one("artist", "Artist").join("ARTIST_ID", "ID"),
                    ),
            );
        let painting = schema.entity("Painting").unwrap();
        let subject = EvalSubject::Entity {
            schema: &schema,
            entity: painting,
        };
        let compiled = CompiledExpression::compile(&Expression::path("artist.name"));
        assert_eq!(
            compiled.evaluate(subject).unwrap(),
            Value::Text("ARTIST_NAME".into())
        );
    }

    #[test]
    fn filter_excludes_failures() {
        let rows = vec![
            DataRow::new().with("N", 1),
            DataRow::new().with("N", "x"),
            DataRow::new().with("N", 5),
        ];
        let compiled = CompiledExpression::compile(&Expression::path("N").gt(2));
        let kept = compiled.filter(&rows, EvalSubject::Row);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].get("N"), Some(&Value::Int(5)));
    }
}
