//! Compilation of expression trees into flat operation sequences.
//!
//! Operands are emitted in postfix order. `And`/`Or` compile to a conditional
//! jump over their right operand, so a short-circuited right side is never
//! evaluated.

use crate::expr::{CompareOp, Expression};
use crate::like::LikePattern;
use relmap_core::Value;

/// One step of a compiled expression.
#[derive(Debug, Clone)]
pub(crate) enum Op {
    /// Push a constant.
    Push(Value),
    /// Push the value read from the evaluated subject.
    Property { path: String, db: bool },
    /// Pop right then left, push the comparison result.
    Compare(CompareOp),
    /// Pop high, low, value; push the range test result.
    Between { negated: bool },
    /// Pop list then value; push the membership result.
    In { negated: bool },
    /// Pop a value; push the match result.
    Like { pattern: LikePattern, negated: bool },
    /// Pop a value; push its negated truthiness.
    Not,
    /// Replace the top value with its truthiness.
    ToBool,
    /// Drop the top value.
    Pop,
    /// Coerce the top value to bool; jump to the index if it is false.
    JumpIfFalse(usize),
    /// Coerce the top value to bool; jump to the index if it is true.
    JumpIfTrue(usize),
}

/// A compiled step plus the sub-expression it came from.
#[derive(Debug, Clone)]
pub(crate) struct Step {
    pub op: Op,
    /// Index into [`CompiledExpression::sources`].
    pub source: usize,
}

/// An expression compiled into a flat, immutable operation sequence.
///
/// Evaluation never mutates the compiled form, so one instance can be shared
/// and evaluated concurrently.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    pub(crate) steps: Vec<Step>,
    /// Rendered text of each sub-expression that produced steps.
    pub(crate) sources: Vec<String>,
    expression: Expression,
}

impl CompiledExpression {
    /// Compile `expression`.
    pub fn compile(expression: &Expression) -> Self {
        let mut compiler = Compiler::default();
        compiler.emit(expression);
        tracing::trace!(
            steps = compiler.steps.len(),
            expression = %expression,
            "Compiled expression"
        );
        Self {
            steps: compiler.steps,
            sources: compiler.sources,
            expression: expression.clone(),
        }
    }

    /// The expression this was compiled from.
    pub fn expression(&self) -> &Expression {
        &self.expression
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl From<&Expression> for CompiledExpression {
    fn from(expression: &Expression) -> Self {
        Self::compile(expression)
    }
}

impl From<Expression> for CompiledExpression {
    fn from(expression: Expression) -> Self {
        Self::compile(&expression)
    }
}

#[derive(Default)]
struct Compiler {
    steps: Vec<Step>,
    sources: Vec<String>,
}

impl Compiler {
    fn source(&mut self, node: &Expression) -> usize {
        self.sources.push(node.to_string());
        self.sources.len() - 1
    }

    fn push(&mut self, op: Op, source: usize) -> usize {
        self.steps.push(Step { op, source });
        self.steps.len() - 1
    }

    fn emit(&mut self, node: &Expression) {
        match node {
            Expression::Literal(value) => {
                let source = self.source(node);
                self.push(Op::Push(value.clone()), source);
            }
            Expression::List(values) => {
                let source = self.source(node);
                self.push(Op::Push(Value::Array(values.clone())), source);
            }
            Expression::ObjPath(path) => {
                let source = self.source(node);
                self.push(
                    Op::Property {
                        path: path.clone(),
                        db: false,
                    },
                    source,
                );
            }
            Expression::DbPath(path) => {
                let source = self.source(node);
                self.push(
                    Op::Property {
                        path: path.clone(),
                        db: true,
                    },
                    source,
                );
            }
            Expression::Compare { op, left, right } => {
                self.emit(left);
                self.emit(right);
                let source = self.source(node);
                self.push(Op::Compare(*op), source);
            }
            Expression::Between {
                value,
                low,
                high,
                negated,
            } => {
                self.emit(value);
                self.emit(low);
                self.emit(high);
                let source = self.source(node);
                self.push(Op::Between { negated: *negated }, source);
            }
            Expression::In {
                value,
                list,
                negated,
            } => {
                self.emit(value);
                self.emit(list);
                let source = self.source(node);
                self.push(Op::In { negated: *negated }, source);
            }
            Expression::Like {
                value,
                pattern,
                negated,
            } => {
                self.emit(value);
                let source = self.source(node);
                self.push(
                    Op::Like {
                        pattern: pattern.clone(),
                        negated: *negated,
                    },
                    source,
                );
            }
            Expression::And(left, right) => self.emit_short_circuit(node, left, right, false),
            Expression::Or(left, right) => self.emit_short_circuit(node, left, right, true),
            Expression::Not(inner) => {
                self.emit(inner);
                let source = self.source(node);
                self.push(Op::Not, source);
            }
        }
    }

    /// `left; JumpIf*(end); Pop; right; ToBool; end:`
    fn emit_short_circuit(
        &mut self,
        node: &Expression,
        left: &Expression,
        right: &Expression,
        jump_when: bool,
    ) {
        self.emit(left);
        let source = self.source(node);
        let jump = if jump_when {
            self.push(Op::JumpIfTrue(0), source)
        } else {
            self.push(Op::JumpIfFalse(0), source)
        };
        self.push(Op::Pop, source);
        self.emit(right);
        self.push(Op::ToBool, source);
        let end = self.steps.len();
        self.steps[jump].op = if jump_when {
            Op::JumpIfTrue(end)
        } else {
            Op::JumpIfFalse(end)
        };
    }
}
