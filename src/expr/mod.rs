use evalexpr::{ContextWithMutableVariables, HashMapContext, Node, Value};
use tracing::{debug, error};

use crate::record::{Record, Token};

/// Environment binding prefix for the current record.
const RESULT_IDENT: &str = "result";
/// Environment binding prefix for the previous record.
const PREV_RESULT_IDENT: &str = "prevResult";

/// A compiled chain of scalar expressions applied to each record before it
/// is stored.
///
/// Expressions run left-to-right, each consuming the previous one's output.
/// Every stage keeps the record it saw on the previous tick and exposes it
/// as `prevResult`; on the first tick `prevResult` is an empty mapping. A
/// stage that fails to compile or evaluate passes its input through
/// unchanged.
pub struct ExprPipeline {
    stages: Vec<Stage>,
}

struct Stage {
    source: String,
    compiled: Option<Node>,
    prev: Record,
}

impl ExprPipeline {
    /// Compiles each expression. Compile failures are logged here once; the
    /// failed stage becomes a pass-through.
    pub fn new(expressions: &[String]) -> Self {
        let stages = expressions
            .iter()
            .map(|source| {
                let compiled = match evalexpr::build_operator_tree(source) {
                    Ok(node) => Some(node),
                    Err(e) => {
                        error!(expression = %source, error = %e, "expression compile failed");
                        None
                    }
                };

                Stage {
                    source: source.clone(),
                    compiled,
                    prev: Record::empty(),
                }
            })
            .collect();

        Self { stages }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs the record through every stage, returning the final record.
    pub fn apply(&mut self, labels: &[String], record: Record) -> Record {
        let mut current = record;

        for stage in &mut self.stages {
            let output = stage.eval(labels, &current);
            stage.prev = std::mem::replace(&mut current, output);
        }

        current
    }
}

impl Stage {
    /// Evaluates one stage against its input, or returns the input
    /// unchanged on any error.
    fn eval(&self, labels: &[String], input: &Record) -> Record {
        let Some(node) = &self.compiled else {
            return input.clone();
        };

        let mut ctx = HashMapContext::new();
        bind_record(&mut ctx, RESULT_IDENT, labels, input);
        bind_record(&mut ctx, PREV_RESULT_IDENT, labels, &self.prev);

        match node.eval_with_context(&ctx) {
            Ok(value) => match scalar_to_token(value) {
                Some(token) => Record::new(token.to_string(), vec![token]),
                None => {
                    debug!(expression = %self.source, "expression produced a non-scalar");
                    input.clone()
                }
            },
            Err(e) => {
                debug!(expression = %self.source, error = %e, "expression evaluation failed");
                input.clone()
            }
        }
    }
}

/// Binds `<ident>.<label>` variables for each labelled token of a record.
/// An empty record binds nothing, leaving the mapping empty.
fn bind_record(ctx: &mut HashMapContext, ident: &str, labels: &[String], record: &Record) {
    for (label, token) in labels.iter().zip(record.tokens.iter()) {
        let value = match token {
            Token::Int(i) => Value::Int(*i),
            Token::Float(f) => Value::Float(*f),
            Token::Text(s) => Value::String(s.clone()),
        };

        // set_value only fails on type conflicts, impossible in a fresh map.
        let _ = ctx.set_value(format!("{ident}.{label}"), value);
    }
}

/// Converts an evaluation result into a single token. Booleans carry their
/// textual form; tuples and the empty value are not scalars.
fn scalar_to_token(value: Value) -> Option<Token> {
    match value {
        Value::Int(i) => Some(Token::Int(i)),
        Value::Float(f) => Some(Token::Float(f)),
        Value::Boolean(b) => Some(Token::Text(b.to_string())),
        Value::String(s) => Some(Token::Text(s)),
        Value::Tuple(_) | Value::Empty => None,
    }
}
