use crate::conditions::{
    ast::{BinaryOp, Node, UnaryOp},
    eval::{evaluate, EmptyEnvironment},
    Value,
};

/// Folds constant sub-expressions and removes branches that can never be evaluated, so that
/// identifiers inside dead code are not reported as inputs of the condition.
///
/// Folding never changes the result of a successful evaluation. Sub-expressions that would fail
/// at runtime are left in place so the failure still surfaces during evaluation.
pub(crate) fn optimize(node: Node) -> Node {
    match node {
        Node::Array(items) => Node::Array(items.into_iter().map(optimize).collect()),
        Node::Call { name, args } => Node::Call {
            name,
            args: args.into_iter().map(optimize).collect(),
        },
        Node::Unary { op, operand } => {
            let operand = optimize(*operand);
            fold(Node::Unary {
                op,
                operand: Box::new(operand),
            })
        }
        Node::Binary { op, left, right } => {
            let left = optimize(*left);
            if op == BinaryOp::Coalesce && left == Node::Nil {
                return optimize(*right);
            }
            let decided = matches!(
                (op, &left),
                (BinaryOp::And, Node::Bool(false)) | (BinaryOp::Or, Node::Bool(true))
            ) || (op == BinaryOp::Coalesce && left.is_literal());
            if decided {
                return left;
            }
            let right = optimize(*right);
            fold(Node::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            })
        }
        Node::Conditional {
            condition,
            then,
            otherwise,
        } => match optimize(*condition) {
            Node::Bool(true) => optimize(*then),
            Node::Bool(false) => optimize(*otherwise),
            condition => Node::Conditional {
                condition: Box::new(condition),
                then: Box::new(optimize(*then)),
                otherwise: Box::new(optimize(*otherwise)),
            },
        },
        leaf => leaf,
    }
}

/// Replaces an operator over literal operands with its value.
fn fold(node: Node) -> Node {
    let foldable = match &node {
        Node::Unary { op, operand } => {
            operand.is_literal() && !(*op == UnaryOp::Neg && matches!(**operand, Node::Nil))
        }
        Node::Binary { left, right, .. } => left.is_literal() && right.is_literal(),
        _ => false,
    };
    if !foldable {
        return node;
    }

    match evaluate(&node, &EmptyEnvironment) {
        Ok(Value::Nil) => Node::Nil,
        Ok(Value::Bool(b)) => Node::Bool(b),
        Ok(Value::Int(i)) => Node::Int(i),
        Ok(Value::Float(f)) => Node::Float(f),
        Ok(Value::String(s)) => Node::Str(s),
        _ => node,
    }
}
