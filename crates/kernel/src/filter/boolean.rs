//! Boolean `where` trees.
//!
//! A client's `and`/`or` nesting becomes a [`BooleanNode`]. The tree is
//! generic over its leaf so the same shape carries parsed conditions,
//! resolved conditions and finally rendered condition strings.

use std::fmt;

use crate::error::FilterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BooleanOperator {
    And,
    Or,
}

impl BooleanOperator {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "and" => Some(BooleanOperator::And),
            "or" => Some(BooleanOperator::Or),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BooleanOperator::And => "and",
            BooleanOperator::Or => "or",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BooleanNode<L> {
    Leaf(L),
    Branch {
        lhs: Vec<BooleanNode<L>>,
        rhs: Vec<BooleanNode<L>>,
        operator: BooleanOperator,
    },
}

impl<L> BooleanNode<L> {
    /// Fold a child list into one branch: everything but the last child on
    /// the left, the last child on the right.
    pub fn fold(mut children: Vec<Self>, operator: BooleanOperator) -> Result<Self, FilterError> {
        let Some(last) = children.pop() else {
            return Err(FilterError::InvalidNesting(format!(
                "'{}' needs at least one condition",
                operator.as_str()
            )));
        };
        Ok(BooleanNode::Branch {
            lhs: children,
            rhs: vec![last],
            operator,
        })
    }

    /// A branch with no children; renders to nothing.
    pub fn empty() -> Self {
        BooleanNode::Branch {
            lhs: Vec::new(),
            rhs: Vec::new(),
            operator: BooleanOperator::Or,
        }
    }

    /// Replace every leaf with the subtree `f` produces for it.
    pub fn try_map<M, E, F>(self, f: &mut F) -> Result<BooleanNode<M>, E>
    where
        F: FnMut(L) -> Result<BooleanNode<M>, E>,
    {
        match self {
            BooleanNode::Leaf(leaf) => f(leaf),
            BooleanNode::Branch { lhs, rhs, operator } => Ok(BooleanNode::Branch {
                lhs: lhs
                    .into_iter()
                    .map(|child| child.try_map(f))
                    .collect::<Result<_, _>>()?,
                rhs: rhs
                    .into_iter()
                    .map(|child| child.try_map(f))
                    .collect::<Result<_, _>>()?,
                operator,
            }),
        }
    }

    /// Leaves in left-to-right order.
    pub fn leaves(&self) -> Vec<&L> {
        match self {
            BooleanNode::Leaf(leaf) => vec![leaf],
            BooleanNode::Branch { lhs, rhs, .. } => {
                lhs.iter().chain(rhs).flat_map(BooleanNode::leaves).collect()
            }
        }
    }
}

impl<L: fmt::Display> BooleanNode<L> {
    /// Render as a native condition. Each branch becomes `(a op b ...)`;
    /// branches without any condition render to `None` and are skipped by
    /// their parent.
    pub fn render(&self) -> Option<String> {
        match self {
            BooleanNode::Leaf(leaf) => Some(leaf.to_string()),
            BooleanNode::Branch { lhs, rhs, operator } => {
                let parts: Vec<String> = lhs.iter().chain(rhs).filter_map(Self::render).collect();
                if parts.is_empty() {
                    return None;
                }
                let joiner = format!(" {} ", operator.as_str());
                Some(format!("({})", parts.join(&joiner)))
            }
        }
    }
}

impl<L: fmt::Display> fmt::Display for BooleanNode<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render().unwrap_or_default())
    }
}
