//! Typed query tree. Parser output contains only these variants plus
//! literals, never raw tokens.

use std::fmt;

/// One column description in a `select` list.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// `*`: every schema field in order.
    Star,
    Field(String),
    Int(i64),
    Str(String),
    Call { name: String, args: Vec<Projection> },
}

impl Projection {
    /// Output column name: the projection syntax verbatim.
    pub fn column_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Projection::Star => write!(f, "*"),
            Projection::Field(name) => write!(f, "{}", name),
            Projection::Int(i) => write!(f, "{}", i),
            Projection::Str(s) => write!(f, "'{}'", s),
            Projection::Call { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Comparison operators; all six are total over values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Gt => ">",
            CmpOp::Le => "<=",
            CmpOp::Ge => ">=",
        };
        write!(f, "{}", s)
    }
}

/// A predicate operand: a field reference or a literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(String),
    Int(i64),
    Str(String),
}

/// Predicate tree evaluated by the executor's interpreter.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Compare {
        lhs: Operand,
        op: CmpOp,
        rhs: Operand,
    },
    /// `lo <= val <= hi`.
    Between {
        val: Operand,
        lo: Operand,
        hi: Operand,
    },
    In {
        val: Operand,
        items: Vec<Operand>,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub fields: Vec<String>,
    pub direction: Direction,
}

/// `LIMIT count` or `LIMIT offset, count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub offset: usize,
    pub count: usize,
}

/// A parsed query, one per execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub fields: Vec<Projection>,
    /// Parsed but ignored; the dataset is implicit.
    pub frm: Option<String>,
    pub predicate: Option<Predicate>,
    pub group_by: Option<Vec<String>>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<Limit>,
}
