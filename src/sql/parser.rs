//! Recursive-descent parser for the query language.
//!
//! Grammar (optional tokens in brackets):
//!
//! ```text
//! statement := [SELECT] fields [FROM ident] [WHERE wherelist]
//!              [GROUP BY identlist] [ORDER BY identlist [ASC|DESC]]
//!              [LIMIT INT [, INT]] [;]
//! fields    := field ("," field)*
//! field     := STAR | IDENT | INT | STRING | function
//! function  := IDENT "(" field ("," field)* ")"
//! wherelist := wherexpr ( (AND|OR) wherexpr )*
//! wherexpr  := whereval OPERATOR whereval
//!            | whereval IN "(" item ("," item)* ")"
//!            | whereval BETWEEN whereval AND whereval
//!            | "(" wherelist ")"
//! whereval  := IDENT | INT | STRING
//! ```
//!
//! AND/OR are left-associative with equal precedence; parentheses override.

use crate::error::{Error, Result};
use crate::sql::ast::{
    Direction, Limit, Operand, OrderBy, Predicate, Projection, Statement,
};
use crate::sql::lexer::{Spanned, Token, syntax_error, tokenize};

/// Parse a query string into a `Statement`.
pub fn parse(query: &str) -> Result<Statement> {
    let tokens = tokenize(query)?;
    let mut parser = Parser {
        query,
        tokens,
        pos: 0,
    };
    parser.statement()
}

struct Parser<'a> {
    query: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.tok)
    }

    fn advance(&mut self) -> Option<&Spanned> {
        let spanned = self.tokens.get(self.pos);
        if spanned.is_some() {
            self.pos += 1;
        }
        spanned
    }

    /// Consume the next token if it equals `tok`.
    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// The query ran out of tokens mid-statement.
    fn incomplete(&self) -> Error {
        Error::IncompleteQuery(self.query.to_string())
    }

    /// The current token does not fit the grammar.
    fn unexpected(&self) -> Error {
        match self.tokens.get(self.pos) {
            Some(spanned) => syntax_error(self.query, spanned.pos, spanned.len),
            None => self.incomplete(),
        }
    }

    fn expect(&mut self, tok: &Token) -> Result<()> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn statement(&mut self) -> Result<Statement> {
        self.eat(&Token::Select);
        let fields = self.fields()?;

        let frm = if self.eat(&Token::From) {
            match self.advance() {
                Some(Spanned {
                    tok: Token::Ident(name),
                    ..
                }) => Some(name.clone()),
                Some(_) => {
                    self.pos -= 1;
                    return Err(self.unexpected());
                }
                None => return Err(self.incomplete()),
            }
        } else {
            None
        };

        let predicate = if self.eat(&Token::Where) {
            Some(self.wherelist()?)
        } else {
            None
        };

        let group_by = if self.eat(&Token::Group) {
            self.expect(&Token::By)?;
            Some(self.ident_list()?)
        } else {
            None
        };

        let order_by = if self.eat(&Token::Order) {
            self.expect(&Token::By)?;
            let fields = self.ident_list()?;
            let direction = if self.eat(&Token::Asc) {
                Direction::Asc
            } else if self.eat(&Token::Desc) {
                Direction::Desc
            } else {
                Direction::default()
            };
            Some(OrderBy { fields, direction })
        } else {
            None
        };

        let limit = if self.eat(&Token::Limit) {
            let first = self.integer()?;
            if self.eat(&Token::Comma) {
                let count = self.integer()?;
                Some(Limit {
                    offset: first,
                    count,
                })
            } else {
                Some(Limit {
                    offset: 0,
                    count: first,
                })
            }
        } else {
            None
        };

        self.eat(&Token::Semi);
        if self.peek().is_some() {
            return Err(self.unexpected());
        }

        Ok(Statement {
            fields,
            frm,
            predicate,
            group_by,
            order_by,
            limit,
        })
    }

    fn integer(&mut self) -> Result<usize> {
        match self.advance() {
            Some(Spanned {
                tok: Token::Int(i), ..
            }) => Ok(*i as usize),
            Some(_) => {
                self.pos -= 1;
                Err(self.unexpected())
            }
            None => Err(self.incomplete()),
        }
    }

    fn fields(&mut self) -> Result<Vec<Projection>> {
        let mut fields = vec![self.field()?];
        while self.eat(&Token::Comma) {
            fields.push(self.field()?);
        }
        Ok(fields)
    }

    fn field(&mut self) -> Result<Projection> {
        let spanned = self.tokens.get(self.pos).ok_or_else(|| self.incomplete())?;
        match &spanned.tok {
            Token::Star => {
                self.pos += 1;
                Ok(Projection::Star)
            }
            Token::Int(i) => {
                let i = *i;
                self.pos += 1;
                Ok(Projection::Int(i))
            }
            Token::Str(s) => {
                let s = s.clone();
                self.pos += 1;
                Ok(Projection::Str(s))
            }
            tok => {
                let name = tok.as_name().ok_or_else(|| self.unexpected())?.to_string();
                self.pos += 1;
                if self.eat(&Token::LParen) {
                    let mut args = vec![self.field()?];
                    while self.eat(&Token::Comma) {
                        args.push(self.field()?);
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Projection::Call { name, args })
                } else {
                    Ok(Projection::Field(name))
                }
            }
        }
    }

    fn ident_list(&mut self) -> Result<Vec<String>> {
        let mut names = vec![self.identifier()?];
        while self.eat(&Token::Comma) {
            names.push(self.identifier()?);
        }
        Ok(names)
    }

    fn identifier(&mut self) -> Result<String> {
        match self.advance() {
            Some(Spanned {
                tok: Token::Ident(name),
                ..
            }) => Ok(name.clone()),
            Some(_) => {
                self.pos -= 1;
                Err(self.unexpected())
            }
            None => Err(self.incomplete()),
        }
    }

    fn wherelist(&mut self) -> Result<Predicate> {
        let mut expr = self.wherexpr()?;
        loop {
            if self.eat(&Token::And) {
                let rhs = self.wherexpr()?;
                expr = Predicate::And(Box::new(expr), Box::new(rhs));
            } else if self.eat(&Token::Or) {
                let rhs = self.wherexpr()?;
                expr = Predicate::Or(Box::new(expr), Box::new(rhs));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn wherexpr(&mut self) -> Result<Predicate> {
        if self.eat(&Token::LParen) {
            let inner = self.wherelist()?;
            self.expect(&Token::RParen)?;
            return Ok(inner);
        }
        let val = self.operand()?;
        match self.peek() {
            Some(Token::Op(_)) => {
                let op = match self.advance() {
                    Some(Spanned {
                        tok: Token::Op(op), ..
                    }) => *op,
                    _ => unreachable!(),
                };
                let rhs = self.operand()?;
                Ok(Predicate::Compare { lhs: val, op, rhs })
            }
            Some(Token::In) => {
                self.pos += 1;
                self.expect(&Token::LParen)?;
                let mut items = vec![self.operand()?];
                while self.eat(&Token::Comma) {
                    items.push(self.operand()?);
                }
                self.expect(&Token::RParen)?;
                Ok(Predicate::In { val, items })
            }
            Some(Token::Between) => {
                self.pos += 1;
                let lo = self.operand()?;
                self.expect(&Token::And)?;
                let hi = self.operand()?;
                Ok(Predicate::Between { val, lo, hi })
            }
            Some(_) => Err(self.unexpected()),
            None => Err(self.incomplete()),
        }
    }

    fn operand(&mut self) -> Result<Operand> {
        match self.advance() {
            Some(Spanned {
                tok: Token::Ident(name),
                ..
            }) => Ok(Operand::Field(name.clone())),
            Some(Spanned {
                tok: Token::Int(i), ..
            }) => Ok(Operand::Int(*i)),
            Some(Spanned {
                tok: Token::Str(s), ..
            }) => Ok(Operand::Str(s.clone())),
            Some(_) => {
                self.pos -= 1;
                Err(self.unexpected())
            }
            None => Err(self.incomplete()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::CmpOp;

    #[test]
    fn test_minimal_statement() {
        let stmt = parse("select *;").unwrap();
        assert_eq!(stmt.fields, vec![Projection::Star]);
        assert!(stmt.frm.is_none());
        assert!(stmt.predicate.is_none());
    }

    #[test]
    fn test_select_and_semicolon_optional() {
        assert_eq!(parse("*").unwrap(), parse("select *;").unwrap());
    }

    #[test]
    fn test_from_is_parsed_but_kept_inert() {
        let stmt = parse("select remote_host from log").unwrap();
        assert_eq!(stmt.frm.as_deref(), Some("log"));
        assert_eq!(stmt.fields, vec![Projection::Field("remote_host".into())]);
    }

    #[test]
    fn test_function_call_with_star() {
        let stmt = parse("select count(*)").unwrap();
        assert_eq!(
            stmt.fields,
            vec![Projection::Call {
                name: "count".into(),
                args: vec![Projection::Star],
            }]
        );
        assert_eq!(stmt.fields[0].column_name(), "count(*)");
    }

    #[test]
    fn test_unknown_function_name_is_deferred() {
        let stmt = parse("select median(body_size)").unwrap();
        assert_eq!(
            stmt.fields,
            vec![Projection::Call {
                name: "median".into(),
                args: vec![Projection::Field("body_size".into())],
            }]
        );
    }

    #[test]
    fn test_where_compare() {
        let stmt = parse("select * where status_code = 200").unwrap();
        assert_eq!(
            stmt.predicate,
            Some(Predicate::Compare {
                lhs: Operand::Field("status_code".into()),
                op: CmpOp::Eq,
                rhs: Operand::Int(200),
            })
        );
    }

    #[test]
    fn test_where_and_or_left_associative() {
        let stmt = parse("select * where a = 1 or b = 2 and c = 3").unwrap();
        // ((a = 1 or b = 2) and c = 3)
        match stmt.predicate.unwrap() {
            Predicate::And(lhs, _) => match *lhs {
                Predicate::Or(_, _) => {}
                other => panic!("expected Or on the left, got {:?}", other),
            },
            other => panic!("expected And at the root, got {:?}", other),
        }
    }

    #[test]
    fn test_parens_override_precedence() {
        let stmt = parse("select * where a = 1 or (b = 2 and c = 3)").unwrap();
        match stmt.predicate.unwrap() {
            Predicate::Or(_, rhs) => match *rhs {
                Predicate::And(_, _) => {}
                other => panic!("expected And on the right, got {:?}", other),
            },
            other => panic!("expected Or at the root, got {:?}", other),
        }
    }

    #[test]
    fn test_between() {
        let stmt = parse("select * where body_size between 20 and 3000").unwrap();
        assert_eq!(
            stmt.predicate,
            Some(Predicate::Between {
                val: Operand::Field("body_size".into()),
                lo: Operand::Int(20),
                hi: Operand::Int(3000),
            })
        );
    }

    #[test]
    fn test_between_chained_with_and() {
        let stmt = parse("select * where body_size between 1 and 10 and status_code = 200").unwrap();
        match stmt.predicate.unwrap() {
            Predicate::And(lhs, _) => match *lhs {
                Predicate::Between { .. } => {}
                other => panic!("expected Between on the left, got {:?}", other),
            },
            other => panic!("expected And at the root, got {:?}", other),
        }
    }

    #[test]
    fn test_in_list() {
        let stmt = parse("select * where status_code in (200, 304, '404')").unwrap();
        assert_eq!(
            stmt.predicate,
            Some(Predicate::In {
                val: Operand::Field("status_code".into()),
                items: vec![
                    Operand::Int(200),
                    Operand::Int(304),
                    Operand::Str("404".into()),
                ],
            })
        );
    }

    #[test]
    fn test_group_order_limit() {
        let stmt =
            parse("select status_code, count(*) group by status_code order by status_code desc limit 5")
                .unwrap();
        assert_eq!(stmt.group_by, Some(vec!["status_code".into()]));
        assert_eq!(
            stmt.order_by,
            Some(OrderBy {
                fields: vec!["status_code".into()],
                direction: Direction::Desc,
            })
        );
        assert_eq!(
            stmt.limit,
            Some(Limit {
                offset: 0,
                count: 5
            })
        );
    }

    #[test]
    fn test_order_defaults_to_asc() {
        let stmt = parse("select * order by body_size").unwrap();
        assert_eq!(stmt.order_by.unwrap().direction, Direction::Asc);
    }

    #[test]
    fn test_limit_offset_count() {
        let stmt = parse("select * limit 10, 20").unwrap();
        assert_eq!(
            stmt.limit,
            Some(Limit {
                offset: 10,
                count: 20
            })
        );
    }

    #[test]
    fn test_truncated_query_surfaces_text() {
        let err = parse("select * where").unwrap_err();
        match err {
            Error::IncompleteQuery(q) => assert_eq!(q, "select * where"),
            other => panic!("expected IncompleteQuery, got {:?}", other),
        }
    }

    #[test]
    fn test_shape_error_has_caret() {
        let err = parse("select * where = 200").unwrap_err();
        match err {
            Error::Syntax(msg) => assert!(msg.contains('^'), "got: {}", msg),
            other => panic!("expected Syntax, got {:?}", other),
        }
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(parse("select * limit 5 bogus").is_err());
    }
}
