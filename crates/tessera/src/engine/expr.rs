//! Parser for the textual term list.
//!
//! ```text
//! expr    := term ("," term)*
//! term    := inout? oper? body
//! inout   := "[in]" | "[out]" | "[inout]" | "[none]"
//! oper    := "?" | "!"
//! body    := "(" name "," name ")"
//!          | name ( "(" src ("," name)? ")" )?
//! src     := "$this" | "This" | flag ("|" flag)* | name
//! flag    := "self" | "up" | "parent" | "cascade"
//! name    := identifier ("." identifier)*
//! ```
//!
//! Names are resolved through a caller-supplied closure so the parser does
//! not depend on engine state. Columns in errors are 0-based byte offsets.

use super::EngineError;
use crate::entity::{Entity, Id, Pair};
use crate::term::{Access, Term, TermOper, TermSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tok<'s> {
    Ident(&'s str),
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Question,
    Bang,
    Pipe,
}

struct Lexer<'s> {
    src: &'s str,
    pos: usize,
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'$')
}

impl<'s> Lexer<'s> {
    fn skip_ws(&mut self) {
        let bytes = self.src.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    /// Next token and its column, or `None` at the end of input.
    fn peek(&mut self) -> Result<Option<(Tok<'s>, usize)>, EngineError> {
        self.skip_ws();
        let bytes = self.src.as_bytes();
        let Some(&b) = bytes.get(self.pos) else {
            return Ok(None);
        };
        let start = self.pos;
        let tok = match b {
            b'[' => Tok::LBracket,
            b']' => Tok::RBracket,
            b'(' => Tok::LParen,
            b')' => Tok::RParen,
            b',' => Tok::Comma,
            b'?' => Tok::Question,
            b'!' => Tok::Bang,
            b'|' => Tok::Pipe,
            b if is_ident_byte(b) => {
                let mut end = start;
                while end < bytes.len() && is_ident_byte(bytes[end]) {
                    end += 1;
                }
                Tok::Ident(&self.src[start..end])
            }
            _ => {
                return Err(parse_error(
                    self.src,
                    start,
                    format!("unexpected character '{}'", &self.src[start..].chars().next().unwrap_or('?')),
                ))
            }
        };
        Ok(Some((tok, start)))
    }

    fn bump(&mut self) -> Result<Option<(Tok<'s>, usize)>, EngineError> {
        let next = self.peek()?;
        if let Some((tok, start)) = next {
            self.pos = start
                + match tok {
                    Tok::Ident(s) => s.len(),
                    _ => 1,
                };
        }
        Ok(next)
    }

    fn expect(&mut self, want: Tok<'static>, what: &str) -> Result<usize, EngineError> {
        match self.bump()? {
            Some((tok, col)) if tok == want => Ok(col),
            Some((_, col)) => Err(parse_error(self.src, col, format!("expected {what}"))),
            None => Err(parse_error(self.src, self.src.len(), format!("expected {what}, found end of input"))),
        }
    }

    fn ident(&mut self, what: &str) -> Result<(&'s str, usize), EngineError> {
        match self.bump()? {
            Some((Tok::Ident(s), col)) => Ok((s, col)),
            Some((_, col)) => Err(parse_error(self.src, col, format!("expected {what}"))),
            None => Err(parse_error(self.src, self.src.len(), format!("expected {what}, found end of input"))),
        }
    }
}

fn parse_error(src: &str, column: usize, message: String) -> EngineError {
    EngineError::Parse {
        expr: src.to_owned(),
        column,
        message,
    }
}

const FLAGS: [&str; 4] = ["self", "up", "parent", "cascade"];

/// Parse `src` into terms, resolving entity paths with `resolve`.
pub fn parse<F>(src: &str, resolve: F) -> Result<Vec<Term>, EngineError>
where
    F: Fn(&str) -> Option<Entity>,
{
    let mut lx = Lexer { src, pos: 0 };
    let mut terms = Vec::new();
    if lx.peek()?.is_none() {
        return Ok(terms);
    }
    loop {
        terms.push(parse_term(&mut lx, &resolve)?);
        match lx.bump()? {
            None => return Ok(terms),
            Some((Tok::Comma, _)) => {}
            Some((_, col)) => return Err(parse_error(src, col, "expected ',' between terms".into())),
        }
    }
}

fn name<F>(lx: &mut Lexer<'_>, resolve: &F, what: &str) -> Result<Entity, EngineError>
where
    F: Fn(&str) -> Option<Entity>,
{
    let (path, column) = lx.ident(what)?;
    resolve(path).ok_or_else(|| EngineError::UnknownName {
        name: path.to_owned(),
        column,
    })
}

fn parse_term<F>(lx: &mut Lexer<'_>, resolve: &F) -> Result<Term, EngineError>
where
    F: Fn(&str) -> Option<Entity>,
{
    let mut access = Access::Default;
    if let Some((Tok::LBracket, _)) = lx.peek()? {
        lx.bump()?;
        let (word, col) = lx.ident("access modifier")?;
        access = match word {
            "in" => Access::In,
            "out" => Access::Out,
            "inout" => Access::InOut,
            "none" => Access::None,
            other => return Err(parse_error(lx.src, col, format!("unknown access modifier '{other}'"))),
        };
        lx.expect(Tok::RBracket, "']'")?;
    }

    let oper = match lx.peek()? {
        Some((Tok::Question, _)) => {
            lx.bump()?;
            TermOper::Optional
        }
        Some((Tok::Bang, _)) => {
            lx.bump()?;
            TermOper::Not
        }
        _ => TermOper::And,
    };

    // "(Rel, Target)"
    if let Some((Tok::LParen, _)) = lx.peek()? {
        lx.bump()?;
        let relation = name(lx, resolve, "relation")?;
        lx.expect(Tok::Comma, "','")?;
        let target = name(lx, resolve, "target")?;
        lx.expect(Tok::RParen, "')'")?;
        return Ok(Term {
            id: Id::Pair(Pair::new(relation, target)),
            oper,
            access,
            source: TermSource::This,
        });
    }

    let pred = name(lx, resolve, "component name")?;
    let mut id = Id::Entity(pred);
    let mut source = TermSource::This;

    if let Some((Tok::LParen, _)) = lx.peek()? {
        lx.bump()?;
        source = parse_source(lx, resolve)?;
        if let Some((Tok::Comma, _)) = lx.peek()? {
            lx.bump()?;
            let target = name(lx, resolve, "target")?;
            id = Id::Pair(Pair::new(pred, target));
        }
        lx.expect(Tok::RParen, "')'")?;
    }

    Ok(Term {
        id,
        oper,
        access,
        source,
    })
}

fn parse_source<F>(lx: &mut Lexer<'_>, resolve: &F) -> Result<TermSource, EngineError>
where
    F: Fn(&str) -> Option<Entity>,
{
    let (word, col) = lx.ident("source")?;
    if word == "$this" || word == "This" {
        return Ok(TermSource::This);
    }
    if !FLAGS.contains(&word) {
        return resolve(word)
            .map(TermSource::Entity)
            .ok_or_else(|| EngineError::UnknownName {
                name: word.to_owned(),
                column: col,
            });
    }

    let (mut include_self, mut up, mut cascade) = (false, false, false);
    let mut flag = word;
    let mut flag_col = col;
    loop {
        match flag {
            "self" => include_self = true,
            "up" | "parent" => up = true,
            "cascade" => {
                up = true;
                cascade = true;
            }
            other => return Err(parse_error(lx.src, flag_col, format!("unknown traversal flag '{other}'"))),
        }
        if let Some((Tok::Pipe, _)) = lx.peek()? {
            lx.bump()?;
            (flag, flag_col) = lx.ident("traversal flag")?;
        } else {
            break;
        }
    }

    Ok(if up {
        TermSource::Up {
            cascade,
            include_self,
        }
    } else {
        TermSource::This
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn names() -> HashMap<&'static str, Entity> {
        [
            ("Position", Entity::new(1, 0)),
            ("Velocity", Entity::new(2, 0)),
            ("Local", Entity::new(3, 0)),
            ("World", Entity::new(4, 0)),
            ("ChildOf", Entity::new(5, 0)),
            ("Sun.Earth", Entity::new(6, 0)),
        ]
        .into_iter()
        .collect()
    }

    fn parse_with(src: &str) -> Result<Vec<Term>, EngineError> {
        let n = names();
        parse(src, |s| n.get(s).copied())
    }

    #[test]
    fn plain_and_optional_terms() {
        let terms = parse_with("Position, ?Velocity").unwrap();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0].id, Id::Entity(Entity::new(1, 0)));
        assert_eq!(terms[0].oper, TermOper::And);
        assert_eq!(terms[1].oper, TermOper::Optional);
    }

    #[test]
    fn cascade_pair_with_access() {
        let terms =
            parse_with("[in](Position,Local), [out](Position,World), [in]?Position(parent|cascade,World)")
                .unwrap();
        assert_eq!(terms.len(), 3);
        let local = Id::Pair(Pair::new(Entity::new(1, 0), Entity::new(3, 0)));
        let world = Id::Pair(Pair::new(Entity::new(1, 0), Entity::new(4, 0)));
        assert_eq!(terms[0].id, local);
        assert_eq!(terms[0].access, Access::In);
        assert_eq!(terms[1].access, Access::Out);
        assert_eq!(terms[2].id, world);
        assert_eq!(terms[2].oper, TermOper::Optional);
        assert_eq!(
            terms[2].source,
            TermSource::Up {
                cascade: true,
                include_self: false
            }
        );
    }

    #[test]
    fn fixed_source_and_not() {
        let terms = parse_with("!Velocity, Position(Sun.Earth)").unwrap();
        assert_eq!(terms[0].oper, TermOper::Not);
        assert_eq!(terms[1].source, TermSource::Entity(Entity::new(6, 0)));
        let this = parse_with("Position($this)").unwrap();
        assert_eq!(this[0].source, TermSource::This);
    }

    #[test]
    fn unknown_name_reports_column() {
        let err = parse_with("Position, Mass").unwrap_err();
        assert_eq!(
            err,
            EngineError::UnknownName {
                name: "Mass".into(),
                column: 10
            }
        );
    }

    #[test]
    fn syntax_errors_report_column() {
        match parse_with("Position Velocity").unwrap_err() {
            EngineError::Parse { column, .. } => assert_eq!(column, 9),
            other => panic!("unexpected error {other:?}"),
        }
        match parse_with("[write]Position").unwrap_err() {
            EngineError::Parse { column, message, .. } => {
                assert_eq!(column, 1);
                assert!(message.contains("write"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(parse_with("(Position, Local"), Err(EngineError::Parse { .. })));
    }

    #[test]
    fn empty_expression_has_no_terms() {
        assert!(parse_with("   ").unwrap().is_empty());
    }
}
