//! The static table mapping each token kind to its prefix/infix parse
//! functions and infix precedence (spec §4.3's Pratt table).

use crate::compiler::Compiler;
use crate::precedence::Precedence;
use crate::token::TokenKind;

pub type ParseFn<'src, 'heap> = fn(&mut Compiler<'src, 'heap>, bool);

pub struct ParseRule<'src, 'heap> {
    pub prefix: Option<ParseFn<'src, 'heap>>,
    pub infix: Option<ParseFn<'src, 'heap>>,
    pub precedence: Precedence,
}

macro_rules! rule {
    ($prefix:expr, $infix:expr, $prec:expr) => {
        ParseRule {
            prefix: $prefix,
            infix: $infix,
            precedence: $prec,
        }
    };
}

pub fn get_rule<'src, 'heap>(kind: TokenKind) -> ParseRule<'src, 'heap> {
    use Precedence as P;
    use TokenKind::*;
    match kind {
        LeftParen => rule!(Some(Compiler::grouping), Some(Compiler::call), P::Call),
        Dot => rule!(None, Some(Compiler::dot), P::Call),
        Minus => rule!(Some(Compiler::unary), Some(Compiler::binary), P::Term),
        Plus => rule!(None, Some(Compiler::binary), P::Term),
        Slash => rule!(None, Some(Compiler::binary), P::Factor),
        SlashSlash => rule!(None, Some(Compiler::binary), P::Factor),
        Star => rule!(None, Some(Compiler::binary), P::Factor),
        StarStar => rule!(None, Some(Compiler::binary), P::Pow),
        Bang => rule!(Some(Compiler::unary), None, P::None),
        BangEqual => rule!(None, Some(Compiler::binary), P::Equality),
        EqualEqual => rule!(None, Some(Compiler::binary), P::Equality),
        Greater => rule!(None, Some(Compiler::binary), P::Comparison),
        GreaterEqual => rule!(None, Some(Compiler::binary), P::Comparison),
        Less => rule!(None, Some(Compiler::binary), P::Comparison),
        LessEqual => rule!(None, Some(Compiler::binary), P::Comparison),
        Identifier => rule!(Some(Compiler::variable), None, P::None),
        String => rule!(Some(Compiler::string), None, P::None),
        Number => rule!(Some(Compiler::number), None, P::None),
        And => rule!(None, Some(Compiler::and_), P::And),
        Or => rule!(None, Some(Compiler::or_), P::Or),
        False => rule!(Some(Compiler::literal), None, P::None),
        True => rule!(Some(Compiler::literal), None, P::None),
        Nil => rule!(Some(Compiler::literal), None, P::None),
        This => rule!(Some(Compiler::this_), None, P::None),
        Super => rule!(Some(Compiler::super_), None, P::None),
        Fn => rule!(Some(Compiler::lambda), None, P::None),
        _ => rule!(None, None, P::None),
    }
}
