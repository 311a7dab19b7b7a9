//! Folex parses arithmetic expressions into reusable [`Formula`](Formula)
//! values and evaluates them under two semantics: strictly left to right
//! ("naive") and respecting operator priorities ("in operation order").
//! Operators, named functions, the decimal separator and the argument
//! delimiter are all runtime-extensible; variables are single characters
//! bound to `f64` values after parsing.
//!
//! ```rust
//! # fn main() -> folex::FolResult<()> {
//! folex::with_default_parser(|parser| {
//!     let mut formula = parser.parse("2+3*4")?;
//!     assert_eq!(formula.in_operation_order(parser)?, 14.0);
//!     assert_eq!(formula.naive(parser)?, 20.0);
//!     Ok(())
//! })
//! # }
//! ```
//!
//! ## Variables
//!
//! Every character that is not a digit, an operator, a separator or part of
//! a function name is a variable. Adjacent variable-like tokens multiply
//! implicitly, so `2ab` means `2*a*b`.
//!
//! ```rust
//! # fn main() -> folex::FolResult<()> {
//! use folex::Parser;
//! let mut parser = Parser::new();
//! let mut formula = parser.parse("2ab")?;
//! formula.set_variable('a', 3.0)?;
//! formula.set_variable('b', 3.0)?;
//! assert_eq!(formula.naive(&parser)?, 18.0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Extending the parser
//!
//! ```rust
//! # fn main() -> folex::FolResult<()> {
//! use folex::{Entity, EvalContext, Parser};
//! let mut parser = Parser::new();
//! parser.add_operator('~', 8, Box::new(|r, v, _| Ok(r.max(v))))?;
//! parser.add_function(
//!     "double",
//!     Box::new(|ctx: &EvalContext, args: &[Entity]| {
//!         let x = match args.first() {
//!             Some(arg) => ctx.entity_value(arg)?,
//!             None => 0.0,
//!         };
//!         Ok(2.0 * x)
//!     }),
//! )?;
//! let mut formula = parser.parse("double(2~5)")?;
//! assert_eq!(formula.in_operation_order(&parser)?, 10.0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Background evaluation
//!
//! ```rust
//! # fn main() -> folex::FolResult<()> {
//! use std::sync::Arc;
//! let mut parser = folex::Parser::new();
//! let formula = parser.parse("2^3^2")?;
//! let parser = Arc::new(parser);
//! let task = formula.in_operation_order_async(&parser);
//! assert!(task.is_fresh());
//! assert_eq!(task.wait()?, 512.0);
//! # Ok(())
//! # }
//! ```

use std::cell::RefCell;

mod buckets;
mod definitions;
mod entity;
mod formula;
mod functions;
mod names;
mod operators;
mod parser;
mod result;

pub use entity::{Entity, EntityKind};
pub use formula::{EvalContext, EvalMode, EvalTask, Formula, VarTable};
pub use functions::FunctionCompute;
pub use names::PrefixIndex;
pub use operators::{OpFlags, OperatorCompute, OperatorTable};
pub use parser::{ParseOverride, Parser};
pub use result::{FolError, FolErrorKind, FolResult};

thread_local! {
    static DEFAULT_PARSER: RefCell<Parser> = RefCell::new(Parser::new());
}

/// Runs `f` against this thread's shared default parser.
///
/// The default parser keeps its configuration between calls, so operators and
/// functions registered here stay available for later parses on the same
/// thread.
pub fn with_default_parser<R>(f: impl FnOnce(&mut Parser) -> R) -> R {
    DEFAULT_PARSER.with(|parser| f(&mut parser.borrow_mut()))
}

/// Parses `text` with this thread's default parser.
///
/// ```rust
/// # fn main() -> folex::FolResult<()> {
/// let mut formula = folex::parse("1+2+3")?;
/// let sum = folex::with_default_parser(|parser| formula.naive(parser))?;
/// assert_eq!(sum, 6.0);
/// # Ok(())
/// # }
/// ```
pub fn parse(text: &str) -> FolResult<Formula> {
    with_default_parser(|parser| parser.parse(text))
}
