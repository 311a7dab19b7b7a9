use std::collections::HashMap;
use std::mem;

use log::debug;
use smallvec::SmallVec;

use crate::buckets::{RankBuckets, ScanList};
use crate::definitions::{DEFAULT_CHAR_LIMIT, N_ARGS_ON_STACK, N_POOLED_STATES};
use crate::entity::{Entity, EntityKind};
use crate::folerr;
use crate::formula::{Formula, VarTable};
use crate::functions::{default_functions, FunctionCompute};
use crate::names::PrefixIndex;
use crate::operators::{OperatorCompute, OperatorTable};
use crate::result::{FolErrorKind, FolResult};

/// Hook consulted before the scanner runs. Returning `Ok(Some(_))` replaces
/// the parse entirely.
pub type ParseOverride = Box<dyn Fn(&str) -> FolResult<Option<Formula>> + Send + Sync>;

/// Mutable per-scope scanner state. One instance per parenthesis nesting
/// level; finished instances are pooled and reused across parses.
#[derive(Debug)]
struct ScanState {
    in_order: ScanList,
    buckets: RankBuckets,
    current_value: Option<f64>,
    current_op: Option<char>,
    paren_op: char,
    negative: bool,
    has_decimal: bool,
    decimal_place: f64,
    started: bool,
    has_entity: bool,
    last_prio: u32,
    last_op: char,
    is_func: bool,
    func_matched: bool,
    func_name: String,
    pre_func_op: Option<char>,
    pre_func_prio: u32,
    pre_func_last_op: char,
    pre_func_has_entity: bool,
    pulled_committed: Option<(usize, Entity)>,
    func_args: SmallVec<[Entity; N_ARGS_ON_STACK]>,
    power_pending: Option<usize>,
}

impl ScanState {
    fn new(bucket_count: usize, default_op: char, between: char) -> Self {
        ScanState {
            in_order: ScanList::new(),
            buckets: RankBuckets::new(bucket_count),
            current_value: None,
            current_op: None,
            paren_op: between,
            negative: false,
            has_decimal: false,
            decimal_place: 0.1,
            started: false,
            has_entity: false,
            last_prio: 0,
            last_op: default_op,
            is_func: false,
            func_matched: false,
            func_name: String::new(),
            pre_func_op: None,
            pre_func_prio: 0,
            pre_func_last_op: default_op,
            pre_func_has_entity: false,
            pulled_committed: None,
            func_args: SmallVec::new(),
            power_pending: None,
        }
    }

    /// Captures the resolver bookkeeping a function-name rollback has to
    /// restore alongside the entity lists.
    fn snapshot_resolver(&mut self) {
        self.pre_func_prio = self.last_prio;
        self.pre_func_last_op = self.last_op;
        self.pre_func_has_entity = self.has_entity;
    }

    /// Forgets the operand and operator under construction.
    fn reset(&mut self) {
        self.current_value = None;
        self.current_op = None;
        self.negative = false;
        self.has_decimal = false;
        self.decimal_place = 0.1;
        self.started = false;
    }

    /// Additionally forgets the resolver bookkeeping, for reuse within the
    /// same scope after an argument boundary.
    fn full_reset(&mut self, default_op: char) {
        self.reset();
        self.has_entity = false;
        self.last_prio = 0;
        self.last_op = default_op;
        self.power_pending = None;
    }

    /// Restores the pristine state a pooled instance must have.
    fn final_reset(&mut self, default_op: char, between: char) {
        self.full_reset(default_op);
        self.in_order.clear();
        self.buckets.clear();
        self.paren_op = between;
        self.is_func = false;
        self.func_matched = false;
        self.func_name.clear();
        self.pre_func_op = None;
        self.pre_func_prio = 0;
        self.pre_func_last_op = default_op;
        self.pre_func_has_entity = false;
        self.pulled_committed = None;
        self.func_args.clear();
    }
}

/// The expression parser: configuration surface, operator and function
/// tables, and the single-pass scanner producing [`Formula`](Formula) values.
///
/// Parsing and configuration need `&mut self`; evaluation only reads, so the
/// borrow checker enforces that nobody reconfigures a parser mid-evaluation.
///
/// ```rust
/// # use folex::FolResult;
/// # fn main() -> FolResult<()> {
/// use folex::Parser;
/// let mut parser = Parser::new();
/// let mut formula = parser.parse("sqrt(2)*sqrt(2)")?;
/// let value = formula.in_operation_order(&parser)?;
/// assert!((value - 2.0).abs() < 1e-12);
/// # Ok(())
/// # }
/// ```
pub struct Parser {
    operators: OperatorTable,
    functions: HashMap<String, FunctionCompute>,
    prefixes: PrefixIndex,
    commas: Vec<bool>,
    delimiters: Vec<bool>,
    skip_whitespace: bool,
    default_operator: char,
    between_variables: char,
    default_fill_value: f64,
    pool: Vec<ScanState>,
    override_hook: Option<ParseOverride>,
}

impl Default for Parser {
    fn default() -> Self {
        Parser::new()
    }
}

impl Parser {
    /// A parser with the default operators, the default function catalog,
    /// `.` as decimal separator and `,` as argument delimiter.
    pub fn new() -> Self {
        let operators = OperatorTable::default();
        let functions = default_functions();
        let mut prefixes = PrefixIndex::new();
        for name in functions.keys() {
            prefixes.add(name);
        }
        let mut parser = Parser {
            operators,
            functions,
            prefixes,
            commas: vec![false; DEFAULT_CHAR_LIMIT],
            delimiters: vec![false; DEFAULT_CHAR_LIMIT],
            skip_whitespace: true,
            default_operator: '+',
            between_variables: '*',
            default_fill_value: 0.0,
            pool: Vec::new(),
            override_hook: None,
        };
        parser.commas['.' as usize] = true;
        parser.delimiters[',' as usize] = true;
        parser
    }

    /// Restores the full default configuration, dropping every custom
    /// operator, function, comma, delimiter and the parse override.
    pub fn reset(&mut self) {
        *self = Parser::new();
    }

    // ---- configuration surface ----

    pub fn skip_whitespace(&self) -> bool {
        self.skip_whitespace
    }

    pub fn set_skip_whitespace(&mut self, skip: bool) {
        self.skip_whitespace = skip;
    }

    pub fn default_operator(&self) -> char {
        self.default_operator
    }

    /// Sets the operator assumed where none was written, e.g. before the
    /// first operand. Must be a registered operator.
    pub fn set_default_operator(&mut self, c: char) -> FolResult<()> {
        if !self.operators.is_operator(c) {
            return Err(folerr!(
                FolErrorKind::Config,
                "'{}' is not a registered operator",
                c
            ));
        }
        self.default_operator = c;
        Ok(())
    }

    pub fn between_variables(&self) -> char {
        self.between_variables
    }

    /// Sets the operator inserted between adjacent variable-like tokens,
    /// `*` by default. Must be a registered operator.
    pub fn set_between_variables(&mut self, c: char) -> FolResult<()> {
        if !self.operators.is_operator(c) {
            return Err(folerr!(
                FolErrorKind::Config,
                "'{}' is not a registered operator",
                c
            ));
        }
        self.between_variables = c;
        Ok(())
    }

    pub fn default_fill_value(&self) -> f64 {
        self.default_fill_value
    }

    /// Sets the value an operand gets when no digits were written for it.
    pub fn set_default_fill_value(&mut self, value: f64) {
        self.default_fill_value = value;
    }

    /// The number of character codes the parser accepts, default 128.
    pub fn char_limit(&self) -> usize {
        self.operators.char_limit()
    }

    /// Grows the accepted character space. Shrinking is a `Config` error.
    pub fn change_limit(&mut self, char_limit: usize) -> FolResult<()> {
        self.operators.change_limit(char_limit)?;
        self.commas.resize(char_limit, false);
        self.delimiters.resize(char_limit, false);
        Ok(())
    }

    pub fn parse_override(&self) -> Option<&ParseOverride> {
        self.override_hook.as_ref()
    }

    pub fn set_parse_override(&mut self, hook: Option<ParseOverride>) {
        self.override_hook = hook;
    }

    // ---- operators ----

    pub fn operators(&self) -> &OperatorTable {
        &self.operators
    }

    /// Registers a binary operator, returning the displaced implementation
    /// and its priority if `c` was already registered.
    ///
    /// # Errors
    ///
    /// A `Config` error if the character already serves as decimal separator,
    /// argument delimiter or parenthesis, or lies beyond the char limit.
    pub fn add_operator(
        &mut self,
        c: char,
        priority: u32,
        compute: OperatorCompute,
    ) -> FolResult<Option<(OperatorCompute, u32)>> {
        self.check_role_free(c, "an operator")?;
        let displaced = self.operators.add(c, priority, compute)?;
        debug!("registered operator '{}' with priority {}", c, priority);
        Ok(displaced)
    }

    pub fn remove_operator(&mut self, c: char) -> bool {
        self.operators.remove(c)
    }

    pub fn change_operator_priority(&mut self, c: char, priority: u32) -> FolResult<()> {
        self.operators.change_priority(c, priority)
    }

    pub fn is_operator(&self, c: char) -> bool {
        self.operators.is_operator(c)
    }

    // ---- commas and delimiters ----

    /// Registers a decimal-separator character. Returns whether it was new.
    pub fn add_comma(&mut self, c: char) -> FolResult<bool> {
        let idx = self.role_index(c)?;
        if self.operators.is_operator(c) || self.delimiters[idx] {
            return Err(folerr!(
                FolErrorKind::Config,
                "'{}' already has a conflicting role",
                c
            ));
        }
        let was = self.commas[idx];
        self.commas[idx] = true;
        Ok(!was)
    }

    pub fn remove_comma(&mut self, c: char) -> bool {
        let idx = c as usize;
        if idx >= self.commas.len() || !self.commas[idx] {
            return false;
        }
        self.commas[idx] = false;
        true
    }

    pub fn is_comma(&self, c: char) -> bool {
        let idx = c as usize;
        idx < self.commas.len() && self.commas[idx]
    }

    /// Registers an argument-delimiter character. Returns whether it was new.
    pub fn add_delimiter(&mut self, c: char) -> FolResult<bool> {
        let idx = self.role_index(c)?;
        if self.operators.is_operator(c) || self.commas[idx] {
            return Err(folerr!(
                FolErrorKind::Config,
                "'{}' already has a conflicting role",
                c
            ));
        }
        let was = self.delimiters[idx];
        self.delimiters[idx] = true;
        Ok(!was)
    }

    pub fn remove_delimiter(&mut self, c: char) -> bool {
        let idx = c as usize;
        if idx >= self.delimiters.len() || !self.delimiters[idx] {
            return false;
        }
        self.delimiters[idx] = false;
        true
    }

    pub fn is_delimiter(&self, c: char) -> bool {
        let idx = c as usize;
        idx < self.delimiters.len() && self.delimiters[idx]
    }

    fn role_index(&self, c: char) -> FolResult<usize> {
        let idx = c as usize;
        if idx >= self.char_limit() {
            return Err(folerr!(
                FolErrorKind::Config,
                "character '{}' is beyond the char limit {}",
                c,
                self.char_limit()
            ));
        }
        Ok(idx)
    }

    fn check_role_free(&self, c: char, wanted: &str) -> FolResult<()> {
        let idx = self.role_index(c)?;
        if self.commas[idx] || self.delimiters[idx] || c == '(' || c == ')' {
            return Err(folerr!(
                FolErrorKind::Config,
                "'{}' already has a conflicting role, cannot become {}",
                c,
                wanted
            ));
        }
        Ok(())
    }

    // ---- functions ----

    /// Registers a named function, returning the displaced implementation if
    /// the name was already taken.
    ///
    /// # Errors
    ///
    /// A `Config` error if the name is empty or contains a character that
    /// already serves as operator, separator, delimiter or parenthesis.
    pub fn add_function(
        &mut self,
        name: &str,
        compute: FunctionCompute,
    ) -> FolResult<Option<FunctionCompute>> {
        if name.is_empty() {
            return Err(folerr!(FolErrorKind::Config, "function name is empty"));
        }
        for c in name.chars() {
            self.role_index(c)?;
            if self.operators.is_operator(c)
                || self.is_comma(c)
                || self.is_delimiter(c)
                || c == '('
                || c == ')'
                || c.is_whitespace()
            {
                return Err(folerr!(
                    FolErrorKind::Config,
                    "function name '{}' contains reserved character '{}'",
                    name,
                    c
                ));
            }
        }
        let displaced = self.functions.insert(name.to_string(), compute);
        if displaced.is_none() {
            self.prefixes.add(name);
        }
        debug!("registered function '{}'", name);
        Ok(displaced)
    }

    /// Unregisters a function and prunes its prefixes, returning its
    /// implementation. Afterwards the name's letters scan as variables again.
    pub fn remove_function(&mut self, name: &str) -> Option<FunctionCompute> {
        let removed = self.functions.remove(name);
        if removed.is_some() {
            self.prefixes.remove(name);
        }
        removed
    }

    pub fn is_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionCompute> {
        self.functions.get(name)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    // ---- parsing ----

    /// Parses an expression into a reusable [`Formula`](Formula).
    ///
    /// # Errors
    ///
    /// A `Syntax` error for an unmatched `)`, a second decimal separator in
    /// one number, a delimiter outside a function call, an invalid operation
    /// symbol, a character beyond the char limit, or an empty expression.
    /// An unmatched `(` is not an error; all open scopes close implicitly at
    /// the end of the input.
    pub fn parse(&mut self, text: &str) -> FolResult<Formula> {
        match self.parse_formula(text, false)? {
            Some(formula) => Ok(formula),
            None => Err(folerr!(FolErrorKind::Syntax, "expression is empty")),
        }
    }

    /// Like [`parse`](Parser::parse), consulting the parse override first and
    /// mapping an empty input to `Ok(None)` when `accept_none` holds.
    pub fn parse_formula(&mut self, text: &str, accept_none: bool) -> FolResult<Option<Formula>> {
        if let Some(hook) = &self.override_hook {
            if let Some(formula) = hook(text)? {
                return Ok(Some(formula));
            }
        }
        let mut stack: Vec<ScanState> = Vec::new();
        let mut state = self.acquire_state();
        let mut candidate = String::new();
        let mut last: Option<char> = None;
        for c in text.chars() {
            if self.skip_whitespace && c.is_whitespace() {
                continue;
            }
            if let Err(e) = self.scan_char(&mut stack, &mut state, &mut candidate, last, c) {
                self.abandon(stack, state);
                return Err(e);
            }
            last = Some(c);
        }
        // implicit close of every scope left open
        while let Some(parent) = stack.pop() {
            if state.is_func {
                self.add_func_variable(&mut state)?;
            }
            self.merge_scope(&mut state, parent)?;
        }
        let mut formula = self.finish_scope(&mut state, self.default_operator)?;
        self.release_state(state);
        if formula.in_order.is_empty() {
            return if accept_none {
                Ok(None)
            } else {
                Err(folerr!(FolErrorKind::Syntax, "expression is empty"))
            };
        }
        let mut names = Vec::new();
        formula.collect_var_names(&mut names);
        if !names.is_empty() {
            formula.attach_vars(VarTable::from_names(names));
        }
        Ok(Some(formula))
    }

    fn scan_char(
        &mut self,
        stack: &mut Vec<ScanState>,
        state: &mut ScanState,
        candidate: &mut String,
        last: Option<char>,
        c: char,
    ) -> FolResult<()> {
        if (c as usize) >= self.char_limit() {
            return Err(folerr!(
                FolErrorKind::Syntax,
                "character '{}' is beyond the char limit {}",
                c,
                self.char_limit()
            ));
        }
        if c == '(' {
            return self.open_scope(stack, state, candidate, last);
        }
        if c == ')' {
            candidate.clear();
            return self.close_scope(stack, state);
        }
        let candidate_fresh = self.candidate_step(state, candidate, c);
        self.process_char(state, c, candidate_fresh)
    }

    fn abandon(&mut self, stack: Vec<ScanState>, state: ScanState) {
        for parent in stack {
            self.release_state(parent);
        }
        self.release_state(state);
    }

    /// Advances the function-name candidate by one character. Returns whether
    /// a new candidate started at this character.
    fn candidate_step(&mut self, state: &mut ScanState, candidate: &mut String, c: char) -> bool {
        let was_empty = candidate.is_empty();
        candidate.push(c);
        if self.prefixes.contains(candidate) {
            if was_empty {
                self.commit_scan(state);
                state.pre_func_op = Some(self.pre_func_op_for(state));
                state.snapshot_resolver();
            }
            return was_empty;
        }
        // the candidate died; its letters were real entities after all
        candidate.clear();
        self.commit_scan(state);
        candidate.push(c);
        if self.prefixes.contains(candidate) {
            state.pre_func_op = Some(self.pre_func_op_for(state));
            state.snapshot_resolver();
            return true;
        }
        candidate.clear();
        false
    }

    /// The operator a matched name attaches with: whatever was pending when
    /// its first character arrived. The sign parity of a pending negation is
    /// folded in here because scanning the name's letters resets it.
    fn pre_func_op_for(&self, state: &ScanState) -> char {
        if state.current_value.is_some() {
            // a literal is still open, the name multiplies into it
            self.between_variables
        } else if let Some(op) = state.current_op {
            if op == '-' && !state.negative {
                self.default_operator
            } else {
                op
            }
        } else if state.negative {
            '-'
        } else if !state.in_order.is_empty() {
            self.between_variables
        } else {
            self.default_operator
        }
    }

    fn open_scope(
        &mut self,
        stack: &mut Vec<ScanState>,
        state: &mut ScanState,
        candidate: &mut String,
        last: Option<char>,
    ) -> FolResult<()> {
        let operator;
        if self.functions.contains_key(candidate.as_str()) {
            // the tentative entities were the name's letters
            state.in_order.rollback();
            state.buckets.rollback_all();
            if let Some((rank, entity)) = state.pulled_committed.take() {
                // a tentative resolve had pulled this entity out of its
                // bucket; put it back where it was
                state.buckets.get_or_add(rank).push_committed(entity);
            }
            state.last_prio = state.pre_func_prio;
            state.last_op = state.pre_func_last_op;
            state.has_entity = state.pre_func_has_entity;
            state.power_pending = None;
            state.reset();
            state.func_matched = true;
            state.func_name = mem::take(candidate);
            operator = state.pre_func_op.take().unwrap_or(self.default_operator);
        } else {
            candidate.clear();
            // a pending literal multiplies into the scope: 2(3) is 2*(3)
            if state.current_value.is_some() {
                self.add_static(state, true);
            }
            self.commit_scan(state);
            let mut op = match last {
                Some(l) if l != '(' => self.between_variables,
                _ => self.default_operator,
            };
            if let Some(l) = last {
                if self.operators.is_operator(l) {
                    op = l;
                }
            }
            operator = op;
        }
        let func_scope = state.func_matched;
        let mut fresh = self.acquire_state();
        fresh.paren_op = operator;
        fresh.is_func = func_scope;
        stack.push(mem::replace(state, fresh));
        Ok(())
    }

    fn close_scope(&mut self, stack: &mut Vec<ScanState>, state: &mut ScanState) -> FolResult<()> {
        let parent = match stack.pop() {
            Some(parent) => parent,
            None => {
                return Err(folerr!(
                    FolErrorKind::Syntax,
                    "unbalanced closing parenthesis"
                ))
            }
        };
        if state.is_func {
            self.add_func_variable(state)?;
        }
        self.merge_scope(state, parent)
    }

    /// Merges the closed scope in `state` into its parent as a single entity
    /// and makes the parent current again.
    fn merge_scope(&mut self, state: &mut ScanState, mut parent: ScanState) -> FolResult<()> {
        let paren_op = state.paren_op;
        let entity = if parent.func_matched {
            // sign parity was already folded into the captured operator
            let id = mem::take(&mut parent.func_name);
            let args = mem::take(&mut state.func_args).into_vec();
            parent.func_matched = false;
            parent.pre_func_op = None;
            Entity::new(paren_op, EntityKind::Call { id, args })
        } else {
            // a minus in front of the scope cancels against a pending negation
            let op = if paren_op == '-' {
                if parent.negative {
                    '-'
                } else {
                    self.default_operator
                }
            } else {
                paren_op
            };
            let sub = self.finish_scope(state, op)?;
            Entity::new(op, EntityKind::Sub(Box::new(sub)))
        };
        self.pre_resolve(&mut parent, paren_op, entity, true);
        let finished = mem::replace(state, parent);
        self.release_state(finished);
        Ok(())
    }

    /// Closes the accumulated entities of a function-argument scope into one
    /// argument and prepares the scope for the next argument.
    fn add_func_variable(&mut self, state: &mut ScanState) -> FolResult<()> {
        let op = state.paren_op;
        let sub = self.finish_scope(state, op)?;
        state
            .func_args
            .push(Entity::new(op, EntityKind::Sub(Box::new(sub))));
        state.buckets.clear();
        state.full_reset(self.default_operator);
        Ok(())
    }

    /// Drains the scope's containers into a formula.
    fn finish_scope(&mut self, state: &mut ScanState, op: char) -> FolResult<Formula> {
        if state.current_value.is_some() || state.current_op.is_some() {
            self.add_static(state, true);
        }
        self.commit_scan(state);
        let lowest = state.buckets.take_lowest();
        let grouped = state.buckets.concat();
        let in_order = state.in_order.take_items();
        Ok(Formula::new(op, in_order, grouped, lowest))
    }

    fn commit_scan(&mut self, state: &mut ScanState) {
        state.in_order.commit();
        state.buckets.commit_all();
        state.pulled_committed = None;
        if let Some(rank) = state.power_pending.take() {
            self.group_power(state, rank);
        }
    }

    fn process_char(&mut self, state: &mut ScanState, c: char, candidate_fresh: bool) -> FolResult<()> {
        // between two entities only an operator, a delimiter, or an implicit
        // multiplication can follow
        if state.current_op.is_none() && state.current_value.is_none() && !state.in_order.is_empty()
        {
            if self.is_valid_var(c) {
                state.current_op = Some(self.between_variables);
            } else if self.is_delimiter(c) {
                if state.is_func {
                    return self.add_func_variable(state);
                }
                return Err(folerr!(
                    FolErrorKind::Syntax,
                    "argument delimiter '{}' outside a function call",
                    c
                ));
            } else if !self.operators.is_operator(c) {
                return Err(folerr!(
                    FolErrorKind::Syntax,
                    "invalid operation symbol '{}'",
                    c
                ));
            } else {
                state.current_op = Some(c);
                state.negative = c == '-';
                return Ok(());
            }
        }
        if state.current_value.is_none() {
            if c == '-' {
                state.negative = !state.negative;
                return Ok(());
            }
            state.current_value = Some(0.0);
        }
        if self.is_comma(c) {
            if state.has_decimal {
                return Err(folerr!(
                    FolErrorKind::Syntax,
                    "second decimal separator in one number"
                ));
            }
            state.has_decimal = true;
            return Ok(());
        }
        if self.is_delimiter(c) {
            if state.is_func {
                return self.add_func_variable(state);
            }
            return Err(folerr!(
                FolErrorKind::Syntax,
                "argument delimiter '{}' outside a function call",
                c
            ));
        }
        match c.to_digit(10) {
            Some(digit) => {
                let digit = f64::from(digit);
                state.started = true;
                let current = state.current_value.unwrap_or(0.0);
                if state.has_decimal {
                    state.current_value = Some(current + digit * state.decimal_place);
                    state.decimal_place *= 0.1;
                } else {
                    state.current_value = Some(current * 10.0 + digit);
                }
            }
            None => {
                if self.operators.is_operator(c) {
                    self.add_static(state, true);
                    state.current_op = Some(c);
                    state.negative = c == '-';
                } else {
                    let pending = state.current_value.unwrap_or(0.0);
                    if pending != 0.0 {
                        self.add_static(state, false);
                        if candidate_fresh {
                            // the literal predates the name candidate and
                            // must survive a later rollback
                            self.commit_scan(state);
                            state.snapshot_resolver();
                        }
                    }
                    self.add_variable(state, c);
                }
            }
        }
        Ok(())
    }

    fn is_valid_var(&self, c: char) -> bool {
        !self.operators.is_operator(c) && !self.is_comma(c) && !self.is_delimiter(c)
    }

    fn add_static(&mut self, state: &mut ScanState, reset: bool) {
        let operation = state.current_op.unwrap_or(self.default_operator);
        // an operand that never saw a digit takes the fill value
        let mut value = if state.started {
            state.current_value.unwrap_or(0.0)
        } else {
            self.default_fill_value
        };
        if state.negative {
            value = -value;
        }
        // subtraction carries as addition of the negated literal
        let op = if operation == '-' {
            self.default_operator
        } else {
            operation
        };
        let entity = Entity::num(value, op);
        self.pre_resolve(state, operation, entity, reset);
    }

    fn add_variable(&mut self, state: &mut ScanState, name: char) {
        let operand_open = state.current_value.map(|v| v != 0.0).unwrap_or(false);
        let operation = if operand_open {
            self.between_variables
        } else {
            state.current_op.unwrap_or(self.default_operator)
        };
        let op = if operation == '-' {
            self.default_operator
        } else {
            operation
        };
        let entity = Entity::var(name, op, state.negative);
        self.pre_resolve(state, operation, entity, true);
    }

    fn pre_resolve(&mut self, state: &mut ScanState, operation: char, entity: Entity, reset: bool) {
        if state.has_entity {
            self.resolve_addition(state, operation, entity.clone());
        } else {
            state.has_entity = true;
            state.last_prio = 0;
            state.last_op = operation;
            let rank = self.rank_for(0, state);
            state.buckets.get_or_add(rank).push(entity.clone());
        }
        state.in_order.push(entity);
        if reset {
            state.reset();
        }
    }

    /// Routes an entity into the rank bucket its preceding operator demands.
    fn resolve_addition(&mut self, state: &mut ScanState, operation: char, entity: Entity) {
        let prio = self.operators.priority(operation);
        if prio == state.last_prio {
            let rank = self.rank_for(prio, state);
            state.buckets.get_or_add(rank).push(entity);
            let chained_power = operation == '^' && state.last_op == '^';
            state.last_op = operation;
            if chained_power {
                if state.buckets.get_or_add(rank).has_uncommitted() {
                    // regrouping must not swallow entities a later rollback
                    // would have to restore; retry at the next commit
                    state.power_pending = Some(rank);
                } else {
                    self.group_power(state, rank);
                }
            }
        } else if prio < state.last_prio {
            state.last_prio = prio;
            state.last_op = operation;
            let rank = self.rank_for(prio, state);
            state.buckets.get_or_add(rank).push(entity);
        } else {
            // a higher-priority run starts; it takes the previous entity with
            // it, and whatever remains of the old run reattaches with the
            // operator that linked the departed entity
            let old_rank = self.rank_for(state.last_prio, state);
            let old_prio = state.last_prio;
            let old_op = state.last_op;
            let old_bucket = state.buckets.get_or_add(old_rank);
            let pulled_was_committed = !old_bucket.has_uncommitted();
            let pulled = old_bucket.pop_last();
            if !old_bucket.is_empty() && old_prio > 0 {
                if let Some(first) = old_bucket.first_mut() {
                    first.op = old_op;
                }
            }
            if pulled_was_committed {
                // the pull moved a committed entity; remember it so a
                // function-name rollback can restore its placement
                if let Some(pulled) = &pulled {
                    state.pulled_committed = Some((old_rank, pulled.clone()));
                }
            }
            state.last_prio = prio;
            state.last_op = operation;
            let rank = self.rank_for(prio, state);
            let bucket = state.buckets.get_or_add(rank);
            if let Some(pulled) = pulled {
                bucket.push(pulled);
            }
            bucket.push(entity);
        }
    }

    /// Wraps the newest two entities of a `^`-run into a nested formula so
    /// power chains evaluate right-associatively.
    fn group_power(&mut self, state: &mut ScanState, rank: usize) {
        let bucket = state.buckets.get_or_add(rank);
        if bucket.len() < 3 {
            return;
        }
        let exponent = bucket.pop_last();
        let base = bucket.pop_last();
        if let (Some(exponent), Some(base)) = (exponent, base) {
            let Entity { op: base_op, kind } = base;
            match kind {
                EntityKind::Sub(mut inner) => {
                    inner.power_wrap_last(exponent, '^');
                    bucket.push(Entity::new(base_op, EntityKind::Sub(inner)));
                }
                other => {
                    let base = Entity::new(base_op, other);
                    let sub = Formula::power_pair(base, exponent, '^');
                    bucket.push(Entity::new(base_op, EntityKind::Sub(Box::new(sub))));
                }
            }
        }
    }

    fn rank_for(&self, priority: u32, state: &ScanState) -> usize {
        self.operators
            .rank_of(priority)
            .unwrap_or_else(|| state.buckets.bucket_count() - 1)
    }

    // ---- state pool ----

    fn acquire_state(&mut self) -> ScanState {
        let bucket_count = self.operators.bucket_count();
        match self.pool.pop() {
            Some(mut state) => {
                if state.buckets.bucket_count() != bucket_count {
                    state.buckets = RankBuckets::new(bucket_count);
                }
                state
            }
            None => ScanState::new(bucket_count, self.default_operator, self.between_variables),
        }
    }

    fn release_state(&mut self, mut state: ScanState) {
        if self.pool.len() < N_POOLED_STATES {
            state.final_reset(self.default_operator, self.between_variables);
            self.pool.push(state);
        }
    }
}
