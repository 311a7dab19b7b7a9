use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;
use smallvec::SmallVec;

use crate::definitions::N_VARS_ON_STACK;
use crate::entity::{Entity, EntityKind};
use crate::folerr;
use crate::operators::OpFlags;
use crate::parser::Parser;
use crate::result::{FolErrorKind, FolResult};

/// The two evaluation strategies a [`Formula`](Formula) supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvalMode {
    /// Folds entities strictly left to right, ignoring operator priorities.
    Naive,
    /// Folds priority groups first, lowest-priority entities last.
    OperationOrder,
}

/// Variable bindings of a top-level formula. Names are single characters in
/// order of first occurrence; a value must be bound to every name before the
/// formula can be evaluated.
#[derive(Clone, Debug, Default)]
pub struct VarTable {
    names: SmallVec<[char; N_VARS_ON_STACK]>,
    values: SmallVec<[f64; N_VARS_ON_STACK]>,
    bound: SmallVec<[bool; N_VARS_ON_STACK]>,
    indices: HashMap<char, usize>,
}

impl VarTable {
    pub(crate) fn from_names(names: Vec<char>) -> Self {
        let mut table = VarTable::default();
        for (i, name) in names.into_iter().enumerate() {
            table.names.push(name);
            table.values.push(0.0);
            table.bound.push(false);
            table.indices.insert(name, i);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[char] {
        &self.names
    }

    pub fn index_of(&self, name: char) -> Option<usize> {
        self.indices.get(&name).copied()
    }

    pub(crate) fn values(&self) -> &[f64] {
        &self.values
    }

    pub(crate) fn set(&mut self, index: usize, value: f64) {
        self.values[index] = value;
        self.bound[index] = true;
    }

    fn first_unbound(&self) -> Option<char> {
        self.bound
            .iter()
            .position(|b| !b)
            .map(|i| self.names[i])
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct EvalCache {
    naive: Option<f64>,
    ordered: Option<f64>,
}

/// Everything entity evaluation needs to look at: the parser whose operator
/// and function tables apply, the bound variable values of the root formula,
/// and the strategy sub-formulas are folded with.
pub struct EvalContext<'a> {
    pub(crate) parser: &'a Parser,
    pub(crate) vars: &'a [f64],
    pub(crate) mode: EvalMode,
}

impl EvalContext<'_> {
    /// Resolves a single entity to its numeric value. Function implementations
    /// use this on their argument entities.
    pub fn entity_value(&self, entity: &Entity) -> FolResult<f64> {
        match entity.kind() {
            EntityKind::Num(v) => Ok(*v),
            EntityKind::Var {
                name,
                negated,
                index,
            } => {
                let value = self.vars.get(*index).copied().ok_or_else(|| {
                    folerr!(
                        FolErrorKind::State,
                        "no value bound for variable '{}'",
                        name
                    )
                })?;
                Ok(if *negated { -value } else { value })
            }
            EntityKind::Call { id, args } => match self.parser.function(id) {
                Some(compute) => compute(self, args),
                None => Err(folerr!(
                    FolErrorKind::State,
                    "function '{}' is not registered",
                    id
                )),
            },
            EntityKind::Sub(formula) => formula.eval(self),
        }
    }
}

fn next_flags(entity: &Entity, value: f64) -> OpFlags {
    let is_sub = entity.is_sub_formula();
    OpFlags {
        prev_was_formula: is_sub,
        prev_value_negative: value < 0.0,
        formula_minus: is_sub && entity.op() == '-',
    }
}

/// A parsed arithmetic expression. Holds its entities in scan order for
/// naive evaluation and pre-grouped by operator priority for evaluation in
/// operation order. The top-level formula additionally owns the variable
/// table and caches the last result of each mode.
///
/// ```rust
/// # use folex::FolResult;
/// # fn main() -> FolResult<()> {
/// folex::with_default_parser(|parser| {
///     let mut formula = parser.parse("2+3*a")?;
///     formula.set_variable('a', 4.0)?;
///     assert_eq!(formula.in_operation_order(parser)?, 14.0);
///     assert_eq!(formula.naive(parser)?, 20.0);
///     Ok(())
/// })
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Formula {
    pub(crate) op: char,
    pub(crate) in_order: Vec<Entity>,
    pub(crate) grouped: Vec<Entity>,
    pub(crate) lowest: Vec<Entity>,
    pub(crate) vars: Option<VarTable>,
    cache: EvalCache,
}

impl Formula {
    pub(crate) fn new(op: char, in_order: Vec<Entity>, grouped: Vec<Entity>, lowest: Vec<Entity>) -> Self {
        Formula {
            op,
            in_order,
            grouped,
            lowest,
            vars: None,
            cache: EvalCache::default(),
        }
    }

    pub(crate) fn power_pair(base: Entity, exponent: Entity, op: char) -> Self {
        let pair = vec![base, exponent];
        Formula::new(op, pair.clone(), pair, Vec::new())
    }

    /// Rewrites the deepest power chain so a freshly scanned exponent binds
    /// right-associatively, turning `a^b` plus `c` into `a^(b^c)`.
    pub(crate) fn power_wrap_last(&mut self, exponent: Entity, op: char) {
        let descend = matches!(
            self.grouped.last().map(Entity::kind),
            Some(EntityKind::Sub(_))
        );
        if descend {
            if let Some(Entity {
                kind: EntityKind::Sub(inner),
                ..
            }) = self.grouped.last_mut()
            {
                inner.power_wrap_last(exponent, op);
            }
        } else if let Some(base) = self.grouped.pop() {
            let base_op = base.op();
            let sub = Formula::power_pair(base, exponent, op);
            self.grouped
                .push(Entity::new(base_op, EntityKind::Sub(Box::new(sub))));
        }
        if let (Some(slot), Some(grouped_last)) = (self.in_order.last_mut(), self.grouped.last()) {
            *slot = grouped_last.clone();
        }
    }

    /// Collects variable names in order of first occurrence, descending into
    /// function arguments and sub-formulas.
    pub(crate) fn collect_var_names(&self, out: &mut Vec<char>) {
        collect_names(&self.in_order, out);
    }

    pub(crate) fn attach_vars(&mut self, vars: VarTable) {
        let indices: HashMap<char, usize> = vars
            .names()
            .iter()
            .enumerate()
            .map(|(i, &n)| (n, i))
            .collect();
        assign_indices(&mut self.in_order, &indices);
        assign_indices(&mut self.grouped, &indices);
        assign_indices(&mut self.lowest, &indices);
        self.vars = Some(vars);
    }

    /// The operator character binding this formula to its surrounding scope.
    pub fn op(&self) -> char {
        self.op
    }

    /// The names of this formula's variables in order of first occurrence.
    pub fn variables(&self) -> &[char] {
        self.vars.as_ref().map(|v| v.names()).unwrap_or(&[])
    }

    /// The variables that still need a value before evaluation can run.
    pub fn required_variables(&self) -> Vec<char> {
        match &self.vars {
            None => Vec::new(),
            Some(table) => table
                .names
                .iter()
                .zip(table.bound.iter())
                .filter(|(_, &bound)| !bound)
                .map(|(&name, _)| name)
                .collect(),
        }
    }

    /// The currently bound values in variable order. Unbound slots hold 0.0.
    pub fn variable_values(&self) -> &[f64] {
        self.vars.as_ref().map(|v| v.values()).unwrap_or(&[])
    }

    /// A debug join of the variable bindings, e.g. `a=1, b=?`.
    pub fn variables_string(&self) -> String {
        match &self.vars {
            None => String::new(),
            Some(table) => table
                .names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    if table.bound[i] {
                        format!("{}={}", name, table.values[i])
                    } else {
                        format!("{}=?", name)
                    }
                })
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    /// A copy of this formula with all bindings and caches cleared.
    pub fn clone_without_values(&self) -> Formula {
        let mut clone = self.clone();
        if let Some(table) = clone.vars.as_mut() {
            for i in 0..table.len() {
                table.values[i] = 0.0;
                table.bound[i] = false;
            }
        }
        clone.reset_cache();
        clone
    }

    /// Binds one variable by name. Any cached results are dropped.
    ///
    /// # Errors
    ///
    /// A [`FolErrorKind::State`](crate::FolErrorKind::State) error if the
    /// formula has no variable of this name.
    pub fn set_variable(&mut self, name: char, value: f64) -> FolResult<()> {
        let table = self.vars.as_mut().ok_or_else(|| {
            folerr!(FolErrorKind::State, "formula has no variables")
        })?;
        let index = table.index_of(name).ok_or_else(|| {
            folerr!(FolErrorKind::State, "formula has no variable '{}'", name)
        })?;
        table.set(index, value);
        self.reset_cache();
        Ok(())
    }

    /// Like [`set_variable`](Formula::set_variable), emitting a diagnostic
    /// message through the `log` facade.
    pub fn set_variable_logged(&mut self, name: char, value: f64) -> FolResult<()> {
        self.set_variable(name, value)?;
        debug!("bound variable '{}' to {}", name, value);
        Ok(())
    }

    /// Binds all variables at once, in order of first occurrence. Any cached
    /// results are dropped.
    ///
    /// # Errors
    ///
    /// A [`FolErrorKind::State`](crate::FolErrorKind::State) error if the
    /// number of values does not match the number of variables.
    pub fn set_variables(&mut self, values: &[f64]) -> FolResult<()> {
        let expected = self.variables().len();
        if values.len() != expected {
            return Err(folerr!(
                FolErrorKind::State,
                "expected {} variable values, got {}",
                expected,
                values.len()
            ));
        }
        if let Some(table) = self.vars.as_mut() {
            for (i, &value) in values.iter().enumerate() {
                table.set(i, value);
            }
        }
        self.reset_cache();
        Ok(())
    }

    /// Drops the cached results of both evaluation modes.
    pub fn reset_cache(&mut self) {
        self.cache = EvalCache::default();
    }

    /// The cached result of the last naive evaluation, if still valid.
    pub fn last_naive_cached(&self) -> Option<f64> {
        self.cache.naive
    }

    /// The cached result of the last evaluation in operation order, if still
    /// valid.
    pub fn last_ordered_cached(&self) -> Option<f64> {
        self.cache.ordered
    }

    fn bound_values(&self) -> FolResult<&[f64]> {
        match &self.vars {
            None => Ok(&[]),
            Some(table) => match table.first_unbound() {
                Some(name) => Err(folerr!(
                    FolErrorKind::State,
                    "no value bound for variable '{}'",
                    name
                )),
                None => Ok(table.values()),
            },
        }
    }

    /// Evaluates strictly left to right in scan order, ignoring operator
    /// priorities. The result is cached until a variable is rebound.
    ///
    /// # Errors
    ///
    /// A [`FolErrorKind::State`](crate::FolErrorKind::State) error if a
    /// variable has no bound value, or whatever error an operator or
    /// function implementation raises.
    pub fn naive(&mut self, parser: &Parser) -> FolResult<f64> {
        if let Some(cached) = self.cache.naive {
            return Ok(cached);
        }
        let result = {
            let ctx = EvalContext {
                parser,
                vars: self.bound_values()?,
                mode: EvalMode::Naive,
            };
            self.eval(&ctx)?
        };
        self.cache.naive = Some(result);
        Ok(result)
    }

    /// Binds all variables, then evaluates naively.
    pub fn naive_with(&mut self, parser: &Parser, values: &[f64]) -> FolResult<f64> {
        self.set_variables(values)?;
        self.naive(parser)
    }

    /// Evaluates respecting operator priorities. The result is cached until
    /// a variable is rebound.
    ///
    /// # Errors
    ///
    /// Same conditions as [`naive`](Formula::naive).
    pub fn in_operation_order(&mut self, parser: &Parser) -> FolResult<f64> {
        if let Some(cached) = self.cache.ordered {
            return Ok(cached);
        }
        let result = {
            let ctx = EvalContext {
                parser,
                vars: self.bound_values()?,
                mode: EvalMode::OperationOrder,
            };
            self.eval(&ctx)?
        };
        self.cache.ordered = Some(result);
        Ok(result)
    }

    /// Binds all variables, then evaluates in operation order.
    pub fn in_operation_order_with(&mut self, parser: &Parser, values: &[f64]) -> FolResult<f64> {
        self.set_variables(values)?;
        self.in_operation_order(parser)
    }

    /// Starts a naive evaluation on a background thread and returns
    /// immediately. The thread works on a detached clone, so later rebinding
    /// of this formula's variables does not affect the running evaluation.
    /// A valid cache short-circuits without spawning a thread.
    pub fn naive_async(&self, parser: &Arc<Parser>) -> EvalTask {
        match self.cache.naive {
            Some(cached) => EvalTask::done(cached),
            None => {
                let mut detached = self.clone();
                let parser = Arc::clone(parser);
                EvalTask::spawn(thread::spawn(move || detached.naive(&parser)))
            }
        }
    }

    /// Like [`naive_async`](Formula::naive_async), evaluating in operation
    /// order.
    pub fn in_operation_order_async(&self, parser: &Arc<Parser>) -> EvalTask {
        match self.cache.ordered {
            Some(cached) => EvalTask::done(cached),
            None => {
                let mut detached = self.clone();
                let parser = Arc::clone(parser);
                EvalTask::spawn(thread::spawn(move || detached.in_operation_order(&parser)))
            }
        }
    }

    fn eval(&self, ctx: &EvalContext) -> FolResult<f64> {
        match ctx.mode {
            EvalMode::Naive => self.fold(&self.in_order, 0.0, ctx),
            EvalMode::OperationOrder => self.eval_ordered(ctx),
        }
    }

    fn fold(&self, entities: &[Entity], start: f64, ctx: &EvalContext) -> FolResult<f64> {
        let mut result = start;
        let mut flags = OpFlags::default();
        for entity in entities {
            let value = ctx.entity_value(entity)?;
            result = ctx
                .parser
                .operators()
                .compute(entity.op(), result, value, flags)?;
            flags = next_flags(entity, value);
        }
        Ok(result)
    }

    fn eval_ordered(&self, ctx: &EvalContext) -> FolResult<f64> {
        let operators = ctx.parser.operators();
        let default_op = ctx.parser.default_operator();
        let mut extra: Vec<Entity> = Vec::new();
        if let Some((first, rest)) = self.grouped.split_first() {
            let mut running = ctx.entity_value(first)?;
            let mut flags = next_flags(first, running);
            for entity in rest {
                if operators.priority(entity.op()) == 0 {
                    // a new lowest-priority group starts; park the finished
                    // group and fold it in after all others
                    extra.push(Entity::num(running, default_op));
                    running = 0.0;
                }
                let value = ctx.entity_value(entity)?;
                running = operators.compute(entity.op(), running, value, flags)?;
                flags = next_flags(entity, value);
            }
            extra.push(Entity::num(running, default_op));
        }
        let result = self.fold(&self.lowest, 0.0, ctx)?;
        self.fold(&extra, result, ctx)
    }
}

fn collect_names(entities: &[Entity], out: &mut Vec<char>) {
    for entity in entities {
        match entity.kind() {
            EntityKind::Var { name, .. } => {
                if !out.contains(name) {
                    out.push(*name);
                }
            }
            EntityKind::Call { args, .. } => collect_names(args, out),
            EntityKind::Sub(formula) => formula.collect_var_names(out),
            EntityKind::Num(_) => {}
        }
    }
}

fn assign_indices(entities: &mut [Entity], indices: &HashMap<char, usize>) {
    for entity in entities {
        match &mut entity.kind {
            EntityKind::Var { name, index, .. } => {
                if let Some(&i) = indices.get(name) {
                    *index = i;
                }
            }
            EntityKind::Call { args, .. } => assign_indices(args, indices),
            EntityKind::Sub(formula) => {
                assign_indices(&mut formula.in_order, indices);
                assign_indices(&mut formula.grouped, indices);
                assign_indices(&mut formula.lowest, indices);
            }
            EntityKind::Num(_) => {}
        }
    }
}

enum TaskState {
    Running(JoinHandle<FolResult<f64>>),
    Done(f64),
}

/// Handle of an evaluation started with [`Formula::naive_async`](Formula::naive_async)
/// or [`Formula::in_operation_order_async`](Formula::in_operation_order_async).
pub struct EvalTask {
    state: TaskState,
}

impl EvalTask {
    fn done(value: f64) -> Self {
        EvalTask {
            state: TaskState::Done(value),
        }
    }

    fn spawn(handle: JoinHandle<FolResult<f64>>) -> Self {
        EvalTask {
            state: TaskState::Running(handle),
        }
    }

    /// Whether a background thread is computing the result. `false` means the
    /// task was answered from the formula's cache.
    pub fn is_fresh(&self) -> bool {
        matches!(self.state, TaskState::Running(_))
    }

    /// Blocks until the result is available.
    pub fn wait(self) -> FolResult<f64> {
        match self.state {
            TaskState::Done(value) => Ok(value),
            TaskState::Running(handle) => handle
                .join()
                .map_err(|_| folerr!(FolErrorKind::State, "evaluation thread panicked"))?,
        }
    }
}
