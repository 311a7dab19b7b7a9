use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};

use crate::definitions::DEFAULT_CHAR_LIMIT;
use crate::folerr;
use crate::result::{FolErrorKind, FolResult};

/// Context an operator receives about its left-hand operand. The default
/// power operator needs this to apply mathematical sign rules, since the
/// running result it is given has already lost the operand's original form.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpFlags {
    /// The previous operand was a parenthesized sub-formula.
    pub prev_was_formula: bool,
    /// The previous operand evaluated to a negative value.
    pub prev_value_negative: bool,
    /// The previous operand was a sub-formula preceded by a minus.
    pub formula_minus: bool,
}

/// Binary operator implementation. Receives the running result, the next
/// operand, and flags describing the left-hand side.
pub type OperatorCompute = Box<dyn Fn(f64, f64, OpFlags) -> FolResult<f64> + Send + Sync>;

/// Registered binary operators, indexed directly by character code. Each
/// operator carries a priority; distinct priorities are ranked descending so
/// the scanner can group same-priority runs into buckets.
pub struct OperatorTable {
    computes: Vec<Option<OperatorCompute>>,
    priorities: Vec<u32>,
    ranks: HashMap<u32, usize>,
    bucket_count: usize,
}

impl Debug for OperatorTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorTable")
            .field("operators", &self.operator_chars())
            .field("bucket_count", &self.bucket_count)
            .finish()
    }
}

fn pow_compute(result: f64, operand: f64, flags: OpFlags) -> FolResult<f64> {
    let base = result.abs();
    let mut sign = 1.0;
    if flags.prev_was_formula && flags.prev_value_negative {
        if operand != operand.floor() {
            return Err(folerr!(
                FolErrorKind::Domain,
                "cannot raise a negative value to the fractional power {}",
                operand
            ));
        }
        if (operand as i64) % 2 != 0 {
            sign = -sign;
        }
    } else if !flags.prev_was_formula && result < 0.0 {
        sign = -sign;
    }
    if flags.prev_was_formula && flags.formula_minus {
        sign = -sign;
    }
    Ok(sign * base.powf(operand))
}

impl OperatorTable {
    /// A table holding the default operators `+ - * / % ^` with the usual
    /// precedence, sized for character codes below `char_limit`.
    pub fn new(char_limit: usize) -> Self {
        let mut table = OperatorTable {
            computes: Vec::new(),
            priorities: Vec::new(),
            ranks: HashMap::new(),
            bucket_count: 0,
        };
        table.resize(char_limit);
        table.install_defaults();
        table
    }

    fn resize(&mut self, char_limit: usize) {
        self.computes.resize_with(char_limit, || None);
        self.priorities.resize(char_limit, 0);
    }

    fn install_defaults(&mut self) {
        self.insert('+', 0, Box::new(|r, v, _| Ok(r + v)));
        self.insert('-', 0, Box::new(|r, v, _| Ok(r - v)));
        self.insert('*', 5, Box::new(|r, v, _| Ok(r * v)));
        self.insert('/', 5, Box::new(|r, v, _| Ok(r / v)));
        self.insert('%', 5, Box::new(|r, v, _| Ok(r % v)));
        self.insert('^', 10, Box::new(pow_compute));
        self.rebuild_ranks();
    }

    /// The number of character codes the table can hold.
    pub fn char_limit(&self) -> usize {
        self.computes.len()
    }

    /// Grows the table to hold character codes below `char_limit`. Shrinking
    /// is rejected since registered operators would be lost.
    pub fn change_limit(&mut self, char_limit: usize) -> FolResult<()> {
        if char_limit < self.computes.len() {
            return Err(folerr!(
                FolErrorKind::Config,
                "char limit {} is below the current limit {}",
                char_limit,
                self.computes.len()
            ));
        }
        self.resize(char_limit);
        Ok(())
    }

    fn check_char(&self, c: char) -> FolResult<usize> {
        let idx = c as usize;
        if idx >= self.computes.len() {
            Err(folerr!(
                FolErrorKind::Config,
                "character '{}' is beyond the char limit {}",
                c,
                self.computes.len()
            ))
        } else {
            Ok(idx)
        }
    }

    /// Unchecked registration path; defaults beyond a small char limit are
    /// simply absent.
    fn insert(&mut self, c: char, priority: u32, compute: OperatorCompute) {
        let idx = c as usize;
        if idx < self.computes.len() {
            self.computes[idx] = Some(compute);
            self.priorities[idx] = priority;
        }
    }

    /// Registers `c` as a binary operator, returning the displaced
    /// implementation and its priority if `c` was already registered.
    pub fn add(
        &mut self,
        c: char,
        priority: u32,
        compute: OperatorCompute,
    ) -> FolResult<Option<(OperatorCompute, u32)>> {
        let idx = self.check_char(c)?;
        let displaced = self.computes[idx].take().map(|old| (old, self.priorities[idx]));
        self.insert(c, priority, compute);
        self.rebuild_ranks();
        Ok(displaced)
    }

    /// Removes `c` from the table. Returns whether it was registered.
    pub fn remove(&mut self, c: char) -> bool {
        let idx = c as usize;
        if idx >= self.computes.len() || self.computes[idx].is_none() {
            return false;
        }
        self.computes[idx] = None;
        self.priorities[idx] = 0;
        self.rebuild_ranks();
        true
    }

    /// Changes the priority of a registered operator. Does nothing if `c` is
    /// not registered.
    pub fn change_priority(&mut self, c: char, priority: u32) -> FolResult<()> {
        let idx = self.check_char(c)?;
        if self.computes[idx].is_some() {
            self.priorities[idx] = priority;
            self.rebuild_ranks();
        }
        Ok(())
    }

    pub fn is_operator(&self, c: char) -> bool {
        let idx = c as usize;
        idx < self.computes.len() && self.computes[idx].is_some()
    }

    /// The priority of `c`, 0 if it is not registered.
    pub fn priority(&self, c: char) -> u32 {
        let idx = c as usize;
        if idx < self.priorities.len() && self.computes[idx].is_some() {
            self.priorities[idx]
        } else {
            0
        }
    }

    /// Applies the operator `c` to the running result and the next operand.
    pub fn compute(&self, c: char, result: f64, operand: f64, flags: OpFlags) -> FolResult<f64> {
        let idx = self.check_char(c)?;
        match &self.computes[idx] {
            Some(compute) => compute(result, operand, flags),
            None => Err(folerr!(
                FolErrorKind::State,
                "'{}' is not a registered operator",
                c
            )),
        }
    }

    /// The rank of `priority` among all registered priorities, rank 0 being
    /// the highest priority. `None` if no operator has this priority.
    pub fn rank_of(&self, priority: u32) -> Option<usize> {
        self.ranks.get(&priority).copied()
    }

    /// Number of distinct priorities in use, never below 1 so the scanner
    /// always has a lowest bucket.
    pub fn bucket_count(&self) -> usize {
        self.bucket_count.max(1)
    }

    fn operator_chars(&self) -> Vec<char> {
        self.computes
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .filter_map(|(idx, _)| char::from_u32(idx as u32))
            .collect()
    }

    fn rebuild_ranks(&mut self) {
        let mut distinct: Vec<u32> = self
            .computes
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(idx, _)| self.priorities[idx])
            .collect();
        distinct.sort_unstable_by(|a, b| b.cmp(a));
        distinct.dedup();
        self.ranks = distinct
            .iter()
            .enumerate()
            .map(|(rank, &priority)| (priority, rank))
            .collect();
        self.bucket_count = distinct.len();
    }
}

impl Default for OperatorTable {
    fn default() -> Self {
        OperatorTable::new(DEFAULT_CHAR_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ranks() {
        let table = OperatorTable::default();
        assert_eq!(table.bucket_count(), 3);
        assert_eq!(table.rank_of(10), Some(0));
        assert_eq!(table.rank_of(5), Some(1));
        assert_eq!(table.rank_of(0), Some(2));
        assert_eq!(table.rank_of(7), None);
    }

    #[test]
    fn ranks_follow_mutations() {
        let mut table = OperatorTable::default();
        table.add('!', 7, Box::new(|r, v, _| Ok(r + v))).unwrap();
        assert_eq!(table.bucket_count(), 4);
        assert_eq!(table.rank_of(7), Some(1));
        assert!(table.remove('!'));
        assert_eq!(table.bucket_count(), 3);
        assert_eq!(table.rank_of(7), None);
    }

    #[test]
    fn change_priority_ignores_unregistered() {
        let mut table = OperatorTable::default();
        table.change_priority('!', 3).unwrap();
        assert!(!table.is_operator('!'));
        assert_eq!(table.rank_of(3), None);
        // '*' joins '^' at the top, '/' and '%' stay at 5
        table.change_priority('*', 10).unwrap();
        assert_eq!(table.bucket_count(), 3);
        assert_eq!(table.priority('*'), 10);
        assert_eq!(table.rank_of(10), Some(0));
    }

    #[test]
    fn re_adding_returns_the_displaced_binding() {
        let mut table = OperatorTable::default();
        let displaced = table.add('+', 2, Box::new(|r, v, _| Ok(r * v))).unwrap();
        let (old, priority) = displaced.unwrap();
        assert_eq!(priority, 0);
        assert_eq!(old(2.0, 3.0, OpFlags::default()).unwrap(), 5.0);
        let fresh = table.add('&', 1, Box::new(|r, v, _| Ok(r + v))).unwrap();
        assert!(fresh.is_none());
    }

    #[test]
    fn small_char_limit_skips_unreachable_defaults() {
        let table = OperatorTable::new(64);
        assert!(table.is_operator('+'));
        assert!(table.is_operator('*'));
        assert!(!table.is_operator('^'));
        assert_eq!(table.bucket_count(), 2);
    }

    #[test]
    fn pow_sign_rules() {
        let table = OperatorTable::default();
        let plain = OpFlags::default();
        assert_eq!(table.compute('^', -2.0, 2.0, plain).unwrap(), -4.0);
        let formula = OpFlags {
            prev_was_formula: true,
            prev_value_negative: true,
            formula_minus: false,
        };
        assert_eq!(table.compute('^', -2.0, 2.0, formula).unwrap(), 4.0);
        assert_eq!(table.compute('^', -2.0, 3.0, formula).unwrap(), -8.0);
        assert!(table.compute('^', -2.0, 0.5, formula).is_err());
    }

    #[test]
    fn char_beyond_limit_is_rejected() {
        let mut table = OperatorTable::new(64);
        assert!(table.add('~', 1, Box::new(|r, v, _| Ok(r + v))).is_err());
        table.change_limit(256).unwrap();
        assert!(table.add('~', 1, Box::new(|r, v, _| Ok(r + v))).is_ok());
        assert!(table.change_limit(8).is_err());
    }
}
