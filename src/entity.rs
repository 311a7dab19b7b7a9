use crate::formula::Formula;

/// One node of a parsed formula. Every entity carries the operator character
/// that combines it with the running result during evaluation.
#[derive(Clone, Debug)]
pub struct Entity {
    pub(crate) op: char,
    pub(crate) kind: EntityKind,
}

/// The closed set of node kinds a parse can produce.
#[derive(Clone, Debug)]
pub enum EntityKind {
    /// A literal numeric value, sign already applied.
    Num(f64),
    /// A single-character placeholder resolved against the root formula's
    /// variable table. `index` is assigned once the whole top-level formula
    /// has been built.
    Var {
        name: char,
        negated: bool,
        index: usize,
    },
    /// A named function call; each argument is itself a finished entity.
    Call { id: String, args: Vec<Entity> },
    /// A nested sub-formula.
    Sub(Box<Formula>),
}

impl Entity {
    pub fn new(op: char, kind: EntityKind) -> Self {
        Entity { op, kind }
    }

    pub fn num(value: f64, op: char) -> Self {
        Entity::new(op, EntityKind::Num(value))
    }

    pub fn var(name: char, op: char, negated: bool) -> Self {
        Entity::new(
            op,
            EntityKind::Var {
                name,
                negated,
                index: 0,
            },
        )
    }

    /// The preceding operator character of this entity.
    pub fn op(&self) -> char {
        self.op
    }

    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    pub fn is_sub_formula(&self) -> bool {
        matches!(self.kind, EntityKind::Sub(_))
    }
}
