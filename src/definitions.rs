/// Capacities of the stack-allocated parts of scan-time containers. Longer
/// formulas spill to the heap.
pub const N_ENTITIES_ON_STACK: usize = 16;
pub const N_ARGS_ON_STACK: usize = 4;
pub const N_VARS_ON_STACK: usize = 8;

/// Scan states kept warm in the pool; one is needed per open parenthesis or
/// function-argument list at any moment during a parse.
pub const N_POOLED_STATES: usize = 3;

/// Default character-space bound, covering the 7-bit range. Raising it via
/// [`Parser::change_limit`](crate::Parser::change_limit) trades memory for
/// support of a wider character set.
pub const DEFAULT_CHAR_LIMIT: usize = 128;
