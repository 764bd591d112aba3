//! The intermediate representation of the programs that get sliced.
//!
//! A [`Program`] is a collection of global variables and procedures ([`Sub`]),
//! where each procedure consists of basic blocks ([`Blk`])
//! holding instructions ([`Def`]) and a terminating jump ([`Jmp`]).
//! Every object is wrapped in a [`Term`] carrying a unique identifier ([`Tid`]).
//! Instructions reference the results of other instructions through these identifiers,
//! i.e. the representation is in SSA form with explicit [`Phi`](Def::Phi) instructions.
//!
//! Modules are (de)serializable with serde,
//! the command line tool reads them from JSON files.

use crate::prelude::*;

/// An identifier for a term.
///
/// The contained ID string is required to be unique inside its procedure.
/// The same ID may appear in different procedures,
/// e.g. for procedures instantiated more than once in the dependence graph.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct Tid {
    /// The unique ID of the term.
    id: String,
}

impl Tid {
    /// Generate a new term identifier with the given ID string.
    pub fn new<T: ToString>(val: T) -> Tid {
        Tid { id: val.to_string() }
    }

    /// Add a suffix to the ID string and return the new `Tid`.
    pub fn with_id_suffix(self, suffix: &str) -> Self {
        Tid {
            id: self.id + suffix,
        }
    }
}

impl std::fmt::Display for Tid {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "{}", self.id)
    }
}

/// A term is an object of the program with a unique ID.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct Term<T> {
    /// The term identifier.
    pub tid: Tid,
    /// The object.
    pub term: T,
}

/// A value that an instruction operand can take.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub enum Value {
    /// The result of the instruction (or formal parameter or global variable)
    /// with the given ID.
    Ref(Tid),
    /// The address of the procedure with the given name.
    Function(String),
    /// The null pointer constant.
    NullPtr,
    /// A non-pointer literal. Only tracked for dependence purposes.
    Int(i64),
}

impl Value {
    /// Return the referenced term ID if the value is a reference.
    pub fn as_ref_tid(&self) -> Option<&Tid> {
        match self {
            Value::Ref(tid) => Some(tid),
            _ => None,
        }
    }
}

/// The target of a call instruction.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub enum CallTarget {
    /// A call of the procedure with the given name.
    Direct(String),
    /// A call through a function pointer.
    Indirect(Value),
}

/// An instruction inside a basic block.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub enum Def {
    /// A local (stack-like) allocation.
    /// The result value is the address of the allocated memory.
    Alloc {
        /// The size of the allocation in bytes, if known.
        size: Option<u64>,
        /// Whether reads from unwritten offsets yield null.
        zero_initialized: bool,
    },
    /// A dynamic (heap) allocation.
    DynAlloc {
        /// The size of the allocation in bytes, if known.
        size: Option<u64>,
        /// Whether reads from unwritten offsets yield null.
        zero_initialized: bool,
    },
    /// Load the value stored at `*address`.
    Load {
        /// The address operand.
        address: Value,
    },
    /// Store `value` to `*address`.
    Store {
        /// The address operand.
        address: Value,
        /// The stored value.
        value: Value,
    },
    /// Pointer arithmetic: the result is `base` shifted by a constant offset.
    Gep {
        /// The base pointer.
        base: Value,
        /// The constant byte offset.
        offset: u64,
    },
    /// A bit-reinterpreting copy of the operand.
    Cast {
        /// The copied value.
        value: Value,
    },
    /// Merge values arriving over different control flow paths.
    Phi {
        /// The merged values.
        values: Vec<Value>,
    },
    /// A procedure call. The result value is the returned value.
    Call {
        /// The called procedure.
        target: CallTarget,
        /// The actual arguments.
        args: Vec<Value>,
    },
    /// Copy `length` bytes from `*source` to `*destination`.
    Memcpy {
        /// The destination address.
        destination: Value,
        /// The source address.
        source: Value,
        /// The number of copied bytes. `None` means unknown.
        length: Option<u64>,
    },
    /// Release a dynamic allocation.
    Free {
        /// The released pointer.
        pointer: Value,
    },
    /// A non-pointer computation over the given operands.
    /// The concrete operation is irrelevant for slicing,
    /// only the dependences on the operands are tracked.
    Compute {
        /// The operands of the computation.
        operands: Vec<Value>,
    },
}

impl Def {
    /// Get all operand values of the instruction in order.
    pub fn operands(&self) -> Vec<&Value> {
        match self {
            Def::Alloc { .. } | Def::DynAlloc { .. } => Vec::new(),
            Def::Load { address } => vec![address],
            Def::Store { address, value } => vec![value, address],
            Def::Gep { base, .. } => vec![base],
            Def::Cast { value } => vec![value],
            Def::Phi { values } => values.iter().collect(),
            Def::Call { target, args } => {
                let mut operands: Vec<&Value> = Vec::new();
                if let CallTarget::Indirect(value) = target {
                    operands.push(value);
                }
                operands.extend(args.iter());
                operands
            }
            Def::Memcpy {
                destination,
                source,
                ..
            } => vec![destination, source],
            Def::Free { pointer } => vec![pointer],
            Def::Compute { operands } => operands.iter().collect(),
        }
    }
}

/// A jump terminating a basic block.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub enum Jmp {
    /// An unconditional jump to the block with the given ID.
    Branch(Tid),
    /// A conditional jump.
    CondBranch {
        /// The branch condition.
        condition: Value,
        /// The jump target if the condition is true.
        if_true: Tid,
        /// The jump target if the condition is false.
        if_false: Tid,
    },
    /// Return from the procedure.
    Return(Option<Value>),
}

impl Jmp {
    /// Get the IDs of all possible jump targets.
    pub fn targets(&self) -> Vec<&Tid> {
        match self {
            Jmp::Branch(target) => vec![target],
            Jmp::CondBranch {
                if_true, if_false, ..
            } => vec![if_true, if_false],
            Jmp::Return(_) => Vec::new(),
        }
    }
}

/// A basic block.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct Blk {
    /// The instructions of the block in execution order.
    pub defs: Vec<Term<Def>>,
    /// The terminating jump of the block.
    pub jmp: Term<Jmp>,
}

/// A formal parameter of a procedure.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct Param {
    /// The name of the parameter.
    pub name: String,
}

/// A procedure.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct Sub {
    /// The name of the procedure.
    pub name: String,
    /// The formal parameters of the procedure.
    pub parameters: Vec<Term<Param>>,
    /// The basic blocks of the procedure.
    /// The first block is the entry block.
    pub blocks: Vec<Term<Blk>>,
}

/// A global variable.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct Global {
    /// The name of the variable.
    pub name: String,
    /// The size of the variable in bytes, if known.
    pub size: Option<u64>,
    /// Whether the variable is zero-initialized.
    pub zero_initialized: bool,
    /// An optional pointer value stored to the variable before program start.
    pub initializer: Option<Value>,
}

/// A program, i.e. a loadable module.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct Program {
    /// The global variables of the program.
    pub globals: Vec<Term<Global>>,
    /// The procedures of the program.
    pub subs: Vec<Term<Sub>>,
    /// The name of the entry procedure.
    pub entry: String,
}

impl Program {
    /// Find a procedure by name.
    pub fn find_sub(&self, name: &str) -> Option<&Term<Sub>> {
        self.subs.iter().find(|sub| sub.term.name == name)
    }

    /// Find the entry procedure of the program.
    pub fn entry_sub(&self) -> Option<&Term<Sub>> {
        self.find_sub(&self.entry)
    }
}

#[cfg(test)]
pub mod builder {
    //! Helpers for constructing IR terms in tests.

    use super::*;

    /// Wrap a term object with the given ID.
    pub fn term<T>(id: &str, term: T) -> Term<T> {
        Term {
            tid: Tid::new(id),
            term,
        }
    }

    /// Shorthand for a reference value.
    pub fn var(id: &str) -> Value {
        Value::Ref(Tid::new(id))
    }

    /// A block with the given instructions that falls through to a return.
    pub fn ret_block(id: &str, defs: Vec<Term<Def>>) -> Term<Blk> {
        term(
            id,
            Blk {
                defs,
                jmp: term(&format!("{id}_ret"), Jmp::Return(None)),
            },
        )
    }

    /// A procedure with a single block and no parameters.
    pub fn simple_sub(name: &str, defs: Vec<Term<Def>>) -> Term<Sub> {
        term(
            name,
            Sub {
                name: name.to_string(),
                parameters: Vec::new(),
                blocks: vec![ret_block(&format!("{name}_blk"), defs)],
            },
        )
    }
}
