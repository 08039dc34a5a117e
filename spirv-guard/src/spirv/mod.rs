//! A minimal model of a SPIR-V shader module.
//!
//! The instrumentation framework does not parse or serialize SPIR-V itself; the surrounding
//! layer owns the words-level round trip. What it needs is an in-memory view it can rewrite:
//! a [`Module`] holding ordered [`Function`]s, each holding ordered [`BasicBlock`]s of
//! [`Instruction`]s, with enough type and constant bookkeeping to synthesize new code without
//! breaking SSA form.
//!
//! Only the opcodes that the framework emits or inspects are modeled as enum variants;
//! everything else round-trips through [`Op::Other`].

pub use self::module::{BasicBlock, Function, Module, Variable};

mod module;

use std::fmt::{Display, Formatter, Result as FmtResult};

/// A SPIR-V result id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u32);

impl Id {
    #[inline]
    pub const fn new(value: u32) -> Self {
        Id(value)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "%{}", self.0)
    }
}

/// A module-unique ordinal assigned to every instruction when it enters a [`Module`].
///
/// Unlike a result id, every instruction has one, including instructions without a result
/// (`OpStore`, branches). It is stable across block splitting, which makes it the identity
/// used to re-locate a target instruction after injections have shifted block contents, and
/// the value reported to the device so an error record can name the instruction it came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstructionPosition(pub u32);

/// Subset of SPIR-V opcodes handled structurally by this crate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Op {
    Undef,
    EntryPoint,
    ExecutionMode,
    Capability,
    TypeVoid,
    TypeBool,
    TypeInt,
    TypeFloat,
    TypeVector,
    TypePointer,
    ConstantTrue,
    ConstantFalse,
    Constant,
    ConstantNull,
    Function,
    FunctionParameter,
    FunctionEnd,
    FunctionCall,
    Variable,
    Load,
    Store,
    AccessChain,
    Decorate,
    MemberDecorate,
    CompositeConstruct,
    CompositeExtract,
    ConvertPtrToU,
    UConvert,
    SConvert,
    Bitcast,
    Phi,
    SelectionMerge,
    Label,
    Branch,
    BranchConditional,
    Return,
    ReturnValue,
    /// Any opcode the framework treats as opaque, by raw opcode value.
    Other(u16),
}

impl Op {
    /// The raw SPIR-V opcode value.
    pub const fn as_u16(self) -> u16 {
        match self {
            Op::Undef => 1,
            Op::EntryPoint => 15,
            Op::ExecutionMode => 16,
            Op::Capability => 17,
            Op::TypeVoid => 19,
            Op::TypeBool => 20,
            Op::TypeInt => 21,
            Op::TypeFloat => 22,
            Op::TypeVector => 23,
            Op::TypePointer => 32,
            Op::ConstantTrue => 41,
            Op::ConstantFalse => 42,
            Op::Constant => 43,
            Op::ConstantNull => 46,
            Op::Function => 54,
            Op::FunctionParameter => 55,
            Op::FunctionEnd => 56,
            Op::FunctionCall => 57,
            Op::Variable => 59,
            Op::Load => 61,
            Op::Store => 62,
            Op::AccessChain => 65,
            Op::Decorate => 71,
            Op::MemberDecorate => 72,
            Op::CompositeConstruct => 80,
            Op::CompositeExtract => 81,
            Op::ConvertPtrToU => 117,
            Op::UConvert => 113,
            Op::SConvert => 114,
            Op::Bitcast => 124,
            Op::Phi => 245,
            Op::SelectionMerge => 247,
            Op::Label => 248,
            Op::Branch => 249,
            Op::BranchConditional => 250,
            Op::Return => 253,
            Op::ReturnValue => 254,
            Op::Other(value) => value,
        }
    }
}

/// Shader stages an instrumented module can execute in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ExecutionModel {
    Vertex,
    Fragment,
    Compute,
    RayGeneration,
    ClosestHit,
    Miss,
}

impl ExecutionModel {
    /// Stable stage identifier reported to the device-side check functions.
    pub const fn stage_id(self) -> u32 {
        match self {
            ExecutionModel::Vertex => 0,
            ExecutionModel::Fragment => 4,
            ExecutionModel::Compute => 5,
            ExecutionModel::RayGeneration => 5313,
            ExecutionModel::ClosestHit => 5315,
            ExecutionModel::Miss => 5316,
        }
    }
}

/// Storage classes the framework declares variables or pointers in.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StorageClass {
    UniformConstant,
    Input,
    Uniform,
    Output,
    Private,
    Function,
    StorageBuffer,
}

impl StorageClass {
    pub const fn as_u32(self) -> u32 {
        match self {
            StorageClass::UniformConstant => 0,
            StorageClass::Input => 1,
            StorageClass::Uniform => 2,
            StorageClass::Output => 3,
            StorageClass::Private => 6,
            StorageClass::Function => 7,
            StorageClass::StorageBuffer => 12,
        }
    }
}

/// Builtins the stage-info synthesis reads from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum BuiltIn {
    FragCoord,
    VertexIndex,
    InstanceIndex,
    GlobalInvocationId,
    LaunchId,
}

impl BuiltIn {
    pub const fn as_u32(self) -> u32 {
        match self {
            BuiltIn::FragCoord => 15,
            BuiltIn::VertexIndex => 42,
            BuiltIn::InstanceIndex => 43,
            BuiltIn::GlobalInvocationId => 28,
            BuiltIn::LaunchId => 5319,
        }
    }
}

/// Decorations the framework emits or looks up.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Decoration {
    Block,
    ArrayStride,
    BuiltIn,
    NonWritable,
    Binding,
    DescriptorSet,
    Offset,
}

impl Decoration {
    pub const fn as_u32(self) -> u32 {
        match self {
            Decoration::Block => 2,
            Decoration::ArrayStride => 6,
            Decoration::BuiltIn => 11,
            Decoration::NonWritable => 24,
            Decoration::Binding => 33,
            Decoration::DescriptorSet => 34,
            Decoration::Offset => 35,
        }
    }
}

/// A single SPIR-V instruction.
///
/// `operands` holds all words after the result type and result id, in instruction order;
/// ids and literals are not distinguished here, callers know the layout of the opcodes they
/// touch (the same contract the words-level encoding has).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Op,
    pub result_type: Option<Id>,
    pub result_id: Option<Id>,
    pub operands: smallvec::SmallVec<[u32; 4]>,
    pub(crate) position: InstructionPosition,
}

impl Instruction {
    /// Creates an instruction that is not yet part of a module.
    ///
    /// A real position is assigned when the instruction enters a [`Module`].
    pub fn new(
        opcode: Op,
        result_type: Option<Id>,
        result_id: Option<Id>,
        operands: impl IntoIterator<Item = u32>,
    ) -> Self {
        Instruction {
            opcode,
            result_type,
            result_id,
            operands: operands.into_iter().collect(),
            position: InstructionPosition(u32::MAX),
        }
    }

    /// The module-unique position of this instruction.
    ///
    /// # Panics
    ///
    /// Panics if the instruction has not been inserted into a module yet.
    #[inline]
    pub fn position(&self) -> InstructionPosition {
        assert_ne!(self.position.0, u32::MAX, "instruction has no position yet");
        self.position
    }

    /// Reads operand `index` as an id.
    #[inline]
    pub fn operand_id(&self, index: usize) -> Id {
        Id::new(self.operands[index])
    }

    /// Whether this instruction produces a value that later instructions can consume.
    #[inline]
    pub fn is_read_shaped(&self) -> bool {
        self.result_id.is_some()
    }
}
