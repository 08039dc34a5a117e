use super::{
    BuiltIn, Decoration, ExecutionModel, Id, Instruction, InstructionPosition, Op, StorageClass,
};
use foldhash::HashMap;

/// A declared storage object (builtin input, uniform, ...), referenced by id.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Variable {
    /// Result id of the `OpVariable`.
    pub id: Id,
    /// The pointer type of the variable.
    pub type_id: Id,
    /// The type the variable points to.
    pub pointee_type_id: Id,
    pub storage_class: StorageClass,
    pub builtin: Option<BuiltIn>,
}

/// An ordered sequence of instructions with a single entry point.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub label_id: Id,
    pub instructions: Vec<Instruction>,
}

impl BasicBlock {
    pub fn new(label_id: Id) -> Self {
        BasicBlock {
            label_id,
            instructions: Vec::new(),
        }
    }

    /// Index of the instruction with the given module position, if it lives in this block.
    pub fn index_of_position(&self, position: InstructionPosition) -> Option<usize> {
        self.instructions
            .iter()
            .position(|inst| inst.position == position)
    }
}

/// A function of the module, with its basic blocks in layout order.
#[derive(Clone, Debug)]
pub struct Function {
    pub result_id: Id,
    pub return_type: Id,
    pub blocks: Vec<BasicBlock>,
}

impl Function {
    pub fn new(result_id: Id, return_type: Id) -> Self {
        Function {
            result_id,
            return_type,
            blocks: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum TypeKey {
    Void,
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { component: Id, len: u32 },
    Pointer { storage_class: u32, pointee: Id },
}

/// One shader program; the unit of instrumentation and caching.
///
/// Owns the global sections (annotations, types/constants/global variables) and the functions.
/// All type, constant and builtin-variable creation goes through memoizing helpers so that
/// asking twice never emits a duplicate instruction.
#[derive(Clone, Debug)]
pub struct Module {
    execution_model: ExecutionModel,
    next_id: u32,
    next_position: u32,
    instrumented: bool,

    pub(crate) annotations: Vec<Instruction>,
    pub(crate) types_global_values: Vec<Instruction>,
    pub(crate) functions: Vec<Function>,

    type_cache: HashMap<TypeKey, Id>,
    constant_cache: HashMap<(Id, u32), Id>,
    null_constant_cache: HashMap<Id, Id>,
    builtin_cache: HashMap<u32, Variable>,
}

impl Module {
    pub fn new(execution_model: ExecutionModel) -> Self {
        Module {
            execution_model,
            next_id: 1,
            next_position: 0,
            instrumented: false,
            annotations: Vec::new(),
            types_global_values: Vec::new(),
            functions: Vec::new(),
            type_cache: HashMap::default(),
            constant_cache: HashMap::default(),
            null_constant_cache: HashMap::default(),
            builtin_cache: HashMap::default(),
        }
    }

    #[inline]
    pub fn execution_model(&self) -> ExecutionModel {
        self.execution_model
    }

    #[inline]
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Allocates a fresh result id.
    pub fn alloc_id(&mut self) -> Id {
        let id = Id::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn assign_position(&mut self, inst: &mut Instruction) {
        inst.position = InstructionPosition(self.next_position);
        self.next_position += 1;
    }

    /// Adds a function and returns its index.
    pub fn add_function(&mut self, function: Function) -> usize {
        self.functions.push(function);
        self.functions.len() - 1
    }

    /// Adds a basic block to a function and returns its index.
    pub fn add_block(&mut self, function: usize, block: BasicBlock) -> usize {
        let blocks = &mut self.functions[function].blocks;
        blocks.push(block);
        blocks.len() - 1
    }

    /// Appends an instruction to a block, assigning it a module position.
    pub fn append_to_block(&mut self, function: usize, block: usize, mut inst: Instruction) {
        self.assign_position(&mut inst);
        self.functions[function].blocks[block].instructions.push(inst);
    }

    /// Inserts an instruction at `index` within a block, assigning it a module position.
    pub fn insert_in_block(
        &mut self,
        function: usize,
        block: usize,
        index: usize,
        mut inst: Instruction,
    ) {
        self.assign_position(&mut inst);
        self.functions[function].blocks[block]
            .instructions
            .insert(index, inst);
    }

    fn push_global(&mut self, mut inst: Instruction) {
        self.assign_position(&mut inst);
        self.types_global_values.push(inst);
    }

    fn push_annotation(&mut self, mut inst: Instruction) {
        self.assign_position(&mut inst);
        self.annotations.push(inst);
    }

    fn type_id(&mut self, key: TypeKey, build: impl FnOnce(Id) -> Instruction) -> Id {
        if let Some(&id) = self.type_cache.get(&key) {
            return id;
        }
        let id = self.alloc_id();
        let inst = build(id);
        self.push_global(inst);
        self.type_cache.insert(key, id);
        id
    }

    pub fn type_void(&mut self) -> Id {
        self.type_id(TypeKey::Void, |id| {
            Instruction::new(Op::TypeVoid, None, Some(id), [])
        })
    }

    pub fn type_bool(&mut self) -> Id {
        self.type_id(TypeKey::Bool, |id| {
            Instruction::new(Op::TypeBool, None, Some(id), [])
        })
    }

    pub fn type_int(&mut self, width: u32, signed: bool) -> Id {
        self.type_id(TypeKey::Int { width, signed }, |id| {
            Instruction::new(Op::TypeInt, None, Some(id), [width, signed as u32])
        })
    }

    pub fn type_uint32(&mut self) -> Id {
        self.type_int(32, false)
    }

    pub fn type_float(&mut self, width: u32) -> Id {
        self.type_id(TypeKey::Float { width }, |id| {
            Instruction::new(Op::TypeFloat, None, Some(id), [width])
        })
    }

    pub fn type_vector(&mut self, component: Id, len: u32) -> Id {
        self.type_id(TypeKey::Vector { component, len }, |id| {
            Instruction::new(Op::TypeVector, None, Some(id), [component.as_raw(), len])
        })
    }

    pub fn type_pointer(&mut self, storage_class: StorageClass, pointee: Id) -> Id {
        self.type_id(
            TypeKey::Pointer {
                storage_class: storage_class.as_u32(),
                pointee,
            },
            |id| {
                Instruction::new(
                    Op::TypePointer,
                    None,
                    Some(id),
                    [storage_class.as_u32(), pointee.as_raw()],
                )
            },
        )
    }

    /// Returns the id of a 32-bit unsigned constant, creating it on first request.
    pub fn const_u32(&mut self, value: u32) -> Id {
        let type_id = self.type_uint32();
        if let Some(&id) = self.constant_cache.get(&(type_id, value)) {
            return id;
        }
        let id = self.alloc_id();
        self.push_global(Instruction::new(
            Op::Constant,
            Some(type_id),
            Some(id),
            [value],
        ));
        self.constant_cache.insert((type_id, value), id);
        id
    }

    /// Returns the id of the null constant of `type_id`, creating it on first request.
    ///
    /// Used as the substitute value for invalidated reads.
    pub fn const_null(&mut self, type_id: Id) -> Id {
        if let Some(&id) = self.null_constant_cache.get(&type_id) {
            return id;
        }
        let id = self.alloc_id();
        self.push_global(Instruction::new(
            Op::ConstantNull,
            Some(type_id),
            Some(id),
            [],
        ));
        self.null_constant_cache.insert(type_id, id);
        id
    }

    /// Finds the defining instruction of `id`, looking through the global sections and every
    /// function body.
    pub fn find_def(&self, id: Id) -> Option<&Instruction> {
        self.types_global_values
            .iter()
            .find(|inst| inst.result_id == Some(id))
            .or_else(|| {
                self.functions.iter().find_map(|function| {
                    function.blocks.iter().find_map(|block| {
                        block
                            .instructions
                            .iter()
                            .find(|inst| inst.result_id == Some(id))
                    })
                })
            })
    }

    /// The result type of the value defined by `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` has no defining instruction; referencing a dangling id is an internal
    /// consistency error, not a recoverable condition.
    pub fn type_of(&self, id: Id) -> Id {
        let inst = self
            .find_def(id)
            .unwrap_or_else(|| panic!("{} has no defining instruction", id));
        inst.result_type
            .unwrap_or_else(|| panic!("{} has no result type", id))
    }

    /// If `type_id` names an integer type, its `(width, signedness)`.
    pub fn int_type_info(&self, type_id: Id) -> Option<(u32, bool)> {
        let inst = self.find_def(type_id)?;
        match inst.opcode {
            Op::TypeInt => Some((inst.operands[0], inst.operands[1] != 0)),
            _ => None,
        }
    }

    /// If `type_id` names a float type, its width.
    pub fn float_type_info(&self, type_id: Id) -> Option<u32> {
        let inst = self.find_def(type_id)?;
        match inst.opcode {
            Op::TypeFloat => Some(inst.operands[0]),
            _ => None,
        }
    }

    /// Whether `type_id` names a pointer type.
    pub fn is_pointer_type(&self, type_id: Id) -> bool {
        matches!(self.find_def(type_id), Some(inst) if inst.opcode == Op::TypePointer)
    }

    /// Returns the variable for a builtin, creating and decorating it on first request.
    pub fn get_builtin_variable(&mut self, builtin: BuiltIn) -> Variable {
        if let Some(&variable) = self.builtin_cache.get(&builtin.as_u32()) {
            return variable;
        }

        let pointee_type_id = match builtin {
            BuiltIn::GlobalInvocationId | BuiltIn::LaunchId => {
                let u32_t = self.type_uint32();
                self.type_vector(u32_t, 3)
            }
            BuiltIn::VertexIndex | BuiltIn::InstanceIndex => self.type_uint32(),
            BuiltIn::FragCoord => {
                let f32_t = self.type_float(32);
                self.type_vector(f32_t, 4)
            }
        };
        let type_id = self.type_pointer(StorageClass::Input, pointee_type_id);
        let id = self.alloc_id();
        self.push_global(Instruction::new(
            Op::Variable,
            Some(type_id),
            Some(id),
            [StorageClass::Input.as_u32()],
        ));
        self.push_annotation(Instruction::new(
            Op::Decorate,
            None,
            None,
            [id.as_raw(), Decoration::BuiltIn.as_u32(), builtin.as_u32()],
        ));

        let variable = Variable {
            id,
            type_id,
            pointee_type_id,
            storage_class: StorageClass::Input,
            builtin: Some(builtin),
        };
        self.builtin_cache.insert(builtin.as_u32(), variable);
        variable
    }

    /// Rewires every use of `old` to `new`, preserving SSA form after a value substitution.
    ///
    /// Uses inside the block labeled `skip_block` and inside the instruction whose result is
    /// `skip_result` are left alone; the value-select node itself must keep referencing the
    /// original value, and so must the guarded path that produces it.
    pub(crate) fn replace_uses(
        &mut self,
        old: Id,
        new: Id,
        skip_block: Option<Id>,
        skip_result: Option<Id>,
    ) {
        for function in &mut self.functions {
            for block in &mut function.blocks {
                if Some(block.label_id) == skip_block {
                    continue;
                }
                for inst in &mut block.instructions {
                    if inst.result_id.is_some() && inst.result_id == skip_result {
                        continue;
                    }
                    for index in id_operand_indices(inst) {
                        if inst.operands[index] == old.as_raw() {
                            inst.operands[index] = new.as_raw();
                        }
                    }
                }
            }
        }
    }

    /// Whether this module has already been through its instrumentation run.
    #[inline]
    pub fn is_instrumented(&self) -> bool {
        self.instrumented
    }

    /// Marks the module as instrumented. Further pass runs are rejected; callers that want the
    /// instrumented form again go through the cache.
    pub fn seal_instrumented(&mut self) {
        self.instrumented = true;
    }
}

/// Operand indices that hold ids for the given instruction.
///
/// Literal operands (bit widths, storage classes, member indices) must never be rewritten by
/// a value substitution, so the distinction matters.
fn id_operand_indices(inst: &Instruction) -> std::ops::Range<usize> {
    let all = 0..inst.operands.len();
    let none = 0..0;
    let first = 0..1usize.min(inst.operands.len());
    match inst.opcode {
        Op::AccessChain | Op::FunctionCall | Op::CompositeConstruct | Op::Phi => all,
        Op::Load
        | Op::CompositeExtract
        | Op::UConvert
        | Op::SConvert
        | Op::Bitcast
        | Op::ConvertPtrToU
        | Op::Branch
        | Op::SelectionMerge
        | Op::ReturnValue
        | Op::Decorate
        | Op::MemberDecorate => first,
        Op::Store => 0..2usize.min(inst.operands.len()),
        Op::BranchConditional => 0..3usize.min(inst.operands.len()),
        // Type declarations, constants, labels and variables carry literals (or nothing) in
        // the positions a substitution would touch.
        Op::Undef
        | Op::TypeVoid
        | Op::TypeBool
        | Op::TypeInt
        | Op::TypeFloat
        | Op::TypeVector
        | Op::TypePointer
        | Op::ConstantTrue
        | Op::ConstantFalse
        | Op::Constant
        | Op::ConstantNull
        | Op::Variable
        | Op::Label
        | Op::Return => none,
        // Opaque instructions are assumed id-only past any known layout; the opcodes reachable
        // from instrumented code paths are all modeled above.
        _ => all,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spirv::{BuiltIn, ExecutionModel, Id, Instruction, Op};

    #[test]
    fn type_and_constant_creation_is_memoized() {
        let mut module = Module::new(ExecutionModel::Compute);
        let a = module.type_uint32();
        let b = module.type_uint32();
        assert_eq!(a, b);

        let c0 = module.const_u32(7);
        let c1 = module.const_u32(7);
        assert_eq!(c0, c1);
        let c2 = module.const_u32(8);
        assert_ne!(c0, c2);

        // One OpTypeInt and two OpConstants total.
        assert_eq!(
            module
                .types_global_values
                .iter()
                .filter(|inst| inst.opcode == Op::TypeInt)
                .count(),
            1
        );
        assert_eq!(
            module
                .types_global_values
                .iter()
                .filter(|inst| inst.opcode == Op::Constant)
                .count(),
            2
        );
    }

    #[test]
    fn builtin_variable_is_created_once_and_decorated() {
        let mut module = Module::new(ExecutionModel::Compute);
        let first = module.get_builtin_variable(BuiltIn::GlobalInvocationId);
        let second = module.get_builtin_variable(BuiltIn::GlobalInvocationId);
        assert_eq!(first.id, second.id);

        let decorations: Vec<_> = module
            .annotations
            .iter()
            .filter(|inst| {
                inst.opcode == Op::Decorate && inst.operand_id(0) == first.id
            })
            .collect();
        assert_eq!(decorations.len(), 1);
        assert_eq!(decorations[0].operands[2], BuiltIn::GlobalInvocationId.as_u32());
    }

    #[test]
    fn replace_uses_skips_literals_and_excluded_sites() {
        let mut module = Module::new(ExecutionModel::Compute);
        let u32_t = module.type_uint32();
        let old = module.const_u32(3);
        let new = module.const_u32(4);

        let void_t = module.type_void();
        let fn_id = module.alloc_id();
        let function = module.add_function(Function::new(fn_id, void_t));
        let label = module.alloc_id();
        module.add_block(function, BasicBlock::new(label));

        let use_id = module.alloc_id();
        module.append_to_block(
            function,
            0,
            Instruction::new(
                Op::CompositeConstruct,
                Some(u32_t),
                Some(use_id),
                [old.as_raw(), old.as_raw()],
            ),
        );
        // A constant whose literal happens to equal the raw id must not be rewritten.
        let decoy = module.const_u32(old.as_raw());

        module.replace_uses(old, new, None, None);

        let inst = &module.functions[0].blocks[0].instructions[0];
        assert_eq!(inst.operands.as_slice(), &[new.as_raw(), new.as_raw()]);
        let decoy_def = module.find_def(decoy).unwrap();
        assert_eq!(decoy_def.operands[0], old.as_raw());
    }

    #[test]
    #[should_panic]
    fn type_of_dangling_id_panics() {
        let module = Module::new(ExecutionModel::Compute);
        module.type_of(Id::new(999));
    }
}
