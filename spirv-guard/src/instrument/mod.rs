//! The instrumentation pass framework.
//!
//! A concrete check (bounds checking of bindless descriptor indexing, buffer-device-address
//! dereference validation, ...) plugs into the framework by implementing
//! [`InstrumentationPass`]: it decides *which* instructions are risky and builds the call to
//! its device-side check function; the framework owns everything else: walking the module,
//! re-locating the target after earlier injections have shifted block contents, synthesizing
//! the per-site [`InjectionData`], splitting control flow around the risky instruction, and
//! keeping per-site pass state from leaking across sites.
//!
//! Instrumentation is a CPU-side, single-threaded-per-module activity performed once at
//! shader-build time. The rewritten module is reused read-only afterwards; see
//! [`cache`](self::cache).

pub mod cache;

mod inject;

pub use self::cache::{InstrumentationCache, ShaderModuleKey};

use crate::spirv::{
    BuiltIn, Decoration, ExecutionModel, Function, Id, Instruction, InstructionPosition, Module,
    Op, Variable,
};
use foldhash::HashMap;
use smallvec::SmallVec;

/// Context every injected check call receives, so the device side can report *where* a
/// failure occurred: the id of the stage/invocation composite and the id of a constant
/// holding the target instruction's module position.
#[derive(Copy, Clone, Debug)]
pub struct InjectionData {
    pub stage_info_id: Id,
    pub inst_position_id: Id,
}

/// Coordinates of an insertion point inside a module.
///
/// Helpers that insert instructions advance `index`, so the instruction originally at the
/// cursor stays in front of it, the way the C-style iterator contract behaves.
#[derive(Copy, Clone, Debug)]
pub struct InjectionSite {
    pub function: usize,
    pub block: usize,
    pub index: usize,
}

/// One concrete check, instantiated per module run.
///
/// A pass may keep per-site scratch state between `analyze_instruction` and
/// `create_function_call`; the framework calls [`reset`](Self::reset) after every processed
/// site, and a pass instance must not be reused across modules.
pub trait InstrumentationPass {
    fn name(&self) -> &'static str;

    /// Whether the given instruction needs its check injected.
    fn analyze_instruction(&mut self, function: &Function, instruction: &Instruction) -> bool;

    /// Builds the `OpFunctionCall` to the pass's check function at `site` and returns its
    /// result id. The result must be boolean-shaped; the framework uses it as the guard
    /// condition when conditional guarding is enabled.
    fn create_function_call(
        &mut self,
        ctx: &mut PassContext<'_>,
        site: &mut InjectionSite,
        data: &InjectionData,
    ) -> Id;

    /// Clears per-site scratch state. Called by the framework after each injection.
    fn reset(&mut self);
}

/// Mutable view over the module handed to passes, carrying the memoization state for the
/// type-normalization helpers.
pub struct PassContext<'m> {
    module: &'m mut Module,
    convert_cache: HashMap<(Id, Id), Id>,
    cast_cache: HashMap<(Id, Id), Id>,
}

impl<'m> PassContext<'m> {
    fn new(module: &'m mut Module) -> Self {
        PassContext {
            module,
            convert_cache: HashMap::default(),
            cast_cache: HashMap::default(),
        }
    }

    #[inline]
    pub fn module(&self) -> &Module {
        self.module
    }

    #[inline]
    pub fn module_mut(&mut self) -> &mut Module {
        self.module
    }

    /// Inserts an instruction at the site and advances the cursor past it.
    pub fn insert_before(&mut self, site: &mut InjectionSite, inst: Instruction) {
        self.module
            .insert_in_block(site.function, site.block, site.index, inst);
        site.index += 1;
    }

    /// Inserts a call to `function_id` at the site and returns its result id.
    pub fn insert_function_call(
        &mut self,
        site: &mut InjectionSite,
        function_id: Id,
        result_type: Id,
        arguments: &[Id],
    ) -> Id {
        let result_id = self.module.alloc_id();
        let operands: SmallVec<[u32; 4]> = std::iter::once(function_id.as_raw())
            .chain(arguments.iter().map(|id| id.as_raw()))
            .collect();
        self.insert_before(
            site,
            Instruction::new(Op::FunctionCall, Some(result_type), Some(result_id), operands),
        );
        result_id
    }

    /// Returns the variable for a builtin, creating and decorating it on first request.
    pub fn get_builtin_variable(&mut self, builtin: BuiltIn) -> Variable {
        self.module.get_builtin_variable(builtin)
    }

    /// Looks up an existing decoration of `id`. Absence is not an error here; callers decide.
    pub fn get_decoration(&self, id: Id, decoration: Decoration) -> Option<&Instruction> {
        self.module.annotations.iter().find(|inst| {
            inst.opcode == Op::Decorate
                && inst.operand_id(0) == id
                && inst.operands[1] == decoration.as_u32()
        })
    }

    /// Looks up an existing decoration of member `member_index` of `id`.
    pub fn get_member_decoration(
        &self,
        id: Id,
        member_index: u32,
        decoration: Decoration,
    ) -> Option<&Instruction> {
        self.module.annotations.iter().find(|inst| {
            inst.opcode == Op::MemberDecorate
                && inst.operand_id(0) == id
                && inst.operands[1] == member_index
                && inst.operands[2] == decoration.as_u32()
        })
    }

    /// Synthesizes the stage/invocation composite for the current site and returns its id.
    ///
    /// The composite is four 32-bit words: the stage identifier followed by three
    /// stage-specific invocation coordinates (global invocation id, vertex/instance index,
    /// fragment coordinate), zero-padded.
    pub fn get_stage_info(&mut self, site: &mut InjectionSite) -> Id {
        let u32_t = self.module.type_uint32();
        let model = self.module.execution_model();
        let stage_const = self.module.const_u32(model.stage_id());
        let mut components: SmallVec<[Id; 4]> = SmallVec::new();
        components.push(stage_const);

        match model {
            ExecutionModel::Compute
            | ExecutionModel::RayGeneration
            | ExecutionModel::ClosestHit
            | ExecutionModel::Miss => {
                let builtin = if model == ExecutionModel::Compute {
                    BuiltIn::GlobalInvocationId
                } else {
                    BuiltIn::LaunchId
                };
                let variable = self.get_builtin_variable(builtin);
                let loaded = self.load_variable(site, &variable);
                for component in 0..3 {
                    let id = self.module.alloc_id();
                    self.insert_before(
                        site,
                        Instruction::new(
                            Op::CompositeExtract,
                            Some(u32_t),
                            Some(id),
                            [loaded.as_raw(), component],
                        ),
                    );
                    components.push(id);
                }
            }
            ExecutionModel::Vertex => {
                for builtin in [BuiltIn::VertexIndex, BuiltIn::InstanceIndex] {
                    let variable = self.get_builtin_variable(builtin);
                    let loaded = self.load_variable(site, &variable);
                    components.push(loaded);
                }
                components.push(self.module.const_u32(0));
            }
            ExecutionModel::Fragment => {
                let f32_t = self.module.type_float(32);
                let variable = self.get_builtin_variable(BuiltIn::FragCoord);
                let loaded = self.load_variable(site, &variable);
                for component in 0..2 {
                    let extracted = self.module.alloc_id();
                    self.insert_before(
                        site,
                        Instruction::new(
                            Op::CompositeExtract,
                            Some(f32_t),
                            Some(extracted),
                            [loaded.as_raw(), component],
                        ),
                    );
                    components.push(self.cast_to_uint32(extracted, site));
                }
                components.push(self.module.const_u32(0));
            }
        }

        let result_type = self.module.type_vector(u32_t, 4);
        let result_id = self.module.alloc_id();
        let operands: SmallVec<[u32; 4]> =
            components.iter().map(|id| id.as_raw()).collect();
        self.insert_before(
            site,
            Instruction::new(Op::CompositeConstruct, Some(result_type), Some(result_id), operands),
        );
        result_id
    }

    fn load_variable(&mut self, site: &mut InjectionSite, variable: &Variable) -> Id {
        let id = self.module.alloc_id();
        self.insert_before(
            site,
            Instruction::new(
                Op::Load,
                Some(variable.pointee_type_id),
                Some(id),
                [variable.id.as_raw()],
            ),
        );
        id
    }

    fn block_label(&self, site: &InjectionSite) -> Id {
        self.module.functions[site.function].blocks[site.block].label_id
    }

    /// Widens or narrows an integer value to 32 bits.
    ///
    /// If the value is already a 32-bit integer, its id is returned unchanged and nothing is
    /// emitted. Converting the same id twice at the same logical point yields the id of the
    /// first conversion instead of a duplicate instruction.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not an integer value; callers that assume integerness on arbitrary
    /// ids are misusing the helper.
    pub fn convert_to_32(&mut self, id: Id, site: &mut InjectionSite) -> Id {
        let type_id = self.module.type_of(id);
        let (width, signed) = self
            .module
            .int_type_info(type_id)
            .unwrap_or_else(|| panic!("convert_to_32 called on non-integer {}", id));
        if width == 32 {
            return id;
        }

        let key = (self.block_label(site), id);
        if let Some(&converted) = self.convert_cache.get(&key) {
            return converted;
        }

        let target_type = self.module.type_int(32, signed);
        let opcode = if signed { Op::SConvert } else { Op::UConvert };
        let converted = self.module.alloc_id();
        self.insert_before(
            site,
            Instruction::new(opcode, Some(target_type), Some(converted), [id.as_raw()]),
        );
        self.convert_cache.insert(key, converted);
        converted
    }

    /// Reinterprets a value as an unsigned 32-bit integer, converting the width first if
    /// needed. Follows the same no-op-if-already-right-type and idempotence rules as
    /// [`convert_to_32`](Self::convert_to_32).
    pub fn cast_to_uint32(&mut self, id: Id, site: &mut InjectionSite) -> Id {
        let u32_t = self.module.type_uint32();
        let type_id = self.module.type_of(id);
        if type_id == u32_t {
            return id;
        }

        let key = (self.block_label(site), id);
        if let Some(&cast) = self.cast_cache.get(&key) {
            return cast;
        }

        let cast = if let Some((_, _)) = self.module.int_type_info(type_id) {
            let converted = self.convert_to_32(id, site);
            if self.module.type_of(converted) == u32_t {
                converted
            } else {
                self.bitcast(site, converted, u32_t)
            }
        } else if self.module.float_type_info(type_id) == Some(32) {
            self.bitcast(site, id, u32_t)
        } else if self.module.is_pointer_type(type_id) {
            let result = self.module.alloc_id();
            self.insert_before(
                site,
                Instruction::new(Op::ConvertPtrToU, Some(u32_t), Some(result), [id.as_raw()]),
            );
            result
        } else {
            panic!("cast_to_uint32 called on unsupported value {}", id);
        };
        self.cast_cache.insert(key, cast);
        cast
    }

    fn bitcast(&mut self, site: &mut InjectionSite, id: Id, target_type: Id) -> Id {
        let result = self.module.alloc_id();
        self.insert_before(
            site,
            Instruction::new(Op::Bitcast, Some(target_type), Some(result), [id.as_raw()]),
        );
        result
    }
}

/// Drives one [`InstrumentationPass`] over a module.
///
/// `conditional_function_check` selects the guard strategy: when disabled, the surrounding
/// system has other means (such as hardware robustness) to avoid a crash on bad values, and
/// the check call is injected purely for its error-logging side effect.
pub struct PassEngine<'m> {
    ctx: PassContext<'m>,
    conditional_function_check: bool,
    target_instruction: Option<InstructionPosition>,
}

impl<'m> PassEngine<'m> {
    pub fn new(module: &'m mut Module, conditional_function_check: bool) -> Self {
        PassEngine {
            ctx: PassContext::new(module),
            conditional_function_check,
            target_instruction: None,
        }
    }

    /// Runs the pass over every instruction of every block of every function.
    ///
    /// Returns whether the module was modified.
    ///
    /// # Panics
    ///
    /// Panics if the module has already been sealed as instrumented; instrument once, cache
    /// the result, and go through the cache instead of re-running.
    pub fn run(&mut self, pass: &mut dyn InstrumentationPass) -> bool {
        assert!(
            !self.ctx.module.is_instrumented(),
            "module has already been instrumented; re-running a pass would double-inject"
        );

        let mut modified = false;
        for fi in 0..self.ctx.module.functions.len() {
            let mut bi = 0;
            'blocks: while bi < self.ctx.module.functions[fi].blocks.len() {
                let mut ii = 0;
                while ii < self.ctx.module.functions[fi].blocks[bi].instructions.len() {
                    let inst = self.ctx.module.functions[fi].blocks[bi].instructions[ii].clone();
                    let interested = {
                        let function = &self.ctx.module.functions[fi];
                        pass.analyze_instruction(function, &inst)
                    };
                    if !interested {
                        ii += 1;
                        continue;
                    }

                    self.target_instruction = Some(inst.position());
                    let index = self.find_target_instruction(fi, bi);
                    let mut site = InjectionSite {
                        function: fi,
                        block: bi,
                        index,
                    };
                    let data = self.build_injection_data(&mut site);
                    modified = true;

                    if self.conditional_function_check {
                        let merge_block = self.inject_conditional_function_check(pass, site, &data);
                        pass.reset();
                        self.target_instruction = None;
                        bi = merge_block;
                        continue 'blocks;
                    } else {
                        self.inject_function_check(pass, &mut site, &data);
                        pass.reset();
                        self.target_instruction = None;
                        // Continue past the unmodified target.
                        ii = site.index + 1;
                    }
                }
                bi += 1;
            }
        }
        modified
    }

    /// Re-locates the target instruction within its block.
    ///
    /// Required because injections earlier in the same run shift block contents; position is
    /// the only identity that survives.
    fn find_target_instruction(&self, function: usize, block: usize) -> usize {
        let target = self
            .target_instruction
            .expect("no target instruction recorded for this site");
        self.ctx.module.functions[function].blocks[block]
            .index_of_position(target)
            .expect("target instruction is no longer in its block")
    }

    fn build_injection_data(&mut self, site: &mut InjectionSite) -> InjectionData {
        let stage_info_id = self.ctx.get_stage_info(site);
        let position = self
            .target_instruction
            .expect("no target instruction recorded for this site");
        let inst_position_id = self.ctx.module.const_u32(position.0);
        InjectionData {
            stage_info_id,
            inst_position_id,
        }
    }
}
