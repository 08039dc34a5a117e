//! Control-flow-splitting primitives behind the conditional guard strategy.

use super::{InjectionData, InjectionSite, InstrumentationPass, PassEngine};
use crate::spirv::{BasicBlock, Instruction, Op};

impl PassEngine<'_> {
    /// Injects the check call and guards the target instruction behind its result.
    ///
    /// The call itself always executes before the branch decision is made: it both tests
    /// validity and logs the error as a side effect, and only its boolean result feeds the
    /// branch. A write-shaped target is simply skipped on the invalid path; a read-shaped
    /// target is replaced by zero through a phi in the merge block, so downstream uses stay
    /// well-defined either way.
    ///
    /// Returns the index of the merge block, where iteration resumes.
    pub(super) fn inject_conditional_function_check(
        &mut self,
        pass: &mut dyn InstrumentationPass,
        mut site: InjectionSite,
        data: &InjectionData,
    ) -> usize {
        let condition = pass.create_function_call(&mut self.ctx, &mut site, data);

        let module = self.ctx.module_mut();
        let fi = site.function;
        let bi = site.block;

        // Everything from the target onwards leaves the original block.
        let mut tail = module.functions[fi].blocks[bi]
            .instructions
            .split_off(site.index);
        let target = tail.remove(0);
        assert!(
            !matches!(
                target.opcode,
                Op::Branch | Op::BranchConditional | Op::Return | Op::ReturnValue
            ),
            "cannot guard a block terminator"
        );
        let original_result = target.result_id;
        let read_shaped = target.is_read_shaped();

        let valid_label = module.alloc_id();
        let invalid_label = read_shaped.then(|| module.alloc_id());
        let merge_label = module.alloc_id();

        module.append_to_block(
            fi,
            bi,
            Instruction::new(Op::SelectionMerge, None, None, [merge_label.as_raw(), 0]),
        );
        module.append_to_block(
            fi,
            bi,
            Instruction::new(
                Op::BranchConditional,
                None,
                None,
                [
                    condition.as_raw(),
                    valid_label.as_raw(),
                    invalid_label.unwrap_or(merge_label).as_raw(),
                ],
            ),
        );

        // Valid path: the target executes, then falls through to the merge block. The target
        // keeps its position and result id.
        let mut valid_block = BasicBlock::new(valid_label);
        valid_block.instructions.push(target);
        module.functions[fi].blocks.insert(bi + 1, valid_block);
        module.append_to_block(
            fi,
            bi + 1,
            Instruction::new(Op::Branch, None, None, [merge_label.as_raw()]),
        );

        let mut merge_block_index = bi + 2;
        if let Some(invalid_label) = invalid_label {
            let invalid_block = BasicBlock::new(invalid_label);
            module.functions[fi].blocks.insert(bi + 2, invalid_block);
            module.append_to_block(
                fi,
                bi + 2,
                Instruction::new(Op::Branch, None, None, [merge_label.as_raw()]),
            );
            merge_block_index = bi + 3;
        }

        // The rest of the original block becomes the merge block.
        let mut merge_block = BasicBlock::new(merge_label);
        merge_block.instructions = tail;
        module
            .functions[fi]
            .blocks
            .insert(merge_block_index, merge_block);

        if read_shaped {
            let original_result =
                original_result.expect("read-shaped target must produce a result");
            let result_type = module.type_of(original_result);
            let zero = module.const_null(result_type);
            let phi_id = module.alloc_id();
            module.insert_in_block(
                fi,
                merge_block_index,
                0,
                Instruction::new(
                    Op::Phi,
                    Some(result_type),
                    Some(phi_id),
                    [
                        original_result.as_raw(),
                        valid_label.as_raw(),
                        zero.as_raw(),
                        invalid_label
                            .expect("read-shaped guard always has an invalid block")
                            .as_raw(),
                    ],
                ),
            );
            module.replace_uses(original_result, phi_id, Some(valid_label), Some(phi_id));
        }

        merge_block_index
    }

    /// Injects the check call without touching control flow.
    ///
    /// The call's result is ignored and the target instruction's behavior is left completely
    /// unmodified; the check still logs detected violations.
    pub(super) fn inject_function_check(
        &mut self,
        pass: &mut dyn InstrumentationPass,
        site: &mut InjectionSite,
        data: &InjectionData,
    ) {
        let _ = pass.create_function_call(&mut self.ctx, site, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{PassContext, PassEngine};
    use crate::spirv::{
        BasicBlock, ExecutionModel, Function, Id, Instruction, Module, Op, StorageClass,
    };

    /// A pass that targets every `OpLoad` (or `OpStore`) and calls a fixed check function.
    struct OpcodePass {
        opcode: Op,
        check_function: Id,
        target_found: bool,
        resets: usize,
    }

    impl OpcodePass {
        fn new(opcode: Op, check_function: Id) -> Self {
            OpcodePass {
                opcode,
                check_function,
                target_found: false,
                resets: 0,
            }
        }
    }

    impl super::InstrumentationPass for OpcodePass {
        fn name(&self) -> &'static str {
            "opcode_test_pass"
        }

        fn analyze_instruction(&mut self, _function: &Function, inst: &Instruction) -> bool {
            if inst.opcode != self.opcode {
                return false;
            }
            self.target_found = true;
            true
        }

        fn create_function_call(
            &mut self,
            ctx: &mut PassContext<'_>,
            site: &mut super::InjectionSite,
            data: &InjectionData,
        ) -> Id {
            assert!(self.target_found);
            let bool_t = ctx.module_mut().type_bool();
            ctx.insert_function_call(
                site,
                self.check_function,
                bool_t,
                &[data.stage_info_id, data.inst_position_id],
            )
        }

        fn reset(&mut self) {
            self.target_found = false;
            self.resets += 1;
        }
    }

    /// Compute module with one function: `%val = OpLoad %data_ptr` then
    /// `OpStore %out_ptr %val` then `OpReturn`.
    fn test_module() -> (Module, Id, Id) {
        let mut module = Module::new(ExecutionModel::Compute);
        let void_t = module.type_void();
        let u32_t = module.type_uint32();
        let ptr_t = module.type_pointer(StorageClass::StorageBuffer, u32_t);

        let data_ptr = module.alloc_id();
        let out_ptr = module.alloc_id();
        let load_result = module.alloc_id();

        let fn_id = module.alloc_id();
        let fi = module.add_function(Function::new(fn_id, void_t));
        let label = module.alloc_id();
        module.add_block(fi, BasicBlock::new(label));
        // Pointers live as function-external ids here; the framework only follows the
        // operands it rewrites.
        let _ = ptr_t;
        module.append_to_block(
            fi,
            0,
            Instruction::new(Op::Load, Some(u32_t), Some(load_result), [data_ptr.as_raw()]),
        );
        module.append_to_block(
            fi,
            0,
            Instruction::new(
                Op::Store,
                None,
                None,
                [out_ptr.as_raw(), load_result.as_raw()],
            ),
        );
        module.append_to_block(fi, 0, Instruction::new(Op::Return, None, None, []));
        (module, load_result, data_ptr)
    }

    #[test]
    fn conditional_read_guard_splits_and_merges_through_phi() {
        let (mut module, load_result, _) = test_module();
        let check_function = module.alloc_id();
        let mut pass = OpcodePass::new(Op::Load, check_function);

        let mut engine = PassEngine::new(&mut module, true);
        assert!(engine.run(&mut pass));
        assert_eq!(pass.resets, 1);

        // Original block, valid block, invalid block, merge block.
        let blocks = &module.functions()[0].blocks;
        assert_eq!(blocks.len(), 4);

        // The original block ends with the selection construct, preceded by the check call.
        let entry = &blocks[0];
        let n = entry.instructions.len();
        assert_eq!(entry.instructions[n - 2].opcode, Op::SelectionMerge);
        assert_eq!(entry.instructions[n - 1].opcode, Op::BranchConditional);
        let call = entry
            .instructions
            .iter()
            .find(|inst| inst.opcode == Op::FunctionCall)
            .expect("check call must be in the unconditional part");
        assert_eq!(call.operand_id(0), check_function);
        // The call result drives the branch.
        assert_eq!(
            entry.instructions[n - 1].operand_id(0),
            call.result_id.unwrap()
        );

        // The load executes only in the valid block.
        let valid = &blocks[1];
        assert_eq!(valid.instructions[0].opcode, Op::Load);
        assert_eq!(valid.instructions[0].result_id, Some(load_result));
        assert_eq!(valid.instructions.last().unwrap().opcode, Op::Branch);

        // The invalid block is a plain fallthrough.
        let invalid = &blocks[2];
        assert_eq!(invalid.instructions.len(), 1);
        assert_eq!(invalid.instructions[0].opcode, Op::Branch);

        // The merge block starts with the phi and the displaced store now consumes the phi
        // result instead of the raw load result.
        let merge = &blocks[3];
        let phi = &merge.instructions[0];
        assert_eq!(phi.opcode, Op::Phi);
        assert_eq!(phi.operand_id(0), load_result);
        let store = merge
            .instructions
            .iter()
            .find(|inst| inst.opcode == Op::Store)
            .unwrap();
        assert_eq!(store.operand_id(1), phi.result_id.unwrap());
    }

    #[test]
    fn conditional_write_guard_skips_without_substitute() {
        let (mut module, _, _) = test_module();
        let check_function = module.alloc_id();
        let mut pass = OpcodePass::new(Op::Store, check_function);

        let mut engine = PassEngine::new(&mut module, true);
        assert!(engine.run(&mut pass));

        // Original block, valid block, merge block; no invalid block and no phi.
        let blocks = &module.functions()[0].blocks;
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1].instructions[0].opcode, Op::Store);
        assert!(blocks[2]
            .instructions
            .iter()
            .all(|inst| inst.opcode != Op::Phi));

        // On failure the store is skipped entirely: false branch goes straight to merge.
        let entry = &blocks[0];
        let branch = entry.instructions.last().unwrap();
        assert_eq!(branch.opcode, Op::BranchConditional);
        assert_eq!(branch.operand_id(2), blocks[2].label_id);
    }

    #[test]
    fn unconditional_check_leaves_control_flow_untouched() {
        let (mut module, load_result, _) = test_module();
        let check_function = module.alloc_id();
        let mut pass = OpcodePass::new(Op::Load, check_function);

        let mut engine = PassEngine::new(&mut module, false);
        assert!(engine.run(&mut pass));

        let blocks = &module.functions()[0].blocks;
        assert_eq!(blocks.len(), 1);
        let insts = &blocks[0].instructions;
        assert!(insts.iter().all(|inst| {
            inst.opcode != Op::BranchConditional && inst.opcode != Op::Phi
        }));

        // The call precedes the load; the load and its consumers are unmodified.
        let call_index = insts
            .iter()
            .position(|inst| inst.opcode == Op::FunctionCall)
            .unwrap();
        let load_index = insts
            .iter()
            .position(|inst| inst.opcode == Op::Load && inst.result_id == Some(load_result))
            .unwrap();
        assert!(call_index < load_index);
        let store = insts.iter().find(|inst| inst.opcode == Op::Store).unwrap();
        assert_eq!(store.operand_id(1), load_result);
    }

    #[test]
    fn uninterested_pass_modifies_nothing() {
        let (mut module, _, _) = test_module();
        let check_function = module.alloc_id();
        // OpAccessChain never appears in the test module.
        let mut pass = OpcodePass::new(Op::AccessChain, check_function);

        let before = module.functions()[0].blocks[0].instructions.len();
        let mut engine = PassEngine::new(&mut module, true);
        assert!(!engine.run(&mut pass));
        assert_eq!(pass.resets, 0);
        assert_eq!(module.functions()[0].blocks[0].instructions.len(), before);
    }

    #[test]
    #[should_panic(expected = "already been instrumented")]
    fn running_on_sealed_module_is_rejected() {
        let (mut module, _, _) = test_module();
        let check_function = module.alloc_id();
        module.seal_instrumented();
        let mut pass = OpcodePass::new(Op::Load, check_function);
        let mut engine = PassEngine::new(&mut module, true);
        engine.run(&mut pass);
    }

    #[test]
    fn convert_and_cast_are_idempotent_at_one_point() {
        let mut module = Module::new(ExecutionModel::Compute);
        let void_t = module.type_void();
        let u64_t = module.type_int(64, false);
        let wide = module.alloc_id();

        let fn_id = module.alloc_id();
        let fi = module.add_function(Function::new(fn_id, void_t));
        let label = module.alloc_id();
        module.add_block(fi, BasicBlock::new(label));
        module.append_to_block(fi, 0, Instruction::new(Op::Undef, Some(u64_t), Some(wide), []));
        module.append_to_block(fi, 0, Instruction::new(Op::Return, None, None, []));

        let mut engine = PassEngine::new(&mut module, true);
        let mut site = super::InjectionSite {
            function: 0,
            block: 0,
            index: 1,
        };
        let before = engine.ctx.module().functions()[0].blocks[0].instructions.len();
        let first = engine.ctx.convert_to_32(wide, &mut site);
        let second = engine.ctx.convert_to_32(wide, &mut site);
        assert_eq!(first, second);
        assert_ne!(first, wide);
        let after = engine.ctx.module().functions()[0].blocks[0].instructions.len();
        assert_eq!(after, before + 1);

        // Converting a value that is already 32 bits wide is a no-op.
        let mut module2 = Module::new(ExecutionModel::Compute);
        let void_t = module2.type_void();
        let u32_t = module2.type_uint32();
        let narrow = module2.alloc_id();
        let fn_id = module2.alloc_id();
        let fi = module2.add_function(Function::new(fn_id, void_t));
        let label = module2.alloc_id();
        module2.add_block(fi, BasicBlock::new(label));
        module2.append_to_block(
            fi,
            0,
            Instruction::new(Op::Undef, Some(u32_t), Some(narrow), []),
        );
        let mut engine2 = PassEngine::new(&mut module2, true);
        let mut site2 = super::InjectionSite {
            function: 0,
            block: 0,
            index: 1,
        };
        assert_eq!(engine2.ctx.cast_to_uint32(narrow, &mut site2), narrow);
        assert_eq!(engine2.ctx.module().functions()[0].blocks[0].instructions.len(), 1);
    }

    #[test]
    fn cast_of_signed_and_float_values_bitcasts_once() {
        let mut module = Module::new(ExecutionModel::Compute);
        let void_t = module.type_void();
        let i32_t = module.type_int(32, true);
        let f32_t = module.type_float(32);
        let signed = module.alloc_id();
        let float = module.alloc_id();

        let fn_id = module.alloc_id();
        let fi = module.add_function(Function::new(fn_id, void_t));
        let label = module.alloc_id();
        module.add_block(fi, BasicBlock::new(label));
        module.append_to_block(fi, 0, Instruction::new(Op::Undef, Some(i32_t), Some(signed), []));
        module.append_to_block(fi, 0, Instruction::new(Op::Undef, Some(f32_t), Some(float), []));

        let mut engine = PassEngine::new(&mut module, true);
        let mut site = super::InjectionSite {
            function: 0,
            block: 0,
            index: 2,
        };
        let a = engine.ctx.cast_to_uint32(signed, &mut site);
        let b = engine.ctx.cast_to_uint32(signed, &mut site);
        assert_eq!(a, b);
        assert_ne!(a, signed);
        let c = engine.ctx.cast_to_uint32(float, &mut site);
        assert_ne!(c, float);

        let bitcasts = engine.ctx.module().functions()[0].blocks[0]
            .instructions
            .iter()
            .filter(|inst| inst.opcode == Op::Bitcast)
            .count();
        assert_eq!(bitcasts, 2);
    }
}
