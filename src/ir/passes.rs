use std::fmt::Write as _;
use std::io::{self, Write};

use tracing::debug;

use crate::arena::IrArena;
use crate::front::ast::BinOp;

use super::{FunctionOutput, Inst, IrFunction, Reloc, RelocKind, Symbol, fold_binary};

/// A per-function pass context over a worker's arena.
///
/// Mirrors the enter → optimize/print/codegen → exit discipline of the
/// backend: `enter` snapshots the body, `exit` releases the context.
pub struct PassContext<'a> {
    symbol: &'a Symbol,
    arena: &'a mut IrArena,
    body: Option<IrFunction>,
}

impl<'a> PassContext<'a> {
    pub fn enter(symbol: &'a Symbol, arena: &'a mut IrArena) -> Self {
        let body = symbol.body_snapshot();
        Self {
            symbol,
            arena,
            body,
        }
    }

    pub fn exit(self) {}

    /// Fold constant subtrees. Branch targets index instructions, so folding
    /// is restricted to straight-line bodies.
    pub fn optimize(&mut self) {
        let Some(body) = &mut self.body else { return };
        if body
            .insts
            .iter()
            .any(|inst| matches!(inst, Inst::BranchZero(_) | Inst::Jump(_)))
        {
            return;
        }

        let mut out: Vec<Inst> = Vec::with_capacity(body.insts.len());
        let stack = self.arena.values();
        stack.clear();
        // Entries mirror the runtime stack; i64::MIN marks a non-constant.
        const OPAQUE: i64 = i64::MIN;

        for inst in body.insts.drain(..) {
            match inst {
                Inst::PushConst(value) => {
                    out.push(Inst::PushConst(value));
                    stack.push(value);
                }
                Inst::Binary(op) => {
                    let rhs = stack.pop().unwrap_or(OPAQUE);
                    let lhs = stack.pop().unwrap_or(OPAQUE);
                    let tail_is_const = out.len() >= 2
                        && matches!(out[out.len() - 1], Inst::PushConst(_))
                        && matches!(out[out.len() - 2], Inst::PushConst(_));
                    if lhs != OPAQUE && rhs != OPAQUE && tail_is_const {
                        out.pop();
                        out.pop();
                        let folded = fold_binary(op, lhs, rhs);
                        out.push(Inst::PushConst(folded));
                        stack.push(folded);
                    } else {
                        out.push(Inst::Binary(op));
                        stack.push(OPAQUE);
                    }
                }
                Inst::Neg | Inst::Not => {
                    let operand = stack.pop().unwrap_or(OPAQUE);
                    let tail_is_const =
                        matches!(out.last(), Some(Inst::PushConst(_)));
                    if operand != OPAQUE && tail_is_const {
                        out.pop();
                        let folded = if matches!(inst, Inst::Neg) {
                            operand.wrapping_neg()
                        } else {
                            i64::from(operand == 0)
                        };
                        out.push(Inst::PushConst(folded));
                        stack.push(folded);
                    } else {
                        out.push(inst);
                        stack.push(OPAQUE);
                    }
                }
                Inst::PushLocal(_) | Inst::PushGlobal(_) | Inst::PushGlobalAddr(_) => {
                    out.push(inst);
                    stack.push(OPAQUE);
                }
                Inst::StoreLocal(_) | Inst::StoreGlobal(_) | Inst::Pop => {
                    stack.pop();
                    out.push(inst);
                }
                Inst::Call { callee, argc } => {
                    for _ in 0..argc {
                        stack.pop();
                    }
                    out.push(Inst::Call { callee, argc });
                    stack.push(OPAQUE);
                }
                Inst::Ret { has_value } => {
                    if has_value {
                        stack.pop();
                    }
                    out.push(Inst::Ret { has_value });
                }
                Inst::BranchZero(_) | Inst::Jump(_) => unreachable!("straight-line only"),
            }
        }
        body.insts = out;
    }

    /// Print the IR listing.
    ///
    /// # Errors
    ///
    /// Returns an error if `out` rejects a write.
    pub fn print(&self, out: &mut dyn Write) -> io::Result<()> {
        let Some(body) = &self.body else {
            return Ok(());
        };
        writeln!(
            out,
            "fn {} (locals: {}, returns: {})",
            self.symbol.name, body.local_count, body.returns_value
        )?;
        for (idx, inst) in body.insts.iter().enumerate() {
            writeln!(out, "  {idx:3}: {inst:?}")?;
        }
        Ok(())
    }

    /// Encode the body as x86-64 machine code, recording relocations for
    /// calls and data accesses. Stores the output on the symbol and returns
    /// a copy for the caller to print.
    pub fn codegen(&mut self, emit_asm: bool) -> Option<FunctionOutput> {
        let body = self.body.as_ref()?;
        let output = encode_x86_64(&self.symbol.name, body, emit_asm);
        debug!(name = %self.symbol.name, bytes = output.code.len(), "codegen");
        self.symbol.set_output(output.clone());
        Some(output)
    }
}

const ARG_REG_POPS: [&[u8]; 6] = [
    &[0x5F],       // pop rdi
    &[0x5E],       // pop rsi
    &[0x5A],       // pop rdx
    &[0x59],       // pop rcx
    &[0x41, 0x58], // pop r8
    &[0x41, 0x59], // pop r9
];

const ARG_REG_NAMES: [&str; 6] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];

pub(crate) fn encode_x86_64(name: &str, body: &IrFunction, emit_asm: bool) -> FunctionOutput {
    let mut code: Vec<u8> = Vec::new();
    let mut relocs: Vec<Reloc> = Vec::new();
    let mut asm = emit_asm.then(|| format!("{name}:\n"));
    let mut fixups: Vec<(usize, usize)> = Vec::new();
    let mut offsets: Vec<usize> = Vec::with_capacity(body.insts.len() + 1);

    let frame = (body.local_count * 8).next_multiple_of(16);
    // push rbp; mov rbp, rsp
    code.extend_from_slice(&[0x55, 0x48, 0x89, 0xE5]);
    emit_line(&mut asm, "push rbp");
    emit_line(&mut asm, "mov rbp, rsp");
    if frame > 0 {
        code.extend_from_slice(&[0x48, 0x81, 0xEC]);
        code.extend_from_slice(&(frame as u32).to_le_bytes());
        emit_line(&mut asm, &format!("sub rsp, {frame}"));
    }

    let local_disp = |slot: usize| -> [u8; 4] {
        let disp = -8 * (i32::try_from(slot).unwrap_or(0) + 1);
        disp.to_le_bytes()
    };

    for inst in &body.insts {
        offsets.push(code.len());
        match inst {
            Inst::PushConst(value) => {
                code.extend_from_slice(&[0x48, 0xB8]);
                code.extend_from_slice(&value.to_le_bytes());
                code.push(0x50);
                emit_line(&mut asm, &format!("movabs rax, {value}"));
                emit_line(&mut asm, "push rax");
            }
            Inst::PushLocal(slot) => {
                code.extend_from_slice(&[0x48, 0x8B, 0x85]);
                code.extend_from_slice(&local_disp(*slot));
                code.push(0x50);
                emit_line(&mut asm, &format!("mov rax, [rbp{}]", -8 * (*slot as i64 + 1)));
                emit_line(&mut asm, "push rax");
            }
            Inst::StoreLocal(slot) => {
                code.push(0x58);
                code.extend_from_slice(&[0x48, 0x89, 0x85]);
                code.extend_from_slice(&local_disp(*slot));
                emit_line(&mut asm, "pop rax");
                emit_line(&mut asm, &format!("mov [rbp{}], rax", -8 * (*slot as i64 + 1)));
            }
            Inst::PushGlobal(symbol) => {
                code.extend_from_slice(&[0x48, 0x8B, 0x05]);
                relocs.push(Reloc {
                    offset: code.len(),
                    symbol: symbol.clone(),
                    kind: RelocKind::Rip32,
                });
                code.extend_from_slice(&[0; 4]);
                code.push(0x50);
                emit_line(&mut asm, &format!("mov rax, [rip + {symbol}]"));
                emit_line(&mut asm, "push rax");
            }
            Inst::PushGlobalAddr(symbol) => {
                code.extend_from_slice(&[0x48, 0x8D, 0x05]);
                relocs.push(Reloc {
                    offset: code.len(),
                    symbol: symbol.clone(),
                    kind: RelocKind::Rip32,
                });
                code.extend_from_slice(&[0; 4]);
                code.push(0x50);
                emit_line(&mut asm, &format!("lea rax, [rip + {symbol}]"));
                emit_line(&mut asm, "push rax");
            }
            Inst::StoreGlobal(symbol) => {
                code.push(0x58);
                code.extend_from_slice(&[0x48, 0x89, 0x05]);
                relocs.push(Reloc {
                    offset: code.len(),
                    symbol: symbol.clone(),
                    kind: RelocKind::Rip32,
                });
                code.extend_from_slice(&[0; 4]);
                emit_line(&mut asm, "pop rax");
                emit_line(&mut asm, &format!("mov [rip + {symbol}], rax"));
            }
            Inst::Binary(op) => {
                // rhs into rcx, lhs into rax
                code.extend_from_slice(&[0x59, 0x58]);
                emit_line(&mut asm, "pop rcx");
                emit_line(&mut asm, "pop rax");
                encode_binary(&mut code, &mut asm, *op);
                code.push(0x50);
                emit_line(&mut asm, "push rax");
            }
            Inst::Neg => {
                code.extend_from_slice(&[0x58, 0x48, 0xF7, 0xD8, 0x50]);
                emit_line(&mut asm, "pop rax");
                emit_line(&mut asm, "neg rax");
                emit_line(&mut asm, "push rax");
            }
            Inst::Not => {
                code.extend_from_slice(&[
                    0x58, 0x48, 0x85, 0xC0, 0x0F, 0x94, 0xC0, 0x48, 0x0F, 0xB6, 0xC0, 0x50,
                ]);
                emit_line(&mut asm, "pop rax");
                emit_line(&mut asm, "test rax, rax");
                emit_line(&mut asm, "sete al");
                emit_line(&mut asm, "movzx rax, al");
                emit_line(&mut asm, "push rax");
            }
            Inst::Call { callee, argc } => {
                // Arguments sit on the stack rightmost-deepest, so forward
                // pops fill rdi..r9 with args 0..5 and the rest stay put as
                // the SysV stack arguments.
                let in_regs = (*argc).min(ARG_REG_POPS.len());
                for (pop, name) in ARG_REG_POPS.iter().zip(ARG_REG_NAMES).take(in_regs) {
                    code.extend_from_slice(pop);
                    emit_line(&mut asm, &format!("pop {name}"));
                }
                code.push(0xE8);
                relocs.push(Reloc {
                    offset: code.len(),
                    symbol: callee.clone(),
                    kind: RelocKind::Call,
                });
                code.extend_from_slice(&[0; 4]);
                emit_line(&mut asm, &format!("call {callee}"));
                let spilled = *argc - in_regs;
                if spilled > 0 {
                    let bytes = (spilled * 8) as u32;
                    code.extend_from_slice(&[0x48, 0x81, 0xC4]);
                    code.extend_from_slice(&bytes.to_le_bytes());
                    emit_line(&mut asm, &format!("add rsp, {bytes}"));
                }
                code.push(0x50);
                emit_line(&mut asm, "push rax");
            }
            Inst::BranchZero(target) => {
                code.extend_from_slice(&[0x58, 0x48, 0x85, 0xC0, 0x0F, 0x84]);
                fixups.push((code.len(), *target));
                code.extend_from_slice(&[0; 4]);
                emit_line(&mut asm, "pop rax");
                emit_line(&mut asm, "test rax, rax");
                emit_line(&mut asm, &format!("jz .L{target}"));
            }
            Inst::Jump(target) => {
                code.push(0xE9);
                fixups.push((code.len(), *target));
                code.extend_from_slice(&[0; 4]);
                emit_line(&mut asm, &format!("jmp .L{target}"));
            }
            Inst::Pop => {
                code.push(0x58);
                emit_line(&mut asm, "pop rax");
            }
            Inst::Ret { has_value } => {
                if *has_value {
                    code.push(0x58);
                    emit_line(&mut asm, "pop rax");
                } else {
                    code.extend_from_slice(&[0x48, 0x31, 0xC0]);
                    emit_line(&mut asm, "xor rax, rax");
                }
                code.extend_from_slice(&[0x48, 0x89, 0xEC, 0x5D, 0xC3]);
                emit_line(&mut asm, "mov rsp, rbp");
                emit_line(&mut asm, "pop rbp");
                emit_line(&mut asm, "ret");
            }
        }
    }
    offsets.push(code.len());

    for (pos, target) in fixups {
        let rel = i64::try_from(offsets[target]).unwrap_or(0) - i64::try_from(pos + 4).unwrap_or(0);
        let rel = i32::try_from(rel).unwrap_or(0);
        code[pos..pos + 4].copy_from_slice(&rel.to_le_bytes());
    }

    FunctionOutput {
        code,
        relocs,
        asm,
    }
}

fn encode_binary(code: &mut Vec<u8>, asm: &mut Option<String>, op: BinOp) {
    match op {
        BinOp::Add => {
            code.extend_from_slice(&[0x48, 0x01, 0xC8]);
            emit_line(asm, "add rax, rcx");
        }
        BinOp::Sub => {
            code.extend_from_slice(&[0x48, 0x29, 0xC8]);
            emit_line(asm, "sub rax, rcx");
        }
        BinOp::Mul => {
            code.extend_from_slice(&[0x48, 0x0F, 0xAF, 0xC1]);
            emit_line(asm, "imul rax, rcx");
        }
        BinOp::Div => {
            code.extend_from_slice(&[0x48, 0x99, 0x48, 0xF7, 0xF9]);
            emit_line(asm, "cqo");
            emit_line(asm, "idiv rcx");
        }
        BinOp::Mod => {
            code.extend_from_slice(&[0x48, 0x99, 0x48, 0xF7, 0xF9, 0x48, 0x89, 0xD0]);
            emit_line(asm, "cqo");
            emit_line(asm, "idiv rcx");
            emit_line(asm, "mov rax, rdx");
        }
        BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
            let (setcc, mnemonic) = match op {
                BinOp::Lt => (0x9C, "setl"),
                BinOp::Gt => (0x9F, "setg"),
                BinOp::Le => (0x9E, "setle"),
                BinOp::Ge => (0x9D, "setge"),
                BinOp::Eq => (0x94, "sete"),
                _ => (0x95, "setne"),
            };
            code.extend_from_slice(&[0x48, 0x39, 0xC8, 0x0F, setcc, 0xC0, 0x48, 0x0F, 0xB6, 0xC0]);
            emit_line(asm, "cmp rax, rcx");
            emit_line(asm, &format!("{mnemonic} al"));
            emit_line(asm, "movzx rax, al");
        }
    }
}

fn emit_line(asm: &mut Option<String>, line: &str) {
    if let Some(asm) = asm {
        let _ = writeln!(asm, "  {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::PassContext;
    use crate::arena::IrArena;
    use crate::args::{Arch, TargetOs};
    use crate::front::ast::BinOp;
    use crate::ir::{Inst, IrFunction, Linkage, Module, RelocKind, SymKind};

    fn function_symbol(insts: Vec<Inst>, locals: usize) -> std::sync::Arc<crate::ir::Symbol> {
        let module = Module::new(Arch::X86_64, TargetOs::Linux, false);
        let symbol = module.intern("f", Linkage::Export, SymKind::Function, 0);
        let body = IrFunction {
            insts,
            local_count: locals,
            returns_value: true,
        };
        assert!(symbol.claim_body(body));
        symbol
    }

    #[test]
    fn constant_folding_collapses_straight_line_bodies() {
        let symbol = function_symbol(
            vec![
                Inst::PushConst(6),
                Inst::PushConst(7),
                Inst::Binary(BinOp::Mul),
                Inst::Ret { has_value: true },
            ],
            0,
        );
        let mut arena = IrArena::new();
        let mut pass = PassContext::enter(&symbol, &mut arena);
        pass.optimize();
        let mut out = Vec::new();
        pass.print(&mut out).unwrap();
        let listing = String::from_utf8(out).unwrap();
        assert!(listing.contains("PushConst(42)"));
        assert!(!listing.contains("Binary"));
        pass.exit();
    }

    #[test]
    fn codegen_of_return_zero_is_tiny_and_ends_in_ret() {
        let symbol = function_symbol(
            vec![Inst::PushConst(0), Inst::Ret { has_value: true }],
            0,
        );
        let mut arena = IrArena::new();
        let mut pass = PassContext::enter(&symbol, &mut arena);
        let output = pass.codegen(true).unwrap();
        pass.exit();

        assert_eq!(output.code.last(), Some(&0xC3));
        assert!(output.relocs.is_empty());
        let asm = output.asm.unwrap();
        assert!(asm.contains("movabs rax, 0"));
        assert!(asm.contains("ret"));
        assert!(symbol.output_snapshot().is_some());
    }

    #[test]
    fn calls_record_relocations() {
        let symbol = function_symbol(
            vec![
                Inst::PushConst(1),
                Inst::Call {
                    callee: "helper".to_string(),
                    argc: 1,
                },
                Inst::Ret { has_value: true },
            ],
            0,
        );
        let mut arena = IrArena::new();
        let mut pass = PassContext::enter(&symbol, &mut arena);
        let output = pass.codegen(false).unwrap();
        pass.exit();

        assert_eq!(output.relocs.len(), 1);
        assert_eq!(output.relocs[0].symbol, "helper");
        assert_eq!(output.relocs[0].kind, RelocKind::Call);
        assert!(output.relocs[0].offset + 4 <= output.code.len());
    }

    #[test]
    fn seven_argument_calls_spill_to_the_stack() {
        let insts: Vec<Inst> = (0..7i64)
            .map(Inst::PushConst)
            .chain([
                Inst::Call {
                    callee: "sum7".to_string(),
                    argc: 7,
                },
                Inst::Ret { has_value: true },
            ])
            .collect();
        let symbol = function_symbol(insts, 0);
        let mut arena = IrArena::new();
        let mut pass = PassContext::enter(&symbol, &mut arena);
        let output = pass.codegen(true).unwrap();
        pass.exit();

        let asm = output.asm.unwrap();
        // six register pops in SysV order, the seventh stays a stack argument
        let rdi = asm.find("pop rdi").unwrap();
        let r9 = asm.find("pop r9").unwrap();
        assert!(rdi < r9);
        assert!(asm.contains("add rsp, 8"));
        assert_eq!(output.code.last(), Some(&0xC3));
    }

    #[test]
    fn branch_fixups_stay_in_bounds() {
        // while (x) x = x - 1; return x;
        let symbol = function_symbol(
            vec![
                Inst::PushLocal(0),
                Inst::BranchZero(6),
                Inst::PushLocal(0),
                Inst::PushConst(1),
                Inst::Binary(BinOp::Sub),
                Inst::StoreLocal(0),
                Inst::PushLocal(0),
                Inst::Ret { has_value: true },
            ],
            1,
        );
        let mut arena = IrArena::new();
        let mut pass = PassContext::enter(&symbol, &mut arena);
        // branchy body: optimize must be a no-op
        pass.optimize();
        let output = pass.codegen(false).unwrap();
        pass.exit();
        assert_eq!(output.code.last(), Some(&0xC3));
    }
}
