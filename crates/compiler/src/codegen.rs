//! Final code generation: block-by-block translation of quads into
//! assembly for a MIPS-like target.
//!
//! Frame discipline: `$sp` is the base of the current frame, `$fp` is
//! set up for the frame of the next callee, `$s0` holds the global
//! frame pointer for the whole run. Offsets 0/-4/-8 of a frame hold
//! the return address, the static link and the return-value pointer;
//! parameters and locals live at -12, -16, ... in declaration order.
//! Non-local variables are reached by walking the static-link chain.

use crate::quads::{Quad, QuadGen, QuadOp};
use crate::symbols::{Entity, FunctionEntity, LookupResult, SymbolTable};

fn lookup_or_panic<'a>(table: &'a SymbolTable, name: &str) -> LookupResult<'a> {
    match table.lookup(name) {
        Some(result) => result,
        None => panic!("final generator: unknown name `{}`", name),
    }
}

fn entity_offset(entity: &Entity) -> usize {
    match entity.offset() {
        Some(offset) => offset,
        None => panic!("final generator: `{}` has no frame offset", entity.name()),
    }
}

fn function_or_panic<'a>(table: &'a SymbolTable, name: &str) -> &'a FunctionEntity {
    match lookup_or_panic(table, name).entity.as_function() {
        Some(f) => f,
        None => panic!("final generator: `{}` is not callable", name),
    }
}

fn frame_length_of(function: &FunctionEntity) -> usize {
    match function.frame_length {
        Some(frame_length) => frame_length,
        None => panic!(
            "final generator: `{}` has no frame length yet",
            function.name
        ),
    }
}

fn is_const(term: &str) -> bool {
    term.parse::<i64>().is_ok()
}

/// Accumulates the assembly lines for a whole compilation. The parser
/// drives it at every block close; [`QuadGen::get_and_mark_quads_from`]
/// guarantees each quad is translated exactly once.
#[derive(Debug, Default)]
pub struct FinalGen {
    generated: Vec<String>,
}

impl FinalGen {
    pub fn new() -> Self {
        FinalGen {
            generated: Vec::new(),
        }
    }

    /// The preamble jump over nested subprogram bodies to the program
    /// block's `begin_block`, which is always quad 0.
    pub fn generate_jump_to_main(&mut self) {
        self.generated.push("j L_0".to_string());
    }

    /// The exit syscall, emitted under the halt quad's label.
    pub fn generate_program_exit(&mut self, halt_quad: usize) {
        self.generated.push(format!("L_{}:", halt_quad));
        self.generated.push("li $v0, 10".to_string());
        self.generated.push("syscall".to_string());
    }

    /// Drain and translate the quads of the scope that is closing.
    ///
    /// `par` quads are buffered and emitted as the argument-setup
    /// block of the next `call`. Non-program blocks get the epilogue
    /// that reloads `$ra` and returns.
    pub fn generate_block(&mut self, table: &SymbolTable, quads: &mut QuadGen) {
        let current_level = table.get_current_nesting_level();
        let start_quad = if current_level == 0 {
            0
        } else {
            table.get_cause_of_birth().start_quad
        };

        let drained = quads.get_and_mark_quads_from(start_quad);
        let mut par_quads: Vec<Quad> = Vec::new();

        for quad in drained {
            if quad.op == QuadOp::Par {
                par_quads.push(quad);
                continue;
            }

            if quad.op == QuadOp::Call {
                let lines = self.precall_set_fp(table, &quad.term0);
                self.generated.extend(lines);
            }

            if !par_quads.is_empty() {
                let lines = self.setup_parameters(table, &par_quads);
                self.generated.extend(lines);
                par_quads.clear();
            }

            let lines = self.translate_quad(table, &quad);
            self.generated.extend(lines);
        }

        if current_level != 0 {
            self.generated.extend(Self::jump_to_ra());
        }
    }

    /// Assembly text: label lines flush left, instructions indented
    /// with one tab.
    pub fn formatted(&self) -> String {
        let mut out = String::new();
        for line in &self.generated {
            if line.ends_with(':') {
                out.push_str(line);
            } else {
                out.push('\t');
                out.push_str(line);
            }
            out.push('\n');
        }
        out
    }

    /// Address of a non-local, non-global variable into `$t0` by
    /// walking the static-link chain.
    fn gnlvcode(&self, table: &SymbolTable, var: &str) -> Vec<String> {
        let result = lookup_or_panic(table, var);
        let mut ret = vec!["lw $t0, -4($sp)".to_string()];
        for _ in 0..(table.get_current_nesting_level() - result.nesting_level) {
            ret.push("lw $t0, -4($t0)".to_string());
        }
        ret.push(format!("add $t0, $t0, -{}", entity_offset(result.entity)));
        ret
    }

    /// Shared body of `loadvr`/`storerv`: pick the access path from
    /// the variable's nesting level and parameter mode.
    fn store_load_rv(&self, table: &SymbolTable, op: &str, reg: usize, var: &str) -> Vec<String> {
        let result = lookup_or_panic(table, var);
        let current_level = table.get_current_nesting_level();
        let offset = entity_offset(result.entity);

        if result.nesting_level == 0 {
            return vec![format!("{} $t{}, -{}($s0)", op, reg, offset)];
        }

        if result.nesting_level == current_level {
            if result.entity.is_ref_parameter() {
                return vec![
                    format!("lw $t0, -{}($sp)", offset),
                    format!("{} $t{}, ($t0)", op, reg),
                ];
            }
            return vec![format!("{} $t{}, -{}($sp)", op, reg, offset)];
        }

        let mut ret = self.gnlvcode(table, var);
        if result.entity.is_ref_parameter() {
            ret.push("lw $t0, ($t0)".to_string());
        }
        ret.push(format!("{} $t{}, ($t0)", op, reg));
        ret
    }

    /// Load a variable or integer constant into `$t<reg>`.
    fn loadvr(&self, table: &SymbolTable, var: &str, reg: usize) -> Vec<String> {
        if is_const(var) {
            return vec![format!("li $t{}, {}", reg, var)];
        }
        self.store_load_rv(table, "lw", reg, var)
    }

    /// Store `$t<reg>` into a variable.
    fn storerv(&self, table: &SymbolTable, reg: usize, var: &str) -> Vec<String> {
        self.store_load_rv(table, "sw", reg, var)
    }

    fn precall_set_fp(&self, table: &SymbolTable, func_name: &str) -> Vec<String> {
        let callee = function_or_panic(table, func_name);
        vec![format!("add $fp, $sp, {}", frame_length_of(callee))]
    }

    fn jump_to_ra() -> Vec<String> {
        vec!["lw $ra, ($sp)".to_string(), "jr $ra".to_string()]
    }

    fn new_scope_setup(&self, table: &SymbolTable) -> Vec<String> {
        let mut ret = vec![
            format!("add $sp, $sp, {}", table.get_current_framelength()),
            "sw $ra, ($sp)".to_string(),
        ];
        if table.get_current_nesting_level() == 0 {
            ret.push("move $s0, $sp".to_string());
        }
        ret
    }

    /// Plant the callee's static link before `jal`: a callee declared
    /// at the caller's own level shares the caller's static link;
    /// otherwise the caller's frame is the link.
    fn init_call(&self, table: &SymbolTable, func_name: &str) -> Vec<String> {
        let result = lookup_or_panic(table, func_name);
        if table.get_current_nesting_level() == result.nesting_level {
            return vec![
                "lw $t0, -4($sp)".to_string(),
                "sw $t0, -4($fp)".to_string(),
            ];
        }
        vec!["sw $sp, -4($fp)".to_string()]
    }

    fn exit_scope(&self, table: &SymbolTable, func_name: &str) -> Vec<String> {
        let callee = function_or_panic(table, func_name);
        vec![format!("add $sp, $sp, -{}", frame_length_of(callee))]
    }

    /// Emit the buffered `par` quads of the upcoming call. The i-th
    /// actual parameter goes to offset 12 + 4i of the callee frame;
    /// the `ret` slot address goes to -8($fp).
    fn setup_parameters(&self, table: &SymbolTable, quads: &[Quad]) -> Vec<String> {
        let mut ret = Vec::new();

        for (i, quad) in quads.iter().enumerate() {
            ret.push(format!("L_{}:", quad.id));
            let slot = 12 + 4 * i;

            match quad.term1.as_str() {
                "cv" => {
                    ret.extend(self.loadvr(table, &quad.term0, 0));
                    ret.push(format!("sw $t0, -{}($fp)", slot));
                }
                "ref" => {
                    let result = lookup_or_panic(table, &quad.term0);
                    let caller_level = table.get_current_nesting_level();
                    if caller_level == result.nesting_level {
                        if result.entity.is_ref_parameter() {
                            ret.push(format!("lw $t0, -{}($sp)", entity_offset(result.entity)));
                        } else {
                            ret.push(format!("add $t0, $sp, -{}", entity_offset(result.entity)));
                        }
                        ret.push(format!("sw $t0, -{}($fp)", slot));
                    } else {
                        ret.extend(self.gnlvcode(table, &quad.term0));
                        if result.entity.is_ref_parameter() {
                            ret.push("lw $t0, ($t0)".to_string());
                        }
                        ret.push(format!("sw $t0, -{}($fp)", slot));
                    }
                }
                "ret" => {
                    let result = lookup_or_panic(table, &quad.term0);
                    ret.push(format!("add $t0, $sp, -{}", entity_offset(result.entity)));
                    ret.push("sw $t0, -8($fp)".to_string());
                }
                other => panic!("final generator: unsupported parameter mode `{}`", other),
            }
        }
        ret
    }

    fn translate_quad(&self, table: &SymbolTable, quad: &Quad) -> Vec<String> {
        let qid = format!("L_{}:", quad.id);

        match quad.op {
            QuadOp::BeginBlock => {
                let mut ret = vec![qid, format!("{}:", quad.term0)];
                ret.extend(self.new_scope_setup(table));
                ret
            }

            // Structural markers keep their label so jumps can land on
            // them; the program-end halt gets its syscall separately.
            QuadOp::EndBlock | QuadOp::Int | QuadOp::Halt | QuadOp::Par => vec![qid],

            QuadOp::Assign => {
                let mut ret = vec![qid];
                ret.extend(self.loadvr(table, &quad.term0, 1));
                ret.extend(self.storerv(table, 1, &quad.target));
                ret
            }

            QuadOp::Add | QuadOp::Sub | QuadOp::Mul | QuadOp::Div => {
                let mnemonic = match quad.op {
                    QuadOp::Add => "add",
                    QuadOp::Sub => "sub",
                    QuadOp::Mul => "mul",
                    _ => "div",
                };
                let mut ret = vec![qid];
                ret.extend(self.loadvr(table, &quad.term0, 1));
                ret.extend(self.loadvr(table, &quad.term1, 2));
                ret.push(format!("{} $t1, $t1, $t2", mnemonic));
                ret.extend(self.storerv(table, 1, &quad.target));
                ret
            }

            QuadOp::Jump => vec![qid, format!("j L_{}", quad.target)],

            QuadOp::Eq | QuadOp::Neq | QuadOp::Gt | QuadOp::Lt | QuadOp::Ge | QuadOp::Le => {
                let mnemonic = match quad.op {
                    QuadOp::Eq => "beq",
                    QuadOp::Neq => "bne",
                    QuadOp::Gt => "bgt",
                    QuadOp::Lt => "blt",
                    QuadOp::Ge => "bge",
                    _ => "ble",
                };
                let mut ret = vec![qid];
                ret.extend(self.loadvr(table, &quad.term0, 1));
                ret.extend(self.loadvr(table, &quad.term1, 2));
                ret.push(format!("{} $t1, $t2, L_{}", mnemonic, quad.target));
                ret
            }

            QuadOp::Retv => {
                let mut ret = vec![qid];
                ret.extend(self.loadvr(table, &quad.term0, 1));
                ret.push("lw $t0, -8($sp)".to_string());
                ret.push("sw $t1, ($t0)".to_string());
                ret.extend(Self::jump_to_ra());
                ret
            }

            QuadOp::Call => {
                let mut ret = self.init_call(table, &quad.term0);
                ret.push(qid);
                ret.push(format!("jal {}", quad.term0));
                ret.extend(self.exit_scope(table, &quad.term0));
                ret
            }

            QuadOp::Out => {
                let mut ret = vec![qid];
                ret.extend(self.loadvr(table, &quad.term0, 1));
                ret.push("li $v0, 1".to_string());
                ret.push("move $a0, $t1".to_string());
                ret.push("syscall".to_string());
                ret.push("li $a0, 0xA".to_string());
                ret.push("li $v0, 0xB".to_string());
                ret.push("syscall".to_string());
                ret
            }

            QuadOp::Inp => {
                let mut ret = vec![qid];
                ret.push("li $v0, 5".to_string());
                ret.push("syscall".to_string());
                ret.push("move $t3, $v0".to_string());
                ret.extend(self.storerv(table, 3, &quad.term0));
                ret
            }
        }
    }
}
