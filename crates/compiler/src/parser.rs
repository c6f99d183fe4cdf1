//! Recursive-descent parser and semantic driver.
//!
//! The parser is the top-level scheduler of the whole compilation: it
//! validates syntax with one token of lookahead, emits quads with
//! on-the-fly backpatching for control flow and short-circuit
//! booleans, maintains the scoped symbol table, and flushes the final
//! generator at every block close. State is mutated in the order the
//! productions are written; reordering calls changes the emitted code.

use crate::codegen::FinalGen;
use crate::error::CompileError;
use crate::lexer::{Position, Token, TokenKind};
use crate::quads::{QuadGen, QuadOp, UNUSED};
use crate::symbols::{Argument, CallableKind, Entity, FunctionEntity, ParMode, SymbolTable};

type ParseResult<T> = Result<T, CompileError>;

/// The pending jump lists of a boolean expression: quads to patch to
/// the "condition holds" label and to the "condition fails" label.
#[derive(Debug, Default)]
struct TrueFalse {
    true_list: Vec<usize>,
    false_list: Vec<usize>,
}

#[derive(Debug)]
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Position of the last consumed token, used by semantic errors.
    last_pos: Position,
    pub table: SymbolTable,
    pub quads: QuadGen,
    pub final_gen: FinalGen,
    /// Pending `exit` jumps of the innermost open `repeat`; outer
    /// lists are stashed on the call stack across nesting.
    exits: Vec<usize>,
    inside_repeat: usize,
    /// One "has a return been seen" flag per open function body.
    returns_of_scopes: Vec<bool>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            pos: 0,
            last_pos: Position::start(),
            table: SymbolTable::new(),
            quads: QuadGen::new(),
            final_gen: FinalGen::new(),
            exits: Vec::new(),
            inside_repeat: 0,
            returns_of_scopes: Vec::new(),
        }
    }

    /// Parse the whole token stream, driving quad emission and final
    /// code generation along the way.
    pub fn parse(&mut self) -> ParseResult<()> {
        self.parse_program()?;
        if let Some(extra) = self.tokens.get(self.pos) {
            return Err(CompileError::new(
                extra.pos,
                "Unexpected token after endprogram.",
            ));
        }
        Ok(())
    }

    fn eof_error(&self) -> CompileError {
        CompileError::with_suggestion(
            self.last_pos,
            "Unexpected end of file.",
            "Maybe endprogram is missing.",
        )
    }

    fn peek_kind(&self) -> ParseResult<TokenKind> {
        match self.tokens.get(self.pos) {
            Some(token) => Ok(token.kind),
            None => Err(self.eof_error()),
        }
    }

    fn peek(&self, kind: TokenKind) -> ParseResult<bool> {
        Ok(self.peek_kind()? == kind)
    }

    fn consume(&mut self, kind: TokenKind) -> ParseResult<Token> {
        let token = match self.tokens.get(self.pos) {
            Some(token) => token.clone(),
            None => return Err(self.eof_error()),
        };
        if token.kind != kind {
            let suggestion = match token.kind {
                TokenKind::Id => Some("Maybe a \";\" or a \",\" is missing."),
                _ => None,
            };
            let message = format!(
                "Expected token of type `{}`, got `{}` (`{}`).",
                kind.name(),
                token.kind.name(),
                token.value
            );
            return Err(match suggestion {
                Some(s) => CompileError::with_suggestion(token.pos, message, s),
                None => CompileError::new(token.pos, message),
            });
        }
        self.pos += 1;
        self.last_pos = token.pos;
        Ok(token)
    }

    // ------------------------------------------------------------------
    // Semantic checks
    // ------------------------------------------------------------------

    fn ensure_we_do_not_redeclare(&self, name: &str) -> ParseResult<()> {
        if self.table.lookup_on_current_scope(name).is_some() {
            return Err(CompileError::new(
                self.last_pos,
                format!("Redeclaring {} is not allowed.", name),
            ));
        }
        Ok(())
    }

    fn error_incorrect_use(&self, name: &str, as_kind: &str) -> CompileError {
        CompileError::new(
            self.last_pos,
            format!("Using \"{}\" as a {} but it's not one.", name, as_kind),
        )
    }

    fn ensure_a_valid_variable(&self, name: &str) -> ParseResult<()> {
        if !self.table.has_a_variable(name) {
            return Err(self.error_incorrect_use(name, "variable"));
        }
        Ok(())
    }

    fn ensure_a_valid_procedure(&self, name: &str) -> ParseResult<()> {
        if !self.table.has_a_procedure(name) {
            return Err(self.error_incorrect_use(name, "procedure"));
        }
        Ok(())
    }

    fn ensure_a_valid_function(&self, name: &str) -> ParseResult<()> {
        if !self.table.has_a_function(name) {
            return Err(self.error_incorrect_use(name, "function"));
        }
        Ok(())
    }

    fn ensure_signature(&self, name: &str, modes: &[ParMode]) -> ParseResult<()> {
        if !self.table.has_a_callable_with_signature(name, modes) {
            return Err(CompileError::new(
                self.last_pos,
                format!("Invalid signature for \"{}\".", name),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Program structure
    // ------------------------------------------------------------------

    fn parse_program(&mut self) -> ParseResult<()> {
        self.consume(TokenKind::Program)?;
        let name = self.consume(TokenKind::Id)?.value;

        self.final_gen.generate_jump_to_main();
        self.quads.genquad(QuadOp::BeginBlock, &name, UNUSED, UNUSED);
        self.parse_block()?;

        let halt_quad = self.quads.nextquad();
        self.quads.genquad(QuadOp::Halt, UNUSED, UNUSED, UNUSED);
        self.quads.genquad(QuadOp::EndBlock, &name, UNUSED, UNUSED);
        self.final_gen.generate_program_exit(halt_quad);

        self.consume(TokenKind::Endprogram)?;
        Ok(())
    }

    /// A block owns a scope. Once its statements are parsed the
    /// callee's frame length is known, the accumulated quads are
    /// flushed to assembly, and the scope dies.
    fn parse_block(&mut self) -> ParseResult<()> {
        self.table.create_scope();
        self.parse_declarations()?;
        self.parse_subprograms()?;
        self.parse_statements()?;

        self.table.fill_in_framelength_on_callee();
        self.final_gen.generate_block(&self.table, &mut self.quads);
        self.table.destroy_scope();
        Ok(())
    }

    fn parse_declarations(&mut self) -> ParseResult<()> {
        if self.peek(TokenKind::Declare)? {
            self.consume(TokenKind::Declare)?;
            self.parse_varlist()?;
            self.consume(TokenKind::Enddeclare)?;
        }
        Ok(())
    }

    fn parse_varlist(&mut self) -> ParseResult<()> {
        if self.peek(TokenKind::Id)? {
            self.declare_variable()?;
            while self.peek(TokenKind::Comma)? {
                self.consume(TokenKind::Comma)?;
                self.declare_variable()?;
            }
        }
        Ok(())
    }

    fn declare_variable(&mut self) -> ParseResult<()> {
        let name = self.consume(TokenKind::Id)?.value;
        self.ensure_we_do_not_redeclare(&name)?;
        self.quads.genquad(QuadOp::Int, &name, UNUSED, UNUSED);
        self.table.add_entity(Entity::Variable { name, offset: None });
        Ok(())
    }

    fn parse_subprograms(&mut self) -> ParseResult<()> {
        while self.peek(TokenKind::Procedure)? || self.peek(TokenKind::Function)? {
            self.parse_procorfunc()?;
        }
        Ok(())
    }

    /// Declare the callable in the enclosing scope before opening its
    /// body, so parameter synthesis can find it there.
    fn parse_procorfunc(&mut self) -> ParseResult<()> {
        if self.peek(TokenKind::Procedure)? {
            self.consume(TokenKind::Procedure)?;
            let name = self.consume(TokenKind::Id)?.value;
            self.ensure_we_do_not_redeclare(&name)?;
            self.table.add_entity(Entity::Function(FunctionEntity {
                name: name.clone(),
                start_quad: self.quads.nextquad(),
                arguments: Vec::new(),
                frame_length: None,
                kind: CallableKind::Procedure,
            }));
            self.quads.genquad(QuadOp::BeginBlock, &name, UNUSED, UNUSED);
            self.parse_procorfuncbody()?;
            self.quads.genquad(QuadOp::EndBlock, &name, UNUSED, UNUSED);
            self.consume(TokenKind::Endprocedure)?;
        } else {
            self.consume(TokenKind::Function)?;
            let name = self.consume(TokenKind::Id)?.value;
            self.ensure_we_do_not_redeclare(&name)?;
            self.table.add_entity(Entity::Function(FunctionEntity {
                name: name.clone(),
                start_quad: self.quads.nextquad(),
                arguments: Vec::new(),
                frame_length: None,
                kind: CallableKind::Function,
            }));
            self.returns_of_scopes.push(false);
            self.quads.genquad(QuadOp::BeginBlock, &name, UNUSED, UNUSED);
            self.parse_procorfuncbody()?;
            self.quads.genquad(QuadOp::EndBlock, &name, UNUSED, UNUSED);
            self.consume(TokenKind::Endfunction)?;

            let has_return = self.returns_of_scopes.pop().unwrap_or(false);
            if !has_return {
                return Err(CompileError::with_suggestion(
                    self.last_pos,
                    "End of function block and no return found.",
                    "Did you forget to return?",
                ));
            }
        }
        Ok(())
    }

    fn parse_procorfuncbody(&mut self) -> ParseResult<()> {
        self.parse_formalpars()?;
        self.parse_block()
    }

    fn parse_formalpars(&mut self) -> ParseResult<()> {
        self.consume(TokenKind::Oparen)?;
        self.parse_formalparlist()?;
        self.consume(TokenKind::Cparen)?;
        Ok(())
    }

    fn parse_formalparlist(&mut self) -> ParseResult<()> {
        if self.peek(TokenKind::In)? || self.peek(TokenKind::Inout)? {
            self.parse_formalparitem()?;
            while self.peek(TokenKind::Comma)? {
                self.consume(TokenKind::Comma)?;
                self.parse_formalparitem()?;
            }
        }
        Ok(())
    }

    fn parse_formalparitem(&mut self) -> ParseResult<()> {
        let mode = if self.peek(TokenKind::In)? {
            self.consume(TokenKind::In)?;
            ParMode::Cv
        } else {
            self.consume(TokenKind::Inout)?;
            ParMode::Ref
        };
        let name = self.consume(TokenKind::Id)?.value;
        self.table.add_argument(Argument { name, mode });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_statements(&mut self) -> ParseResult<()> {
        self.parse_statement()?;
        while self.peek(TokenKind::Semicolon)? {
            self.consume(TokenKind::Semicolon)?;
            self.parse_statement()?;
        }
        Ok(())
    }

    /// One token of lookahead picks the production; anything else is
    /// the empty statement.
    fn parse_statement(&mut self) -> ParseResult<()> {
        match self.peek_kind()? {
            TokenKind::Id => self.parse_assignmentstat(),
            TokenKind::If => self.parse_ifstat(),
            TokenKind::While => self.parse_whilestat(),
            TokenKind::Repeat => self.parse_repeatstat(),
            TokenKind::Exit => self.parse_exitstat(),
            TokenKind::Switch => self.parse_switchstat(),
            TokenKind::Forcase => self.parse_forcasestat(),
            TokenKind::Call => self.parse_callstat(),
            TokenKind::Return => self.parse_returnstat(),
            TokenKind::Input => self.parse_inputstat(),
            TokenKind::Print => self.parse_printstat(),
            _ => Ok(()),
        }
    }

    fn parse_assignmentstat(&mut self) -> ParseResult<()> {
        let target = self.consume(TokenKind::Id)?.value;
        self.ensure_a_valid_variable(&target)?;
        self.consume(TokenKind::Assign)?;
        let value = self.parse_expression()?;
        self.quads.genquad(QuadOp::Assign, &value, UNUSED, &target);
        Ok(())
    }

    fn parse_ifstat(&mut self) -> ParseResult<()> {
        self.consume(TokenKind::If)?;
        let cond = self.parse_condition()?;
        self.consume(TokenKind::Then)?;

        let then_start = self.quads.nextquad();
        self.quads.backpatch(&cond.true_list, then_start);
        self.parse_statements()?;

        let after_if_jump = self.quads.nextquad();
        self.quads.genquad(QuadOp::Jump, UNUSED, UNUSED, UNUSED);

        let else_start = self.quads.nextquad();
        self.quads.backpatch(&cond.false_list, else_start);
        self.parse_elsepart()?;
        self.consume(TokenKind::Endif)?;

        let after_else = self.quads.nextquad();
        self.quads.backpatch(&[after_if_jump], after_else);
        Ok(())
    }

    fn parse_elsepart(&mut self) -> ParseResult<()> {
        if self.peek(TokenKind::Else)? {
            self.consume(TokenKind::Else)?;
            self.parse_statements()?;
        }
        Ok(())
    }

    fn parse_whilestat(&mut self) -> ParseResult<()> {
        self.consume(TokenKind::While)?;
        let pre_cond = self.quads.nextquad();
        let cond = self.parse_condition()?;

        let in_while = self.quads.nextquad();
        self.quads.backpatch(&cond.true_list, in_while);
        self.parse_statements()?;
        self.quads
            .genquad(QuadOp::Jump, UNUSED, UNUSED, &pre_cond.to_string());

        let after_while = self.quads.nextquad();
        self.quads.backpatch(&cond.false_list, after_while);
        self.consume(TokenKind::Endwhile)?;
        Ok(())
    }

    fn parse_repeatstat(&mut self) -> ParseResult<()> {
        self.consume(TokenKind::Repeat)?;
        let in_repeat = self.quads.nextquad();
        self.inside_repeat += 1;

        let old_exits = std::mem::take(&mut self.exits);
        self.parse_statements()?;
        self.quads
            .genquad(QuadOp::Jump, UNUSED, UNUSED, &in_repeat.to_string());

        let after_repeat = self.quads.nextquad();
        let exits = std::mem::replace(&mut self.exits, old_exits);
        self.quads.backpatch(&exits, after_repeat);

        self.consume(TokenKind::Endrepeat)?;
        self.inside_repeat -= 1;
        Ok(())
    }

    fn parse_exitstat(&mut self) -> ParseResult<()> {
        self.consume(TokenKind::Exit)?;
        if self.inside_repeat < 1 {
            return Err(CompileError::with_suggestion(
                self.last_pos,
                "Found exit outside a repeat block.",
                "Remove the exit?",
            ));
        }
        self.exits.push(self.quads.nextquad());
        self.quads.genquad(QuadOp::Jump, UNUSED, UNUSED, UNUSED);
        Ok(())
    }

    /// The scrutinee is evaluated once; every case compares against it
    /// with a `<>` jump to the next case and collects a jump past the
    /// whole switch.
    fn parse_switchstat(&mut self) -> ParseResult<()> {
        self.consume(TokenKind::Switch)?;
        let scrutinee = self.parse_expression()?;

        let mut jumps_when_done = self.parse_case(&scrutinee)?;
        while self.peek(TokenKind::Case)? {
            jumps_when_done.extend(self.parse_case(&scrutinee)?);
        }

        self.consume(TokenKind::Endswitch)?;
        let after_switch = self.quads.nextquad();
        self.quads.backpatch(&jumps_when_done, after_switch);
        Ok(())
    }

    fn parse_case(&mut self, scrutinee: &str) -> ParseResult<Vec<usize>> {
        self.consume(TokenKind::Case)?;
        let case_expr = self.parse_expression()?;

        let neq_quad = self.quads.nextquad();
        self.quads
            .genquad(QuadOp::Neq, scrutinee, &case_expr, UNUSED);

        self.consume(TokenKind::Colon)?;
        self.parse_statements()?;

        let jump_when_done = self.quads.nextquad();
        self.quads.genquad(QuadOp::Jump, UNUSED, UNUSED, UNUSED);

        let next_case = self.quads.nextquad();
        self.quads.backpatch(&[neq_quad], next_case);
        Ok(vec![jump_when_done])
    }

    /// A fresh flag temporary records whether any guard fired; the
    /// final `(=, 1, flag, start)` quad re-enters the loop while one
    /// did.
    fn parse_forcasestat(&mut self) -> ParseResult<()> {
        self.consume(TokenKind::Forcase)?;
        let in_forcase = self.quads.nextquad();
        let any_true_flag = self.quads.newtemp(&mut self.table);
        self.quads
            .genquad(QuadOp::Assign, "0", UNUSED, &any_true_flag);

        self.parse_when(&any_true_flag)?;
        while self.peek(TokenKind::When)? {
            self.parse_when(&any_true_flag)?;
        }

        self.quads
            .genquad(QuadOp::Eq, "1", &any_true_flag, &in_forcase.to_string());
        self.consume(TokenKind::Endforcase)?;
        Ok(())
    }

    fn parse_when(&mut self, any_true_flag: &str) -> ParseResult<()> {
        self.consume(TokenKind::When)?;
        let cond = self.parse_condition()?;
        self.consume(TokenKind::Colon)?;

        let when_ok = self.quads.nextquad();
        self.quads.backpatch(&cond.true_list, when_ok);
        self.quads
            .genquad(QuadOp::Assign, "1", UNUSED, any_true_flag);
        self.parse_statements()?;

        let next_when = self.quads.nextquad();
        self.quads.backpatch(&cond.false_list, next_when);
        Ok(())
    }

    fn parse_callstat(&mut self) -> ParseResult<()> {
        self.consume(TokenKind::Call)?;
        let name = self.consume(TokenKind::Id)?.value;
        self.ensure_a_valid_procedure(&name)?;
        let modes = self.parse_actualpars()?;
        self.ensure_signature(&name, &modes)?;
        self.quads.genquad(QuadOp::Call, &name, UNUSED, UNUSED);
        Ok(())
    }

    fn parse_returnstat(&mut self) -> ParseResult<()> {
        self.consume(TokenKind::Return)?;
        let value = self.parse_expression()?;
        self.quads.genquad(QuadOp::Retv, &value, UNUSED, UNUSED);

        if !self.table.am_i_inside_function() {
            return Err(CompileError::with_suggestion(
                self.last_pos,
                "Found stray return outside function block.",
                "Remove the stray return.",
            ));
        }
        if let Some(has_return) = self.returns_of_scopes.last_mut() {
            *has_return = true;
        }
        Ok(())
    }

    fn parse_printstat(&mut self) -> ParseResult<()> {
        self.consume(TokenKind::Print)?;
        let value = self.parse_expression()?;
        self.quads.genquad(QuadOp::Out, &value, UNUSED, UNUSED);
        Ok(())
    }

    fn parse_inputstat(&mut self) -> ParseResult<()> {
        self.consume(TokenKind::Input)?;
        let name = self.consume(TokenKind::Id)?.value;
        self.ensure_a_valid_variable(&name)?;
        self.quads.genquad(QuadOp::Inp, &name, UNUSED, UNUSED);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Actual parameters
    // ------------------------------------------------------------------

    fn parse_actualpars(&mut self) -> ParseResult<Vec<ParMode>> {
        self.consume(TokenKind::Oparen)?;
        let modes = self.parse_actualparlist()?;
        self.consume(TokenKind::Cparen)?;
        Ok(modes)
    }

    fn parse_actualparlist(&mut self) -> ParseResult<Vec<ParMode>> {
        let mut modes = Vec::new();
        if self.peek(TokenKind::In)? || self.peek(TokenKind::Inout)? {
            modes.push(self.parse_actualparitem()?);
            while self.peek(TokenKind::Comma)? {
                self.consume(TokenKind::Comma)?;
                modes.push(self.parse_actualparitem()?);
            }
        }
        Ok(modes)
    }

    fn parse_actualparitem(&mut self) -> ParseResult<ParMode> {
        if self.peek(TokenKind::In)? {
            self.consume(TokenKind::In)?;
            let value = self.parse_expression()?;
            self.quads
                .genquad(QuadOp::Par, &value, ParMode::Cv.as_str(), UNUSED);
            Ok(ParMode::Cv)
        } else {
            self.consume(TokenKind::Inout)?;
            let name = self.consume(TokenKind::Id)?.value;
            self.ensure_a_valid_variable(&name)?;
            self.quads
                .genquad(QuadOp::Par, &name, ParMode::Ref.as_str(), UNUSED);
            Ok(ParMode::Ref)
        }
    }

    // ------------------------------------------------------------------
    // Conditions (short-circuit via backpatch-list merging)
    // ------------------------------------------------------------------

    fn parse_condition(&mut self) -> ParseResult<TrueFalse> {
        let mut cond = self.parse_boolterm()?;

        while self.peek(TokenKind::Or)? {
            self.consume(TokenKind::Or)?;
            // A false left operand falls through to try the right one.
            let right_start = self.quads.nextquad();
            self.quads.backpatch(&cond.false_list, right_start);

            let right = self.parse_boolterm()?;
            cond.true_list.extend(right.true_list);
            cond.false_list = right.false_list;
        }
        Ok(cond)
    }

    fn parse_boolterm(&mut self) -> ParseResult<TrueFalse> {
        let mut term = self.parse_boolfactor()?;

        while self.peek(TokenKind::And)? {
            self.consume(TokenKind::And)?;
            // A true left operand falls through to test the right one.
            let right_start = self.quads.nextquad();
            self.quads.backpatch(&term.true_list, right_start);

            let right = self.parse_boolfactor()?;
            term.false_list.extend(right.false_list);
            term.true_list = right.true_list;
        }
        Ok(term)
    }

    fn parse_boolfactor(&mut self) -> ParseResult<TrueFalse> {
        if self.peek(TokenKind::Not)? {
            self.consume(TokenKind::Not)?;
            self.consume(TokenKind::Obracket)?;
            let cond = self.parse_condition()?;
            self.consume(TokenKind::Cbracket)?;
            Ok(TrueFalse {
                true_list: cond.false_list,
                false_list: cond.true_list,
            })
        } else if self.peek(TokenKind::Obracket)? {
            self.consume(TokenKind::Obracket)?;
            let cond = self.parse_condition()?;
            self.consume(TokenKind::Cbracket)?;
            Ok(cond)
        } else if self.peek(TokenKind::True)? {
            self.consume(TokenKind::True)?;
            let jump = self.quads.nextquad();
            self.quads.genquad(QuadOp::Jump, UNUSED, UNUSED, UNUSED);
            Ok(TrueFalse {
                true_list: vec![jump],
                false_list: Vec::new(),
            })
        } else if self.peek(TokenKind::False)? {
            self.consume(TokenKind::False)?;
            let jump = self.quads.nextquad();
            self.quads.genquad(QuadOp::Jump, UNUSED, UNUSED, UNUSED);
            Ok(TrueFalse {
                true_list: Vec::new(),
                false_list: vec![jump],
            })
        } else {
            let left = self.parse_expression()?;
            let relop = self.parse_relationaloper()?;
            let right = self.parse_expression()?;

            let relop_quad = self.quads.nextquad();
            self.quads.genquad(relop, &left, &right, UNUSED);
            let jump_quad = self.quads.nextquad();
            self.quads.genquad(QuadOp::Jump, UNUSED, UNUSED, UNUSED);
            Ok(TrueFalse {
                true_list: vec![relop_quad],
                false_list: vec![jump_quad],
            })
        }
    }

    fn parse_relationaloper(&mut self) -> ParseResult<QuadOp> {
        match self.peek_kind()? {
            TokenKind::Eq => {
                self.consume(TokenKind::Eq)?;
                Ok(QuadOp::Eq)
            }
            TokenKind::Le => {
                self.consume(TokenKind::Le)?;
                Ok(QuadOp::Le)
            }
            TokenKind::Ge => {
                self.consume(TokenKind::Ge)?;
                Ok(QuadOp::Ge)
            }
            TokenKind::Lt => {
                self.consume(TokenKind::Lt)?;
                Ok(QuadOp::Lt)
            }
            TokenKind::Gt => {
                self.consume(TokenKind::Gt)?;
                Ok(QuadOp::Gt)
            }
            _ => {
                self.consume(TokenKind::Neq)?;
                Ok(QuadOp::Neq)
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// Left-associative additive chain. A leading minus negates the
    /// accumulated result by multiplying with the literal -1.
    fn parse_expression(&mut self) -> ParseResult<String> {
        let negated = self.parse_optionalsign()?;
        let mut value = self.parse_term()?;

        while self.peek(TokenKind::Plus)? || self.peek(TokenKind::Minus)? {
            let op = self.parse_addoper()?;
            let right = self.parse_term()?;
            let target = self.quads.newtemp(&mut self.table);
            self.quads.genquad(op, &value, &right, &target);
            value = target;
        }

        if negated {
            let signed = self.quads.newtemp(&mut self.table);
            self.quads.genquad(QuadOp::Mul, &value, "-1", &signed);
            value = signed;
        }
        Ok(value)
    }

    fn parse_term(&mut self) -> ParseResult<String> {
        let mut value = self.parse_factor()?;

        while self.peek(TokenKind::Mul)? || self.peek(TokenKind::Div)? {
            let op = self.parse_muloper()?;
            let right = self.parse_factor()?;
            let target = self.quads.newtemp(&mut self.table);
            self.quads.genquad(op, &value, &right, &target);
            value = target;
        }
        Ok(value)
    }

    fn parse_factor(&mut self) -> ParseResult<String> {
        if self.peek(TokenKind::Oparen)? {
            self.consume(TokenKind::Oparen)?;
            let value = self.parse_expression()?;
            self.consume(TokenKind::Cparen)?;
            Ok(value)
        } else if self.peek(TokenKind::Id)? {
            let name = self.consume(TokenKind::Id)?.value;
            match self.parse_idtail(&name)? {
                Some(return_slot) => {
                    self.quads.genquad(QuadOp::Call, &name, UNUSED, UNUSED);
                    Ok(return_slot)
                }
                None => {
                    self.ensure_a_valid_variable(&name)?;
                    Ok(name)
                }
            }
        } else {
            Ok(self.consume(TokenKind::Int)?.value)
        }
    }

    /// A `(` after an identifier makes it a function call. The return
    /// slot is a fresh temporary registered as a `ret`-mode parameter
    /// of the current scope, announced to the callee with a
    /// `(par, T_k, ret, _)` quad before the `call`.
    fn parse_idtail(&mut self, fn_name: &str) -> ParseResult<Option<String>> {
        if !self.peek(TokenKind::Oparen)? {
            return Ok(None);
        }

        let modes = self.parse_actualpars()?;
        self.ensure_a_valid_function(fn_name)?;
        self.ensure_signature(fn_name, &modes)?;

        let return_slot = self.quads.newtemp_unregistered();
        self.quads
            .genquad(QuadOp::Par, &return_slot, ParMode::Ret.as_str(), UNUSED);
        self.table.add_entity(Entity::Parameter {
            name: return_slot.clone(),
            mode: ParMode::Ret,
            offset: None,
        });
        Ok(Some(return_slot))
    }

    fn parse_addoper(&mut self) -> ParseResult<QuadOp> {
        if self.peek(TokenKind::Plus)? {
            self.consume(TokenKind::Plus)?;
            Ok(QuadOp::Add)
        } else {
            self.consume(TokenKind::Minus)?;
            Ok(QuadOp::Sub)
        }
    }

    fn parse_muloper(&mut self) -> ParseResult<QuadOp> {
        if self.peek(TokenKind::Mul)? {
            self.consume(TokenKind::Mul)?;
            Ok(QuadOp::Mul)
        } else {
            self.consume(TokenKind::Div)?;
            Ok(QuadOp::Div)
        }
    }

    /// Returns true when the expression carries a leading minus.
    fn parse_optionalsign(&mut self) -> ParseResult<bool> {
        if self.peek(TokenKind::Plus)? || self.peek(TokenKind::Minus)? {
            return Ok(self.parse_addoper()? == QuadOp::Sub);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::quads::Quad;

    fn parse(source: &str) -> Result<Parser, CompileError> {
        let tokens = Lexer::new(source).tokenize()?;
        let mut parser = Parser::new(tokens);
        parser.parse()?;
        Ok(parser)
    }

    fn quad_tuples(parser: &Parser) -> Vec<(String, String, String, String)> {
        parser
            .quads
            .quads()
            .iter()
            .map(|q: &Quad| {
                (
                    q.op.to_string(),
                    q.term0.clone(),
                    q.term1.clone(),
                    q.target.clone(),
                )
            })
            .collect()
    }

    #[test]
    fn test_declarations_arithmetic_and_print() {
        let parser = parse(
            "program p declare x, y enddeclare x := 3 + 4; print x endprogram",
        )
        .unwrap();

        let quads = quad_tuples(&parser);
        let expect = |op: &str, t0: &str, t1: &str, target: &str| {
            (
                op.to_string(),
                t0.to_string(),
                t1.to_string(),
                target.to_string(),
            )
        };
        assert_eq!(quads[0], expect("begin_block", "p", "_", "_"));
        assert_eq!(quads[1], expect("int", "x", "_", "_"));
        assert_eq!(quads[2], expect("int", "y", "_", "_"));
        assert_eq!(quads[3], expect("+", "3", "4", "T_0"));
        assert_eq!(quads[4], expect(":=", "T_0", "_", "x"));
        assert_eq!(quads[5], expect("out", "x", "_", "_"));
        assert_eq!(quads[6], expect("halt", "_", "_", "_"));
        assert_eq!(quads[7], expect("end_block", "p", "_", "_"));
    }

    #[test]
    fn test_if_else_backpatching() {
        let parser = parse(
            "program p declare x, y enddeclare \
             if x = 0 then y := 1 else y := 2 endif endprogram",
        )
        .unwrap();

        let quads = parser.quads.quads();
        // 3: (=, x, 0, 5)   true jump to the then-branch
        // 4: (jump, _, _, 7) false jump to the else-branch
        // 5: (:=, 1, _, y)
        // 6: (jump, _, _, 8) skip the else-branch
        // 7: (:=, 2, _, y)
        assert_eq!(quads[3].op, QuadOp::Eq);
        assert_eq!(quads[3].target, "5");
        assert_eq!(quads[4].op, QuadOp::Jump);
        assert_eq!(quads[4].target, "7");
        assert_eq!(quads[6].op, QuadOp::Jump);
        assert_eq!(quads[6].target, "8");
    }

    #[test]
    fn test_while_loops_back_to_condition() {
        let parser = parse(
            "program p declare x enddeclare \
             while x > 0 x := x - 1 endwhile endprogram",
        )
        .unwrap();

        let quads = parser.quads.quads();
        // 2: (>, x, 0, 4), 3: (jump, _, _, 7), 4/5: body, 6: back jump.
        assert_eq!(quads[2].op, QuadOp::Gt);
        assert_eq!(quads[2].target, "4");
        assert_eq!(quads[3].target, "7");
        assert_eq!(quads[6].op, QuadOp::Jump);
        assert_eq!(quads[6].target, "2");
    }

    #[test]
    fn test_repeat_exit_targets_after_back_edge() {
        let parser = parse(
            "program p declare x enddeclare \
             repeat if x = 0 then exit endif; x := x - 1 endrepeat endprogram",
        )
        .unwrap();

        let quads = parser.quads.quads();
        let back_edge = quads
            .iter()
            .find(|q| q.op == QuadOp::Jump && q.target == "2")
            .expect("back edge to the repeat start");
        let exit_quad = quads
            .iter()
            .find(|q| q.op == QuadOp::Jump && q.target == (back_edge.id + 1).to_string())
            .expect("exit jump past the back edge");
        assert!(exit_quad.id < back_edge.id);
    }

    #[test]
    fn test_nested_repeat_exit_targets_innermost() {
        let parser = parse(
            "program p declare x enddeclare \
             repeat repeat exit endrepeat; x := 1 endrepeat endprogram",
        )
        .unwrap();

        let quads = parser.quads.quads();
        // Inner body: 2: (jump exit), 3: (jump back to 2) -> exit lands on 4.
        assert_eq!(quads[2].op, QuadOp::Jump);
        assert_eq!(quads[2].target, "4");
        assert_eq!(quads[3].target, "2");
    }

    #[test]
    fn test_switch_cases_chain() {
        let parser = parse(
            "program p declare x, y enddeclare \
             switch x case 1 : y := 1 case 2 : y := 2 endswitch endprogram",
        )
        .unwrap();

        let quads = parser.quads.quads();
        // 3: (<>, x, 1, 6) -> next case; 5: (jump, _, _, 9) -> after.
        assert_eq!(quads[3].op, QuadOp::Neq);
        assert_eq!(quads[3].target, "6");
        assert_eq!(quads[5].op, QuadOp::Jump);
        assert_eq!(quads[5].target, "9");
        assert_eq!(quads[6].op, QuadOp::Neq);
        assert_eq!(quads[6].target, "9");
        assert_eq!(quads[8].target, "9");
    }

    #[test]
    fn test_forcase_flag_loop() {
        let parser = parse(
            "program p declare x enddeclare \
             forcase when x > 0 : x := x - 1 endforcase endprogram",
        )
        .unwrap();

        let quads = parser.quads.quads();
        // 2: (:=, 0, _, T_0) flag reset at the loop head.
        assert_eq!(quads[2].op, QuadOp::Assign);
        assert_eq!(quads[2].term0, "0");
        assert_eq!(quads[2].target, "T_0");
        // Guard fired: flag set to 1 before the guarded statements.
        assert_eq!(quads[5].term0, "1");
        assert_eq!(quads[5].target, "T_0");
        // Re-enter while any guard fired.
        let last = quads.iter().rfind(|q| q.op == QuadOp::Eq).unwrap();
        assert_eq!(last.term0, "1");
        assert_eq!(last.term1, "T_0");
        assert_eq!(last.target, "2");
    }

    #[test]
    fn test_boolean_literals_and_not() {
        let parser = parse(
            "program p declare x enddeclare \
             if not [ false ] then x := 1 endif endprogram",
        )
        .unwrap();

        // The false literal's jump becomes the (swapped) true list and
        // is patched to the then-branch.
        let quads = parser.quads.quads();
        assert_eq!(quads[2].op, QuadOp::Jump);
        assert_eq!(quads[2].target, "3");
    }

    #[test]
    fn test_function_call_in_expression_emits_ret_par() {
        let parser = parse(
            "program p declare x enddeclare \
             function f ( in a ) return a + 1 endfunction \
             x := f ( in 5 ) endprogram",
        )
        .unwrap();

        let quads = quad_tuples(&parser);
        let par_cv = quads.iter().position(|q| q.0 == "par" && q.2 == "cv").unwrap();
        let par_ret = quads.iter().position(|q| q.0 == "par" && q.2 == "ret").unwrap();
        let call = quads.iter().position(|q| q.0 == "call").unwrap();
        assert!(par_cv < par_ret && par_ret < call);
        assert_eq!(quads[par_ret].1, quads[call + 1].1);
        assert_eq!(quads[call].1, "f");
    }

    #[test]
    fn test_begin_and_end_blocks_balance() {
        let parser = parse(
            "program p \
             procedure q ( ) endprocedure \
             function f ( ) return 1 endfunction \
             call q ( ) endprogram",
        )
        .unwrap();

        let quads = parser.quads.quads();
        let begins = quads.iter().filter(|q| q.op == QuadOp::BeginBlock).count();
        let ends = quads.iter().filter(|q| q.op == QuadOp::EndBlock).count();
        assert_eq!(begins, 3);
        assert_eq!(ends, 3);
    }

    #[test]
    fn test_unary_minus_multiplies_by_minus_one() {
        let parser = parse(
            "program p declare x enddeclare x := -x + 2 endprogram",
        )
        .unwrap();

        let quads = quad_tuples(&parser);
        assert_eq!(quads[2], ("+".to_string(), "x".to_string(), "2".to_string(), "T_0".to_string()));
        assert_eq!(quads[3], ("*".to_string(), "T_0".to_string(), "-1".to_string(), "T_1".to_string()));
    }

    #[test]
    fn test_signature_mismatch_is_an_error() {
        let err = parse(
            "program p declare a enddeclare \
             procedure g ( in x, in y ) endprocedure \
             call g ( inout a, in 5 ) endprogram",
        )
        .unwrap_err();
        assert_eq!(err.message, "Invalid signature for \"g\".");
    }

    #[test]
    fn test_function_without_return_is_an_error() {
        let err = parse(
            "program p function f ( in a ) declare b enddeclare b := a endfunction endprogram",
        )
        .unwrap_err();
        assert_eq!(err.message, "End of function block and no return found.");
        assert_eq!(err.suggestion.as_deref(), Some("Did you forget to return?"));
    }

    #[test]
    fn test_exit_outside_repeat_is_an_error() {
        let err = parse("program p exit endprogram").unwrap_err();
        assert_eq!(err.message, "Found exit outside a repeat block.");
    }

    #[test]
    fn test_return_outside_function_is_an_error() {
        let err = parse("program p declare x enddeclare return x endprogram").unwrap_err();
        assert_eq!(err.message, "Found stray return outside function block.");
    }

    #[test]
    fn test_return_in_procedure_is_an_error() {
        let err = parse(
            "program p procedure q ( ) return 1 endprocedure call q ( ) endprogram",
        )
        .unwrap_err();
        assert_eq!(err.message, "Found stray return outside function block.");
    }

    #[test]
    fn test_redeclaration_is_an_error() {
        let err = parse("program p declare x, x enddeclare endprogram").unwrap_err();
        assert_eq!(err.message, "Redeclaring x is not allowed.");
    }

    #[test]
    fn test_unknown_variable_use_is_an_error() {
        let err = parse("program p declare x enddeclare x := y endprogram").unwrap_err();
        assert_eq!(err.message, "Using \"y\" as a variable but it's not one.");
    }

    #[test]
    fn test_calling_a_function_with_call_is_an_error() {
        let err = parse(
            "program p function f ( ) return 1 endfunction call f ( ) endprogram",
        )
        .unwrap_err();
        assert_eq!(err.message, "Using \"f\" as a procedure but it's not one.");
    }

    #[test]
    fn test_syntax_error_reports_unexpected_token() {
        let err = parse("program p declare x y enddeclare endprogram").unwrap_err();
        assert_eq!(
            err.message,
            "Expected token of type `enddeclare`, got `id` (`y`)."
        );
        assert_eq!(
            err.suggestion.as_deref(),
            Some("Maybe a \";\" or a \",\" is missing.")
        );
    }

    #[test]
    fn test_missing_endprogram_is_an_eof_error() {
        let err = parse("program p declare x enddeclare x := 1").unwrap_err();
        assert_eq!(err.message, "Unexpected end of file.");
    }

    #[test]
    fn test_trailing_tokens_are_an_error() {
        let err = parse("program p endprogram extra").unwrap_err();
        assert_eq!(err.message, "Unexpected token after endprogram.");
    }
}
