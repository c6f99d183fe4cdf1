//! Three-address intermediate code ("quads") and its generator.

use crate::symbols::{Entity, SymbolTable};

/// Sentinel for an unused quad slot.
pub const UNUSED: &str = "_";

/// A quad operation tag. `as_str` is the rendering used by the
/// intermediate listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuadOp {
    BeginBlock,
    EndBlock,
    Halt,
    /// Declaration marker; informational, not executable.
    Int,
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Jump,
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
    Par,
    Call,
    Retv,
    Inp,
    Out,
}

impl QuadOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuadOp::BeginBlock => "begin_block",
            QuadOp::EndBlock => "end_block",
            QuadOp::Halt => "halt",
            QuadOp::Int => "int",
            QuadOp::Assign => ":=",
            QuadOp::Add => "+",
            QuadOp::Sub => "-",
            QuadOp::Mul => "*",
            QuadOp::Div => "/",
            QuadOp::Jump => "jump",
            QuadOp::Eq => "=",
            QuadOp::Neq => "<>",
            QuadOp::Lt => "<",
            QuadOp::Gt => ">",
            QuadOp::Le => "<=",
            QuadOp::Ge => ">=",
            QuadOp::Par => "par",
            QuadOp::Call => "call",
            QuadOp::Retv => "retv",
            QuadOp::Inp => "inp",
            QuadOp::Out => "out",
        }
    }
}

impl std::fmt::Display for QuadOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single three-address instruction. Terms and target are plain
/// strings: identifier names, literals, temporary names, quad ids used
/// as jump targets, or `_` when unused. Only `target` is ever
/// rewritten, via [`QuadGen::backpatch`].
#[derive(Debug, Clone, PartialEq)]
pub struct Quad {
    pub id: usize,
    pub op: QuadOp,
    pub term0: String,
    pub term1: String,
    pub target: String,
}

/// The quad stream: append-only list, a parallel "emitted" mark per
/// quad, and the temporary-name allocator.
#[derive(Debug, Default)]
pub struct QuadGen {
    quads: Vec<Quad>,
    marked: Vec<bool>,
    next_temp: usize,
}

impl QuadGen {
    pub fn new() -> Self {
        QuadGen {
            quads: Vec::new(),
            marked: Vec::new(),
            next_temp: 0,
        }
    }

    /// The id the next `genquad` will assign.
    pub fn nextquad(&self) -> usize {
        self.quads.len()
    }

    pub fn genquad(&mut self, op: QuadOp, term0: &str, term1: &str, target: &str) {
        let id = self.quads.len();
        self.quads.push(Quad {
            id,
            op,
            term0: term0.to_string(),
            term1: term1.to_string(),
            target: target.to_string(),
        });
        self.marked.push(false);
    }

    /// Produce a fresh temporary name `T_k` and register it as a
    /// `Temporary` entity in the current scope.
    pub fn newtemp(&mut self, table: &mut SymbolTable) -> String {
        let temp = self.next_temp_name();
        table.add_entity(Entity::Temporary {
            name: temp.clone(),
            offset: None,
        });
        temp
    }

    /// Produce a fresh temporary name without registering it. Used for
    /// function-call return slots, which are registered separately as
    /// `ret`-mode parameters.
    pub fn newtemp_unregistered(&mut self) -> String {
        self.next_temp_name()
    }

    fn next_temp_name(&mut self) -> String {
        let temp = format!("T_{}", self.next_temp);
        self.next_temp += 1;
        temp
    }

    /// Rewrite the target of every listed quad; all other fields stay
    /// untouched.
    pub fn backpatch(&mut self, ids: &[usize], target: usize) {
        for &id in ids {
            self.quads[id].target = target.to_string();
        }
    }

    /// Return the still-unemitted quads with id >= `start`, then mark
    /// everything from `start` on as emitted. Each quad is therefore
    /// returned exactly once across all calls.
    pub fn get_and_mark_quads_from(&mut self, start: usize) -> Vec<Quad> {
        let drained: Vec<Quad> = self.quads[start..]
            .iter()
            .filter(|quad| !self.marked[quad.id])
            .cloned()
            .collect();

        for mark in &mut self.marked[start..] {
            *mark = true;
        }
        drained
    }

    pub fn quads(&self) -> &[Quad] {
        &self.quads
    }

    /// The intermediate listing: one line per quad.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for quad in &self.quads {
            out.push_str(&format!(
                "{}: ({}, {}, {}, {})\n",
                quad.id, quad.op, quad.term0, quad.term1, quad.target
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quad_ids_are_dense() {
        let mut quads = QuadGen::new();
        quads.genquad(QuadOp::Jump, UNUSED, UNUSED, UNUSED);
        quads.genquad(QuadOp::Add, "1", "2", "T_0");
        quads.genquad(QuadOp::Halt, UNUSED, UNUSED, UNUSED);

        for (i, quad) in quads.quads().iter().enumerate() {
            assert_eq!(quad.id, i);
        }
        assert_eq!(quads.nextquad(), 3);
    }

    #[test]
    fn test_backpatch_rewrites_only_the_target() {
        let mut quads = QuadGen::new();
        quads.genquad(QuadOp::Eq, "x", "0", UNUSED);
        quads.genquad(QuadOp::Jump, UNUSED, UNUSED, UNUSED);

        quads.backpatch(&[0, 1], 7);

        assert_eq!(quads.quads()[0].op, QuadOp::Eq);
        assert_eq!(quads.quads()[0].term0, "x");
        assert_eq!(quads.quads()[0].term1, "0");
        assert_eq!(quads.quads()[0].target, "7");
        assert_eq!(quads.quads()[1].target, "7");
    }

    #[test]
    fn test_get_and_mark_returns_each_quad_once() {
        let mut quads = QuadGen::new();
        for _ in 0..4 {
            quads.genquad(QuadOp::Jump, UNUSED, UNUSED, UNUSED);
        }

        let inner = quads.get_and_mark_quads_from(2);
        assert_eq!(inner.iter().map(|q| q.id).collect::<Vec<_>>(), vec![2, 3]);

        // Quads appended later are unmarked and drain with the rest.
        quads.genquad(QuadOp::Halt, UNUSED, UNUSED, UNUSED);
        let outer = quads.get_and_mark_quads_from(0);
        assert_eq!(outer.iter().map(|q| q.id).collect::<Vec<_>>(), vec![0, 1, 4]);

        assert!(quads.get_and_mark_quads_from(0).is_empty());
    }

    #[test]
    fn test_newtemp_registers_in_the_current_scope() {
        let mut table = SymbolTable::new();
        table.create_scope();
        let mut quads = QuadGen::new();

        let t0 = quads.newtemp(&mut table);
        let t1 = quads.newtemp_unregistered();
        let t2 = quads.newtemp(&mut table);

        assert_eq!(t0, "T_0");
        assert_eq!(t1, "T_1");
        assert_eq!(t2, "T_2");
        assert!(table.lookup("T_0").is_some());
        assert!(table.lookup("T_1").is_none());
        assert_eq!(table.lookup("T_2").unwrap().entity.offset(), Some(16));
    }

    #[test]
    fn test_listing_format() {
        let mut quads = QuadGen::new();
        quads.genquad(QuadOp::BeginBlock, "p", UNUSED, UNUSED);
        quads.genquad(QuadOp::Add, "3", "4", "T_0");
        quads.genquad(QuadOp::Assign, "T_0", UNUSED, "x");

        assert_eq!(
            quads.listing(),
            "0: (begin_block, p, _, _)\n1: (+, 3, 4, T_0)\n2: (:=, T_0, _, x)\n"
        );
    }
}
