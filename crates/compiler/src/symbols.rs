//! Nested scopes, entities and frame layout.
//!
//! The symbol table is a stack of scopes. Offsets inside a frame start
//! at 12 (three reserved header slots: return address, static link,
//! return value pointer) and grow by 4 per offset-bearing entity.

/// Parameter passing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParMode {
    /// By value.
    Cv,
    /// By reference.
    Ref,
    /// Callee-writable return slot in the caller's frame.
    Ret,
}

impl ParMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParMode::Cv => "cv",
            ParMode::Ref => "ref",
            ParMode::Ret => "ret",
        }
    }
}

impl std::fmt::Display for ParMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallableKind {
    Function,
    Procedure,
}

/// A declared (name, mode) pair on a callable's signature. Arguments
/// exist on the `Function` entity before the callee's scope does; the
/// scope synthesizes `Parameter` entities from them on creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: String,
    pub mode: ParMode,
}

/// A callable entity: a function or a procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionEntity {
    pub name: String,
    /// Id of the callable's `begin_block` quad.
    pub start_quad: usize,
    pub arguments: Vec<Argument>,
    /// Total frame bytes, filled in when the body's scope closes.
    pub frame_length: Option<usize>,
    pub kind: CallableKind,
}

impl FunctionEntity {
    /// Signature match is ordered mode-list equality.
    pub fn has_signature(&self, modes: &[ParMode]) -> bool {
        self.arguments.len() == modes.len()
            && self.arguments.iter().zip(modes).all(|(a, m)| a.mode == *m)
    }
}

/// A named binding in a scope.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Variable { name: String, offset: Option<usize> },
    Parameter { name: String, mode: ParMode, offset: Option<usize> },
    Temporary { name: String, offset: Option<usize> },
    Function(FunctionEntity),
}

impl Entity {
    pub fn name(&self) -> &str {
        match self {
            Entity::Variable { name, .. } => name,
            Entity::Parameter { name, .. } => name,
            Entity::Temporary { name, .. } => name,
            Entity::Function(f) => &f.name,
        }
    }

    /// The assigned frame offset, if this entity occupies a slot.
    pub fn offset(&self) -> Option<usize> {
        match self {
            Entity::Variable { offset, .. } => *offset,
            Entity::Parameter { offset, .. } => *offset,
            Entity::Temporary { offset, .. } => *offset,
            Entity::Function(_) => None,
        }
    }

    fn set_offset(&mut self, new_offset: usize) {
        match self {
            Entity::Variable { offset, .. } => *offset = Some(new_offset),
            Entity::Parameter { offset, .. } => *offset = Some(new_offset),
            Entity::Temporary { offset, .. } => *offset = Some(new_offset),
            Entity::Function(_) => panic!("functions do not occupy a frame slot"),
        }
    }

    fn has_offset_slot(&self) -> bool {
        !matches!(self, Entity::Function(_))
    }

    /// Variables, parameters and temporaries all count as
    /// variable-kind for frame sizing and name resolution.
    pub fn is_variable(&self) -> bool {
        !matches!(self, Entity::Function(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(
            self,
            Entity::Function(FunctionEntity {
                kind: CallableKind::Function,
                ..
            })
        )
    }

    pub fn is_procedure(&self) -> bool {
        matches!(
            self,
            Entity::Function(FunctionEntity {
                kind: CallableKind::Procedure,
                ..
            })
        )
    }

    pub fn as_function(&self) -> Option<&FunctionEntity> {
        match self {
            Entity::Function(f) => Some(f),
            _ => None,
        }
    }

    /// True for a by-reference parameter; drives the extra
    /// indirection in the final generator.
    pub fn is_ref_parameter(&self) -> bool {
        matches!(
            self,
            Entity::Parameter {
                mode: ParMode::Ref,
                ..
            }
        )
    }
}

/// One nesting level with its entities in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub nesting_level: usize,
    pub entities: Vec<Entity>,
}

/// A successful name resolution: the entity plus the nesting level of
/// the scope it was found in.
#[derive(Debug, Clone, Copy)]
pub struct LookupResult<'a> {
    pub entity: &'a Entity,
    pub nesting_level: usize,
}

/// The scope stack. The scope at index `i` has nesting level `i`;
/// level 0 is the program's global scope.
#[derive(Debug, Default)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable { scopes: Vec::new() }
    }

    /// Open a new scope. When the enclosing scope's last entity is a
    /// `Function`, its declared arguments are synthesized as the new
    /// scope's initial `Parameter` entities at offsets 12, 16, 20, ...
    pub fn create_scope(&mut self) {
        let params: Vec<Entity> = match self.last_entity() {
            Some(Entity::Function(f)) => f
                .arguments
                .iter()
                .enumerate()
                .map(|(i, arg)| Entity::Parameter {
                    name: arg.name.clone(),
                    mode: arg.mode,
                    offset: Some(12 + i * 4),
                })
                .collect(),
            _ => Vec::new(),
        };

        let nesting_level = self.scopes.len();
        self.scopes.push(Scope {
            nesting_level,
            entities: params,
        });
    }

    /// Close the current scope. The owning function's frame length
    /// must already be filled in; anything else is a driver bug.
    pub fn destroy_scope(&mut self) {
        if !self.is_callee_framelength_filled_in() {
            panic!("destroying a scope whose owning function has no frame length");
        }
        self.scopes.pop();
    }

    /// The function whose body opened the current scope, when the
    /// current level is at least 1.
    fn callee(&self) -> Option<&FunctionEntity> {
        if self.scopes.len() <= 1 {
            return None;
        }
        match self.scopes[self.scopes.len() - 2].entities.last() {
            Some(Entity::Function(f)) => Some(f),
            _ => panic!("scope owner slot does not hold a function"),
        }
    }

    fn callee_mut(&mut self) -> Option<&mut FunctionEntity> {
        if self.scopes.len() <= 1 {
            return None;
        }
        let parent = self.scopes.len() - 2;
        match self.scopes[parent].entities.last_mut() {
            Some(Entity::Function(f)) => Some(f),
            _ => panic!("scope owner slot does not hold a function"),
        }
    }

    /// Record the current scope's frame length on its owning
    /// function. A no-op at program level.
    pub fn fill_in_framelength_on_callee(&mut self) {
        let frame_length = self.get_current_framelength();
        if let Some(callee) = self.callee_mut() {
            callee.frame_length = Some(frame_length);
        }
    }

    pub fn is_callee_framelength_filled_in(&self) -> bool {
        self.callee().is_none_or(|f| f.frame_length.is_some())
    }

    /// Append an entity to the current scope, assigning the next free
    /// offset (last used + 4, or 12) when it occupies a frame slot.
    pub fn add_entity(&mut self, mut entity: Entity) {
        if entity.has_offset_slot() {
            let next = self
                .closest_offset_on_current_scope()
                .map_or(12, |offset| offset + 4);
            entity.set_offset(next);
        }
        self.current_scope_mut().entities.push(entity);
    }

    fn closest_offset_on_current_scope(&self) -> Option<usize> {
        self.scopes
            .last()
            .and_then(|scope| scope.entities.iter().rev().find_map(|e| e.offset()))
    }

    /// Append a declared argument to the current scope's last entity,
    /// which must be a `Function`.
    pub fn add_argument(&mut self, arg: Argument) {
        match self.current_scope_mut().entities.last_mut() {
            Some(Entity::Function(f)) => f.arguments.push(arg),
            _ => panic!("adding an argument but the last entity is not a function"),
        }
    }

    fn current_scope_mut(&mut self) -> &mut Scope {
        match self.scopes.last_mut() {
            Some(scope) => scope,
            None => panic!("no open scope"),
        }
    }

    fn last_entity(&self) -> Option<&Entity> {
        self.scopes.last().and_then(|scope| scope.entities.last())
    }

    /// True when the current scope is the body of a `function`
    /// (not a procedure, not the program block).
    pub fn am_i_inside_function(&self) -> bool {
        if self.scopes.len() <= 1 {
            return false;
        }
        self.scopes[self.scopes.len() - 2]
            .entities
            .last()
            .is_some_and(|e| e.is_function())
    }

    /// Resolve a name from the innermost scope outwards; within each
    /// scope entities are searched in reverse declaration order.
    pub fn lookup(&self, name: &str) -> Option<LookupResult<'_>> {
        for scope in self.scopes.iter().rev() {
            for entity in scope.entities.iter().rev() {
                if entity.name() == name {
                    return Some(LookupResult {
                        entity,
                        nesting_level: scope.nesting_level,
                    });
                }
            }
        }
        None
    }

    /// Resolve a name in the current scope only (redeclaration checks).
    pub fn lookup_on_current_scope(&self, name: &str) -> Option<LookupResult<'_>> {
        let scope = self.scopes.last()?;
        for entity in scope.entities.iter().rev() {
            if entity.name() == name {
                return Some(LookupResult {
                    entity,
                    nesting_level: scope.nesting_level,
                });
            }
        }
        None
    }

    pub fn has_a_variable(&self, name: &str) -> bool {
        self.lookup(name).is_some_and(|r| r.entity.is_variable())
    }

    pub fn has_a_procedure(&self, name: &str) -> bool {
        self.lookup(name).is_some_and(|r| r.entity.is_procedure())
    }

    pub fn has_a_function(&self, name: &str) -> bool {
        self.lookup(name).is_some_and(|r| r.entity.is_function())
    }

    pub fn has_a_callable_with_signature(&self, name: &str, modes: &[ParMode]) -> bool {
        self.lookup(name).is_some_and(|r| {
            r.entity
                .as_function()
                .is_some_and(|f| f.has_signature(modes))
        })
    }

    pub fn get_current_nesting_level(&self) -> usize {
        self.scopes.len().saturating_sub(1)
    }

    /// The function whose body the current scope is. Only valid for
    /// nested scopes; the final generator uses it to find the block's
    /// first quad.
    pub fn get_cause_of_birth(&self) -> &FunctionEntity {
        match self.callee() {
            Some(f) => f,
            None => panic!("the program scope has no owning function"),
        }
    }

    fn var_entities_on_scope(scope: &Scope) -> usize {
        scope.entities.iter().filter(|e| e.is_variable()).count()
    }

    /// 12 header bytes plus 4 per variable-kind entity in the current
    /// scope.
    pub fn get_current_framelength(&self) -> usize {
        let vars = self
            .scopes
            .last()
            .map_or(0, |scope| Self::var_entities_on_scope(scope));
        12 + vars * 4
    }
}
