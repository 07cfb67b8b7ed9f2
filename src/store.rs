//! Lexical scope chain (component D, §3), grounded on the reference
//! implementation's `Store` class: an ordered map plus a parent pointer,
//! lookup/assignment walking the chain to the nearest scope that already
//! defines a name.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::WandelscriptError;
use crate::frame_graph::FrameGraph;
use crate::value::{Frame, Value};

pub const MAX_CALL_DEPTH: usize = 64;

pub struct Scope {
    parent: Option<Rc<Scope>>,
    data: RefCell<Vec<(String, Value)>>,
    pub frame_graph: Rc<RefCell<FrameGraph>>,
    pub flange: Frame,
    pub robot_frame: Frame,
    depth: usize,
}

impl Scope {
    /// Build the process-wide root scope, seeded with a fresh frame graph and
    /// the two always-present frames the reference `Store.__init__` creates.
    pub fn root() -> Rc<Scope> {
        let graph = Rc::new(RefCell::new(FrameGraph::new()));
        let flange = Frame { name: "flange".to_owned(), graph: graph.clone() };
        let robot_frame = Frame { name: "robot_".to_owned(), graph: graph.clone() };
        graph.borrow_mut().add_frame(&flange.name);
        graph.borrow_mut().add_frame(&robot_frame.name);
        Rc::new(Scope { parent: None, data: RefCell::new(Vec::new()), frame_graph: graph, flange, robot_frame, depth: 0 })
    }

    /// A child scope (function call, block, modifier suite) sharing the
    /// frame graph with its ancestors.
    pub fn descend(parent: &Rc<Scope>) -> Result<Rc<Scope>, WandelscriptError> {
        let depth = parent.depth + 1;
        if depth > MAX_CALL_DEPTH {
            return Err(WandelscriptError::generic(None, "call stack depth exceeded"));
        }
        Ok(Rc::new(Scope {
            parent: Some(parent.clone()),
            data: RefCell::new(Vec::new()),
            frame_graph: parent.frame_graph.clone(),
            flange: parent.flange.clone(),
            robot_frame: parent.robot_frame.clone(),
            depth,
        }))
    }

    pub fn contains_local(&self, name: &str) -> bool {
        self.data.borrow().iter().any(|(k, _)| k == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.contains_local(name) || self.parent.as_ref().is_some_and(|p| p.contains(name))
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some((_, v)) = self.data.borrow().iter().find(|(k, _)| k == name) {
            return Some(v.clone());
        }
        self.parent.as_ref().and_then(|p| p.get(name))
    }

    /// Writes into the nearest scope (walking up) that already defines
    /// `name`; otherwise binds in the current scope, exactly like the
    /// reference `Store.__setitem__`.
    pub fn set(&self, name: &str, value: Value) {
        if self.contains_local(name) {
            self.set_local(name, value);
            return;
        }
        if let Some(parent) = &self.parent {
            if parent.contains(name) {
                parent.set(name, value);
                return;
            }
        }
        self.bind_local(name, value);
    }

    /// Always writes into *this* scope, regardless of shadowing further up —
    /// used for function parameter binding and loop variables.
    pub fn bind_local(&self, name: &str, value: Value) {
        if self.contains_local(name) {
            self.set_local(name, value);
        } else {
            self.data.borrow_mut().push((name.to_owned(), value));
        }
    }

    fn set_local(&self, name: &str, value: Value) {
        let mut data = self.data.borrow_mut();
        if let Some(slot) = data.iter_mut().find(|(k, _)| k == name) {
            slot.1 = value;
        }
    }

    /// Snapshot of locally-bound names, used for `ProgramRun` store output.
    pub fn local_entries(&self) -> Vec<(String, Value)> {
        self.data.borrow().clone()
    }

    /// All entries visible from this scope, nearer scopes shadowing farther
    /// ones — mirrors the reference `Store.data` property collapsed across
    /// the whole chain for top-level reporting.
    pub fn visible_entries(&self) -> Vec<(String, Value)> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        let mut scope = self;
        loop {
            for (k, v) in scope.data.borrow().iter() {
                if seen.insert(k.clone()) {
                    out.push((k.clone(), v.clone()));
                }
            }
            match &scope.parent {
                Some(p) => scope = p,
                None => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_to_bound_name_mutates_nearest_scope() {
        let root = Scope::root();
        root.bind_local("a", Value::Int(1));
        let child = Scope::descend(&root).unwrap();
        child.set("a", Value::Int(2));
        assert_eq!(root.get("a"), Some(Value::Int(2)));
        assert!(!child.contains_local("a"));
    }

    #[test]
    fn never_bound_name_binds_in_current_scope() {
        let root = Scope::root();
        let child = Scope::descend(&root).unwrap();
        child.set("b", Value::Int(5));
        assert!(child.contains_local("b"));
        assert!(!root.contains_local("b"));
    }

    #[test]
    fn call_depth_is_bounded() {
        let mut scope = Scope::root();
        for _ in 0..MAX_CALL_DEPTH {
            scope = Scope::descend(&scope).unwrap();
        }
        assert!(Scope::descend(&scope).is_err());
    }
}
