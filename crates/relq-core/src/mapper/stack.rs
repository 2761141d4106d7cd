//! Mapper stacks: scoping keys for predicates and equality edges.
//!
//! A [`MapperStack`] records where in the relationship tree a predicate or
//! equality lives, as the ordered path of mapper identities traversed to
//! reach it. OR branches push an opaque container frame so that no scope
//! inside an OR branch can ever equal a scope outside it.

use crate::mapper::Mapper;

/// Identity of a mapper instance.
///
/// Two structurally equal but independently constructed mappers have
/// different identities; clones of one mapper share the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapperId(pub(crate) usize);

/// One frame of a mapper stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Frame {
    Mapper(MapperId),
    Container(u64),
}

/// An ordered path of mapper identities, with OR-container markers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MapperStack {
    frames: Vec<Frame>,
}

impl MapperStack {
    /// The empty (root) stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a mapper frame.
    pub fn push_mapper(&mut self, mapper: &Mapper) {
        self.frames.push(Frame::Mapper(mapper.id()));
    }

    /// Pop the most recent frame, which must be a mapper frame.
    pub fn pop_mapper(&mut self) {
        match self.frames.pop() {
            Some(Frame::Mapper(_)) => {}
            other => panic!("pop_mapper on non-mapper frame: {other:?}"),
        }
    }

    /// Push an opaque container frame (an OR branch boundary).
    pub fn push_container(&mut self, id: u64) {
        self.frames.push(Frame::Container(id));
    }

    /// Pop the most recent frame, which must be a container frame.
    pub fn pop_container(&mut self) {
        match self.frames.pop() {
            Some(Frame::Container(_)) => {}
            other => panic!("pop_container on non-container frame: {other:?}"),
        }
    }

    /// Whether this is the root scope.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Whether any frame is a container marker, i.e. the scope lies inside
    /// an OR branch.
    pub fn has_container(&self) -> bool {
        self.frames
            .iter()
            .any(|f| matches!(f, Frame::Container(_)))
    }

    /// The stack with the last mapper frame removed.
    ///
    /// Used when registering a join equality: the left attribute lives in
    /// the scope outside the mapper being traversed.
    pub fn without_last_mapper(&self) -> MapperStack {
        let mut frames = self.frames.clone();
        match frames.pop() {
            Some(Frame::Mapper(_)) => {}
            other => panic!("without_last_mapper on non-mapper frame: {other:?}"),
        }
        MapperStack { frames }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::Mapper;
    use relq_model::EntityType;

    fn test_mapper() -> Mapper {
        let order = EntityType::new("Order");
        let customer = EntityType::new("Customer");
        Mapper::many_to_one(
            "customer",
            vec![(order.attribute("customerId"), customer.attribute("id"))],
        )
    }

    #[test]
    fn test_push_pop_roundtrip() {
        let mapper = test_mapper();
        let mut stack = MapperStack::new();
        assert!(stack.is_empty());

        stack.push_mapper(&mapper);
        assert_eq!(stack.depth(), 1);
        stack.pop_mapper();
        assert!(stack.is_empty());
    }

    #[test]
    fn test_stack_equality_by_identity() {
        let m1 = test_mapper();
        let m2 = test_mapper();

        let mut a = MapperStack::new();
        a.push_mapper(&m1);
        let mut b = MapperStack::new();
        b.push_mapper(&m1.clone());
        let mut c = MapperStack::new();
        c.push_mapper(&m2);

        // Clones share identity; an independent equal mapper does not.
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_container_isolates_scope() {
        let mapper = test_mapper();
        let mut plain = MapperStack::new();
        plain.push_mapper(&mapper);

        let mut branched = MapperStack::new();
        branched.push_container(1);
        branched.push_mapper(&mapper);

        assert_ne!(plain, branched);
        assert!(branched.has_container());
        assert!(!plain.has_container());
    }

    #[test]
    fn test_without_last_mapper() {
        let mapper = test_mapper();
        let mut stack = MapperStack::new();
        stack.push_mapper(&mapper);

        assert!(stack.without_last_mapper().is_empty());
        // Original untouched.
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    #[should_panic]
    fn test_pop_mapper_on_container_panics() {
        let mut stack = MapperStack::new();
        stack.push_container(1);
        stack.pop_mapper();
    }
}
