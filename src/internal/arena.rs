use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// A type that can be used as an index into an [`Arena`].
pub trait ArenaId: Copy {
    fn from_usize(x: usize) -> Self;
    fn to_usize(self) -> usize;
}

/// A growable store of values addressed by a typed id.
///
/// Ids are dense and allocated in insertion order, which makes iteration
/// deterministic. Values are never removed.
#[derive(Clone)]
pub struct Arena<TId: ArenaId, TValue> {
    values: Vec<TValue>,
    phantom: PhantomData<TId>,
}

impl<TId: ArenaId, TValue> Default for Arena<TId, TValue> {
    fn default() -> Self {
        Self::new()
    }
}

impl<TId: ArenaId, TValue> Arena<TId, TValue> {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            phantom: PhantomData,
        }
    }

    pub fn alloc(&mut self, value: TValue) -> TId {
        let id = TId::from_usize(self.values.len());
        self.values.push(value);
        id
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TId, &TValue)> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (TId::from_usize(i), v))
    }

    pub fn ids(&self) -> impl Iterator<Item = TId> {
        (0..self.values.len()).map(TId::from_usize)
    }
}

impl<TId: ArenaId, TValue> Index<TId> for Arena<TId, TValue> {
    type Output = TValue;

    fn index(&self, index: TId) -> &Self::Output {
        &self.values[index.to_usize()]
    }
}

impl<TId: ArenaId, TValue> IndexMut<TId> for Arena<TId, TValue> {
    fn index_mut(&mut self, index: TId) -> &mut Self::Output {
        &mut self.values[index.to_usize()]
    }
}
