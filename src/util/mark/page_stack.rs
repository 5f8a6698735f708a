//! A stack built from page-sized chunks.
//!
//! Chunks are what gets handed to other threads: [`PageStack::split`] moves
//! whole chunks into new stacks without copying entries.

use crate::util::constants::BYTES_IN_PAGE;

pub struct PageStack<T> {
    /// The chunk being pushed to and popped from.
    top: Vec<T>,
    /// Filled chunks below `top`.
    chunks: Vec<Vec<T>>,
    /// Zero means unbounded.
    max_chunks: usize,
}

impl<T> PageStack<T> {
    pub const ENTRIES_PER_CHUNK: usize = {
        let entries = BYTES_IN_PAGE / std::mem::size_of::<T>();
        if entries == 0 {
            1
        } else {
            entries
        }
    };

    pub fn new(max_chunks: usize) -> Self {
        PageStack {
            top: Vec::new(),
            chunks: Vec::new(),
            max_chunks,
        }
    }

    /// Returns false, and drops nothing, if the stack is at its chunk limit.
    #[must_use]
    pub fn push(&mut self, item: T) -> bool {
        if self.top.len() == Self::ENTRIES_PER_CHUNK {
            if self.max_chunks != 0 && self.chunks.len() + 1 >= self.max_chunks {
                return false;
            }
            let full = std::mem::replace(&mut self.top, Vec::with_capacity(Self::ENTRIES_PER_CHUNK));
            self.chunks.push(full);
        } else if self.top.capacity() == 0 {
            self.top.reserve_exact(Self::ENTRIES_PER_CHUNK);
        }
        self.top.push(item);
        true
    }

    pub fn pop(&mut self) -> Option<T> {
        if let Some(item) = self.top.pop() {
            return Some(item);
        }
        let chunk = self.chunks.pop()?;
        self.top = chunk;
        self.top.pop()
    }

    pub fn max_chunks(&self) -> usize {
        self.max_chunks
    }

    pub fn is_empty(&self) -> bool {
        self.top.is_empty() && self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.top.len() + self.chunks.iter().map(Vec::len).sum::<usize>()
    }

    /// Chunks in use, counting a partial top chunk.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len() + usize::from(!self.top.is_empty())
    }

    /// Move full chunks into at most `parts` new stacks, round robin. The top
    /// chunk stays here, so the caller always keeps some work.
    pub fn split(&mut self, parts: usize) -> Vec<PageStack<T>> {
        let parts = parts.min(self.chunks.len());
        let mut stacks: Vec<PageStack<T>> = (0..parts).map(|_| PageStack::new(self.max_chunks)).collect();
        if parts == 0 {
            return stacks;
        }
        for (i, chunk) in std::mem::take(&mut self.chunks).into_iter().enumerate() {
            stacks[i % parts].chunks.push(chunk);
        }
        stacks
    }

    /// Take over everything in `other`, ignoring the chunk limit.
    pub fn append(&mut self, other: &mut PageStack<T>) {
        if !other.top.is_empty() {
            self.chunks.push(std::mem::take(&mut other.top));
        }
        self.chunks.append(&mut other.chunks);
    }

    pub fn clear(&mut self) {
        self.top.clear();
        self.chunks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Stack = PageStack<usize>;

    #[test]
    fn lifo_across_chunks() {
        let mut stack = Stack::new(0);
        let n = Stack::ENTRIES_PER_CHUNK * 2 + 3;
        for i in 0..n {
            assert!(stack.push(i));
        }
        assert_eq!(stack.len(), n);
        assert_eq!(stack.chunk_count(), 3);
        for i in (0..n).rev() {
            assert_eq!(stack.pop(), Some(i));
        }
        assert!(stack.is_empty());
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn push_fails_at_chunk_limit() {
        let mut stack = Stack::new(2);
        for i in 0..Stack::ENTRIES_PER_CHUNK * 2 {
            assert!(stack.push(i));
        }
        assert!(!stack.push(0));
        assert_eq!(stack.len(), Stack::ENTRIES_PER_CHUNK * 2);
        stack.pop();
        assert!(stack.push(0));
    }

    #[test]
    fn split_moves_whole_chunks() {
        let mut stack = Stack::new(0);
        let n = Stack::ENTRIES_PER_CHUNK * 5 + 1;
        for i in 0..n {
            assert!(stack.push(i));
        }
        let mut pieces = stack.split(3);
        assert_eq!(pieces.len(), 3);
        assert_eq!(stack.len(), 1);
        let moved: usize = pieces.iter().map(|p| p.len()).sum();
        assert_eq!(moved + 1, n);

        for piece in pieces.iter_mut() {
            stack.append(piece);
            assert!(piece.is_empty());
        }
        assert_eq!(stack.len(), n);
    }

    #[test]
    fn split_without_full_chunks_keeps_everything() {
        let mut stack = Stack::new(0);
        assert!(stack.push(1));
        assert!(stack.split(4).is_empty());
        assert_eq!(stack.len(), 1);
    }
}
