use crate::{Arena, BufId, Error, Tag};
use std::collections::{vec_deque, VecDeque};
use tracing::trace;

/// Reference to one [crate::Buf] within a [Chain].
///
/// Links are allocated from (and returned to) an [Arena]. Many links may reference the same
/// buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Link {
    buf: BufId,
}

impl Link {
    pub(crate) const fn new(buf: BufId) -> Self {
        Self { buf }
    }

    /// The referenced buffer.
    pub const fn buf(&self) -> BufId {
        self.buf
    }
}

/// Ordered sequence of [Link]s.
#[derive(Clone, Debug, Default)]
pub struct Chain {
    links: VecDeque<Link>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn front(&self) -> Option<&Link> {
        self.links.front()
    }

    pub fn get(&self, index: usize) -> Option<&Link> {
        self.links.get(index)
    }

    pub fn push_back(&mut self, link: Link) {
        self.links.push_back(link);
    }

    pub fn push_front(&mut self, link: Link) {
        self.links.push_front(link);
    }

    pub fn pop_front(&mut self) -> Option<Link> {
        self.links.pop_front()
    }

    /// Move all links of `other` to the end of this chain.
    pub fn append(&mut self, other: &mut Chain) {
        self.links.append(&mut other.links);
    }

    pub fn iter(&self) -> vec_deque::Iter<'_, Link> {
        self.links.iter()
    }

    /// Total unconsumed bytes across all referenced buffers.
    pub fn size(&self, arena: &Arena) -> u64 {
        self.links
            .iter()
            .map(|link| arena.buf(link.buf).size())
            .sum()
    }

    /// Release every link back to the arena's link cache.
    pub fn release(&mut self, arena: &mut Arena) {
        for link in self.links.drain(..) {
            arena.free_chain_link(link);
        }
    }
}

impl IntoIterator for Chain {
    type Item = Link;
    type IntoIter = vec_deque::IntoIter<Link>;

    fn into_iter(self) -> Self::IntoIter {
        self.links.into_iter()
    }
}

impl<'a> IntoIterator for &'a Chain {
    type Item = &'a Link;
    type IntoIter = vec_deque::Iter<'a, Link>;

    fn into_iter(self) -> Self::IntoIter {
        self.links.iter()
    }
}

impl FromIterator<Link> for Chain {
    fn from_iter<T: IntoIterator<Item = Link>>(iter: T) -> Self {
        Self {
            links: iter.into_iter().collect(),
        }
    }
}

impl Extend<Link> for Chain {
    fn extend<T: IntoIterator<Item = Link>>(&mut self, iter: T) {
        self.links.extend(iter);
    }
}

/// Append to `chain` a new link for each buffer referenced by `input`, preserving order.
///
/// Buffers are shared, not copied. If a link allocation fails, the links appended before the
/// failure remain in `chain`.
pub fn chain_add_copy(arena: &mut Arena, chain: &mut Chain, input: &Chain) -> Result<(), Error> {
    for link in input {
        let copy = arena.alloc_chain_link(link.buf)?;
        chain.push_back(copy);
    }
    Ok(())
}

/// Free and busy lists of one buffer owner.
///
/// `busy` holds links submitted downstream, in submission order. Once the head of `busy` is
/// fully consumed it moves to `free` (if this pool owns it) for reuse.
#[derive(Debug)]
pub struct Pool {
    tag: Tag,
    free: Chain,
    busy: Chain,
}

impl Pool {
    pub fn new(tag: Tag) -> Self {
        Self {
            tag,
            free: Chain::new(),
            busy: Chain::new(),
        }
    }

    pub const fn tag(&self) -> Tag {
        self.tag
    }

    /// Buffers available for reuse.
    pub const fn free(&self) -> &Chain {
        &self.free
    }

    /// Buffers submitted downstream and not yet reclaimed.
    pub const fn busy(&self) -> &Chain {
        &self.busy
    }

    /// Pop a reusable link from `free`, or allocate a link to a fresh empty descriptor owned
    /// by this pool.
    pub fn get_free_buf(&mut self, arena: &mut Arena) -> Result<Link, Error> {
        if let Some(link) = self.free.pop_front() {
            return Ok(link);
        }
        let id = arena.alloc_buf()?;
        arena.buf_mut(id).set_tag(self.tag);
        arena.alloc_chain_link(id)
    }

    /// Pop a reusable link from `free`, if any.
    pub(crate) fn take_free(&mut self) -> Option<Link> {
        self.free.pop_front()
    }

    /// Whether buffers tagged `tag` may be recycled by this pool. Nothing tagged
    /// [Tag::NONE] is ever recycled, even by a pool created with that tag.
    fn owns(&self, tag: Tag) -> bool {
        tag != Tag::NONE && tag == self.tag
    }

    /// Return a link owned by this pool to `free`.
    pub fn recycle(&mut self, arena: &mut Arena, link: Link) -> Result<(), Error> {
        let found = arena.buf(link.buf).tag();
        if !self.owns(found) {
            return Err(Error::TagMismatch {
                expected: self.tag,
                found,
            });
        }
        arena.reset(link.buf);
        self.free.push_front(link);
        Ok(())
    }

    /// Reclaim consumed buffers from `busy`, then append `out` (the links just submitted
    /// downstream) to `busy`.
    pub fn update_chains(&mut self, arena: &mut Arena, mut out: Chain) {
        self.reclaim(arena);
        self.busy.append(&mut out);
    }

    /// Walk `busy` from its head, stopping at the first buffer with unconsumed bytes.
    ///
    /// Consumed buffers owned by this pool move to `free` with their memory reset. Consumed
    /// buffers of other owners, and intermediate slices that do not own their storage, only
    /// have their links released. Returns the number of buffers moved to `free`.
    pub fn reclaim(&mut self, arena: &mut Arena) -> usize {
        let mut reclaimed = 0;
        while let Some(link) = self.busy.front().copied() {
            let buf = arena.buf(link.buf);
            if buf.size() != 0 {
                break;
            }
            self.busy.pop_front();

            if !self.owns(buf.tag()) || !buf.releases_storage() {
                trace!(buf = ?link.buf, tag = ?buf.tag(), "released consumed link");
                arena.free_chain_link(link);
                continue;
            }

            arena.reset(link.buf);
            self.free.push_front(link);
            reclaimed += 1;
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Bufs, Flags};
    use bytes::Bytes;
    use std::num::NonZeroUsize;
    use strand_macros::test_traced;

    fn filled(arena: &mut Arena, tag: Tag, data: &[u8]) -> Link {
        let id = arena.create_temp_buf(data.len().max(1)).unwrap();
        arena.spare_mut(id, data.len()).unwrap().copy_from_slice(data);
        let buf = arena.buf_mut(id);
        buf.last = data.len();
        buf.set_tag(tag);
        buf.flags.recycled = true;
        arena.alloc_chain_link(id).unwrap()
    }

    fn consume(arena: &mut Arena, link: Link) {
        let buf = arena.buf_mut(link.buf());
        buf.pos = buf.last;
    }

    #[test_traced]
    fn test_chain_add_copy() {
        let mut arena = Arena::unbounded();
        let a = arena.create_memory_buf(Bytes::from_static(b"a")).unwrap();
        let b = arena.create_memory_buf(Bytes::from_static(b"b")).unwrap();
        let input: Chain = [a, b]
            .into_iter()
            .map(|id| arena.alloc_chain_link(id).unwrap())
            .collect();

        let mut chain = Chain::new();
        chain_add_copy(&mut arena, &mut chain, &input).unwrap();
        chain_add_copy(&mut arena, &mut chain, &input).unwrap();
        let ids: Vec<_> = chain.iter().map(|l| l.buf()).collect();
        assert_eq!(ids, vec![a, b, a, b]);
        assert_eq!(input.len(), 2);
    }

    #[test_traced]
    fn test_chain_add_copy_partial() {
        let mut arena = Arena::unbounded();
        let id = arena.alloc_buf().unwrap();
        let input: Chain = (0..3).map(|_| arena.alloc_chain_link(id).unwrap()).collect();

        // Only enough budget for one more link
        let mut arena_small = Arena::new(std::mem::size_of::<Link>());
        let mut chain = Chain::new();
        let result = chain_add_copy(&mut arena_small, &mut chain, &input);
        assert!(matches!(result, Err(Error::Allocation { .. })));
        assert_eq!(chain.len(), 1);
    }

    #[test_traced]
    fn test_get_free_buf() {
        let mut arena = Arena::unbounded();
        let tag = Tag::new(3);
        let mut pool = Pool::new(tag);

        // Empty free list allocates a fresh descriptor
        let fresh = pool.get_free_buf(&mut arena).unwrap();
        assert_eq!(arena.buf(fresh.buf()).tag(), tag);
        assert_eq!(arena.buf(fresh.buf()).size(), 0);

        // Recycled links are reused most recent first
        let a = filled(&mut arena, tag, b"a");
        let b = filled(&mut arena, tag, b"b");
        pool.recycle(&mut arena, a).unwrap();
        pool.recycle(&mut arena, b).unwrap();
        assert_eq!(pool.get_free_buf(&mut arena).unwrap(), b);
        assert_eq!(pool.get_free_buf(&mut arena).unwrap(), a);
        assert_eq!(arena.buf(a.buf()).size(), 0);
    }

    #[test_traced]
    fn test_recycle_foreign_tag() {
        let mut arena = Arena::unbounded();
        let mut pool = Pool::new(Tag::new(1));
        let link = filled(&mut arena, Tag::new(2), b"x");
        assert!(matches!(
            pool.recycle(&mut arena, link),
            Err(Error::TagMismatch { .. })
        ));
        assert!(pool.free().is_empty());
    }

    #[test_traced]
    fn test_untagged_never_recycled() {
        let mut arena = Arena::unbounded();
        let mut pool = Pool::new(Tag::NONE);

        // Producer memory carries no tag
        let id = arena.create_memory_buf(Bytes::from_static(b"producer")).unwrap();
        let producer = arena.alloc_chain_link(id).unwrap();
        assert!(matches!(
            pool.recycle(&mut arena, producer),
            Err(Error::TagMismatch { .. })
        ));

        // Consumed untagged buffers only have their links released
        let untagged = filled(&mut arena, Tag::NONE, b"u");
        pool.update_chains(&mut arena, [producer, untagged].into_iter().collect());
        consume(&mut arena, producer);
        consume(&mut arena, untagged);
        assert_eq!(pool.reclaim(&mut arena), 0);
        assert!(pool.busy().is_empty());
        assert!(pool.free().is_empty());
    }

    #[test_traced]
    fn test_update_chains_reclaims_consumed_prefix() {
        let mut arena = Arena::unbounded();
        let tag = Tag::new(9);
        let mut pool = Pool::new(tag);
        let a = filled(&mut arena, tag, b"aaaa");
        let b = filled(&mut arena, tag, b"bbbb");
        pool.update_chains(&mut arena, [a, b].into_iter().collect());
        assert_eq!(pool.busy().len(), 2);
        assert!(pool.free().is_empty());

        // Nothing consumed yet
        pool.update_chains(&mut arena, Chain::new());
        assert_eq!(pool.busy().len(), 2);

        // Only the consumed head moves
        consume(&mut arena, a);
        pool.update_chains(&mut arena, Chain::new());
        assert_eq!(pool.busy().len(), 1);
        assert_eq!(pool.free().len(), 1);
        let buf = arena.buf(a.buf());
        assert_eq!(buf.pos(), buf.start());
        assert_eq!(buf.last(), buf.start());

        // Reclaim happens before new output is appended
        let c = filled(&mut arena, tag, b"");
        consume(&mut arena, b);
        pool.update_chains(&mut arena, [c].into_iter().collect());
        assert_eq!(pool.free().len(), 2);
        assert_eq!(pool.busy().len(), 1);
    }

    #[test_traced]
    fn test_update_chains_tag_isolation() {
        let mut arena = Arena::unbounded();
        let ours = Tag::new(1);
        let mut pool = Pool::new(ours);
        let foreign = filled(&mut arena, Tag::new(2), b"f");
        let marker = arena.create_special_buf(Flags::flush()).unwrap();
        let marker = arena.alloc_chain_link(marker).unwrap();
        let own = filled(&mut arena, ours, b"o");
        pool.update_chains(&mut arena, [foreign, marker, own].into_iter().collect());

        consume(&mut arena, foreign);
        consume(&mut arena, own);
        let cached = arena.cached_links();
        pool.update_chains(&mut arena, Chain::new());
        assert!(pool.busy().is_empty());
        assert_eq!(pool.free().len(), 1);
        assert_eq!(pool.free().front(), Some(&own));
        assert_eq!(arena.cached_links(), cached + 2);

        // Foreign memory is never reset
        assert_eq!(arena.buf(foreign.buf()).pos(), 1);
    }

    #[test_traced]
    fn test_update_chains_shadow_slices() {
        let mut arena = Arena::unbounded();
        let tag = Tag::new(4);
        let mut pool = Pool::new(tag);
        let mut chain = arena
            .create_chain_of_bufs(
                Bufs::new(NonZeroUsize::new(1).unwrap(), NonZeroUsize::new(8).unwrap()),
                tag,
            )
            .unwrap();
        let tail = chain.pop_front().unwrap();
        arena.spare_mut(tail.buf(), 6).unwrap().copy_from_slice(b"abcdef");
        arena.buf_mut(tail.buf()).last = 6;
        let head = arena.split(tail.buf(), 4).unwrap();
        let head = arena.alloc_chain_link(head).unwrap();
        pool.update_chains(&mut arena, [head, tail].into_iter().collect());

        consume(&mut arena, head);
        consume(&mut arena, tail);
        pool.update_chains(&mut arena, Chain::new());

        // Only the slice owning the storage is reused, restored to the whole block
        assert_eq!(pool.free().len(), 1);
        assert_eq!(pool.free().front(), Some(&tail));
        assert_eq!(arena.buf(tail.buf()).room(), 8);
    }
}
