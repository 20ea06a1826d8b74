use crate::{Arena, File, Link};

/// Returns the system page size.
#[cfg(unix)]
pub(crate) fn page_size() -> u64 {
    // SAFETY: sysconf is safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096 // Safe fallback if sysconf fails
    } else {
        size as u64
    }
}

#[cfg(not(unix))]
#[allow(clippy::missing_const_for_fn)]
pub(crate) fn page_size() -> u64 {
    4096
}

/// A run of file buffers that may be transmitted as one range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Coalesced {
    /// Bytes in the merged range, starting at the first buffer's `file_pos`.
    pub size: u64,
    /// Links (from the head) covered wholly or partially by the range.
    pub links: usize,
}

/// Merge the leading file buffers of `links` that reference the same file and are contiguous
/// in it, up to `limit` bytes.
///
/// Stops at the first buffer that is not file-backed, refers to another file, or leaves a gap.
/// When the range is truncated at `limit`, its end is rounded down to a page boundary if that
/// keeps it non-empty. Buffers are not modified.
pub fn coalesce_file<'a>(
    arena: &Arena,
    links: impl IntoIterator<Item = &'a Link>,
    limit: u64,
) -> Coalesced {
    coalesce(arena, links, limit, page_size())
}

fn coalesce<'a>(
    arena: &Arena,
    links: impl IntoIterator<Item = &'a Link>,
    limit: u64,
    page: u64,
) -> Coalesced {
    let mut result = Coalesced::default();
    let mut head: Option<(&File, u64)> = None;
    for link in links {
        let buf = arena.buf(link.buf());
        let Some(file) = buf.file().filter(|_| buf.flags.in_file) else {
            break;
        };
        match head {
            None => head = Some((file, buf.file_pos())),
            Some((first, offset)) => {
                if result.size >= limit || !buf.continues_file(first, offset + result.size) {
                    break;
                }
            }
        }

        let size = buf.file_last() - buf.file_pos();
        let remaining = limit - result.size;
        if size > remaining {
            // Round the end of the whole range down without cutting into earlier buffers
            let start = head.map_or(buf.file_pos(), |(_, offset)| offset);
            let mut take = remaining;
            let end = (buf.file_pos() + take) & !(page - 1);
            if end > start && end >= buf.file_pos() {
                take = end - buf.file_pos();
            }
            result.size += take;
            if take > 0 {
                result.links += 1;
            }
            break;
        }
        result.size += size;
        result.links += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Chain, File};
    use bytes::Bytes;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use strand_macros::test_traced;

    const PAGE: u64 = 4096;

    fn file_chain(arena: &mut Arena, ranges: &[(&File, u64, u64)]) -> Chain {
        ranges
            .iter()
            .map(|(file, start, end)| {
                let id = arena
                    .create_file_buf((*file).clone(), *start..*end)
                    .unwrap();
                arena.alloc_chain_link(id).unwrap()
            })
            .collect()
    }

    #[test_traced]
    fn test_merges_contiguous() {
        let mut arena = Arena::unbounded();
        let file = File::from_bytes("f", vec![0u8; 1000]);
        let chain = file_chain(
            &mut arena,
            &[(&file, 0, 100), (&file, 100, 300), (&file, 300, 301)],
        );
        let result = coalesce(&arena, &chain, u64::MAX, PAGE);
        assert_eq!(result, Coalesced { size: 301, links: 3 });
    }

    #[test_traced]
    fn test_stops_at_gap() {
        let mut arena = Arena::unbounded();
        let file = File::from_bytes("f", vec![0u8; 1000]);
        let chain = file_chain(&mut arena, &[(&file, 0, 100), (&file, 101, 300)]);
        let result = coalesce(&arena, &chain, u64::MAX, PAGE);
        assert_eq!(result, Coalesced { size: 100, links: 1 });
    }

    #[test_traced]
    fn test_stops_at_other_file() {
        let mut arena = Arena::unbounded();
        let a = File::from_bytes("a", vec![0u8; 1000]);
        let b = File::from_bytes("a", vec![0u8; 1000]);
        let chain = file_chain(&mut arena, &[(&a, 0, 100), (&b, 100, 300)]);
        let result = coalesce(&arena, &chain, u64::MAX, PAGE);
        assert_eq!(result, Coalesced { size: 100, links: 1 });
    }

    #[test_traced]
    fn test_stops_at_memory() {
        let mut arena = Arena::unbounded();
        let file = File::from_bytes("f", vec![0u8; 1000]);
        let mut chain = file_chain(&mut arena, &[(&file, 0, 100)]);
        let memory = arena.create_memory_buf(Bytes::from_static(b"x")).unwrap();
        chain.push_back(arena.alloc_chain_link(memory).unwrap());
        chain.extend(file_chain(&mut arena, &[(&file, 100, 200)]));
        assert_eq!(coalesce(&arena, &chain, u64::MAX, PAGE).size, 100);

        // A chain starting in memory has nothing to coalesce
        let head: Chain = chain.iter().skip(1).copied().collect();
        assert_eq!(coalesce(&arena, &head, u64::MAX, PAGE), Coalesced::default());
    }

    #[test_traced]
    fn test_truncates_to_page() {
        let mut arena = Arena::unbounded();
        let file = File::from_bytes("f", vec![0u8; 3 * PAGE as usize]);
        let chain = file_chain(&mut arena, &[(&file, 0, PAGE), (&file, PAGE, 3 * PAGE)]);

        // Limit inside the second buffer rounds down to its page boundary
        let result = coalesce(&arena, &chain, PAGE + PAGE / 2 + 10, PAGE);
        assert_eq!(result, Coalesced { size: PAGE, links: 1 });

        // Limit inside the first page cannot be rounded without emptying the range
        let result = coalesce(&arena, &chain, 100, PAGE);
        assert_eq!(result, Coalesced { size: 100, links: 1 });

        // Exact limits are kept
        let result = coalesce(&arena, &chain, 2 * PAGE, PAGE);
        assert_eq!(result, Coalesced { size: 2 * PAGE, links: 2 });
    }

    #[test_traced]
    fn test_random_bounds() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..200 {
            let mut arena = Arena::unbounded();
            let a = File::from_bytes("a", vec![0u8; 1 << 20]);
            let b = File::from_bytes("b", vec![0u8; 1 << 20]);
            let mut chain = Chain::new();
            let mut offset = 0u64;
            for _ in 0..rng.gen_range(1..8) {
                let file = if rng.gen_bool(0.1) { &b } else { &a };
                if rng.gen_bool(0.1) {
                    offset += rng.gen_range(1..100);
                }
                let len = rng.gen_range(0..20_000);
                chain.extend(file_chain(&mut arena, &[(file, offset, offset + len)]));
                offset += len;
            }
            let limit = rng.gen_range(0..60_000);
            let result = coalesce(&arena, &chain, limit, PAGE);
            assert!(result.size <= limit);

            // Every covered buffer continues the previous one in the same file
            let first = arena.buf(chain.front().unwrap().buf());
            let mut expected = first.file_pos();
            for link in chain.iter().take(result.links) {
                let buf = arena.buf(link.buf());
                assert!(buf.continues_file(first.file().unwrap(), expected));
                expected = buf.file_last();
            }
        }
    }

    #[test_traced]
    fn test_page_size() {
        let page = page_size();
        assert!(page.is_power_of_two());
        let mut arena = Arena::unbounded();
        let file = File::from_bytes("f", vec![0u8; 4 * page as usize]);
        let chain = file_chain(&mut arena, &[(&file, 0, 4 * page)]);
        assert_eq!(coalesce_file(&arena, &chain, 2 * page + 1).size, 2 * page);
    }
}
