use crate::{Arena, Chain};

/// Advance the buffers of `chain` past `sent` bytes accepted by a transport.
///
/// Fully consumed buffers are emptied (not removed) so that [crate::Pool::update_chains] can
/// observe and reclaim them; a partially consumed buffer is advanced by the remainder.
/// Payload-less markers are skipped. Returns the index of the first link at which transmission
/// should resume, or `None` if nothing remains.
pub fn update_sent(arena: &mut Arena, chain: &Chain, mut sent: u64) -> Option<usize> {
    for (index, link) in chain.iter().enumerate() {
        let buf = arena.buf_mut(link.buf());
        if buf.is_special() {
            continue;
        }
        if sent == 0 {
            return Some(index);
        }

        let size = buf.size();
        if sent >= size {
            sent -= size;
            if buf.in_memory() {
                buf.pos = buf.last;
            }
            if buf.flags.in_file {
                buf.file_pos = buf.file_last;
            }
            continue;
        }

        if buf.in_memory() {
            buf.pos += sent as usize;
        }
        if buf.flags.in_file {
            buf.file_pos += sent;
        }
        return Some(index);
    }
    None
}
