//! Helpers for scatter/gather buffer lists.

use std::io::{IoSlice, IoSliceMut};

/// Total capacity of a scatter list.
pub(crate) fn capacity(bufs: &[IoSliceMut<'_>]) -> usize {
    bufs.iter().map(|buf| buf.len()).sum()
}

/// Total length of a gather list.
pub(crate) fn gather_len(bufs: &[IoSlice<'_>]) -> usize {
    bufs.iter().map(|buf| buf.len()).sum()
}

/// Copies as much of `src` as fits into `bufs`, filling them in order.
pub(crate) fn scatter(src: &[u8], bufs: &mut [IoSliceMut<'_>]) -> usize {
    let mut copied = 0;
    for buf in bufs.iter_mut() {
        if copied == src.len() {
            break;
        }
        let count = buf.len().min(src.len() - copied);
        buf[..count].copy_from_slice(&src[copied..copied + count]);
        copied += count;
    }
    copied
}

/// Views `bufs` with the first `skip` bytes removed.
pub(crate) fn scatter_tail<'b>(bufs: &'b mut [IoSliceMut<'_>], skip: usize) -> Vec<IoSliceMut<'b>> {
    let mut remaining_skip = skip;
    let mut tail = Vec::with_capacity(bufs.len());
    for buf in bufs.iter_mut() {
        if remaining_skip >= buf.len() {
            remaining_skip -= buf.len();
            continue;
        }
        tail.push(IoSliceMut::new(&mut buf[remaining_skip..]));
        remaining_skip = 0;
    }
    tail
}

/// Appends the bytes of `bufs`, minus the first `skip`, to `out`.
pub(crate) fn gather_into(bufs: &[IoSlice<'_>], skip: usize, out: &mut Vec<u8>) {
    let mut remaining_skip = skip;
    for buf in bufs {
        if remaining_skip >= buf.len() {
            remaining_skip -= buf.len();
            continue;
        }
        out.extend_from_slice(&buf[remaining_skip..]);
        remaining_skip = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scatter_spans_buffers() {
        let mut first = [0u8; 2];
        let mut second = [0u8; 4];
        let mut bufs = [IoSliceMut::new(&mut first), IoSliceMut::new(&mut second)];

        let copied = scatter(b"abcde", &mut bufs);

        assert_eq!(copied, 5);
        assert_eq!(&first, b"ab");
        assert_eq!(&second[..3], b"cde");
    }

    #[test]
    fn test_scatter_tail_skips_into_second_buffer() {
        let mut first = [0u8; 2];
        let mut second = [0u8; 4];
        let mut bufs = [IoSliceMut::new(&mut first), IoSliceMut::new(&mut second)];

        let mut tail = scatter_tail(&mut bufs, 3);
        assert_eq!(tail.len(), 1);
        assert_eq!(capacity(&tail), 3);

        scatter(b"xyz", &mut tail);
        drop(tail);
        assert_eq!(&second, b"\0xyz");
    }

    #[test]
    fn test_gather_into_skips_prefix() {
        let bufs = [IoSlice::new(b"hello"), IoSlice::new(b" world")];
        let mut out = Vec::new();

        gather_into(&bufs, 3, &mut out);

        assert_eq!(out, b"lo world");
        assert_eq!(gather_len(&bufs), 11);
    }
}
