use serde::{Deserialize, Serialize};

/// A selection or cursor over the linear document.
///
/// `from` is the anchor and `to` the focus, so a backwards selection has
/// `from > to`. A collapsed range is a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub from: usize,
    pub to: usize,
}

impl Range {
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }

    pub fn cursor(offset: usize) -> Self {
        Self {
            from: offset,
            to: offset,
        }
    }

    pub fn start(&self) -> usize {
        self.from.min(self.to)
    }

    pub fn end(&self) -> usize {
        self.from.max(self.to)
    }

    pub fn len(&self) -> usize {
        self.end() - self.start()
    }

    pub fn is_collapsed(&self) -> bool {
        self.from == self.to
    }

    pub fn is_backwards(&self) -> bool {
        self.from > self.to
    }

    /// Half-open overlap test. Empty ranges strictly inside the other range
    /// overlap it; ranges that merely touch do not.
    pub fn overlaps(&self, other: &Range) -> bool {
        !(self.end() <= other.start() || other.end() <= self.start())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backwards_range() {
        let r = Range::new(8, 3);
        assert!(r.is_backwards());
        assert_eq!(r.start(), 3);
        assert_eq!(r.end(), 8);
        assert_eq!(r.len(), 5);
    }

    #[test]
    fn test_overlap() {
        assert!(Range::new(2, 6).overlaps(&Range::new(5, 9)));
        assert!(!Range::new(2, 5).overlaps(&Range::new(5, 9)));
        assert!(Range::new(2, 6).overlaps(&Range::cursor(4)));
        assert!(!Range::new(2, 6).overlaps(&Range::cursor(6)));
        assert!(!Range::cursor(3).overlaps(&Range::cursor(3)));
    }
}
