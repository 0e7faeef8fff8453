/// Growable text accumulator with bounded capacity.
///
/// Starts at 4 KiB. Past the 1 MiB ceiling the capacity is rebalanced down
/// to what the content actually needs; content itself is never dropped.
#[derive(Debug)]
pub struct BoundedBuilder {
    buf: String,
}

const INITIAL_CAPACITY: usize = 4 * 1024;
const CAPACITY_CEILING: usize = 1024 * 1024;

impl Default for BoundedBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BoundedBuilder {
    pub fn new() -> Self {
        Self {
            buf: String::with_capacity(INITIAL_CAPACITY),
        }
    }

    pub fn push_str(&mut self, s: &str) {
        self.buf.push_str(s);
        if self.buf.capacity() > CAPACITY_CEILING {
            self.buf.shrink_to(self.buf.len().max(INITIAL_CAPACITY));
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_string(self) -> String {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_survives_capacity_rebalance() {
        let mut b = BoundedBuilder::new();
        let chunk = "x".repeat(64 * 1024);
        for _ in 0..40 {
            b.push_str(&chunk);
        }
        assert_eq!(b.len(), 40 * 64 * 1024);
        assert!(b.as_str().chars().all(|c| c == 'x'));
    }
}
