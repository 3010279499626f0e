use serde::Serialize;

/// Statistics counter. Never wraps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Counter(u64);

impl Counter {
    pub fn inc(&mut self) {
        self.add(1);
    }

    pub fn add(&mut self, n: u64) {
        self.0 = self.0.saturating_add(n);
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Up/down counter clamped to `0..=max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaturatingCounter {
    value: u32,
    max: u32,
}

impl SaturatingCounter {
    pub fn new(max: u32, initial: u32) -> Self {
        Self {
            value: initial.min(max),
            max,
        }
    }

    pub fn increment(&mut self) {
        if self.value < self.max {
            self.value += 1;
        }
    }

    pub fn decrement(&mut self) {
        self.value = self.value.saturating_sub(1);
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// True when the counter sits strictly above the midpoint of its range.
    pub fn above_half(&self) -> bool {
        self.value > self.max / 2
    }
}

/// Modulo-`size` counter. Advances by one and wraps to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclicPointer {
    value: u32,
    size: u32,
}

impl CyclicPointer {
    pub fn new(size: u32) -> Self {
        Self {
            value: 0,
            size: size.max(1),
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn increment(&mut self) {
        self.value = (self.value + 1) % self.size;
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_counter_clamps_both_ends() {
        let mut c = SaturatingCounter::new(3, 3);
        c.increment();
        assert_eq!(3, c.value());
        for _ in 0..10 {
            c.decrement();
        }
        assert_eq!(0, c.value());
    }

    #[test]
    fn above_half_is_strict() {
        let mut c = SaturatingCounter::new(4, 2);
        assert!(!c.above_half());
        c.increment();
        assert!(c.above_half());
    }

    #[test]
    fn cyclic_pointer_wraps() {
        let mut p = CyclicPointer::new(3);
        p.increment();
        p.increment();
        assert_eq!(2, p.value());
        p.increment();
        assert!(p.is_zero());
    }

    #[test]
    fn counter_saturates() {
        let mut c = Counter::default();
        c.add(u64::MAX);
        c.inc();
        assert_eq!(u64::MAX, c.get());
    }
}
