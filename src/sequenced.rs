/// A payload tagged with the sequence id it was given at pipeline entry.
///
/// The id is fixed at construction; only the payload can be replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequenced<T> {
    seq: u64,
    payload: T,
}

impl<T> Sequenced<T> {
    pub fn new(seq: u64, payload: T) -> Self {
        Self { seq, payload }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut T {
        &mut self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Swap in a new payload, keeping the sequence id
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Sequenced<U> {
        Sequenced {
            seq: self.seq,
            payload: f(self.payload),
        }
    }
}

/// Hands out contiguous sequence ids starting at 1
#[derive(Debug)]
pub struct Sequencer {
    next: u64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Tag `payload` with the next id
    pub fn stamp<T>(&mut self, payload: T) -> Sequenced<T> {
        let item = Sequenced::new(self.next, payload);
        self.next += 1;
        item
    }

    /// Number of ids handed out so far
    pub fn issued(&self) -> u64 {
        self.next - 1
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}
