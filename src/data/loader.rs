use crate::error::{ExpError, Result};

/// Trait for batch sources consumed by the trainer
pub trait BatchSource {
    type Batch;

    /// Get the next batch, `None` once the source is exhausted
    fn next_batch(&mut self) -> Result<Option<Self::Batch>>;

    /// Rewind to the first batch; validation sources must support this
    fn reset(&mut self) -> Result<()>;

    /// Get the total number of batches (if known)
    fn num_batches(&self) -> Option<usize> {
        None
    }
}

/// In-memory batches, finite with a known length and rewindable
#[derive(Debug, Clone)]
pub struct VecSource<T> {
    batches: Vec<T>,
    current_batch: usize,
}

impl<T: Clone> VecSource<T> {
    pub fn new(batches: Vec<T>) -> Self {
        Self {
            batches,
            current_batch: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

impl<T: Clone> BatchSource for VecSource<T> {
    type Batch = T;

    fn next_batch(&mut self) -> Result<Option<T>> {
        let batch = self.batches.get(self.current_batch).cloned();
        if batch.is_some() {
            self.current_batch += 1;
        }
        Ok(batch)
    }

    fn reset(&mut self) -> Result<()> {
        self.current_batch = 0;
        Ok(())
    }

    fn num_batches(&self) -> Option<usize> {
        Some(self.batches.len())
    }
}

/// Wraps any iterator; may be endless and cannot be rewound
pub struct IterSource<I> {
    iter: I,
}

impl<I: Iterator> IterSource<I> {
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<I: Iterator> BatchSource for IterSource<I> {
    type Batch = I::Item;

    fn next_batch(&mut self) -> Result<Option<I::Item>> {
        Ok(self.iter.next())
    }

    fn reset(&mut self) -> Result<()> {
        Err(ExpError::configuration(
            "iterator batch source cannot be iterated again from the start",
        ))
    }
}

/// Repeats a rewindable source for a number of epochs
pub struct Repeat<S> {
    inner: S,
    epochs: usize,
    current_epoch: usize,
}

impl<S: BatchSource> Repeat<S> {
    pub fn new(inner: S, epochs: usize) -> Self {
        Self {
            inner,
            epochs,
            current_epoch: 0,
        }
    }
}

impl<S: BatchSource> BatchSource for Repeat<S> {
    type Batch = S::Batch;

    fn next_batch(&mut self) -> Result<Option<S::Batch>> {
        while self.current_epoch < self.epochs {
            if let Some(batch) = self.inner.next_batch()? {
                return Ok(Some(batch));
            }
            self.current_epoch += 1;
            if self.current_epoch < self.epochs {
                self.inner.reset()?;
            }
        }
        Ok(None)
    }

    fn reset(&mut self) -> Result<()> {
        self.current_epoch = 0;
        self.inner.reset()
    }

    fn num_batches(&self) -> Option<usize> {
        self.inner.num_batches().map(|n| n * self.epochs)
    }
}
