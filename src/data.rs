//! Endless iteration over a restartable data source.

/// Cycles through the iterators produced by `factory`, building a new one
/// each time the previous epoch ends.
///
/// Unlike [`Iterator::cycle`] the inner iterator need not be `Clone`, so a
/// factory can reshuffle or reopen files every epoch. Iteration stops if a
/// freshly built epoch yields nothing.
pub struct Repeat<F, I> {
    factory: F,
    current: Option<I>,
    epoch: usize,
    yielded_this_epoch: bool,
}

impl<F, I> Repeat<F, I>
where
    F: FnMut() -> I,
    I: Iterator,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            current: None,
            epoch: 0,
            yielded_this_epoch: false,
        }
    }

    /// Number of epochs started so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl<F, I> Iterator for Repeat<F, I>
where
    F: FnMut() -> I,
    I: Iterator,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = self.current.as_mut() {
                if let Some(item) = iter.next() {
                    self.yielded_this_epoch = true;
                    return Some(item);
                }
                if !self.yielded_this_epoch {
                    tracing::debug!(epoch = self.epoch, "empty epoch, stopping");
                    self.current = None;
                    return None;
                }
            } else if self.epoch > 0 && !self.yielded_this_epoch {
                // Already stopped on an empty epoch.
                return None;
            }
            self.current = Some((self.factory)());
            self.epoch += 1;
            self.yielded_this_epoch = false;
            tracing::debug!(epoch = self.epoch, "starting epoch");
        }
    }
}

/// Shorthand for [`Repeat::new`].
pub fn repeat<F, I>(factory: F) -> Repeat<F, I>
where
    F: FnMut() -> I,
    I: Iterator,
{
    Repeat::new(factory)
}
