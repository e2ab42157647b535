//! Scoped Teardown
//!
//! Multi-step setup records an undo step after each acquisition. If the
//! sequence fails part-way, dropping the stack runs the recorded steps in
//! reverse order. On success, [`Teardown::commit`] disarms it.
//!
//! ```ignore
//! let mut undo = Teardown::new("remote mqt open");
//! engine.open(proc, to_dsp, &attrs)?;
//! undo.push("close to_dsp", || { let _ = engine.close(proc, to_dsp); });
//! engine.open(proc, fm_dsp, &attrs)?;   // on error, to_dsp is closed
//! undo.commit();
//! ```

use log::warn;

type Step<'a> = (&'static str, Box<dyn FnOnce() + 'a>);

/// Reverse-order undo stack for partially completed setup
pub struct Teardown<'a> {
    what: &'static str,
    steps: Vec<Step<'a>>,
}

impl<'a> Teardown<'a> {
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            steps: Vec::new(),
        }
    }

    /// Record how to undo the step that just succeeded
    pub fn push(&mut self, name: &'static str, undo: impl FnOnce() + 'a) {
        self.steps.push((name, Box::new(undo)));
    }

    /// Number of recorded undo steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Setup completed; forget every undo step
    pub fn commit(mut self) {
        self.steps.clear();
    }
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        if self.steps.is_empty() {
            return;
        }
        warn!("{}: rolling back {} step(s)", self.what, self.steps.len());
        while let Some((name, undo)) = self.steps.pop() {
            log::debug!("{}: undo {}", self.what, name);
            undo();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;

    #[test]
    fn test_unwinds_in_reverse() {
        let order = RefCell::new(Vec::new());
        {
            let mut undo = Teardown::new("test");
            undo.push("a", || order.borrow_mut().push("a"));
            undo.push("b", || order.borrow_mut().push("b"));
            undo.push("c", || order.borrow_mut().push("c"));
            assert_eq!(undo.len(), 3);
        }
        assert_eq!(*order.borrow(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_commit_disarms() {
        let ran = RefCell::new(false);
        {
            let mut undo = Teardown::new("test");
            undo.push("a", || *ran.borrow_mut() = true);
            undo.commit();
        }
        assert!(!*ran.borrow());
    }
}
