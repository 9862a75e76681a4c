//! Frozen snapshots used as distillation targets.

use serde::Serialize;
use std::ops::Deref;

/// An immutable, independently owned copy of a model (or ensemble) captured at
/// a task boundary.
///
/// The live value keeps training after the capture; the snapshot only ever
/// hands out shared references, so nothing can update it until the next
/// boundary replaces it wholesale.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct Frozen<T> {
    inner: T,
}

impl<T: Clone> Frozen<T> {
    /// Deep-copy `live` into a new snapshot.
    pub fn capture(live: &T) -> Self {
        Self {
            inner: live.clone(),
        }
    }
}

impl<T> Frozen<T> {
    pub fn get(&self) -> &T {
        &self.inner
    }
}

impl<T> Deref for Frozen<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_does_not_alias_live_value() {
        let mut live = vec![1.0f32, 2.0];
        let frozen = Frozen::capture(&live);
        live[0] = 10.0;
        assert_eq!(frozen.get(), &vec![1.0, 2.0]);
        assert_eq!(frozen.len(), 2);
    }
}
