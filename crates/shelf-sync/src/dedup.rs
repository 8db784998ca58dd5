use std::collections::HashSet;

/// Set of slugs already accepted in the current run.
///
/// Entries are never evicted; the index only grows for the lifetime of one
/// acquisition or import run. Seed it from whatever is already durable (the
/// intermediate dataset, or the catalog) before the run starts.
#[derive(Debug, Default, Clone)]
pub struct SlugIndex {
    seen: HashSet<String>,
}

impl SlugIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.seen.contains(slug)
    }

    /// Record `slug`; returns `false` when it was already present.
    pub fn insert_if_new(&mut self, slug: &str) -> bool {
        if self.seen.contains(slug) {
            return false;
        }
        self.seen.insert(slug.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for SlugIndex {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            seen: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl<S: Into<String>> Extend<S> for SlugIndex {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        self.seen.extend(iter.into_iter().map(Into::into));
    }
}
