use std::fmt;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::RwLock;

use super::page::PagePtr;

/// Lower-bound marker of the key range a reference covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageKey<K> {
    /// Boundary key, `None` for the root.
    pub key: Option<K>,
    /// True when the range lies left of `key` (first child of its parent).
    pub first: bool,
}

impl<K> PageKey<K> {
    /// Marker of the root position.
    pub fn root() -> Self {
        Self {
            key: None,
            first: true,
        }
    }
}

/// Mutable slot holding the current page of one tree position.
///
/// Owned by the parent node page (or by the map for the root). The back
/// pointer to the parent reference is non-owning.
pub struct PageReference<K, V> {
    page: ArcSwap<super::page::Page<K, V>>,
    page_key: PageKey<K>,
    parent: RwLock<Weak<PageReference<K, V>>>,
}

impl<K, V> PageReference<K, V> {
    pub(crate) fn new(page: PagePtr<K, V>, page_key: PageKey<K>) -> Arc<Self> {
        Arc::new(Self {
            page: ArcSwap::new(page),
            page_key,
            parent: RwLock::new(Weak::new()),
        })
    }

    /// Current page instance.
    pub fn page(&self) -> PagePtr<K, V> {
        self.page.load_full()
    }

    /// Publishes a new page instance for this position.
    pub(crate) fn replace_page(&self, page: PagePtr<K, V>) {
        self.page.store(page);
    }

    /// Key-range marker of this position.
    pub fn page_key(&self) -> &PageKey<K> {
        &self.page_key
    }

    /// Parent reference, if still alive.
    pub fn parent(&self) -> Option<Arc<PageReference<K, V>>> {
        self.parent.read().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: &Arc<PageReference<K, V>>) {
        *self.parent.write() = Arc::downgrade(parent);
    }
}

impl<K: fmt::Debug, V> fmt::Debug for PageReference<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let page = self.page();
        f.debug_struct("PageReference")
            .field("page_key", &self.page_key)
            .field("kind", &page.kind_name())
            .field("state", &page.state())
            .finish()
    }
}
