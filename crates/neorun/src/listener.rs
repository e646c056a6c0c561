//! Named listener lists, shared by the server's and the client's message routing.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

pub(crate) struct Listeners<H> {
    by_name: DashMap<String, Vec<(ListenerId, H)>>,
    next_id: AtomicU64,
}

impl<H: Clone> Listeners<H> {
    pub(crate) fn new() -> Self {
        Self { by_name: DashMap::new(), next_id: AtomicU64::new(1) }
    }

    pub(crate) fn add(&self, name: &str, handler: H) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.by_name.entry(name.to_string()).or_default().push((id, handler));
        id
    }

    pub(crate) fn remove(&self, name: &str, id: ListenerId) -> bool {
        let Some(mut list) = self.by_name.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        before != list.len()
    }

    pub(crate) fn remove_all(&self, name: &str) -> usize {
        self.by_name.remove(name).map(|(_, list)| list.len()).unwrap_or(0)
    }

    /// Copies the handlers out so none of the map's locks is held while they run.
    pub(crate) fn snapshot(&self, name: &str) -> Vec<H> {
        self.by_name
            .get(name)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }
}
